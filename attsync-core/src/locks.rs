use crate::error::SyncError;
use chrono::Utc;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

const RETRY_DELAY: Duration = Duration::from_millis(200);
const STAMP_FILE: &str = "lockinfo.txt";

/// Advisory cross-process lock serializing all writes that touch one
/// device's replica slice. Keyed by device serial; implemented as an
/// atomically-created directory so it works across processes and
/// filesystems.
pub struct DeviceLock {
    base_dir: PathBuf,
    stale_after: Duration,
    timeout: Duration,
}

/// RAII handle; releasing twice is a no-op and drop releases.
#[derive(Debug)]
pub struct DeviceLockGuard {
    lock_dir: PathBuf,
    released: bool,
}

impl DeviceLock {
    pub fn new(base_dir: impl Into<PathBuf>, stale_after: Duration, timeout: Duration) -> Self {
        Self {
            base_dir: base_dir.into(),
            stale_after,
            timeout,
        }
    }

    pub fn lock_dir_for(&self, serial: &str) -> PathBuf {
        self.base_dir.join(format!("access_lock_{serial}"))
    }

    /// Acquire the lock for `serial`, polling until `timeout`. A lock
    /// directory older than `stale_after` is forcibly reclaimed.
    pub async fn acquire(&self, serial: &str) -> Result<DeviceLockGuard, SyncError> {
        fs::create_dir_all(&self.base_dir)?;
        let lock_dir = self.lock_dir_for(serial);
        let deadline = Instant::now() + self.timeout;

        loop {
            match fs::create_dir(&lock_dir) {
                Ok(()) => {
                    write_stamp(&lock_dir);
                    return Ok(DeviceLockGuard {
                        lock_dir,
                        released: false,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if is_stale(&lock_dir, self.stale_after) {
                        tracing::warn!(lock = %lock_dir.display(), "reclaiming stale device lock");
                        remove_lock_dir(&lock_dir);
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(SyncError::LockTimeout(serial.to_string()));
                    }
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl DeviceLockGuard {
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        remove_lock_dir(&self.lock_dir);
        self.released = true;
    }
}

impl Drop for DeviceLockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

fn write_stamp(lock_dir: &Path) {
    let stamp = format!(
        "pid={}\ncreated={}\n",
        std::process::id(),
        Utc::now().to_rfc3339()
    );
    // Stamp is diagnostic metadata only; losing it never blocks the holder.
    if let Err(e) = fs::write(lock_dir.join(STAMP_FILE), stamp) {
        tracing::debug!(error = %e, "could not write lock stamp");
    }
}

fn is_stale(lock_dir: &Path, stale_after: Duration) -> bool {
    let Ok(meta) = fs::metadata(lock_dir) else {
        return false;
    };
    let Ok(mtime) = meta.modified() else {
        return false;
    };
    SystemTime::now()
        .duration_since(mtime)
        .map(|age| age > stale_after)
        .unwrap_or(false)
}

fn remove_lock_dir(lock_dir: &Path) {
    let _ = fs::remove_file(lock_dir.join(STAMP_FILE));
    let _ = fs::remove_dir(lock_dir);
}
