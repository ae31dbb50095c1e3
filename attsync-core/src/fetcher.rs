//! Per-device fetch-and-forward pipeline: connect, reconcile the
//! roster, ingest new events with identity resolution, dual-write
//! canonical and replica rows, backfill the serial, and audit
//! unmapped badges.

use crate::config::SyncConfig;
use crate::device::{
    is_ipv4_literal, normalize_event, resolve_serial, DeviceConnector, DeviceSession,
    UNKNOWN_SERIAL,
};
use crate::error::SyncError;
use crate::events::{BusEvent, EventBus, EventKind, Level};
use crate::identity;
use crate::locks::DeviceLock;
use crate::run_log::RunLog;
use crate::store::SyncStore;
use crate::types::{Device, DeviceUserRef, NewAttendanceEvent, NewRawEvent, StagedEvent};
use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

const ROSTER_SOURCE: &str = "zk_device";
const AUTO_SOURCE: &str = "auto_created";
const DEFAULT_USER_NAME: &str = "IMPORTED";

/// One fetch pass over one device. Shared state is injected; a run
/// builds one `Fetcher` and hands it to every worker.
pub struct Fetcher {
    store: Arc<dyn SyncStore>,
    connector: Arc<dyn DeviceConnector>,
    bus: EventBus,
    config: SyncConfig,
    run: Option<Arc<RunLog>>,
}

impl Fetcher {
    pub fn new(
        store: Arc<dyn SyncStore>,
        connector: Arc<dyn DeviceConnector>,
        bus: EventBus,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            connector,
            bus,
            config,
            run: None,
        }
    }

    pub fn with_run_log(mut self, run: Arc<RunLog>) -> Self {
        self.run = Some(run);
        self
    }

    fn emit(&self, level: Level, device: &Device, message: &str) {
        match &self.run {
            Some(run) => run.emit(&self.bus, level, Some((device.id, &device.name)), message),
            None => {
                match level {
                    Level::Error => tracing::error!("{message}"),
                    Level::Warning => tracing::warn!("{message}"),
                    _ => tracing::info!("{message}"),
                }
                self.bus.emit(
                    BusEvent::log(level, message)
                        .kind(EventKind::Console)
                        .device(device.id, &device.name),
                );
            }
        }
    }

    fn device_status(&self, device: &Device, status: &str) {
        self.bus.emit(
            BusEvent::log(Level::Info, status)
                .kind(EventKind::DeviceStatus)
                .device(device.id, &device.name),
        );
    }

    /// Run the full pipeline for one device. Returns the number of
    /// newly committed events; device-scoped failures come back as
    /// errors and the caller records them without stopping the run.
    pub async fn fetch_and_forward(&self, device: &Device) -> Result<u64, SyncError> {
        let mut session = match self.connector.connect(device).await {
            Ok(session) => session,
            Err(e) => {
                self.emit(
                    Level::Error,
                    device,
                    &format!("[ERROR] Polling {} failed: {e}", device.name),
                );
                self.device_status(device, "offline");
                return Err(e);
            }
        };
        self.emit(Level::Info, device, &format!("[CONNECTED] {}", device.name));
        self.device_status(device, "online");

        if let Err(e) = self.store.touch_device_last_seen(device.id, Utc::now()).await {
            tracing::debug!(error = %e, "last_seen update failed");
        }
        let _ = session.disable().await;

        let result = self.run_session(device, session.as_mut()).await;

        let _ = session.enable().await;
        session.disconnect().await;
        self.emit(
            Level::Info,
            device,
            &format!("[DISCONNECTED] {}", device.name),
        );
        result
    }

    async fn run_session(
        &self,
        device: &Device,
        session: &mut dyn DeviceSession,
    ) -> Result<u64, SyncError> {
        let serial = resolve_serial(device, session.device_serial().await.as_deref());

        // Replica writes are serialized per serial across processes.
        // On contention the canonical store must not be blocked:
        // continue degraded, without roster or replica writes.
        let lock = DeviceLock::new(
            &self.config.access_lock_dir,
            self.config.access_lock_stale,
            self.config.access_lock_timeout,
        );
        let guard = match lock.acquire(&serial).await {
            Ok(guard) => Some(guard),
            Err(SyncError::LockTimeout(_)) => {
                self.emit(
                    Level::Warning,
                    device,
                    &format!("[LOCK] {serial} busy; ingesting without replica writes"),
                );
                None
            }
            Err(e) => return Err(e),
        };
        let degraded = guard.is_none();

        if !degraded {
            self.reconcile_roster(device, session, &serial).await?;
        }

        let fetch_start = Instant::now();
        let raw_events = match session.list_events().await {
            Ok(events) => events,
            Err(e) => {
                self.emit(
                    Level::Error,
                    device,
                    &format!("[ERROR] Fetching events from {} failed: {e}", device.name),
                );
                return Err(e);
            }
        };
        let fetch_elapsed = fetch_start.elapsed();
        self.emit(
            Level::Info,
            device,
            &format!(
                "[INFO] Retrieved {} records from {} in {:.2}s",
                raw_events.len(),
                device.name,
                fetch_elapsed.as_secs_f64()
            ),
        );

        let existing: HashSet<i64> = self
            .store
            .existing_record_ids(device.id)
            .await?
            .into_iter()
            .collect();
        let serial_map: HashMap<String, String> = self
            .store
            .refs_for_serial(&serial)
            .await?
            .into_iter()
            .map(|r| (r.badge_number, r.device_userid))
            .collect();

        let mut staged: Vec<StagedEvent> = Vec::new();
        let mut unmapped: BTreeSet<String> = BTreeSet::new();
        let mut seen = existing;

        for raw in &raw_events {
            let Some(rec) = normalize_event(raw) else {
                continue;
            };
            if !seen.insert(rec.record_id) {
                continue;
            }

            let mut badge = identity::resolve_badge(
                self.store.as_ref(),
                &rec.device_userid,
                Some(&serial),
            )
            .await?;

            if badge.is_none()
                && self.config.auto_create_users_from_badges
                && device.branch_id.is_some()
            {
                match identity::ensure_user_and_badge(
                    self.store.as_ref(),
                    &rec.device_userid,
                    None,
                    device.branch_id,
                    Some(device.id),
                    DEFAULT_USER_NAME,
                )
                .await
                {
                    Ok(created) => badge = created,
                    Err(e) => {
                        // Provisioning is opportunistic; the event
                        // still lands without a badge.
                        tracing::warn!(error = %e, userid = %rec.device_userid,
                            "auto-provisioning failed");
                    }
                }
            }

            if badge.is_none() {
                unmapped.insert(rec.device_userid.clone());
            }

            // Degraded mode writes nothing replica-side, so the
            // replica user id is not even derived.
            let replica_userid = if degraded {
                None
            } else {
                let resolved = self
                    .replica_userid(&rec.device_userid, badge.as_ref(), &serial, &serial_map)
                    .await?;
                if resolved.is_none() {
                    unmapped.insert(rec.device_userid.clone());
                }
                resolved
            };

            self.emit(
                Level::New,
                device,
                &format!(
                    "[NEW] RID {}, User={}, Time={}",
                    rec.record_id, rec.device_userid, rec.timestamp
                ),
            );
            staged.push(StagedEvent {
                event: NewAttendanceEvent {
                    record_id: rec.record_id,
                    user_id: rec.device_userid.clone(),
                    device_userid: rec.device_userid.clone(),
                    badge_id: badge.as_ref().map(|b| b.id),
                    timestamp: rec.timestamp,
                    status: rec.status.clone(),
                },
                raw: replica_userid.map(|device_userid| NewRawEvent {
                    device_userid,
                    timestamp: rec.timestamp,
                    event_type: rec.status.clone(),
                    device_serial: serial.clone(),
                }),
            });
        }

        let new_count = if staged.is_empty() {
            0
        } else {
            let insert_start = Instant::now();
            match self.store.commit_fetch(device.id, &staged).await {
                Ok(n) => {
                    let insert_elapsed = insert_start.elapsed();
                    self.bus.emit(
                        BusEvent::log(
                            Level::Info,
                            format!("inserted {n} events for {}", device.name),
                        )
                        .kind(EventKind::DbInsertTimes)
                        .device(device.id, &device.name)
                        .extra(serde_json::json!({
                            "fetch_seconds": fetch_elapsed.as_secs_f64(),
                            "insert_seconds": insert_elapsed.as_secs_f64(),
                        })),
                    );
                    self.bus.emit(
                        BusEvent::log(Level::New, format!("{n} new events from {}", device.name))
                            .kind(EventKind::NewLogsBatch)
                            .device(device.id, &device.name)
                            .extra(serde_json::json!({ "new_events": n })),
                    );
                    n
                }
                Err(e) => {
                    self.emit(
                        Level::Error,
                        device,
                        &format!("[ERROR] Commit for {} failed: {e}", device.name),
                    );
                    return Err(SyncError::SourceCommit(e.to_string()));
                }
            }
        };

        self.backfill_serial(device, &serial).await;

        if !unmapped.is_empty() {
            if let Err(e) =
                append_unmapped_csv(&self.config.scheduler_log_dir, &serial, &unmapped)
            {
                self.emit(
                    Level::Warning,
                    device,
                    &format!("[WARN] unmapped audit write failed: {e}"),
                );
            }
        }

        drop(guard);
        Ok(new_count)
    }

    /// Upsert one `DeviceUserRef` per roster entry. The terminal has
    /// no separate badge space, so the device user id doubles as the
    /// badge number.
    async fn reconcile_roster(
        &self,
        device: &Device,
        session: &mut dyn DeviceSession,
        serial: &str,
    ) -> Result<(), SyncError> {
        let users = match session.list_users().await {
            Ok(users) => users,
            Err(e) => {
                // The roster is a convenience; event ingestion
                // proceeds without it.
                self.emit(
                    Level::Warning,
                    device,
                    &format!("[WARN] Roster fetch from {} failed: {e}", device.name),
                );
                return Ok(());
            }
        };

        let mut present: Vec<String> = Vec::with_capacity(users.len());
        for user in &users {
            let userid = user.device_userid.trim();
            if userid.is_empty() {
                continue;
            }
            self.store
                .upsert_device_user_ref(&DeviceUserRef {
                    device_userid: userid.to_string(),
                    badge_number: userid.to_string(),
                    name: user.name.clone(),
                    device_serial: serial.to_string(),
                    source: ROSTER_SOURCE.to_string(),
                })
                .await?;
            present.push(userid.to_string());
        }

        if self.config.prune_missing_device_users {
            let removed = self
                .store
                .prune_device_user_refs(serial, &present)
                .await?;
            if removed > 0 {
                self.emit(
                    Level::Info,
                    device,
                    &format!("[ROSTER] pruned {removed} stale entries for {serial}"),
                );
            }
        }
        Ok(())
    }

    /// Derive the device-local user id the replica row carries.
    async fn replica_userid(
        &self,
        device_userid: &str,
        badge: Option<&crate::types::Badge>,
        serial: &str,
        serial_map: &HashMap<String, String>,
    ) -> Result<Option<String>, SyncError> {
        let Some(badge) = badge else {
            return Ok(if self.config.allow_insert_raw_badge {
                Some(device_userid.to_string())
            } else {
                None
            });
        };

        if let Some(entry) = self
            .store
            .device_user_ref_by_badge(&badge.badge_number, serial)
            .await?
        {
            return Ok(Some(entry.device_userid));
        }
        if let Some(userid) = serial_map.get(&badge.badge_number) {
            return Ok(Some(userid.clone()));
        }
        if self.config.auto_create_userinfo {
            self.store
                .upsert_device_user_ref(&DeviceUserRef {
                    device_userid: badge.badge_number.clone(),
                    badge_number: badge.badge_number.clone(),
                    name: None,
                    device_serial: serial.to_string(),
                    source: AUTO_SOURCE.to_string(),
                })
                .await?;
            return Ok(Some(badge.badge_number.clone()));
        }
        if self.config.allow_insert_raw_badge {
            return Ok(Some(device_userid.to_string()));
        }
        Ok(None)
    }

    /// Persist a freshly discovered serial onto the device row. The
    /// serial is permanent once set, so only empty columns are
    /// written, and never with an IP literal or the sentinel.
    async fn backfill_serial(&self, device: &Device, serial: &str) {
        let missing = device.serial.as_deref().map_or(true, str::is_empty);
        if !missing || serial == UNKNOWN_SERIAL || is_ipv4_literal(serial) {
            return;
        }
        if let Err(e) = self.store.set_device_serial(device.id, serial).await {
            tracing::warn!(device = device.id, error = %e, "serial backfill failed");
        }
    }
}

/// Append unmapped device user ids to the daily audit CSV for this
/// serial, creating it with its header on first write.
pub fn append_unmapped_csv(
    dir: &str,
    serial: &str,
    badges: &BTreeSet<String>,
) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating log dir {dir}"))?;
    let path = Path::new(dir).join(format!(
        "access_unmapped_{serial}_{}.csv",
        Utc::now().format("%Y%m%d")
    ));
    let new_file = !path.exists();
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("opening {}", path.display()))?;
    if new_file {
        writeln!(file, "badge")?;
    }
    for badge in badges {
        writeln!(file, "{badge}")?;
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmapped_csv_appends_under_one_header() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().to_str().unwrap();

        let first: BTreeSet<String> = ["999".to_string()].into();
        let path = append_unmapped_csv(dir, "SN-A", &first).unwrap();
        let second: BTreeSet<String> = ["1001".to_string()].into();
        append_unmapped_csv(dir, "SN-A", &second).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "badge\n999\n1001\n");
        assert!(path
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("access_unmapped_SN-A_"));
    }
}
