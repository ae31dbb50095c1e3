use crate::events::{BusEvent, EventBus, EventKind, Level};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Footer written at the end of every run file, one JSON object on a
/// marked line so operators can grep it out.
#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub devices_polled: usize,
    pub new_events: u64,
    pub elapsed_seconds: f64,
    pub exceptions: Vec<(String, String)>,
    pub logfile: String,
}

/// Run-scoped log sink. Every line is multiplexed to tracing, the
/// timestamped run file, and the live event stream; workers share it
/// behind an `Arc` and the file has a single writer.
pub struct RunLog {
    path: PathBuf,
    file: Mutex<File>,
    start: DateTime<Utc>,
}

impl RunLog {
    /// Open `{dir}/zk_sync_{YYYYMMDD_HHMMSS}.log` and write the run
    /// header.
    pub fn open(dir: &str) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("creating log dir {dir}"))?;
        let start = Utc::now();
        let path = Path::new(dir).join(format!("zk_sync_{}.log", start.format("%Y%m%d_%H%M%S")));
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening run log {}", path.display()))?;
        writeln!(
            file,
            "===== SYNC RUN START: {} =====",
            start.format("%Y-%m-%d %H:%M:%S")
        )?;
        Ok(Self {
            path,
            file: Mutex::new(file),
            start,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    /// Append one line to the run file. Logging failures never fail
    /// the run.
    pub fn line(&self, text: &str) {
        let mut file = self.file.lock().unwrap();
        if writeln!(file, "{text}").and_then(|_| file.flush()).is_err() {
            tracing::debug!("run log write failed");
        }
    }

    /// Multiplexed emit: tracing, run file, event stream.
    pub fn emit(&self, bus: &EventBus, level: Level, device: Option<(i64, &str)>, message: &str) {
        match level {
            Level::Error => tracing::error!("{message}"),
            Level::Warning => tracing::warn!("{message}"),
            Level::Debug => tracing::debug!("{message}"),
            Level::Info | Level::New => tracing::info!("{message}"),
        }
        self.line(message);

        let mut event = BusEvent::log(level, message).kind(EventKind::Console);
        if let Some((id, name)) = device {
            event = event.device(id, name);
        }
        bus.emit(event);
    }

    /// Write the structured summary footer and the stop framing line.
    pub fn write_summary(&self, summary: &RunSummary) {
        if let Ok(json) = serde_json::to_string(summary) {
            self.line(&format!("RUN_SUMMARY_JSON: {json}"));
        }
        self.line(&format!(
            "===== SYNC RUN STOP: {} (elapsed {:.2}s) =====",
            summary.end.format("%Y-%m-%d %H:%M:%S"),
            summary.elapsed_seconds
        ));
    }
}
