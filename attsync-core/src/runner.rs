//! One poll run: capture a run log, fan the fetcher out over a
//! bounded worker pool, collect per-device outcomes, write the
//! summary footer, and hand off to the exporter.

use crate::events::{BusEvent, Level};
use crate::fetcher::Fetcher;
use crate::run_log::{RunLog, RunSummary};
use crate::service::SyncService;
use crate::types::{Device, DeviceOutcome};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

/// Poll every device in `devices` once. `job_id` ties progress to a
/// registry record when the run was started as a job.
pub async fn run_poll(service: Arc<SyncService>, devices: Vec<Device>, job_id: Option<Uuid>) -> u64 {
    let config = service.config().clone();
    let run = match RunLog::open(&config.scheduler_log_dir) {
        Ok(run) => Some(Arc::new(run)),
        Err(e) => {
            // A run without its file is still worth more than no run.
            tracing::warn!(error = %e, "run log unavailable");
            None
        }
    };
    let start = run.as_ref().map(|r| r.start()).unwrap_or_else(Utc::now);
    let logfile = run
        .as_ref()
        .map(|r| r.path().display().to_string())
        .unwrap_or_default();

    service.bus().emit(BusEvent::log(
        Level::Info,
        format!("[SCHEDULER] Dispatching polling for {} devices", devices.len()),
    ));

    let mut fetcher = Fetcher::new(
        service.store_arc(),
        service.connector_arc(),
        service.bus().clone(),
        config.clone(),
    );
    if let Some(run) = &run {
        fetcher = fetcher.with_run_log(run.clone());
    }
    let fetcher = Arc::new(fetcher);

    let semaphore = Arc::new(Semaphore::new(config.max_poll_workers.max(1)));
    let mut pool: JoinSet<(Device, Result<u64, crate::error::SyncError>)> = JoinSet::new();
    for device in devices.iter().cloned() {
        let fetcher = fetcher.clone();
        let semaphore = semaphore.clone();
        pool.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            let result = fetcher.fetch_and_forward(&device).await;
            (device, result)
        });
    }

    let mut total_new: u64 = 0;
    let mut exceptions: Vec<(String, String)> = Vec::new();
    while let Some(joined) = pool.join_next().await {
        let Ok((device, result)) = joined else {
            exceptions.push(("worker".to_string(), "worker panicked".to_string()));
            continue;
        };
        let outcome = match result {
            Ok(fetched) => {
                total_new += fetched;
                if let Some(run) = &run {
                    run.emit(
                        service.bus(),
                        Level::Info,
                        Some((device.id, &device.name)),
                        &format!("[SCHEDULER] {}: {fetched} new events", device.name),
                    );
                }
                DeviceOutcome {
                    device_id: device.id,
                    name: device.name.clone(),
                    fetched,
                    error: None,
                    timestamp: Utc::now(),
                }
            }
            Err(e) => {
                exceptions.push((device.name.clone(), e.to_string()));
                DeviceOutcome {
                    device_id: device.id,
                    name: device.name.clone(),
                    fetched: 0,
                    error: Some(e.to_string()),
                    timestamp: Utc::now(),
                }
            }
        };
        if let Some(job_id) = job_id {
            service
                .jobs()
                .push_result(job_id, serde_json::json!(outcome));
        }
    }

    let end = Utc::now();
    let summary = RunSummary {
        start,
        end,
        devices_polled: devices.len(),
        new_events: total_new,
        elapsed_seconds: (end - start).num_milliseconds() as f64 / 1000.0,
        exceptions,
        logfile,
    };
    if let Some(run) = &run {
        run.write_summary(&summary);
    }
    service.bus().emit(BusEvent::log(
        Level::Info,
        format!(
            "[SCHEDULER] Completed polling {} devices. Total new events: {total_new}. Run time: {:.2}s",
            summary.devices_polled, summary.elapsed_seconds
        ),
    ));

    if let Some(job_id) = job_id {
        service.jobs().finish(job_id);
    }

    // Ship what just landed, without blocking the run.
    if config.export_after_poll && service.has_end_store() {
        service.start_export_job(false);
    }

    total_new
}
