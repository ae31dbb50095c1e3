//! Application root for the sync engine. One long-lived object owns
//! the stores, the device connector, the job registry, the scheduler
//! singleton, the export lock, and the event bus; transport layers
//! delegate here and hold no state of their own.

use crate::config::SyncConfig;
use crate::device::DeviceConnector;
use crate::end_store::EndStore;
use crate::error::SyncError;
use crate::events::{now_iso, BusEvent, EventBus, Level};
use crate::exporter::{export_attendance, ExportParams};
use crate::fetcher::Fetcher;
use crate::jobs::{JobKind, JobRecord, JobRegistry};
use crate::runner;
use crate::scheduler::Scheduler;
use crate::store::SyncStore;
use crate::types::ExportOutcome;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

pub struct SyncService {
    store: Arc<dyn SyncStore>,
    connector: Arc<dyn DeviceConnector>,
    end_store: Option<Arc<dyn EndStore>>,
    config: SyncConfig,
    jobs: JobRegistry,
    scheduler: Scheduler,
    export_lock: tokio::sync::Mutex<()>,
    bus: EventBus,
}

impl SyncService {
    pub fn new(
        store: Arc<dyn SyncStore>,
        connector: Arc<dyn DeviceConnector>,
        end_store: Option<Arc<dyn EndStore>>,
        config: SyncConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            connector,
            end_store,
            config,
            jobs: JobRegistry::new(),
            scheduler: Scheduler::new(),
            export_lock: tokio::sync::Mutex::new(()),
            bus: EventBus::default(),
        })
    }

    // ── Accessors ──

    pub fn store(&self) -> &dyn SyncStore {
        self.store.as_ref()
    }

    pub fn store_arc(&self) -> Arc<dyn SyncStore> {
        self.store.clone()
    }

    pub fn connector_arc(&self) -> Arc<dyn DeviceConnector> {
        self.connector.clone()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn jobs(&self) -> &JobRegistry {
        &self.jobs
    }

    pub fn has_end_store(&self) -> bool {
        self.end_store.is_some()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.bus.subscribe()
    }

    // ── Job registry views ──

    pub fn get_job(&self, job_id: Uuid) -> Option<JobRecord> {
        self.jobs.get(job_id)
    }

    pub fn list_jobs(&self, limit: usize) -> Vec<JobRecord> {
        self.jobs.list(limit)
    }

    pub fn prune_jobs(&self) -> usize {
        self.jobs.prune(self.config.job_ttl)
    }

    // ── Poll jobs ──

    /// One-off poll of every device. Returns immediately with the
    /// job id; the run proceeds in the background.
    pub async fn start_poll_all_job(self: Arc<Self>) -> Result<Uuid> {
        let devices = self.store.list_devices().await?;
        let job_id = self
            .jobs
            .create(JobKind::PollAll, devices.len() as u64, serde_json::Map::new());
        if devices.is_empty() {
            self.jobs.finish(job_id);
            return Ok(job_id);
        }
        let service = self.clone();
        tokio::spawn(async move {
            runner::run_poll(service, devices, Some(job_id)).await;
        });
        Ok(job_id)
    }

    /// One-off poll of a single branch's devices.
    pub async fn start_poll_branch_job(self: Arc<Self>, branch_id: i64) -> Result<Uuid> {
        let devices = self.store.devices_by_branch(branch_id).await?;
        let mut meta = serde_json::Map::new();
        meta.insert("branch_id".to_string(), serde_json::json!(branch_id));
        let job_id = self
            .jobs
            .create(JobKind::PollBranch, devices.len() as u64, meta);
        if devices.is_empty() {
            self.jobs.finish(job_id);
            return Ok(job_id);
        }
        let service = self.clone();
        tokio::spawn(async move {
            runner::run_poll(service, devices, Some(job_id)).await;
        });
        Ok(job_id)
    }

    /// Poll one device synchronously. `None` means no such device.
    pub async fn poll_device_once(self: Arc<Self>, device_id: i64) -> Result<Option<u64>, SyncError> {
        let Some(device) = self.store.get_device(device_id).await? else {
            return Ok(None);
        };
        let fetcher = Fetcher::new(
            self.store.clone(),
            self.connector.clone(),
            self.bus.clone(),
            self.config.clone(),
        );
        fetcher.fetch_and_forward(&device).await.map(Some)
    }

    // ── Scheduler jobs ──

    pub fn scheduler_running(&self) -> bool {
        self.scheduler.is_running()
    }

    pub fn start_scheduler_job(self: Arc<Self>, interval: Option<Duration>) -> Uuid {
        let mut meta = serde_json::Map::new();
        if let Some(interval) = interval {
            meta.insert(
                "interval_seconds".to_string(),
                serde_json::json!(interval.as_secs()),
            );
        }
        let job_id = self.jobs.create(JobKind::StartScheduler, 1, meta);

        let interval = interval.unwrap_or(self.config.poll_interval);
        let started = self.scheduler.start(self.clone(), interval);
        let message = if started {
            "scheduler started"
        } else {
            "scheduler already running"
        };
        self.jobs.push_result(
            job_id,
            serde_json::json!({ "message": message, "timestamp": now_iso() }),
        );
        self.jobs.finish(job_id);
        self.bus
            .emit(BusEvent::log(Level::Info, format!("[SCHEDULER] {message}")));
        job_id
    }

    pub fn stop_scheduler_job(self: Arc<Self>) -> Uuid {
        let job_id = self
            .jobs
            .create(JobKind::StopScheduler, 1, serde_json::Map::new());
        let stopped = self.scheduler.stop();
        let message = if stopped {
            "scheduler stopped"
        } else {
            "no scheduler to stop"
        };
        self.jobs.push_result(
            job_id,
            serde_json::json!({ "message": message, "timestamp": now_iso() }),
        );
        self.jobs.finish(job_id);
        self.bus
            .emit(BusEvent::log(Level::Info, format!("[SCHEDULER] {message}")));
        job_id
    }

    // ── Export ──

    /// Run one export batch, holding the global export lock. A
    /// second concurrent caller fails fast instead of queueing.
    pub async fn run_export(self: Arc<Self>, dry_run: bool) -> Result<ExportOutcome, SyncError> {
        let _permit = self
            .export_lock
            .try_lock()
            .map_err(|_| SyncError::ExportBusy)?;
        let end = self
            .end_store
            .as_ref()
            .ok_or(SyncError::ConfigMissing("END_DB_URI"))?;
        let params = ExportParams {
            batch_size: self.config.export_batch_size,
            lookback_days: self.config.export_lookback_days,
            time_offset_min: self.config.export_time_offset_min,
            dry_run,
        };
        let outcome = export_attendance(self.store.as_ref(), end.as_ref(), &params).await?;
        self.bus.emit(BusEvent::log(
            Level::Info,
            format!(
                "[EXPORT] exported={} skipped_existing={} skipped_empty_user={} errors={}",
                outcome.exported,
                outcome.skipped_existing,
                outcome.skipped_empty_user,
                outcome.errors
            ),
        ));
        Ok(outcome)
    }

    /// Background export job; the starter returns immediately.
    pub fn start_export_job(self: Arc<Self>, dry_run: bool) -> Uuid {
        let job_id = self
            .jobs
            .create(JobKind::ExportEnddb, 1, serde_json::Map::new());
        let service = self.clone();
        tokio::spawn(async move {
            match service.clone().run_export(dry_run).await {
                Ok(outcome) => {
                    service.jobs.push_result(job_id, serde_json::json!(outcome));
                    service.jobs.finish(job_id);
                }
                Err(e) => {
                    service.bus.emit(BusEvent::log(
                        Level::Error,
                        format!("[EXPORT] job failed: {e}"),
                    ));
                    service.jobs.fail(job_id, e.to_string());
                }
            }
        });
        job_id
    }
}
