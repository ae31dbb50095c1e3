use crate::runner;
use crate::service::SyncService;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

struct Handles {
    poll: JoinHandle<()>,
    prune: JoinHandle<()>,
}

/// Singleton periodic trigger. One spawned tick task fires a poll
/// run at the configured interval; a companion task prunes the job
/// registry. A tick that lands while the previous run is still
/// active is skipped, so runs never overlap.
#[derive(Default)]
pub struct Scheduler {
    inner: Mutex<Option<Handles>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().unwrap().is_some()
    }

    /// Start the periodic jobs. Returns false (and changes nothing)
    /// when the scheduler is already running.
    pub fn start(&self, service: Arc<SyncService>, interval: Duration) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.is_some() {
            tracing::info!("scheduler already running");
            return false;
        }

        let run_slot = Arc::new(tokio::sync::Mutex::new(()));
        let poll_service = service.clone();
        let poll = tokio::spawn(async move {
            // First fire happens one full interval from now.
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Ok(permit) = run_slot.clone().try_lock_owned() else {
                    tracing::info!("previous poll run still active; skipping tick");
                    continue;
                };
                let service = poll_service.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    let devices = match service.store().list_devices().await {
                        Ok(devices) => devices,
                        Err(e) => {
                            tracing::error!(error = %e, "device listing failed; skipping run");
                            return;
                        }
                    };
                    runner::run_poll(service, devices, None).await;
                });
            }
        });

        let prune_interval = service.config().job_prune_interval;
        let prune_service = service.clone();
        let prune = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(prune_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let removed = prune_service.prune_jobs();
                if removed > 0 {
                    tracing::debug!(removed, "pruned finished job records");
                }
            }
        });

        *inner = Some(Handles { poll, prune });
        tracing::info!(interval_secs = interval.as_secs(), "recurring scheduler started");
        true
    }

    /// Deregister the periodic jobs. In-flight poll runs complete
    /// naturally; only the tick tasks are aborted. Returns false
    /// when nothing was running.
    pub fn stop(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.take() {
            Some(handles) => {
                handles.poll.abort();
                handles.prune.abort();
                tracing::info!("recurring scheduler stopped");
                true
            }
            None => {
                tracing::info!("no scheduler to stop");
                false
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(handles) = self.inner.lock().unwrap().take() {
            handles.poll.abort();
            handles.prune.abort();
        }
    }
}
