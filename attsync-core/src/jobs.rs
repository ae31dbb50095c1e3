use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    PollAll,
    PollBranch,
    StartScheduler,
    StopScheduler,
    ExportEnddb,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Finished,
    Failed,
}

/// One background job as shown to operators. Starters return the id
/// immediately; workers mutate the record through the registry.
#[derive(Clone, Debug, Serialize)]
pub struct JobRecord {
    pub job_id: Uuid,
    #[serde(rename = "type")]
    pub kind: JobKind,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub total: u64,
    pub done: u64,
    pub results: Vec<serde_json::Value>,
    pub error: Option<String>,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub meta: serde_json::Map<String, serde_json::Value>,
}

impl JobRecord {
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, JobStatus::Finished | JobStatus::Failed)
    }
}

/// In-memory table of running and recently finished jobs. All access
/// is mutex-guarded; nothing async happens under the lock.
#[derive(Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<Uuid, JobRecord>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(
        &self,
        kind: JobKind,
        total: u64,
        meta: serde_json::Map<String, serde_json::Value>,
    ) -> Uuid {
        let job_id = Uuid::new_v4();
        let record = JobRecord {
            job_id,
            kind,
            status: JobStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            total,
            done: 0,
            results: Vec::new(),
            error: None,
            meta,
        };
        self.jobs.lock().unwrap().insert(job_id, record);
        job_id
    }

    pub fn get(&self, job_id: Uuid) -> Option<JobRecord> {
        self.jobs.lock().unwrap().get(&job_id).cloned()
    }

    /// Recent jobs, newest first by start time.
    pub fn list(&self, limit: usize) -> Vec<JobRecord> {
        let jobs = self.jobs.lock().unwrap();
        let mut out: Vec<JobRecord> = jobs.values().cloned().collect();
        out.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        out.truncate(limit);
        out
    }

    pub fn update(&self, job_id: Uuid, f: impl FnOnce(&mut JobRecord)) {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(record) = jobs.get_mut(&job_id) {
            f(record);
        }
    }

    /// Record one unit of progress with its result payload.
    pub fn push_result(&self, job_id: Uuid, result: serde_json::Value) {
        self.update(job_id, |job| {
            job.done += 1;
            job.results.push(result);
        });
    }

    pub fn finish(&self, job_id: Uuid) {
        self.update(job_id, |job| {
            job.status = JobStatus::Finished;
            job.finished_at = Some(Utc::now());
        });
    }

    pub fn fail(&self, job_id: Uuid, error: impl Into<String>) {
        self.update(job_id, |job| {
            job.status = JobStatus::Failed;
            job.error = Some(error.into());
            job.finished_at = Some(Utc::now());
        });
    }

    /// Drop terminal records whose finish time is older than `ttl`.
    /// Running jobs are never pruned. Returns the number removed.
    pub fn prune(&self, ttl: Duration) -> usize {
        let cutoff =
            Utc::now() - chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
        let mut jobs = self.jobs.lock().unwrap();
        let before = jobs.len();
        jobs.retain(|_, job| {
            !job.is_terminal() || job.finished_at.map_or(true, |t| t >= cutoff)
        });
        before - jobs.len()
    }
}
