use crate::error::SyncError;
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};

/// One row in the downstream reporting table, already shaped to the
/// legacy column layout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndRow {
    pub log_date: NaiveDate,
    pub badge: String,
    pub log_time: NaiveTime,
    pub access_door: String,
    pub access_device: String,
}

/// De-duplication key of the end table.
pub type EndKey = (NaiveDate, String, NaiveTime, String);

impl EndRow {
    pub fn key(&self) -> EndKey {
        (
            self.log_date,
            self.badge.clone(),
            self.log_time,
            self.access_device.clone(),
        )
    }
}

/// Downstream reporting database. Rows are written one statement at
/// a time; the duplicate probe plus the source-side `exported` flag
/// make re-runs safe, so no batch transaction is needed and a failed
/// insert leaves earlier rows in place.
#[async_trait]
pub trait EndStore: Send + Sync {
    async fn contains(&self, row: &EndRow) -> Result<bool, SyncError>;
    async fn insert(&self, row: &EndRow) -> Result<(), SyncError>;
}

// ─── In-memory end store (tests, dry runs against nothing) ────

pub mod memory {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Inner {
        rows: Vec<EndRow>,
        keys: HashSet<EndKey>,
        inserts_attempted: u64,
        fail_after: Option<u64>,
        insert_delay: Option<std::time::Duration>,
    }

    /// In-memory `EndStore` with fault injection: `fail_after(n)`
    /// lets the first n inserts through and rejects the rest until
    /// `heal()`; `set_insert_delay` simulates a slow link.
    #[derive(Default)]
    pub struct MemoryEndStore {
        inner: Mutex<Inner>,
    }

    impl MemoryEndStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn fail_after(&self, n: u64) {
            self.inner.lock().unwrap().fail_after = Some(n);
        }

        pub fn heal(&self) {
            self.inner.lock().unwrap().fail_after = None;
        }

        pub fn set_insert_delay(&self, delay: std::time::Duration) {
            self.inner.lock().unwrap().insert_delay = Some(delay);
        }

        pub fn rows(&self) -> Vec<EndRow> {
            self.inner.lock().unwrap().rows.clone()
        }

        pub fn len(&self) -> usize {
            self.inner.lock().unwrap().rows.len()
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }
    }

    #[async_trait]
    impl EndStore for MemoryEndStore {
        async fn contains(&self, row: &EndRow) -> Result<bool, SyncError> {
            Ok(self.inner.lock().unwrap().keys.contains(&row.key()))
        }

        async fn insert(&self, row: &EndRow) -> Result<(), SyncError> {
            let delay = self.inner.lock().unwrap().insert_delay;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let mut inner = self.inner.lock().unwrap();
            inner.inserts_attempted += 1;
            if let Some(limit) = inner.fail_after {
                if inner.inserts_attempted > limit {
                    return Err(SyncError::EndDb("insert rejected".to_string()));
                }
            }
            inner.keys.insert(row.key());
            inner.rows.push(row.clone());
            Ok(())
        }
    }
}
