use crate::types::*;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Persistence trait for the identity, event, and replica stores.
///
/// The fetcher, identity resolution, and exporter operate exclusively
/// through this trait, enabling pluggable backends (MemoryStore for
/// tests and no-DB operation, Postgres for production).
#[async_trait]
pub trait SyncStore: Send + Sync {
    // ── Branches / devices ──

    async fn add_branch(&self, name: &str, ip_range: &str) -> Result<Branch>;
    async fn add_device(
        &self,
        branch_id: Option<i64>,
        name: &str,
        ip: &str,
        port: u16,
        serial: Option<&str>,
    ) -> Result<Device>;
    async fn list_devices(&self) -> Result<Vec<Device>>;
    async fn devices_by_branch(&self, branch_id: i64) -> Result<Vec<Device>>;
    async fn get_device(&self, id: i64) -> Result<Option<Device>>;

    /// Backfill the permanent serial. Callers only invoke this when
    /// the column is still empty; the store overwrites blindly.
    async fn set_device_serial(&self, id: i64, serial: &str) -> Result<()>;
    async fn touch_device_last_seen(&self, id: i64, at: DateTime<Utc>) -> Result<()>;

    // ── Identity ──

    async fn badge_by_number(&self, badge_number: &str) -> Result<Option<Badge>>;
    async fn user_by_employee_code(&self, employee_code: &str) -> Result<Option<User>>;
    async fn create_user(
        &self,
        branch_id: i64,
        full_name: &str,
        employee_code: &str,
    ) -> Result<User>;
    async fn create_badge(&self, user_id: i64, badge_number: &str) -> Result<Badge>;

    /// Idempotent; inserting an existing pair is a no-op.
    async fn link_user_device(&self, user_id: i64, device_id: i64) -> Result<()>;

    // ── Roster replica (device_user_refs) ──

    async fn device_user_ref(
        &self,
        device_userid: &str,
        device_serial: &str,
    ) -> Result<Option<DeviceUserRef>>;
    async fn device_user_ref_any(&self, device_userid: &str) -> Result<Option<DeviceUserRef>>;
    async fn device_user_ref_by_badge(
        &self,
        badge_number: &str,
        device_serial: &str,
    ) -> Result<Option<DeviceUserRef>>;
    async fn refs_for_serial(&self, device_serial: &str) -> Result<Vec<DeviceUserRef>>;

    /// Idempotent on (device_userid, device_serial): updates
    /// badge_number/name only when changed; a unique-constraint race
    /// resolves by re-reading the surviving row.
    async fn upsert_device_user_ref(&self, entry: &DeviceUserRef) -> Result<()>;

    /// Delete refs for this serial whose device_userid is not in
    /// `keep`. Returns the number of rows removed.
    async fn prune_device_user_refs(&self, device_serial: &str, keep: &[String]) -> Result<u64>;

    // ── Attendance events ──

    async fn existing_record_ids(&self, device_id: i64) -> Result<Vec<i64>>;

    /// Commit a fetch batch: every staged canonical event and its
    /// optional replica twin land in one transaction, or none do.
    /// Returns the number of events committed.
    async fn commit_fetch(&self, device_id: i64, batch: &[StagedEvent]) -> Result<u64>;

    async fn events_for_device(&self, device_id: i64) -> Result<Vec<AttendanceEvent>>;
    async fn raw_events_for_serial(&self, device_serial: &str) -> Result<Vec<RawEvent>>;

    // ── Export bookkeeping ──

    /// Unexported events ordered by id, optionally bounded below by
    /// a timestamp cutoff, capped at `limit`.
    async fn unexported_events(
        &self,
        limit: usize,
        cutoff: Option<DateTime<Utc>>,
    ) -> Result<Vec<AttendanceEvent>>;

    async fn mark_exported(&self, event_id: i64, at: DateTime<Utc>) -> Result<()>;
}
