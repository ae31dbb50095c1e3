use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Identity model ───────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Branch {
    pub id: i64,
    pub name: String,
    pub ip_range: String,
}

/// A networked attendance terminal. `serial` is the permanent
/// identifier once assigned non-trivially; it is never overwritten.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Device {
    pub id: i64,
    pub branch_id: Option<i64>,
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub serial: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub branch_id: i64,
    pub full_name: String,
    pub employee_code: String,
}

/// Globally unique person identifier owned by the identity store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Badge {
    pub id: i64,
    pub user_id: i64,
    pub badge_number: String,
    pub status: String,
}

/// Roster entry binding a device-local user id on one device serial
/// to a badge number. (device_userid, device_serial) is unique.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceUserRef {
    pub device_userid: String,
    pub badge_number: String,
    pub name: Option<String>,
    pub device_serial: String,
    pub source: String,
}

// ─── Event model ──────────────────────────────────────────────

/// Canonical attendance event. (device_id, record_id) is unique;
/// rows are never mutated except to set the export mark.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AttendanceEvent {
    pub id: i64,
    pub device_id: i64,
    pub record_id: i64,
    pub user_id: String,
    pub device_userid: String,
    pub badge_id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub status: String,
    pub exported: bool,
    pub exported_at: Option<DateTime<Utc>>,
}

/// Replica row carrying the device serial verbatim, kept for
/// downstream compatibility with the legacy consumer shape.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RawEvent {
    pub device_userid: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub verify_code: i32,
    pub sensor_id: String,
    pub memo: Option<String>,
    pub workcode: String,
    pub device_serial: String,
}

// ─── Fetch staging ────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct NewAttendanceEvent {
    pub record_id: i64,
    pub user_id: String,
    pub device_userid: String,
    pub badge_id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub status: String,
}

#[derive(Clone, Debug)]
pub struct NewRawEvent {
    pub device_userid: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub device_serial: String,
}

/// One canonical event plus its optional replica twin, committed
/// together in a single store transaction.
#[derive(Clone, Debug)]
pub struct StagedEvent {
    pub event: NewAttendanceEvent,
    pub raw: Option<NewRawEvent>,
}

// ─── Run results ──────────────────────────────────────────────

/// Per-device result collected by a poll run.
#[derive(Clone, Debug, Serialize)]
pub struct DeviceOutcome {
    pub device_id: i64,
    pub name: String,
    pub fetched: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Exporter batch result.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportOutcome {
    pub exported: u64,
    pub skipped_existing: u64,
    pub skipped_empty_user: u64,
    pub errors: u64,
}
