use crate::error::SyncError;
use crate::types::Device;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

// ─── Adapter-boundary records ─────────────────────────────────

/// Roster entry as reported by the terminal.
#[derive(Clone, Debug)]
pub struct UserRecord {
    pub device_userid: String,
    pub name: Option<String>,
    pub card: Option<String>,
}

/// Attendance record after adapter normalization. `record_id` is the
/// device-assigned monotonic uid, stable across sessions.
#[derive(Clone, Debug)]
pub struct EventRecord {
    pub record_id: i64,
    pub device_userid: String,
    pub timestamp: DateTime<Utc>,
    pub status: String,
}

/// Attendance record as probed off the wire; every field optional.
/// The adapter turns this into an `EventRecord` or drops it.
#[derive(Clone, Debug, Default)]
pub struct RawDeviceEvent {
    pub record_id: Option<i64>,
    pub device_userid: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub status: Option<RawStatus>,
}

/// Device status arrives either as a protocol code or a symbolic
/// name. Normalized to a string here; no semantic mapping.
#[derive(Clone, Debug)]
pub enum RawStatus {
    Code(i64),
    Name(String),
}

pub fn normalize_status(status: Option<&RawStatus>) -> String {
    match status {
        Some(RawStatus::Code(c)) => c.to_string(),
        Some(RawStatus::Name(n)) => n.clone(),
        None => String::new(),
    }
}

/// Normalize one wire record. Records without a record id, a
/// device user id, or a wall-clock timestamp are unusable and
/// dropped with a logged reason.
pub fn normalize_event(raw: &RawDeviceEvent) -> Option<EventRecord> {
    let Some(record_id) = raw.record_id else {
        tracing::debug!("dropping device record without uid");
        return None;
    };
    let Some(device_userid) = raw.device_userid.as_deref().filter(|u| !u.is_empty()) else {
        tracing::debug!(record_id, "dropping device record without user id");
        return None;
    };
    let Some(timestamp) = raw.timestamp else {
        tracing::debug!(record_id, "dropping device record without timestamp");
        return None;
    };
    Some(EventRecord {
        record_id,
        device_userid: device_userid.to_string(),
        timestamp,
        status: normalize_status(raw.status.as_ref()),
    })
}

pub fn is_ipv4_literal(s: &str) -> bool {
    s.parse::<std::net::Ipv4Addr>().is_ok()
}

/// Sentinel used when no non-trivial serial can be derived.
pub const UNKNOWN_SERIAL: &str = "UNKNOWN";

/// Resolve the serial used for all replica writes this session:
/// the stored serial, else the one the session reports, else the
/// device name when it is not an IP literal, else the sentinel.
pub fn resolve_serial(device: &Device, session_serial: Option<&str>) -> String {
    if let Some(s) = device.serial.as_deref().filter(|s| !s.is_empty()) {
        return s.to_string();
    }
    if let Some(s) = session_serial.filter(|s| !s.is_empty()) {
        return s.to_string();
    }
    if !device.name.is_empty() && !is_ipv4_literal(&device.name) {
        return device.name.clone();
    }
    UNKNOWN_SERIAL.to_string()
}

// ─── Capability traits ────────────────────────────────────────

/// Abstract connector over the terminal protocol family. The
/// concrete client library is an opaque capability behind this.
#[async_trait]
pub trait DeviceConnector: Send + Sync {
    async fn connect(&self, device: &Device) -> Result<Box<dyn DeviceSession>, SyncError>;
}

#[async_trait]
pub trait DeviceSession: Send {
    /// Best-effort; errors on the cleanup path are ignored.
    async fn disable(&mut self) -> Result<(), SyncError>;
    async fn enable(&mut self) -> Result<(), SyncError>;
    async fn device_serial(&mut self) -> Option<String>;
    async fn list_users(&mut self) -> Result<Vec<UserRecord>, SyncError>;
    async fn list_events(&mut self) -> Result<Vec<RawDeviceEvent>, SyncError>;
    async fn disconnect(&mut self);
}

// ─── Scripted connector (tests, demos, no-hardware runs) ──────

pub mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Canned behavior for one device, keyed by ip.
    #[derive(Clone, Debug, Default)]
    pub struct DeviceScript {
        pub serial: Option<String>,
        pub users: Vec<UserRecord>,
        pub events: Vec<RawDeviceEvent>,
        pub connect_error: Option<String>,
        pub fetch_error: Option<String>,
        /// Simulated fetch latency, applied inside `list_events`.
        pub fetch_delay: Option<Duration>,
    }

    /// Scripted implementation of `DeviceConnector`. Sessions replay
    /// the script verbatim on every connect, which is exactly what a
    /// real terminal does until its log is cleared.
    #[derive(Clone, Default)]
    pub struct MockConnector {
        scripts: Arc<Mutex<HashMap<String, DeviceScript>>>,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl MockConnector {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn script(&self, ip: &str, script: DeviceScript) {
            self.scripts.lock().unwrap().insert(ip.to_string(), script);
        }

        /// Ordered log of connector-level calls, for assertions.
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl DeviceConnector for MockConnector {
        async fn connect(&self, device: &Device) -> Result<Box<dyn DeviceSession>, SyncError> {
            self.record(format!("connect {}", device.ip));
            let script = self
                .scripts
                .lock()
                .unwrap()
                .get(&device.ip)
                .cloned()
                .ok_or_else(|| SyncError::Network(format!("no route to {}", device.ip)))?;
            if let Some(msg) = script.connect_error {
                return Err(SyncError::Network(msg));
            }
            Ok(Box::new(MockSession {
                script,
                calls: self.calls.clone(),
                ip: device.ip.clone(),
            }))
        }
    }

    struct MockSession {
        script: DeviceScript,
        calls: Arc<Mutex<Vec<String>>>,
        ip: String,
    }

    #[async_trait]
    impl DeviceSession for MockSession {
        async fn disable(&mut self) -> Result<(), SyncError> {
            Ok(())
        }

        async fn enable(&mut self) -> Result<(), SyncError> {
            self.calls.lock().unwrap().push(format!("enable {}", self.ip));
            Ok(())
        }

        async fn device_serial(&mut self) -> Option<String> {
            self.script.serial.clone()
        }

        async fn list_users(&mut self) -> Result<Vec<UserRecord>, SyncError> {
            Ok(self.script.users.clone())
        }

        async fn list_events(&mut self) -> Result<Vec<RawDeviceEvent>, SyncError> {
            if let Some(delay) = self.script.fetch_delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(msg) = &self.script.fetch_error {
                return Err(SyncError::Network(msg.clone()));
            }
            Ok(self.script.events.clone())
        }

        async fn disconnect(&mut self) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("disconnect {}", self.ip));
        }
    }
}
