use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// ISO-8601 UTC timestamp with millisecond precision and a `Z`
/// suffix, the wire format every streamed record carries.
pub fn now_iso() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Log,
    Console,
    DeviceStatus,
    NewLogsBatch,
    DbInsertTimes,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Debug,
    Info,
    /// New events landed; the operator UI highlights these.
    New,
    Warning,
    Error,
}

/// Structured record emitted on the live event stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BusEvent {
    pub kind: EventKind,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    pub level: Level,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

impl BusEvent {
    pub fn log(level: Level, message: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Log,
            timestamp: now_iso(),
            device_id: None,
            device_name: None,
            level,
            message: message.into(),
            extra: None,
        }
    }

    pub fn device(mut self, id: i64, name: &str) -> Self {
        self.device_id = Some(id);
        self.device_name = Some(name.to_string());
        self
    }

    pub fn kind(mut self, kind: EventKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn extra(mut self, extra: serde_json::Value) -> Self {
        self.extra = Some(extra);
        self
    }
}

/// Broadcast fan-out for operator consoles. Bounded; lagging
/// subscribers lose the oldest records rather than blocking
/// producers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }

    /// Send errors only mean "no subscribers"; producers never care.
    pub fn emit(&self, event: BusEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_sees_emitted_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.emit(BusEvent::log(Level::Info, "hello").device(7, "K40-1"));

        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::Log);
        assert_eq!(ev.device_id, Some(7));
        assert_eq!(ev.device_name.as_deref(), Some("K40-1"));
        assert!(ev.timestamp.ends_with('Z'));
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.emit(BusEvent::log(Level::Error, "nobody listening"));
    }
}
