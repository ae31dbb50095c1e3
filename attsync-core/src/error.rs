use thiserror::Error;

/// Error taxonomy for the sync engine. Kinds that change behavior
/// (degraded mode, fail-fast export start) are distinct variants;
/// everything else travels as `Internal`.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Device unreachable or the session died mid-fetch.
    #[error("device network error: {0}")]
    Network(String),

    /// Per-device mutex not acquired within the configured timeout.
    #[error("lock timeout on {0}")]
    LockTimeout(String),

    /// Unique-constraint race on an identity upsert.
    #[error("integrity conflict: {0}")]
    IntegrityConflict(String),

    /// The per-device dual-write transaction failed to commit.
    #[error("source commit failed: {0}")]
    SourceCommit(String),

    /// End-database failure during export.
    #[error("end database error: {0}")]
    EndDb(String),

    /// A required configuration key is absent.
    #[error("missing configuration: {0}")]
    ConfigMissing(&'static str),

    #[error("Export already running")]
    ExportBusy,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
