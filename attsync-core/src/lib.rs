//! Synchronization engine for a fleet of networked attendance
//! terminals: a recurring poll scheduler with per-run capture and a
//! job registry, a per-device fetch-and-forward pipeline with
//! identity resolution and duplicate-safe dual writes, and a batched
//! idempotent exporter into the downstream reporting database.

pub mod config;
pub mod device;
pub mod end_store;
pub mod error;
pub mod events;
pub mod exporter;
pub mod fetcher;
pub mod identity;
pub mod jobs;
pub mod locks;
pub mod run_log;
pub mod runner;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod store_memory;
pub mod types;

#[cfg(feature = "postgres")]
pub mod end_postgres;
#[cfg(feature = "postgres")]
pub mod store_postgres;

pub use config::SyncConfig;
pub use error::SyncError;
pub use service::SyncService;
