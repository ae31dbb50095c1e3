use std::env;
use std::time::Duration;

/// Runtime configuration for the sync engine. Every key is optional
/// in the environment; defaults match the values the fleet has been
/// operated with.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Recurring poll interval.
    pub poll_interval: Duration,
    /// Bounded worker pool size for one poll run.
    pub max_poll_workers: usize,
    /// Directory for run logs and the unmapped-badge CSVs.
    pub scheduler_log_dir: String,
    /// Directory holding the per-device lock directories.
    pub access_lock_dir: String,
    pub access_lock_timeout: Duration,
    pub access_lock_stale: Duration,
    pub export_batch_size: usize,
    pub export_lookback_days: Option<i64>,
    pub export_after_poll: bool,
    /// Minutes subtracted from the event timestamp before export.
    /// Carried from the legacy forwarder; 0 unless proven needed.
    pub export_time_offset_min: i64,
    pub end_db_uri: Option<String>,
    pub end_target_table: String,
    pub auto_create_userinfo: bool,
    pub allow_insert_raw_badge: bool,
    pub auto_create_users_from_badges: bool,
    pub prune_missing_device_users: bool,
    pub job_ttl: Duration,
    pub job_prune_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3600),
            max_poll_workers: 10,
            scheduler_log_dir: "logs".into(),
            access_lock_dir: "locks".into(),
            access_lock_timeout: Duration::from_secs(15),
            access_lock_stale: Duration::from_secs(60),
            export_batch_size: 1500,
            export_lookback_days: Some(10),
            export_after_poll: true,
            export_time_offset_min: 0,
            end_db_uri: None,
            end_target_table: "att_raw_data_old".into(),
            auto_create_userinfo: false,
            allow_insert_raw_badge: true,
            auto_create_users_from_badges: false,
            prune_missing_device_users: false,
            job_ttl: Duration::from_secs(3600),
            job_prune_interval: Duration::from_secs(600),
        }
    }
}

fn env_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(env_parse(key, default))
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            poll_interval: env_secs("POLL_INTERVAL", d.poll_interval.as_secs()),
            max_poll_workers: env_parse("MAX_POLL_WORKERS", d.max_poll_workers),
            scheduler_log_dir: env::var("SCHEDULER_LOG_DIR").unwrap_or(d.scheduler_log_dir),
            access_lock_dir: env::var("ACCESS_LOCK_DIR").unwrap_or(d.access_lock_dir),
            access_lock_timeout: env_secs("ACCESS_LOCK_TIMEOUT", d.access_lock_timeout.as_secs()),
            access_lock_stale: env_secs("ACCESS_LOCK_STALE_SECONDS", d.access_lock_stale.as_secs()),
            export_batch_size: env_parse("EXPORT_BATCH_SIZE", d.export_batch_size),
            export_lookback_days: env::var("EXPORT_LOOKBACK_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .or(d.export_lookback_days),
            export_after_poll: env_bool("EXPORT_AFTER_POLL", d.export_after_poll),
            export_time_offset_min: env_parse("EXPORT_TIME_OFFSET_MIN", d.export_time_offset_min),
            end_db_uri: env::var("END_DB_URI").ok().filter(|v| !v.is_empty()),
            end_target_table: env::var("END_TARGET_TABLE").unwrap_or(d.end_target_table),
            auto_create_userinfo: env_bool("AUTO_CREATE_USERINFO", d.auto_create_userinfo),
            allow_insert_raw_badge: env_bool("ALLOW_INSERT_RAW_BADGE", d.allow_insert_raw_badge),
            auto_create_users_from_badges: env_bool(
                "AUTO_CREATE_USERS_FROM_BADGES",
                d.auto_create_users_from_badges,
            ),
            prune_missing_device_users: env_bool(
                "PRUNE_MISSING_DEVICE_USERS",
                d.prune_missing_device_users,
            ),
            job_ttl: env_secs("JOB_TTL_SECONDS", d.job_ttl.as_secs()),
            job_prune_interval: env_secs("JOB_PRUNE_INTERVAL_SECONDS", d.job_prune_interval.as_secs()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_fleet_values() {
        let cfg = SyncConfig::default();
        assert_eq!(cfg.poll_interval, Duration::from_secs(3600));
        assert_eq!(cfg.max_poll_workers, 10);
        assert_eq!(cfg.export_batch_size, 1500);
        assert_eq!(cfg.export_lookback_days, Some(10));
        assert!(cfg.export_after_poll);
        assert_eq!(cfg.export_time_offset_min, 0);
        assert_eq!(cfg.end_target_table, "att_raw_data_old");
        assert!(cfg.allow_insert_raw_badge);
        assert!(!cfg.auto_create_userinfo);
        assert!(!cfg.auto_create_users_from_badges);
        assert!(!cfg.prune_missing_device_users);
    }
}
