//! End-to-end scenarios: exercise the full sync pipeline through the
//! service facade over the memory stores and the scripted connector.
//!
//! The HTTP handlers are thin wrappers around `SyncService`, so
//! driving the facade directly validates the whole stack: poll jobs,
//! the fetcher pipeline, identity resolution, dual writes, the
//! per-device lock, the scheduler, and the exporter.

use attsync_core::config::SyncConfig;
use attsync_core::device::mock::{DeviceScript, MockConnector};
use attsync_core::device::{RawDeviceEvent, RawStatus, UserRecord};
use attsync_core::end_store::memory::MemoryEndStore;
use attsync_core::error::SyncError;
use attsync_core::events::Level;
use attsync_core::jobs::{JobRecord, JobStatus};
use attsync_core::service::SyncService;
use attsync_core::store::SyncStore;
use attsync_core::store_memory::MemoryStore;
use chrono::{TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const DEVICE_IP: &str = "172.19.109.231";

struct Harness {
    service: Arc<SyncService>,
    store: Arc<MemoryStore>,
    end: Arc<MemoryEndStore>,
    mock: MockConnector,
    tmp: tempfile::TempDir,
}

fn harness(tweak: impl FnOnce(&mut SyncConfig)) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = SyncConfig {
        scheduler_log_dir: tmp.path().join("logs").display().to_string(),
        access_lock_dir: tmp.path().join("locks").display().to_string(),
        export_lookback_days: None,
        export_after_poll: false,
        ..SyncConfig::default()
    };
    tweak(&mut config);

    let store = Arc::new(MemoryStore::new());
    let end = Arc::new(MemoryEndStore::new());
    let mock = MockConnector::new();
    let service = SyncService::new(
        store.clone(),
        Arc::new(mock.clone()),
        Some(end.clone() as Arc<dyn attsync_core::end_store::EndStore>),
        config,
    );
    Harness {
        service,
        store,
        end,
        mock,
        tmp,
    }
}

fn user(uid: &str) -> UserRecord {
    UserRecord {
        device_userid: uid.to_string(),
        name: None,
        card: None,
    }
}

fn event(uid: i64, userid: &str, hour: u32, min: u32, status: &str) -> RawDeviceEvent {
    RawDeviceEvent {
        record_id: Some(uid),
        device_userid: Some(userid.to_string()),
        timestamp: Some(Utc.with_ymd_and_hms(2025, 1, 10, hour, min, 0).unwrap()),
        status: Some(RawStatus::Name(status.to_string())),
    }
}

async fn seed_device(h: &Harness, serial: Option<&str>, script: DeviceScript) -> i64 {
    let branch = h.store.add_branch("HQ", "172.19.109.0/24").await.unwrap();
    let device = h
        .store
        .add_device(Some(branch.id), "K40-1", DEVICE_IP, 4370, serial)
        .await
        .unwrap();
    h.mock.script(DEVICE_IP, script);
    device.id
}

async fn wait_terminal(service: &Arc<SyncService>, job_id: Uuid) -> JobRecord {
    for _ in 0..500 {
        if let Some(job) = service.get_job(job_id) {
            if job.is_terminal() {
                return job;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} never reached a terminal state");
}

// ── Scenario 1: fresh device, three events ────────────────────

#[tokio::test]
async fn fresh_device_three_events_end_to_end() {
    let h = harness(|c| c.export_time_offset_min = 10);
    let device_id = seed_device(
        &h,
        Some("SN-A"),
        DeviceScript {
            serial: Some("SN-A".into()),
            users: vec![user("100"), user("101")],
            events: vec![
                event(1, "100", 9, 0, "IN"),
                event(2, "101", 9, 1, "IN"),
                event(3, "100", 9, 2, "OUT"),
            ],
            ..Default::default()
        },
    )
    .await;

    let job_id = h.service.clone().start_poll_all_job().await.unwrap();
    let job = wait_terminal(&h.service, job_id).await;
    assert_eq!(job.status, JobStatus::Finished);
    assert_eq!(job.done, 1);

    let events = h.store.events_for_device(device_id).await.unwrap();
    assert_eq!(events.len(), 3);
    let raws = h.store.raw_events_for_serial("SN-A").await.unwrap();
    assert_eq!(raws.len(), 3);
    assert!(raws.iter().all(|r| r.device_serial == "SN-A"));
    assert_eq!(h.store.refs_for_serial("SN-A").await.unwrap().len(), 2);

    let outcome = h.service.clone().run_export(false).await.unwrap();
    assert_eq!(outcome.exported, 3);

    let mut times: Vec<String> = h
        .end
        .rows()
        .iter()
        .map(|r| r.log_time.to_string())
        .collect();
    times.sort();
    assert_eq!(times, vec!["08:50:00", "08:51:00", "08:52:00"]);
    assert!(h
        .end
        .rows()
        .iter()
        .all(|r| r.access_device == "ZKT-FLASK-SN-A"));
}

// ── Scenario 2: rerun with the same device log ────────────────

#[tokio::test]
async fn rerun_with_same_events_inserts_nothing() {
    let h = harness(|_| {});
    let device_id = seed_device(
        &h,
        Some("SN-A"),
        DeviceScript {
            serial: Some("SN-A".into()),
            events: vec![
                event(1, "100", 9, 0, "IN"),
                event(2, "101", 9, 1, "IN"),
                event(3, "100", 9, 2, "OUT"),
            ],
            ..Default::default()
        },
    )
    .await;

    let first = h.service.clone().poll_device_once(device_id).await.unwrap();
    assert_eq!(first, Some(3));
    h.service.clone().run_export(false).await.unwrap();
    assert_eq!(h.end.len(), 3);

    // The terminal returns its whole log again on the next session.
    let second = h.service.clone().poll_device_once(device_id).await.unwrap();
    assert_eq!(second, Some(0));
    assert_eq!(h.store.events_for_device(device_id).await.unwrap().len(), 3);

    let outcome = h.service.clone().run_export(false).await.unwrap();
    assert_eq!(outcome.exported, 0);
    assert_eq!(h.end.len(), 3);
}

// ── Scenario 3: lock contention → degraded ingestion ──────────

#[tokio::test]
async fn lock_contention_degrades_to_canonical_only() {
    let h = harness(|c| c.access_lock_timeout = Duration::from_millis(300));
    let device_id = seed_device(
        &h,
        Some("SN-A"),
        DeviceScript {
            serial: Some("SN-A".into()),
            users: vec![user("100")],
            events: vec![event(1, "100", 9, 0, "IN")],
            ..Default::default()
        },
    )
    .await;

    // Another process holds the device lock.
    let lock_dir = h.tmp.path().join("locks").join("access_lock_SN-A");
    std::fs::create_dir_all(&lock_dir).unwrap();

    let mut rx = h.service.subscribe();
    let job_id = h.service.clone().start_poll_all_job().await.unwrap();
    let job = wait_terminal(&h.service, job_id).await;
    assert_eq!(job.status, JobStatus::Finished);

    // Canonical events landed; replica writes were skipped.
    assert_eq!(h.store.events_for_device(device_id).await.unwrap().len(), 1);
    assert!(h.store.raw_events_for_serial("SN-A").await.unwrap().is_empty());
    assert!(h.store.refs_for_serial("SN-A").await.unwrap().is_empty());

    let mut saw_warning = false;
    while let Ok(ev) = rx.try_recv() {
        if ev.level == Level::Warning && ev.message.contains("[LOCK]") {
            saw_warning = true;
        }
    }
    assert!(saw_warning, "expected a degraded-mode warning event");
}

// ── Scenario 4: unmapped badge ────────────────────────────────

#[tokio::test]
async fn unmapped_badge_is_audited_but_still_ingested() {
    let h = harness(|_| {});
    let device_id = seed_device(
        &h,
        Some("SN-A"),
        DeviceScript {
            serial: Some("SN-A".into()),
            events: vec![event(10, "999", 9, 0, "IN")],
            ..Default::default()
        },
    )
    .await;

    let fetched = h.service.clone().poll_device_once(device_id).await.unwrap();
    assert_eq!(fetched, Some(1));

    let events = h.store.events_for_device(device_id).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].badge_id, None);

    // ALLOW_INSERT_RAW_BADGE keeps the replica row, with the raw id.
    let raws = h.store.raw_events_for_serial("SN-A").await.unwrap();
    assert_eq!(raws.len(), 1);
    assert_eq!(raws[0].device_userid, "999");

    let csv = h
        .tmp
        .path()
        .join("logs")
        .join(format!("access_unmapped_SN-A_{}.csv", Utc::now().format("%Y%m%d")));
    let contents = std::fs::read_to_string(csv).unwrap();
    assert_eq!(contents, "badge\n999\n");
}

// ── Scenario 5: scheduler overrun ─────────────────────────────

#[tokio::test(start_paused = true)]
async fn overlapping_ticks_are_skipped() {
    let h = harness(|_| {});
    seed_device(
        &h,
        Some("SN-A"),
        DeviceScript {
            serial: Some("SN-A".into()),
            events: vec![event(1, "100", 9, 0, "IN")],
            fetch_delay: Some(Duration::from_secs(3)),
            ..Default::default()
        },
    )
    .await;

    h.service
        .clone()
        .start_scheduler_job(Some(Duration::from_secs(1)));
    assert!(h.service.scheduler_running());

    tokio::time::sleep(Duration::from_secs(5)).await;
    h.service.clone().stop_scheduler_job();

    let connects = h
        .mock
        .calls()
        .iter()
        .filter(|c| c.starts_with("connect"))
        .count();
    assert!(
        (1..=3).contains(&connects),
        "expected 1..=3 poll runs in 5s with a 3s fetch, got {connects}"
    );
}

// ── Scenario 6: exporter partial failure, then recovery ───────

#[tokio::test]
async fn export_survives_partial_end_failure_and_completes_next_run() {
    let h = harness(|_| {});
    let device_id = seed_device(
        &h,
        Some("SN-A"),
        DeviceScript {
            serial: Some("SN-A".into()),
            events: (1..=10).map(|i| event(i, "100", 9, i as u32, "IN")).collect(),
            ..Default::default()
        },
    )
    .await;
    h.service.clone().poll_device_once(device_id).await.unwrap();

    h.end.fail_after(4);
    let job_id = h.service.clone().start_export_job(false);
    let job = wait_terminal(&h.service, job_id).await;
    assert_eq!(job.status, JobStatus::Finished);
    let result = &job.results[0];
    assert_eq!(result["exported"], 4);
    assert!(result["errors"].as_u64().unwrap() >= 1);
    assert_eq!(h.end.len(), 4);

    // The end database recovers; the next run ships the remainder.
    h.end.heal();
    let outcome = h.service.clone().run_export(false).await.unwrap();
    assert_eq!(outcome.exported, 6);
    assert_eq!(h.end.len(), 10);
}

// ── Invariants ────────────────────────────────────────────────

#[tokio::test]
async fn scheduler_start_is_singleton() {
    let h = harness(|_| {});
    let first = h
        .service
        .clone()
        .start_scheduler_job(Some(Duration::from_secs(60)));
    let second = h
        .service
        .clone()
        .start_scheduler_job(Some(Duration::from_secs(60)));

    let first = wait_terminal(&h.service, first).await;
    let second = wait_terminal(&h.service, second).await;
    assert_eq!(first.results[0]["message"], "scheduler started");
    assert_eq!(second.results[0]["message"], "scheduler already running");
    assert!(h.service.scheduler_running());

    h.service.clone().stop_scheduler_job();
    assert!(!h.service.scheduler_running());
}

#[tokio::test]
async fn concurrent_exports_fail_fast() {
    let h = harness(|_| {});
    let device_id = seed_device(
        &h,
        Some("SN-A"),
        DeviceScript {
            serial: Some("SN-A".into()),
            events: vec![event(1, "100", 9, 0, "IN")],
            ..Default::default()
        },
    )
    .await;
    h.service.clone().poll_device_once(device_id).await.unwrap();

    h.end.set_insert_delay(Duration::from_millis(200));
    let slow = tokio::spawn(h.service.clone().run_export(false));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = h.service.clone().run_export(false).await.unwrap_err();
    assert!(matches!(err, SyncError::ExportBusy));
    assert_eq!(err.to_string(), "Export already running");

    slow.await.unwrap().unwrap();
}

#[tokio::test]
async fn export_without_end_db_fails_fast() {
    let tmp = tempfile::tempdir().unwrap();
    let config = SyncConfig {
        scheduler_log_dir: tmp.path().join("logs").display().to_string(),
        access_lock_dir: tmp.path().join("locks").display().to_string(),
        ..SyncConfig::default()
    };
    let service = SyncService::new(
        Arc::new(MemoryStore::new()),
        Arc::new(MockConnector::new()),
        None,
        config,
    );

    let err = service.clone().run_export(false).await.unwrap_err();
    assert!(matches!(err, SyncError::ConfigMissing("END_DB_URI")));
}

#[tokio::test]
async fn auto_provisioning_creates_user_badge_and_link() {
    let h = harness(|c| c.auto_create_users_from_badges = true);
    let device_id = seed_device(
        &h,
        Some("SN-A"),
        DeviceScript {
            serial: Some("SN-A".into()),
            events: vec![event(1, "555", 9, 0, "IN")],
            ..Default::default()
        },
    )
    .await;

    h.service.clone().poll_device_once(device_id).await.unwrap();

    let badge = h.store.badge_by_number("555").await.unwrap().unwrap();
    let user = h.store.user_by_employee_code("555").await.unwrap().unwrap();
    assert_eq!(badge.user_id, user.id);
    assert_eq!(user.full_name, "IMPORTED");

    let events = h.store.events_for_device(device_id).await.unwrap();
    assert_eq!(events[0].badge_id, Some(badge.id));

    // Re-polling never reassigns the badge to another user.
    h.service.clone().poll_device_once(device_id).await.unwrap();
    let badge_after = h.store.badge_by_number("555").await.unwrap().unwrap();
    assert_eq!(badge_after.user_id, user.id);
}

#[tokio::test]
async fn connect_failure_is_reported_and_run_continues() {
    let h = harness(|_| {});
    let branch = h.store.add_branch("HQ", "172.19.109.0/24").await.unwrap();
    let down = h
        .store
        .add_device(Some(branch.id), "K40-down", "10.9.9.9", 4370, None)
        .await
        .unwrap();
    let up = h
        .store
        .add_device(Some(branch.id), "K40-up", DEVICE_IP, 4370, Some("SN-A"))
        .await
        .unwrap();
    h.mock.script(
        DEVICE_IP,
        DeviceScript {
            serial: Some("SN-A".into()),
            events: vec![event(1, "100", 9, 0, "IN")],
            ..Default::default()
        },
    );

    let job_id = h.service.clone().start_poll_all_job().await.unwrap();
    let job = wait_terminal(&h.service, job_id).await;
    assert_eq!(job.status, JobStatus::Finished);
    assert_eq!(job.done, 2);

    let by_device: std::collections::HashMap<i64, &serde_json::Value> = job
        .results
        .iter()
        .map(|r| (r["device_id"].as_i64().unwrap(), r))
        .collect();
    assert!(by_device[&down.id]["error"].is_string());
    assert_eq!(by_device[&up.id]["fetched"], 1);
    assert_eq!(h.store.events_for_device(up.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn serial_backfill_persists_discovered_serial() {
    let h = harness(|_| {});
    let device_id = seed_device(
        &h,
        None,
        DeviceScript {
            serial: Some("SN-LIVE".into()),
            events: vec![],
            ..Default::default()
        },
    )
    .await;

    h.service.clone().poll_device_once(device_id).await.unwrap();
    let device = h.store.get_device(device_id).await.unwrap().unwrap();
    assert_eq!(device.serial.as_deref(), Some("SN-LIVE"));
}

#[tokio::test]
async fn poll_run_writes_log_file_with_summary() {
    let h = harness(|_| {});
    seed_device(
        &h,
        Some("SN-A"),
        DeviceScript {
            serial: Some("SN-A".into()),
            events: vec![event(1, "100", 9, 0, "IN")],
            ..Default::default()
        },
    )
    .await;

    let job_id = h.service.clone().start_poll_all_job().await.unwrap();
    wait_terminal(&h.service, job_id).await;

    let logs_dir = h.tmp.path().join("logs");
    let run_file = std::fs::read_dir(&logs_dir)
        .unwrap()
        .filter_map(Result::ok)
        .find(|e| e.file_name().to_string_lossy().starts_with("zk_sync_"))
        .expect("run log file");
    let contents = std::fs::read_to_string(run_file.path()).unwrap();
    assert!(contents.contains("===== SYNC RUN START:"));
    assert!(contents.contains("RUN_SUMMARY_JSON: "));
    assert!(contents.contains("\"devices_polled\":1"));
}
