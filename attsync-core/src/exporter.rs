//! Batched, idempotent forwarder from the event store into the end
//! database. Safe to re-run: a duplicate probe on the end table plus
//! the source-side `exported` flag mean no row is ever sent twice.

use crate::end_store::{EndRow, EndStore};
use crate::error::SyncError;
use crate::store::SyncStore;
use crate::types::ExportOutcome;
use chrono::{Duration, Utc};
use std::collections::HashMap;

#[derive(Clone, Debug)]
pub struct ExportParams {
    pub batch_size: usize,
    pub lookback_days: Option<i64>,
    /// Minutes subtracted from the event timestamp before deriving
    /// log_date/log_time. Legacy forwarder used 10; default is 0.
    pub time_offset_min: i64,
    /// Count what would be sent without writing or marking anything.
    pub dry_run: bool,
}

impl Default for ExportParams {
    fn default() -> Self {
        Self {
            batch_size: 1500,
            lookback_days: Some(10),
            time_offset_min: 0,
            dry_run: false,
        }
    }
}

/// Ship up to one batch of unexported events. Row-level failures are
/// counted and skipped; the batch keeps going.
pub async fn export_attendance(
    store: &dyn SyncStore,
    end: &dyn EndStore,
    params: &ExportParams,
) -> Result<ExportOutcome, SyncError> {
    let cutoff = params
        .lookback_days
        .map(|days| Utc::now() - Duration::days(days));
    let rows = store
        .unexported_events(params.batch_size, cutoff)
        .await
        .map_err(SyncError::Internal)?;

    let mut outcome = ExportOutcome::default();
    if rows.is_empty() {
        return Ok(outcome);
    }

    // Device serial resolution is per device, not per row.
    let mut doors: HashMap<i64, String> = HashMap::new();

    for rec in rows {
        let badge = if !rec.device_userid.trim().is_empty() {
            rec.device_userid.trim().to_string()
        } else if !rec.user_id.trim().is_empty() {
            rec.user_id.trim().to_string()
        } else {
            outcome.skipped_empty_user += 1;
            continue;
        };

        let access_door = match doors.get(&rec.device_id) {
            Some(door) => door.clone(),
            None => {
                let door = store
                    .get_device(rec.device_id)
                    .await
                    .map_err(SyncError::Internal)?
                    .and_then(|d| d.serial)
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| rec.device_id.to_string());
                doors.insert(rec.device_id, door.clone());
                door
            }
        };

        let log_dt = rec.timestamp - Duration::minutes(params.time_offset_min);
        let row = EndRow {
            log_date: log_dt.date_naive(),
            badge,
            log_time: log_dt.time(),
            access_device: format!("ZKT-FLASK-{access_door}"),
            access_door,
        };

        match end.contains(&row).await {
            Ok(true) => {
                outcome.skipped_existing += 1;
                if !params.dry_run {
                    mark(store, rec.id).await;
                }
                continue;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::error!(event_id = rec.id, error = %e, "end-db duplicate probe failed");
                outcome.errors += 1;
                continue;
            }
        }

        if params.dry_run {
            outcome.exported += 1;
            continue;
        }

        match end.insert(&row).await {
            Ok(()) => {
                outcome.exported += 1;
                mark(store, rec.id).await;
            }
            Err(e) => {
                tracing::error!(event_id = rec.id, error = %e, "end-db insert failed");
                outcome.errors += 1;
            }
        }
    }

    Ok(outcome)
}

/// Source-side export mark. A failure here is recoverable — the next
/// run re-probes the end table and skips the row — so it is logged,
/// not propagated.
async fn mark(store: &dyn SyncStore, event_id: i64) {
    if let Err(e) = store.mark_exported(event_id, Utc::now()).await {
        tracing::warn!(event_id, error = %e, "could not mark event exported");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::end_store::memory::MemoryEndStore;
    use crate::store::SyncStore;
    use crate::store_memory::MemoryStore;
    use crate::types::{NewAttendanceEvent, StagedEvent};
    use chrono::TimeZone;

    async fn seed(store: &MemoryStore, serial: Option<&str>, n: i64) -> i64 {
        let device = store
            .add_device(None, "K40-1", "10.0.0.9", 4370, serial)
            .await
            .unwrap();
        let batch: Vec<StagedEvent> = (1..=n)
            .map(|i| StagedEvent {
                event: NewAttendanceEvent {
                    record_id: i,
                    user_id: format!("10{i}"),
                    device_userid: format!("10{i}"),
                    badge_id: None,
                    timestamp: Utc.with_ymd_and_hms(2025, 1, 10, 9, i as u32, 0).unwrap(),
                    status: "IN".to_string(),
                },
                raw: None,
            })
            .collect();
        store.commit_fetch(device.id, &batch).await.unwrap();
        device.id
    }

    fn params() -> ExportParams {
        ExportParams {
            lookback_days: None,
            ..ExportParams::default()
        }
    }

    #[tokio::test]
    async fn exports_and_marks_each_row() {
        let store = MemoryStore::new();
        let end = MemoryEndStore::new();
        let device_id = seed(&store, Some("SN-A"), 3).await;

        let outcome = export_attendance(&store, &end, &params()).await.unwrap();
        assert_eq!(outcome.exported, 3);
        assert_eq!(end.len(), 3);

        let row = &end.rows()[0];
        assert_eq!(row.access_door, "SN-A");
        assert_eq!(row.access_device, "ZKT-FLASK-SN-A");
        assert_eq!(row.log_time.to_string(), "09:01:00");

        for ev in store.events_for_device(device_id).await.unwrap() {
            assert!(ev.exported);
            assert!(ev.exported_at.is_some());
        }
    }

    #[tokio::test]
    async fn rerun_is_idempotent() {
        let store = MemoryStore::new();
        let end = MemoryEndStore::new();
        seed(&store, Some("SN-A"), 3).await;

        export_attendance(&store, &end, &params()).await.unwrap();
        let second = export_attendance(&store, &end, &params()).await.unwrap();
        assert_eq!(second, ExportOutcome::default());
        assert_eq!(end.len(), 3);
    }

    #[tokio::test]
    async fn existing_end_rows_are_skipped_but_marked() {
        let store = MemoryStore::new();
        let end = MemoryEndStore::new();
        let device_id = seed(&store, Some("SN-A"), 1).await;

        // Pre-insert the exact row the exporter would write.
        end.insert(&EndRow {
            log_date: chrono::NaiveDate::from_ymd_opt(2025, 1, 10).unwrap(),
            badge: "101".to_string(),
            log_time: chrono::NaiveTime::from_hms_opt(9, 1, 0).unwrap(),
            access_door: "SN-A".to_string(),
            access_device: "ZKT-FLASK-SN-A".to_string(),
        })
        .await
        .unwrap();

        let outcome = export_attendance(&store, &end, &params()).await.unwrap();
        assert_eq!(outcome.exported, 0);
        assert_eq!(outcome.skipped_existing, 1);
        assert_eq!(end.len(), 1);
        assert!(store.events_for_device(device_id).await.unwrap()[0].exported);
    }

    #[tokio::test]
    async fn time_offset_shifts_date_and_time() {
        let store = MemoryStore::new();
        let end = MemoryEndStore::new();
        let device = store
            .add_device(None, "K40-1", "10.0.0.9", 4370, Some("SN-A"))
            .await
            .unwrap();
        // Five past midnight: a 10-minute offset crosses the date line.
        store
            .commit_fetch(
                device.id,
                &[StagedEvent {
                    event: NewAttendanceEvent {
                        record_id: 1,
                        user_id: "100".into(),
                        device_userid: "100".into(),
                        badge_id: None,
                        timestamp: Utc.with_ymd_and_hms(2025, 1, 11, 0, 5, 0).unwrap(),
                        status: "IN".into(),
                    },
                    raw: None,
                }],
            )
            .await
            .unwrap();

        let outcome = export_attendance(
            &store,
            &end,
            &ExportParams {
                time_offset_min: 10,
                lookback_days: None,
                ..ExportParams::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(outcome.exported, 1);
        let row = &end.rows()[0];
        assert_eq!(row.log_date.to_string(), "2025-01-10");
        assert_eq!(row.log_time.to_string(), "23:55:00");
    }

    #[tokio::test]
    async fn empty_badges_are_counted_and_skipped() {
        let store = MemoryStore::new();
        let end = MemoryEndStore::new();
        let device = store
            .add_device(None, "K40-1", "10.0.0.9", 4370, None)
            .await
            .unwrap();
        store
            .commit_fetch(
                device.id,
                &[StagedEvent {
                    event: NewAttendanceEvent {
                        record_id: 1,
                        user_id: "  ".into(),
                        device_userid: String::new(),
                        badge_id: None,
                        timestamp: Utc::now(),
                        status: "IN".into(),
                    },
                    raw: None,
                }],
            )
            .await
            .unwrap();

        let outcome = export_attendance(&store, &end, &params()).await.unwrap();
        assert_eq!(outcome.skipped_empty_user, 1);
        assert!(end.is_empty());
    }

    #[tokio::test]
    async fn partial_end_failure_keeps_earlier_rows_and_counts_errors() {
        let store = MemoryStore::new();
        let end = MemoryEndStore::new();
        let device_id = seed(&store, Some("SN-A"), 6).await;
        end.fail_after(4);

        let outcome = export_attendance(&store, &end, &params()).await.unwrap();
        assert_eq!(outcome.exported, 4);
        assert_eq!(outcome.errors, 2);
        assert_eq!(end.len(), 4);

        let exported: Vec<bool> = store
            .events_for_device(device_id)
            .await
            .unwrap()
            .iter()
            .map(|e| e.exported)
            .collect();
        assert_eq!(exported, vec![true, true, true, true, false, false]);
    }

    #[tokio::test]
    async fn dry_run_writes_and_marks_nothing() {
        let store = MemoryStore::new();
        let end = MemoryEndStore::new();
        let device_id = seed(&store, Some("SN-A"), 2).await;

        let outcome = export_attendance(
            &store,
            &end,
            &ExportParams {
                dry_run: true,
                lookback_days: None,
                ..ExportParams::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(outcome.exported, 2);
        assert!(end.is_empty());
        assert!(store
            .events_for_device(device_id)
            .await
            .unwrap()
            .iter()
            .all(|e| !e.exported));
    }

    #[tokio::test]
    async fn missing_serial_falls_back_to_device_id() {
        let store = MemoryStore::new();
        let end = MemoryEndStore::new();
        let device_id = seed(&store, None, 1).await;

        export_attendance(&store, &end, &params()).await.unwrap();
        let row = &end.rows()[0];
        assert_eq!(row.access_door, device_id.to_string());
        assert_eq!(row.access_device, format!("ZKT-FLASK-{device_id}"));
    }
}
