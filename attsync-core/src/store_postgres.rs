use crate::store::SyncStore;
use crate::types::*;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

const UNIQUE_VIOLATION: &str = "23505";

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|d| d.code())
        .map(|c| c == UNIQUE_VIOLATION)
        .unwrap_or(false)
}

fn device_from_row(row: &sqlx::postgres::PgRow) -> Device {
    let port: i32 = row.get("port");
    Device {
        id: row.get("id"),
        branch_id: row.get("branch_id"),
        name: row.get("name"),
        ip: row.get("ip"),
        port: port as u16,
        serial: row.get("serial"),
        last_seen: row.get("last_seen"),
    }
}

fn event_from_row(row: &sqlx::postgres::PgRow) -> AttendanceEvent {
    AttendanceEvent {
        id: row.get("id"),
        device_id: row.get("device_id"),
        record_id: row.get("record_id"),
        user_id: row.get("user_id"),
        device_userid: row.get("device_userid"),
        badge_id: row.get("badge_id"),
        timestamp: row.get("timestamp"),
        status: row.get("status"),
        exported: row.get("exported"),
        exported_at: row.get("exported_at"),
    }
}

fn ref_from_row(row: &sqlx::postgres::PgRow) -> DeviceUserRef {
    DeviceUserRef {
        device_userid: row.get("device_userid"),
        badge_number: row.get("badge_number"),
        name: row.get("name"),
        device_serial: row.get("device_serial"),
        source: row.get("source"),
    }
}

/// PostgreSQL-backed implementation of `SyncStore`.
pub struct PostgresStore {
    pool: sqlx::PgPool,
}

impl PostgresStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    /// Run embedded migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run attsync migrations")?;
        Ok(())
    }
}

#[async_trait]
impl SyncStore for PostgresStore {
    // ── Branches / devices ──

    async fn add_branch(&self, name: &str, ip_range: &str) -> Result<Branch> {
        let row = sqlx::query(
            "INSERT INTO branches (name, ip_range) VALUES ($1, $2) RETURNING id",
        )
        .bind(name)
        .bind(ip_range)
        .fetch_one(&self.pool)
        .await?;
        Ok(Branch {
            id: row.get("id"),
            name: name.to_string(),
            ip_range: ip_range.to_string(),
        })
    }

    async fn add_device(
        &self,
        branch_id: Option<i64>,
        name: &str,
        ip: &str,
        port: u16,
        serial: Option<&str>,
    ) -> Result<Device> {
        let row = sqlx::query(
            r#"
            INSERT INTO devices (branch_id, name, ip, port, serial)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(branch_id)
        .bind(name)
        .bind(ip)
        .bind(port as i32)
        .bind(serial)
        .fetch_one(&self.pool)
        .await?;
        Ok(Device {
            id: row.get("id"),
            branch_id,
            name: name.to_string(),
            ip: ip.to_string(),
            port,
            serial: serial.map(str::to_string),
            last_seen: None,
        })
    }

    async fn list_devices(&self) -> Result<Vec<Device>> {
        let rows = sqlx::query(
            "SELECT id, branch_id, name, ip, port, serial, last_seen FROM devices ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(device_from_row).collect())
    }

    async fn devices_by_branch(&self, branch_id: i64) -> Result<Vec<Device>> {
        let rows = sqlx::query(
            r#"
            SELECT id, branch_id, name, ip, port, serial, last_seen
            FROM devices WHERE branch_id = $1 ORDER BY id
            "#,
        )
        .bind(branch_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(device_from_row).collect())
    }

    async fn get_device(&self, id: i64) -> Result<Option<Device>> {
        let row = sqlx::query(
            "SELECT id, branch_id, name, ip, port, serial, last_seen FROM devices WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(device_from_row))
    }

    async fn set_device_serial(&self, id: i64, serial: &str) -> Result<()> {
        let result = sqlx::query("UPDATE devices SET serial = $1 WHERE id = $2")
            .bind(serial)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(anyhow!("device not found: {id}"));
        }
        Ok(())
    }

    async fn touch_device_last_seen(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE devices SET last_seen = $1 WHERE id = $2")
            .bind(at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Identity ──

    async fn badge_by_number(&self, badge_number: &str) -> Result<Option<Badge>> {
        let row = sqlx::query(
            "SELECT id, user_id, badge_number, status FROM badges WHERE badge_number = $1",
        )
        .bind(badge_number)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| Badge {
            id: r.get("id"),
            user_id: r.get("user_id"),
            badge_number: r.get("badge_number"),
            status: r.get("status"),
        }))
    }

    async fn user_by_employee_code(&self, employee_code: &str) -> Result<Option<User>> {
        let row = sqlx::query(
            "SELECT id, branch_id, full_name, employee_code FROM users WHERE employee_code = $1",
        )
        .bind(employee_code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| User {
            id: r.get("id"),
            branch_id: r.get("branch_id"),
            full_name: r.get("full_name"),
            employee_code: r.get("employee_code"),
        }))
    }

    async fn create_user(
        &self,
        branch_id: i64,
        full_name: &str,
        employee_code: &str,
    ) -> Result<User> {
        let row = sqlx::query(
            r#"
            INSERT INTO users (branch_id, full_name, employee_code)
            VALUES ($1, $2, $3) RETURNING id
            "#,
        )
        .bind(branch_id)
        .bind(full_name)
        .bind(employee_code)
        .fetch_one(&self.pool)
        .await?;
        Ok(User {
            id: row.get("id"),
            branch_id,
            full_name: full_name.to_string(),
            employee_code: employee_code.to_string(),
        })
    }

    async fn create_badge(&self, user_id: i64, badge_number: &str) -> Result<Badge> {
        let row = sqlx::query(
            "INSERT INTO badges (user_id, badge_number) VALUES ($1, $2) RETURNING id, status",
        )
        .bind(user_id)
        .bind(badge_number)
        .fetch_one(&self.pool)
        .await?;
        Ok(Badge {
            id: row.get("id"),
            user_id,
            badge_number: badge_number.to_string(),
            status: row.get("status"),
        })
    }

    async fn link_user_device(&self, user_id: i64, device_id: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_device_map (user_id, device_id)
            VALUES ($1, $2) ON CONFLICT DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(device_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ── Roster replica ──

    async fn device_user_ref(
        &self,
        device_userid: &str,
        device_serial: &str,
    ) -> Result<Option<DeviceUserRef>> {
        let row = sqlx::query(
            r#"
            SELECT device_userid, badge_number, name, device_serial, source
            FROM device_user_refs
            WHERE device_userid = $1 AND device_serial = $2
            "#,
        )
        .bind(device_userid)
        .bind(device_serial)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(ref_from_row))
    }

    async fn device_user_ref_any(&self, device_userid: &str) -> Result<Option<DeviceUserRef>> {
        let row = sqlx::query(
            r#"
            SELECT device_userid, badge_number, name, device_serial, source
            FROM device_user_refs
            WHERE device_userid = $1
            ORDER BY updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(device_userid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(ref_from_row))
    }

    async fn device_user_ref_by_badge(
        &self,
        badge_number: &str,
        device_serial: &str,
    ) -> Result<Option<DeviceUserRef>> {
        let row = sqlx::query(
            r#"
            SELECT device_userid, badge_number, name, device_serial, source
            FROM device_user_refs
            WHERE badge_number = $1 AND device_serial = $2
            "#,
        )
        .bind(badge_number)
        .bind(device_serial)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(ref_from_row))
    }

    async fn refs_for_serial(&self, device_serial: &str) -> Result<Vec<DeviceUserRef>> {
        let rows = sqlx::query(
            r#"
            SELECT device_userid, badge_number, name, device_serial, source
            FROM device_user_refs
            WHERE device_serial = $1
            "#,
        )
        .bind(device_serial)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(ref_from_row).collect())
    }

    async fn upsert_device_user_ref(&self, entry: &DeviceUserRef) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO device_user_refs (device_userid, badge_number, name, device_serial, source)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (device_userid, device_serial) DO UPDATE SET
                badge_number = EXCLUDED.badge_number,
                name = COALESCE(EXCLUDED.name, device_user_refs.name),
                updated_at = now()
            "#,
        )
        .bind(&entry.device_userid)
        .bind(&entry.badge_number)
        .bind(&entry.name)
        .bind(&entry.device_serial)
        .bind(&entry.source)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            // badge_number race: another writer holds the badge; the
            // surviving row stands.
            Err(e) if is_unique_violation(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn prune_device_user_refs(&self, device_serial: &str, keep: &[String]) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM device_user_refs
            WHERE device_serial = $1 AND device_userid <> ALL($2)
            "#,
        )
        .bind(device_serial)
        .bind(keep)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // ── Attendance events ──

    async fn existing_record_ids(&self, device_id: i64) -> Result<Vec<i64>> {
        let rows = sqlx::query("SELECT record_id FROM attendance_events WHERE device_id = $1")
            .bind(device_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get("record_id")).collect())
    }

    async fn commit_fetch(&self, device_id: i64, batch: &[StagedEvent]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        for staged in batch {
            let e = &staged.event;
            sqlx::query(
                r#"
                INSERT INTO attendance_events
                    (device_id, record_id, user_id, device_userid, badge_id, "timestamp", status)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(device_id)
            .bind(e.record_id)
            .bind(&e.user_id)
            .bind(&e.device_userid)
            .bind(e.badge_id)
            .bind(e.timestamp)
            .bind(&e.status)
            .execute(&mut *tx)
            .await?;

            if let Some(raw) = &staged.raw {
                sqlx::query(
                    r#"
                    INSERT INTO raw_events (device_userid, "timestamp", event_type, device_serial)
                    VALUES ($1, $2, $3, $4)
                    "#,
                )
                .bind(&raw.device_userid)
                .bind(raw.timestamp)
                .bind(&raw.event_type)
                .bind(&raw.device_serial)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(batch.len() as u64)
    }

    async fn events_for_device(&self, device_id: i64) -> Result<Vec<AttendanceEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, device_id, record_id, user_id, device_userid, badge_id,
                   "timestamp", status, exported, exported_at
            FROM attendance_events
            WHERE device_id = $1
            ORDER BY id
            "#,
        )
        .bind(device_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(event_from_row).collect())
    }

    async fn raw_events_for_serial(&self, device_serial: &str) -> Result<Vec<RawEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT device_userid, "timestamp", event_type, verify_code, sensor_id,
                   memo, workcode, device_serial
            FROM raw_events
            WHERE device_serial = $1
            ORDER BY "timestamp"
            "#,
        )
        .bind(device_serial)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| RawEvent {
                device_userid: r.get("device_userid"),
                timestamp: r.get("timestamp"),
                event_type: r.get("event_type"),
                verify_code: r.get("verify_code"),
                sensor_id: r.get("sensor_id"),
                memo: r.get("memo"),
                workcode: r.get("workcode"),
                device_serial: r.get("device_serial"),
            })
            .collect())
    }

    // ── Export bookkeeping ──

    async fn unexported_events(
        &self,
        limit: usize,
        cutoff: Option<DateTime<Utc>>,
    ) -> Result<Vec<AttendanceEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, device_id, record_id, user_id, device_userid, badge_id,
                   "timestamp", status, exported, exported_at
            FROM attendance_events
            WHERE exported = FALSE
              AND ($2::timestamptz IS NULL OR "timestamp" >= $2)
            ORDER BY id
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(event_from_row).collect())
    }

    async fn mark_exported(&self, event_id: i64, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE attendance_events SET exported = TRUE, exported_at = $1 WHERE id = $2",
        )
        .bind(at)
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(anyhow!("event not found: {event_id}"));
        }
        Ok(())
    }
}
