use crate::end_store::{EndRow, EndStore};
use crate::error::SyncError;
use anyhow::anyhow;
use async_trait::async_trait;
use sqlx::Row;

/// sqlx-backed `EndStore` writing the legacy reporting table. The
/// table name comes from configuration, so it is validated as a bare
/// identifier before it is ever spliced into SQL.
pub struct PgEndStore {
    pool: sqlx::PgPool,
    table: String,
}

fn valid_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit())
}

impl PgEndStore {
    pub fn new(pool: sqlx::PgPool, table: &str) -> Result<Self, SyncError> {
        if !valid_identifier(table) {
            return Err(SyncError::Internal(anyhow!(
                "invalid end table name: {table:?}"
            )));
        }
        Ok(Self {
            pool,
            table: table.to_string(),
        })
    }

    /// Create the target table when it does not exist yet. The shape
    /// mirrors the legacy consumer's, including the duplicated badge
    /// and placeholder columns.
    pub async fn ensure_table(&self) -> Result<(), SyncError> {
        let sql = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id             BIGSERIAL PRIMARY KEY,
                log_date       DATE NOT NULL,
                badge          TEXT,
                badge_dup      TEXT,
                placeholder    TEXT,
                log_time       TIME,
                flag           TEXT,
                access_door    TEXT,
                batch          TEXT,
                access_device  TEXT,
                created_at     TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
            self.table
        );
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| SyncError::EndDb(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl EndStore for PgEndStore {
    async fn contains(&self, row: &EndRow) -> Result<bool, SyncError> {
        let sql = format!(
            "SELECT COUNT(1) AS n FROM {} \
             WHERE log_date = $1 AND badge = $2 AND log_time = $3 AND access_device = $4",
            self.table
        );
        let found = sqlx::query(&sql)
            .bind(row.log_date)
            .bind(&row.badge)
            .bind(row.log_time)
            .bind(&row.access_device)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| SyncError::EndDb(e.to_string()))?;
        let n: i64 = found.get("n");
        Ok(n > 0)
    }

    async fn insert(&self, row: &EndRow) -> Result<(), SyncError> {
        let sql = format!(
            "INSERT INTO {} \
             (log_date, badge, badge_dup, placeholder, log_time, flag, access_door, batch, access_device) \
             VALUES ($1, $2, $2, '', $3, '0', $4, '', $5)",
            self.table
        );
        sqlx::query(&sql)
            .bind(row.log_date)
            .bind(&row.badge)
            .bind(row.log_time)
            .bind(&row.access_door)
            .bind(&row.access_device)
            .execute(&self.pool)
            .await
            .map_err(|e| SyncError::EndDb(e.to_string()))?;
        Ok(())
    }
}
