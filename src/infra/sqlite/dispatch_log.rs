//! SQLite dispatch log
//!
//! Timestamps are stored as unix milliseconds so the window check is a plain
//! integer comparison.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;

use crate::infra::{DispatchLog, Result};

/// Durable record of dispatched alert keys
pub struct SqliteDispatchLog {
    pool: SqlitePool,
}

impl SqliteDispatchLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Number of keys currently recorded
    pub async fn len(&self) -> Result<u64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM dispatched_alerts")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0 as u64)
    }
}

#[async_trait]
impl DispatchLog for SqliteDispatchLog {
    async fn dispatched_since(&self, dedup_key: &str, since: DateTime<Utc>) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT dispatched_at
            FROM dispatched_alerts
            WHERE dedup_key = ? AND dispatched_at >= ?
            "#,
        )
        .bind(dedup_key)
        .bind(since.timestamp_millis())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    async fn mark_dispatched(&self, dedup_key: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dispatched_alerts (dedup_key, dispatched_at)
            VALUES (?, ?)
            ON CONFLICT(dedup_key) DO UPDATE SET
                dispatched_at = excluded.dispatched_at
            "#,
        )
        .bind(dedup_key)
        .bind(at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM dispatched_alerts WHERE dispatched_at < ?")
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
