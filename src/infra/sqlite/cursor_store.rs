//! SQLite consumer cursor store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;

use crate::domain::ConsumerCursor;
use crate::infra::{CursorStore, InventoryError, Result};

/// Durable consumer cursors
pub struct SqliteCursorStore {
    pool: SqlitePool,
}

impl SqliteCursorStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// All persisted cursors, for operator inspection
    pub async fn list(&self) -> Result<Vec<ConsumerCursor>> {
        let rows: Vec<(String, i64, String)> = sqlx::query_as(
            r#"
            SELECT consumer_id, last_acknowledged_sequence, updated_at
            FROM consumer_cursors
            ORDER BY consumer_id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(cursor_from_row).collect()
    }
}

fn cursor_from_row((consumer_id, sequence, updated_at): (String, i64, String)) -> Result<ConsumerCursor> {
    let updated_at = DateTime::parse_from_rfc3339(&updated_at)
        .map_err(|e| InventoryError::Internal(format!("Invalid updated_at: {}", e)))?
        .with_timezone(&Utc);

    Ok(ConsumerCursor {
        consumer_id,
        last_acknowledged_sequence: sequence as u64,
        updated_at,
    })
}

#[async_trait]
impl CursorStore for SqliteCursorStore {
    async fn load(&self, consumer_id: &str) -> Result<Option<ConsumerCursor>> {
        let row: Option<(String, i64, String)> = sqlx::query_as(
            r#"
            SELECT consumer_id, last_acknowledged_sequence, updated_at
            FROM consumer_cursors
            WHERE consumer_id = ?
            "#,
        )
        .bind(consumer_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(cursor_from_row).transpose()
    }

    async fn save(&self, consumer_id: &str, sequence: u64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO consumer_cursors (consumer_id, last_acknowledged_sequence, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(consumer_id) DO UPDATE SET
                last_acknowledged_sequence = excluded.last_acknowledged_sequence,
                updated_at = excluded.updated_at
            WHERE excluded.last_acknowledged_sequence >= consumer_cursors.last_acknowledged_sequence
            "#,
        )
        .bind(consumer_id)
        .bind(sequence as i64)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
