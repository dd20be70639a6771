//! Failed alert store
//!
//! Alerts whose delivery exhausted its retries, or failed fatally, are kept
//! here for operator visibility instead of being dropped silently.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use uuid::Uuid;

use crate::domain::AlertEvent;
use crate::infra::{FailedAlertStore, InventoryError, Result};

/// Why an alert ended up in the failed alert store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Transient failures persisted through every attempt
    RetriesExhausted,
    /// The channel rejected the alert permanently
    Fatal,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::RetriesExhausted => write!(f, "retries_exhausted"),
            FailureReason::Fatal => write!(f, "fatal"),
        }
    }
}

impl std::str::FromStr for FailureReason {
    type Err = InventoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "retries_exhausted" => Ok(FailureReason::RetriesExhausted),
            "fatal" => Ok(FailureReason::Fatal),
            other => Err(InventoryError::Internal(format!(
                "unknown failure reason: {other}"
            ))),
        }
    }
}

/// A failed alert delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedAlert {
    pub id: Uuid,
    pub dedup_key: String,
    pub store: String,
    pub item: String,
    pub quantity: u64,
    pub threshold: u64,
    pub sequence: u64,
    pub reason: FailureReason,
    pub error_message: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

impl FailedAlert {
    pub fn new(event: &AlertEvent, reason: FailureReason, error_message: impl Into<String>, attempts: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            dedup_key: event.dedup_key.to_string(),
            store: event.store.to_string(),
            item: event.item.to_string(),
            quantity: event.quantity,
            threshold: event.threshold,
            sequence: event.sequence,
            reason,
            error_message: error_message.into(),
            attempts,
            failed_at: Utc::now(),
        }
    }
}

/// SQLite-backed failed alert store
pub struct SqliteFailedAlertStore {
    pool: SqlitePool,
}

impl SqliteFailedAlertStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl FailedAlertStore for SqliteFailedAlertStore {
    async fn record(&self, failure: &FailedAlert) -> Result<()> {
        // A replayed alert that fails again accumulates attempts on one row
        sqlx::query(
            r#"
            INSERT INTO failed_alerts (
                id, dedup_key, store, item, quantity, threshold, sequence,
                reason, error_message, attempts, failed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(dedup_key) DO UPDATE SET
                reason = excluded.reason,
                error_message = excluded.error_message,
                attempts = failed_alerts.attempts + excluded.attempts,
                failed_at = excluded.failed_at
            "#,
        )
        .bind(failure.id.to_string())
        .bind(&failure.dedup_key)
        .bind(&failure.store)
        .bind(&failure.item)
        .bind(failure.quantity as i64)
        .bind(failure.threshold as i64)
        .bind(failure.sequence as i64)
        .bind(failure.reason.to_string())
        .bind(&failure.error_message)
        .bind(failure.attempts as i64)
        .bind(failure.failed_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        tracing::warn!(
            dedup_key = %failure.dedup_key,
            store = %failure.store,
            item = %failure.item,
            reason = %failure.reason,
            error = %failure.error_message,
            "Alert recorded as failed"
        );

        Ok(())
    }

    async fn list(&self, limit: usize) -> Result<Vec<FailedAlert>> {
        let rows = sqlx::query_as::<_, FailedAlertRow>(
            r#"
            SELECT id, dedup_key, store, item, quantity, threshold, sequence,
                   reason, error_message, attempts, failed_at
            FROM failed_alerts
            ORDER BY failed_at DESC, sequence DESC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(FailedAlert::try_from).collect()
    }

    async fn count(&self) -> Result<u64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM failed_alerts")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0 as u64)
    }

    async fn resolve(&self, dedup_key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM failed_alerts WHERE dedup_key = ?")
            .bind(dedup_key)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() > 0 {
            tracing::info!(dedup_key = %dedup_key, "Failed alert resolved by later delivery");
        }
        Ok(result.rows_affected() > 0)
    }
}

/// Database row for failed alerts
#[derive(Debug, sqlx::FromRow)]
struct FailedAlertRow {
    id: String,
    dedup_key: String,
    store: String,
    item: String,
    quantity: i64,
    threshold: i64,
    sequence: i64,
    reason: String,
    error_message: String,
    attempts: i64,
    failed_at: String,
}

impl TryFrom<FailedAlertRow> for FailedAlert {
    type Error = InventoryError;

    fn try_from(row: FailedAlertRow) -> Result<Self> {
        let id = Uuid::parse_str(&row.id)
            .map_err(|e| InventoryError::Internal(format!("Invalid failed alert id: {}", e)))?;
        let failed_at = DateTime::parse_from_rfc3339(&row.failed_at)
            .map_err(|e| InventoryError::Internal(format!("Invalid failed_at: {}", e)))?
            .with_timezone(&Utc);

        Ok(Self {
            id,
            dedup_key: row.dedup_key,
            store: row.store,
            item: row.item,
            quantity: row.quantity as u64,
            threshold: row.threshold as u64,
            sequence: row.sequence as u64,
            reason: row.reason.parse()?,
            error_message: row.error_message,
            attempts: row.attempts as u32,
            failed_at,
        })
    }
}
