//! Trait definitions for the inventory pipeline's storage and delivery seams

use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use thiserror::Error;
use tokio::sync::watch;

use crate::domain::{
    AlertPayload, ChangeRecord, ConsumerCursor, InventoryRecord, ItemId, Mutation, StoreId,
};

use super::{FailedAlert, Result};

/// Keyed stock table plus its append-only change log.
///
/// Invariant: every successful `upsert` appends exactly one change record,
/// atomically with the record update, and no other path writes either.
#[async_trait]
pub trait InventoryStore: Send + Sync {
    /// Create or overwrite the record for the mutation's key.
    ///
    /// Increments `version`, appends one change record with a freshly
    /// assigned sequence and returns the updated record.
    async fn upsert(&self, mutation: &Mutation) -> Result<InventoryRecord>;

    /// Get the record for a key, or `NotFound`
    async fn get(&self, store: &StoreId, item: &ItemId) -> Result<InventoryRecord>;

    /// List records ordered by (store, item), optionally restricted to one store
    async fn list(&self, store: Option<&StoreId>) -> Result<Vec<InventoryRecord>>;

    /// Read up to `limit` change records with sequence > `after`, in order
    async fn read_changes(&self, after: u64, limit: usize) -> Result<Vec<ChangeRecord>>;

    /// Highest committed sequence (0 when the log is empty)
    async fn head(&self) -> Result<u64>;

    /// Watch channel carrying the highest committed sequence
    fn subscribe_head(&self) -> watch::Receiver<u64>;
}

/// Durable per-consumer read position on the change stream.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Load the persisted cursor, `None` if the consumer never acknowledged anything
    async fn load(&self, consumer_id: &str) -> Result<Option<ConsumerCursor>>;

    /// Persist `sequence` as the last acknowledged sequence.
    ///
    /// A save never moves a cursor backwards.
    async fn save(&self, consumer_id: &str, sequence: u64) -> Result<()>;
}

/// Operator-visible record of alerts that could not be delivered.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FailedAlertStore: Send + Sync {
    async fn record(&self, failure: &FailedAlert) -> Result<()>;

    /// Most recent failures first
    async fn list(&self, limit: usize) -> Result<Vec<FailedAlert>>;

    async fn count(&self) -> Result<u64>;

    /// Drop the failure for `dedup_key` once a later attempt delivered it.
    ///
    /// Returns whether a row was removed.
    async fn resolve(&self, dedup_key: &str) -> Result<bool>;
}

/// Durable record of alerts the dispatcher has finished with.
///
/// Backs the in-process dedup window so that a replay after a restart is
/// still recognised.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DispatchLog: Send + Sync {
    /// Whether `dedup_key` was dispatched at or after `since`
    async fn dispatched_since(&self, dedup_key: &str, since: DateTime<Utc>) -> Result<bool>;

    /// Record `dedup_key` as dispatched at `at`, replacing an earlier entry
    async fn mark_dispatched(&self, dedup_key: &str, at: DateTime<Utc>) -> Result<()>;

    /// Remove entries dispatched before `cutoff`, returning how many went
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Delivery failure reported by a fan-out channel
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Transient; the send may succeed if retried
    #[error("retryable channel error: {0}")]
    Retryable(String),

    /// Retrying cannot help (e.g. malformed recipient configuration)
    #[error("fatal channel error: {0}")]
    Fatal(String),
}

/// External fan-out channel that delivers alert payloads to subscribers.
#[async_trait]
pub trait AlertChannel: Send + Sync {
    /// Channel name for logs
    fn name(&self) -> &str;

    async fn send(&self, payload: &AlertPayload) -> std::result::Result<(), ChannelError>;
}

/// Health of one component
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentHealth {
    Healthy,
    Degraded { reason: String },
    Unhealthy { reason: String },
}

impl ComponentHealth {
    pub fn is_unhealthy(&self) -> bool {
        matches!(self, ComponentHealth::Unhealthy { .. })
    }
}
