//! In-memory implementations for tests, benchmarks and ephemeral runs.
//!
//! Same contracts as the SQLite stores; nothing survives the process.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{watch, RwLock};

use crate::domain::{
    ChangeRecord, ConsumerCursor, InventoryKey, InventoryRecord, ItemId, Mutation, StoreId,
};
use crate::infra::{
    CursorStore, DispatchLog, FailedAlert, FailedAlertStore, InventoryError, InventoryStore, Result,
};

#[derive(Default)]
struct InventoryState {
    records: BTreeMap<InventoryKey, InventoryRecord>,
    log: Vec<ChangeRecord>,
}

/// In-memory inventory store.
///
/// One lock covers both the records and the log, so an upsert and its
/// change record become visible together.
pub struct InMemoryInventoryStore {
    state: RwLock<InventoryState>,
    head_tx: watch::Sender<u64>,
}

impl InMemoryInventoryStore {
    pub fn new() -> Self {
        let (head_tx, _) = watch::channel(0);
        Self {
            state: RwLock::new(InventoryState::default()),
            head_tx,
        }
    }
}

impl Default for InMemoryInventoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InventoryStore for InMemoryInventoryStore {
    async fn upsert(&self, mutation: &Mutation) -> Result<InventoryRecord> {
        mutation.ensure_key()?;
        let mut state = self.state.write().await;
        let key = mutation.key();

        let (previous_quantity, current_version) = match state.records.get(&key) {
            Some(record) => (Some(record.quantity), record.version),
            None => (None, 0),
        };

        if let Some(expected) = mutation.expected_version {
            if expected != current_version {
                return Err(InventoryError::VersionConflict {
                    store: mutation.store.to_string(),
                    item: mutation.item.to_string(),
                    expected,
                    actual: current_version,
                });
            }
        }

        let now = Utc::now();
        let sequence = state.log.len() as u64 + 1;
        let record = InventoryRecord {
            store: mutation.store.clone(),
            item: mutation.item.clone(),
            quantity: mutation.quantity,
            version: current_version + 1,
            updated_at: now,
        };

        state.log.push(ChangeRecord {
            sequence,
            store: mutation.store.clone(),
            item: mutation.item.clone(),
            previous_quantity,
            new_quantity: mutation.quantity,
            version: record.version,
            timestamp: now,
        });
        state.records.insert(key, record.clone());
        drop(state);

        self.head_tx.send_replace(sequence);
        Ok(record)
    }

    async fn get(&self, store: &StoreId, item: &ItemId) -> Result<InventoryRecord> {
        let key = InventoryKey::new(store.clone(), item.clone());
        self.state
            .read()
            .await
            .records
            .get(&key)
            .cloned()
            .ok_or_else(|| InventoryError::NotFound {
                store: store.to_string(),
                item: item.to_string(),
            })
    }

    async fn list(&self, store: Option<&StoreId>) -> Result<Vec<InventoryRecord>> {
        let state = self.state.read().await;
        Ok(state
            .records
            .values()
            .filter(|r| store.map_or(true, |s| &r.store == s))
            .cloned()
            .collect())
    }

    async fn read_changes(&self, after: u64, limit: usize) -> Result<Vec<ChangeRecord>> {
        let state = self.state.read().await;
        // Sequence n lives at index n - 1
        let start = (after as usize).min(state.log.len());
        Ok(state.log[start..].iter().take(limit).cloned().collect())
    }

    async fn head(&self) -> Result<u64> {
        Ok(self.state.read().await.log.len() as u64)
    }

    fn subscribe_head(&self) -> watch::Receiver<u64> {
        self.head_tx.subscribe()
    }
}

/// In-memory consumer cursors
#[derive(Default)]
pub struct InMemoryCursorStore {
    cursors: RwLock<HashMap<String, ConsumerCursor>>,
}

impl InMemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CursorStore for InMemoryCursorStore {
    async fn load(&self, consumer_id: &str) -> Result<Option<ConsumerCursor>> {
        Ok(self.cursors.read().await.get(consumer_id).cloned())
    }

    async fn save(&self, consumer_id: &str, sequence: u64) -> Result<()> {
        let mut cursors = self.cursors.write().await;
        let entry = cursors
            .entry(consumer_id.to_string())
            .or_insert_with(|| ConsumerCursor {
                consumer_id: consumer_id.to_string(),
                last_acknowledged_sequence: 0,
                updated_at: Utc::now(),
            });

        if sequence >= entry.last_acknowledged_sequence {
            entry.last_acknowledged_sequence = sequence;
            entry.updated_at = Utc::now();
        }
        Ok(())
    }
}

/// In-memory failed alert store
#[derive(Default)]
pub struct InMemoryFailedAlertStore {
    failures: RwLock<Vec<FailedAlert>>,
}

impl InMemoryFailedAlertStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FailedAlertStore for InMemoryFailedAlertStore {
    async fn record(&self, failure: &FailedAlert) -> Result<()> {
        let mut failures = self.failures.write().await;
        match failures.iter_mut().find(|f| f.dedup_key == failure.dedup_key) {
            Some(existing) => {
                existing.reason = failure.reason;
                existing.error_message = failure.error_message.clone();
                existing.attempts += failure.attempts;
                existing.failed_at = failure.failed_at;
            }
            None => failures.push(failure.clone()),
        }
        Ok(())
    }

    async fn list(&self, limit: usize) -> Result<Vec<FailedAlert>> {
        let failures = self.failures.read().await;
        Ok(failures.iter().rev().take(limit).cloned().collect())
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.failures.read().await.len() as u64)
    }

    async fn resolve(&self, dedup_key: &str) -> Result<bool> {
        let mut failures = self.failures.write().await;
        let before = failures.len();
        failures.retain(|f| f.dedup_key != dedup_key);
        Ok(failures.len() < before)
    }
}

/// In-memory dispatch log
#[derive(Default)]
pub struct InMemoryDispatchLog {
    dispatched: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl InMemoryDispatchLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DispatchLog for InMemoryDispatchLog {
    async fn dispatched_since(&self, dedup_key: &str, since: DateTime<Utc>) -> Result<bool> {
        Ok(self
            .dispatched
            .read()
            .await
            .get(dedup_key)
            .map_or(false, |at| *at >= since))
    }

    async fn mark_dispatched(&self, dedup_key: &str, at: DateTime<Utc>) -> Result<()> {
        self.dispatched.write().await.insert(dedup_key.to_string(), at);
        Ok(())
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut dispatched = self.dispatched.write().await;
        let before = dispatched.len();
        dispatched.retain(|_, at| *at >= cutoff);
        Ok((before - dispatched.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sequences_are_dense() {
        let store = InMemoryInventoryStore::new();
        store.upsert(&Mutation::new("Berlin", "Widget-001", 100)).await.unwrap();
        store.upsert(&Mutation::new("Paris", "Widget-001", 10)).await.unwrap();
        store.upsert(&Mutation::new("Berlin", "Widget-001", 40)).await.unwrap();

        let changes = store.read_changes(0, 100).await.unwrap();
        assert_eq!(changes.iter().map(|c| c.sequence).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(changes[2].previous_quantity, Some(100));
        assert_eq!(store.head().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_read_changes_past_head_is_empty() {
        let store = InMemoryInventoryStore::new();
        store.upsert(&Mutation::new("Berlin", "Widget-001", 1)).await.unwrap();
        assert!(store.read_changes(5, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_version_conflict() {
        let store = InMemoryInventoryStore::new();
        store.upsert(&Mutation::new("Berlin", "Widget-001", 1)).await.unwrap();

        let err = store
            .upsert(&Mutation::new("Berlin", "Widget-001", 2).with_expected_version(5))
            .await
            .unwrap_err();
        assert!(matches!(err, InventoryError::VersionConflict { actual: 1, .. }));
        assert_eq!(store.head().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_blank_identifiers_are_rejected_before_logging() {
        let store = InMemoryInventoryStore::new();

        let err = store.upsert(&Mutation::new("", "Widget-001", 1)).await.unwrap_err();
        assert!(matches!(err, InventoryError::InvalidInput { ref field, .. } if field == "store"));

        let err = store.upsert(&Mutation::new("Berlin", "  ", 1)).await.unwrap_err();
        assert!(matches!(err, InventoryError::InvalidInput { ref field, .. } if field == "item"));

        assert_eq!(store.head().await.unwrap(), 0);
        assert!(store.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_log_window_and_purge() {
        let log = InMemoryDispatchLog::new();
        let now = Utc::now();
        log.mark_dispatched("old", now - chrono::Duration::hours(2)).await.unwrap();
        log.mark_dispatched("new", now).await.unwrap();

        let since = now - chrono::Duration::hours(1);
        assert!(!log.dispatched_since("old", since).await.unwrap());
        assert!(log.dispatched_since("new", since).await.unwrap());

        assert_eq!(log.purge_before(since).await.unwrap(), 1);
        assert_eq!(log.purge_before(since).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cursor_is_monotonic() {
        let cursors = InMemoryCursorStore::new();
        cursors.save("c", 5).await.unwrap();
        cursors.save("c", 2).await.unwrap();
        assert_eq!(cursors.load("c").await.unwrap().unwrap().last_acknowledged_sequence, 5);
    }
}
