//! Mutation applier
//!
//! Validates raw mutation rows and applies the valid ones to the inventory
//! store. Invalid rows are skipped and reported without affecting the rest
//! of the batch. Rows for different keys run in parallel, bounded by a
//! semaphore; rows for the same key run in submission order under a
//! per-key lock.

pub mod csv;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, OwnedMutexGuard, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::domain::{
    BatchReport, FailedRow, InventoryKey, InventoryRecord, Mutation, RawMutation, SkippedRow,
};
use crate::infra::{InventoryStore, Result, Retry, RetryConfig};
use crate::metrics::{metric_names, MetricsRegistry};

/// Applier configuration
#[derive(Debug, Clone)]
pub struct ApplierConfig {
    /// Key groups applied concurrently
    pub concurrency: usize,

    /// Retries for transient store failures
    pub retry: RetryConfig,
}

impl Default for ApplierConfig {
    fn default() -> Self {
        Self {
            concurrency: 16,
            retry: RetryConfig::database(),
        }
    }
}

/// Per-key mutual exclusion
#[derive(Default)]
pub struct KeyLocks {
    locks: Mutex<HashMap<InventoryKey, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`
    pub async fn acquire(&self, key: &InventoryKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(key.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Forget locks nobody holds or waits on
    pub async fn prune(&self) {
        self.locks
            .lock()
            .await
            .retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Cloneable handle used by spawned key-group tasks
#[derive(Clone)]
struct Writer {
    store: Arc<dyn InventoryStore>,
    locks: Arc<KeyLocks>,
    retry: RetryConfig,
}

impl Writer {
    async fn apply(&self, mutation: &Mutation) -> Result<InventoryRecord> {
        let _guard = self.locks.acquire(&mutation.key()).await;

        Retry::new(self.retry.clone())
            .run_with_context(
                "inventory_upsert",
                || self.store.upsert(mutation),
                |e| e.is_retryable(),
            )
            .await
            .into_result()
    }
}

/// Applies batches of mutations to the inventory store
pub struct MutationApplier {
    writer: Writer,
    slots: Arc<Semaphore>,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl MutationApplier {
    pub fn new(config: ApplierConfig, store: Arc<dyn InventoryStore>) -> Self {
        Self {
            writer: Writer {
                store,
                locks: Arc::new(KeyLocks::new()),
                retry: config.retry,
            },
            slots: Arc::new(Semaphore::new(config.concurrency.max(1))),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Apply one validated mutation, serialized with any other write to its key
    pub async fn apply_one(&self, mutation: &Mutation) -> Result<InventoryRecord> {
        let record = self.writer.apply(mutation).await;
        match &record {
            Ok(_) => self.count(metric_names::MUTATIONS_APPLIED, 1).await,
            Err(_) => self.count(metric_names::MUTATIONS_FAILED, 1).await,
        }
        record
    }

    /// Validate then apply one raw mutation
    pub async fn apply_raw(&self, raw: &RawMutation) -> Result<InventoryRecord> {
        let mutation = match raw.validate() {
            Ok(m) => m,
            Err(e) => {
                self.count(metric_names::MUTATIONS_SKIPPED, 1).await;
                return Err(e);
            }
        };
        self.apply_one(&mutation).await
    }

    /// Apply a batch of raw rows.
    ///
    /// Never fails as a whole: every row ends up applied, skipped (invalid)
    /// or failed (valid but not written), and the report says which.
    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    pub async fn apply_batch(&self, rows: Vec<RawMutation>) -> BatchReport {
        let started = Instant::now();
        let mut report = BatchReport {
            total: rows.len(),
            ..BatchReport::default()
        };

        // Group valid rows by key, keeping submission order inside each group
        let mut groups: Vec<Vec<(usize, Mutation)>> = Vec::new();
        let mut group_of: HashMap<InventoryKey, usize> = HashMap::new();

        for (idx, raw) in rows.iter().enumerate() {
            let row = idx + 1;
            match raw.validate() {
                Ok(mutation) => {
                    let group = *group_of.entry(mutation.key()).or_insert_with(|| {
                        groups.push(Vec::new());
                        groups.len() - 1
                    });
                    groups[group].push((row, mutation));
                }
                Err(e) => {
                    debug!(row, error = %e, "Skipping invalid mutation row");
                    report.skipped_rows.push(SkippedRow {
                        row,
                        reason: e.to_string(),
                    });
                }
            }
        }

        let mut pending: HashMap<usize, (String, String)> = groups
            .iter()
            .flatten()
            .map(|(row, m)| (*row, (m.store.to_string(), m.item.to_string())))
            .collect();

        let mut joins = JoinSet::new();
        for group in groups {
            let writer = self.writer.clone();
            let slots = self.slots.clone();

            joins.spawn(async move {
                let _permit = slots.acquire_owned().await;
                let mut results = Vec::with_capacity(group.len());
                for (row, mutation) in group {
                    let result = writer.apply(&mutation).await;
                    results.push((row, mutation, result));
                }
                results
            });
        }

        while let Some(joined) = joins.join_next().await {
            let results = match joined {
                Ok(results) => results,
                Err(e) => {
                    error!(error = %e, "Mutation worker aborted");
                    continue;
                }
            };

            for (row, mutation, result) in results {
                pending.remove(&row);
                match result {
                    Ok(_) => report.applied += 1,
                    Err(e) => {
                        warn!(row, store = %mutation.store, item = %mutation.item, error = %e, "Mutation failed");
                        report.failed_rows.push(FailedRow {
                            row,
                            store: mutation.store.to_string(),
                            item: mutation.item.to_string(),
                            error: e.to_string(),
                        });
                    }
                }
            }
        }

        // Rows of a worker that never reported back
        for (row, (store, item)) in pending {
            report.failed_rows.push(FailedRow {
                row,
                store,
                item,
                error: "mutation worker aborted".to_string(),
            });
        }

        report.skipped_rows.sort_by_key(|r| r.row);
        report.failed_rows.sort_by_key(|r| r.row);
        self.writer.locks.prune().await;

        info!(
            total = report.total,
            applied = report.applied,
            skipped = report.skipped(),
            failed = report.failed(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Mutation batch applied"
        );

        if let Some(metrics) = &self.metrics {
            metrics.add_counter(metric_names::MUTATIONS_APPLIED, report.applied as u64).await;
            metrics.add_counter(metric_names::MUTATIONS_SKIPPED, report.skipped() as u64).await;
            metrics.add_counter(metric_names::MUTATIONS_FAILED, report.failed() as u64).await;
            metrics.inc_counter(metric_names::BATCHES_APPLIED).await;
            metrics
                .observe_histogram(metric_names::BATCH_LATENCY, started.elapsed().as_secs_f64())
                .await;
        }

        report
    }

    async fn count(&self, name: &str, value: u64) {
        if let Some(metrics) = &self.metrics {
            metrics.add_counter(name, value).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ChangeRecord, ItemId, StoreId};
    use crate::infra::{InMemoryInventoryStore, InventoryError};

    fn applier(store: Arc<InMemoryInventoryStore>) -> MutationApplier {
        MutationApplier::new(ApplierConfig::default(), store)
    }

    #[tokio::test]
    async fn test_malformed_row_is_skipped_not_fatal() {
        let store = Arc::new(InMemoryInventoryStore::new());
        let report = applier(store.clone())
            .apply_batch(vec![
                RawMutation::new("Berlin", "Widget-001", "100"),
                RawMutation::new("Berlin", "Widget-002", "50"),
                RawMutation::new("", "Widget-009", "notanumber"),
                RawMutation::new("Paris", "Gadget-002", "7"),
            ])
            .await;

        assert_eq!(report.total, 4);
        assert_eq!(report.applied, 3);
        assert_eq!(report.skipped(), 1);
        assert_eq!(report.skipped_rows[0].row, 3);
        assert_eq!(report.failed(), 0);
        assert_eq!(store.list(None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_same_key_applied_in_submission_order() {
        let store = Arc::new(InMemoryInventoryStore::new());
        let rows: Vec<RawMutation> = (0..50)
            .flat_map(|i| {
                vec![
                    RawMutation::new("Berlin", "Widget-001", i.to_string()),
                    RawMutation::new("Paris", format!("Item-{i}"), "1"),
                ]
            })
            .collect();

        let report = applier(store.clone()).apply_batch(rows).await;
        assert!(report.is_clean());

        let record = store
            .get(&StoreId::from("Berlin"), &ItemId::from("Widget-001"))
            .await
            .unwrap();
        assert_eq!(record.quantity, 49);
        assert_eq!(record.version, 50);

        let widget_changes: Vec<ChangeRecord> = store
            .read_changes(0, 1000)
            .await
            .unwrap()
            .into_iter()
            .filter(|c| c.item.as_str() == "Widget-001")
            .collect();
        let quantities: Vec<u64> = widget_changes.iter().map(|c| c.new_quantity).collect();
        assert_eq!(quantities, (0..50).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_version_conflict_reported_as_failed() {
        let store = Arc::new(InMemoryInventoryStore::new());
        let applier = applier(store.clone());
        applier.apply_one(&Mutation::new("Berlin", "Widget-001", 10)).await.unwrap();

        let err = applier
            .apply_one(&Mutation::new("Berlin", "Widget-001", 5).with_expected_version(7))
            .await
            .unwrap_err();
        assert!(matches!(err, InventoryError::VersionConflict { .. }));
    }

    #[tokio::test]
    async fn test_apply_raw_rejects_negative() {
        let store = Arc::new(InMemoryInventoryStore::new());
        let err = applier(store.clone())
            .apply_raw(&RawMutation::new("Berlin", "Widget-001", "-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, InventoryError::InvalidQuantity(-1)));
        assert_eq!(store.head().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_key_locks_pruned_after_batch() {
        let store = Arc::new(InMemoryInventoryStore::new());
        let applier = applier(store);
        applier
            .apply_batch(vec![
                RawMutation::new("Berlin", "Widget-001", "1"),
                RawMutation::new("Berlin", "Widget-002", "2"),
            ])
            .await;
        assert!(applier.writer.locks.is_empty().await);
    }

    #[tokio::test]
    async fn test_metrics_counted() {
        let store = Arc::new(InMemoryInventoryStore::new());
        let metrics = Arc::new(MetricsRegistry::new());
        let applier = applier(store).with_metrics(metrics.clone());

        applier
            .apply_batch(vec![
                RawMutation::new("Berlin", "Widget-001", "1"),
                RawMutation::new("Berlin", "", "2"),
            ])
            .await;

        assert_eq!(metrics.get_counter(metric_names::MUTATIONS_APPLIED).await, 1);
        assert_eq!(metrics.get_counter(metric_names::MUTATIONS_SKIPPED).await, 1);
        assert_eq!(metrics.get_counter(metric_names::BATCHES_APPLIED).await, 1);
    }
}
