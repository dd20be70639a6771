//! Change stream
//!
//! Ordered, replayable view of the change log. Reading from the same
//! starting point always yields the same records, in strictly increasing
//! sequence order and without gaps relative to what has been committed.
//! Consumers acknowledge through their own cursor; nothing here tracks
//! who has read what.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::domain::ChangeRecord;
use crate::infra::{InventoryError, InventoryStore, Result, ShutdownSignal};

/// Source of change records for a consumer
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Up to `limit` records with sequence > `after`, contiguous from `after + 1`
    async fn read_batch(&self, after: u64, limit: usize) -> Result<Vec<ChangeRecord>>;

    /// Wait until something past `after` is committed.
    ///
    /// Returns `Ok(true)` if new records exist, `Ok(false)` on timeout and
    /// `Err(Cancelled)` if shutdown fired first.
    async fn wait_for_change(
        &self,
        after: u64,
        timeout: Duration,
        shutdown: &ShutdownSignal,
    ) -> Result<bool>;

    /// Highest committed sequence
    async fn head(&self) -> Result<u64>;
}

/// Change stream configuration
#[derive(Debug, Clone)]
pub struct ChangeStreamConfig {
    /// Records fetched per store read when tailing
    pub batch_size: usize,

    /// Upper bound on a single wait before the store is polled again
    pub poll_interval: Duration,
}

impl Default for ChangeStreamConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Change stream over an inventory store's change log
#[derive(Clone)]
pub struct ChangeStream {
    store: Arc<dyn InventoryStore>,
    config: ChangeStreamConfig,
}

impl ChangeStream {
    pub fn new(store: Arc<dyn InventoryStore>) -> Self {
        Self::with_config(store, ChangeStreamConfig::default())
    }

    pub fn with_config(store: Arc<dyn InventoryStore>, config: ChangeStreamConfig) -> Self {
        Self { store, config }
    }

    /// Finite, gap-checked snapshot of records after `after`
    pub async fn read_batch(&self, after: u64, limit: usize) -> Result<Vec<ChangeRecord>> {
        let records = self.store.read_changes(after, limit).await?;
        check_contiguous(after, &records)?;
        Ok(records)
    }

    /// Highest committed sequence
    pub async fn head(&self) -> Result<u64> {
        self.store.head().await
    }

    /// Wait for a commit past `after`, bounded by `timeout` and cancelled by shutdown
    pub async fn wait_for_change(
        &self,
        after: u64,
        timeout: Duration,
        shutdown: &ShutdownSignal,
    ) -> Result<bool> {
        if shutdown.is_shutdown() {
            return Err(InventoryError::Cancelled);
        }

        let mut head = self.store.subscribe_head();
        if *head.borrow_and_update() > after {
            return Ok(true);
        }
        // Another process may have written to the same database
        if self.store.head().await? > after {
            return Ok(true);
        }

        tokio::select! {
            changed = async { head.wait_for(|h| *h > after).await.is_ok() } => Ok(changed),
            _ = tokio::time::sleep(timeout) => Ok(false),
            _ = shutdown.wait() => Err(InventoryError::Cancelled),
        }
    }

    /// Tail the change log from `after` (exclusive).
    ///
    /// The returned stream yields every record committed after `after`, in
    /// order, and waits for new commits when caught up. It ends when
    /// `shutdown` fires, when the receiver is dropped, or after yielding a
    /// non-retryable error.
    pub fn read_from(&self, after: u64, shutdown: ShutdownSignal) -> ReceiverStream<Result<ChangeRecord>> {
        let (tx, rx) = mpsc::channel(self.config.batch_size.max(1));
        let stream = self.clone();

        tokio::spawn(async move {
            let mut position = after;

            while !shutdown.is_shutdown() {
                match stream.read_batch(position, stream.config.batch_size).await {
                    Ok(records) if records.is_empty() => {
                        match stream
                            .wait_for_change(position, stream.config.poll_interval, &shutdown)
                            .await
                        {
                            Ok(_) => {}
                            Err(InventoryError::Cancelled) => break,
                            Err(e) if e.is_retryable() => {
                                warn!(error = %e, "Change stream wait failed, retrying");
                                if !shutdown.sleep(stream.config.poll_interval).await {
                                    break;
                                }
                            }
                            Err(e) => {
                                let _ = tx.send(Err(e)).await;
                                break;
                            }
                        }
                    }
                    Ok(records) => {
                        for record in records {
                            position = record.sequence;
                            if tx.send(Ok(record)).await.is_err() {
                                debug!(position, "Change stream receiver dropped");
                                return;
                            }
                        }
                    }
                    Err(e) if e.is_retryable() => {
                        warn!(position, error = %e, "Change stream read failed, retrying");
                        if !shutdown.sleep(stream.config.poll_interval).await {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                }
            }

            debug!(position, "Change stream tail stopped");
        });

        ReceiverStream::new(rx)
    }
}

#[async_trait]
impl ChangeSource for ChangeStream {
    async fn read_batch(&self, after: u64, limit: usize) -> Result<Vec<ChangeRecord>> {
        ChangeStream::read_batch(self, after, limit).await
    }

    async fn wait_for_change(
        &self,
        after: u64,
        timeout: Duration,
        shutdown: &ShutdownSignal,
    ) -> Result<bool> {
        ChangeStream::wait_for_change(self, after, timeout, shutdown).await
    }

    async fn head(&self) -> Result<u64> {
        ChangeStream::head(self).await
    }
}

/// Records must run `after + 1, after + 2, ...` with no holes
fn check_contiguous(after: u64, records: &[ChangeRecord]) -> Result<()> {
    for (offset, record) in records.iter().enumerate() {
        let expected = after + 1 + offset as u64;
        if record.sequence != expected {
            return Err(InventoryError::SequenceGap {
                expected,
                actual: record.sequence,
            });
        }
    }
    Ok(())
}
