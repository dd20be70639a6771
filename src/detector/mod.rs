//! Threshold detector
//!
//! Consumes the change stream from a durable per-consumer cursor and turns
//! downward threshold crossings into alert events.
//!
//! Each record is evaluated from its own before/after pair, then the alert
//! (if any) is handed to the sink and awaited, and only then is the cursor
//! persisted. The in-memory cursor follows the persisted one, never leads
//! it. A crash anywhere in between replays from the last persisted
//! sequence; the sink absorbs the re-emitted alerts by `dedup_key`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};

use crate::dispatch::{DispatchOutcome, NotificationDispatcher};
use crate::domain::{AlertEvent, ChangeRecord, DEFAULT_THRESHOLD};
use crate::infra::{CursorStore, InventoryError, Result, Retry, RetryConfig, ShutdownSignal};
use crate::metrics::{metric_names, MetricsRegistry};
use crate::stream::ChangeSource;

/// Consumer of detected alerts
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Handle one alert. `Err` means the alert was not handled and the
    /// triggering record must not be acknowledged.
    async fn emit(&self, alert: &AlertEvent) -> Result<DispatchOutcome>;
}

#[async_trait]
impl AlertSink for NotificationDispatcher {
    async fn emit(&self, alert: &AlertEvent) -> Result<DispatchOutcome> {
        self.dispatch(alert).await
    }
}

/// Detector configuration
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Identifies this detector's cursor
    pub consumer_id: String,

    /// Low-stock threshold in units
    pub threshold: u64,

    /// Records read per batch
    pub batch_size: usize,

    /// Longest wait for new records before polling the store again
    pub poll_interval: Duration,

    /// Retries for cursor persistence
    pub cursor_retry: RetryConfig,

    /// Backoff after a failed drain
    pub error_backoff: RetryConfig,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            consumer_id: "low-stock-detector".to_string(),
            threshold: DEFAULT_THRESHOLD,
            batch_size: 100,
            poll_interval: Duration::from_millis(500),
            cursor_retry: RetryConfig::database(),
            error_backoff: RetryConfig::default().with_max_delay(Duration::from_secs(10)),
        }
    }
}

/// Detector statistics
#[derive(Debug, Default, Clone, Serialize)]
pub struct DetectorStats {
    pub records_evaluated: u64,
    pub records_skipped: u64,
    pub alerts_emitted: u64,
    pub alerts_delivered: u64,
    pub alerts_suppressed: u64,
    pub alerts_failed: u64,
    pub cursor_save_failures: u64,
    pub errors: u64,
    pub last_sequence: Option<u64>,
}

/// What happened to one change record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    /// No crossing
    NoAlert,

    /// Crossing detected and handed to the sink
    Alerted(DispatchOutcome),

    /// Malformed record, logged and acknowledged without evaluation
    Skipped { reason: String },
}

/// Single-consumer threshold detector
pub struct ThresholdDetector {
    config: DetectorConfig,
    source: Arc<dyn ChangeSource>,
    cursors: Arc<dyn CursorStore>,
    sink: Arc<dyn AlertSink>,

    /// Held for the whole evaluation loop; the detector is not reentrant
    loop_guard: Mutex<()>,

    /// Last acknowledged sequence, advanced only after a successful save
    acknowledged: AtomicU64,
    cursor_loaded: AtomicBool,

    stats: RwLock<DetectorStats>,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl ThresholdDetector {
    pub fn new(
        config: DetectorConfig,
        source: Arc<dyn ChangeSource>,
        cursors: Arc<dyn CursorStore>,
        sink: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            config,
            source,
            cursors,
            sink,
            loop_guard: Mutex::new(()),
            acknowledged: AtomicU64::new(0),
            cursor_loaded: AtomicBool::new(false),
            stats: RwLock::new(DetectorStats::default()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn consumer_id(&self) -> &str {
        &self.config.consumer_id
    }

    /// Last acknowledged sequence held in memory
    pub fn cursor(&self) -> u64 {
        self.acknowledged.load(Ordering::SeqCst)
    }

    pub async fn stats(&self) -> DetectorStats {
        self.stats.read().await.clone()
    }

    /// Records committed but not yet acknowledged
    pub async fn lag(&self) -> Result<u64> {
        let head = self.source.head().await?;
        Ok(head.saturating_sub(self.cursor()))
    }

    /// Process everything currently committed past the cursor, then return.
    ///
    /// Returns the number of records acknowledged. Fails if another loop is
    /// already running on this detector.
    pub async fn drain(&self, shutdown: &ShutdownSignal) -> Result<u64> {
        let _guard = self.loop_guard.try_lock().map_err(|_| {
            InventoryError::Internal("threshold detector already running".to_string())
        })?;
        self.drain_locked(shutdown).await
    }

    /// Run until shutdown, waiting on the change stream between drains.
    #[instrument(skip(self, shutdown), fields(consumer_id = %self.config.consumer_id))]
    pub async fn run(&self, shutdown: ShutdownSignal) -> Result<()> {
        let _guard = self.loop_guard.try_lock().map_err(|_| {
            InventoryError::Internal("threshold detector already running".to_string())
        })?;

        info!(
            threshold = self.config.threshold,
            batch_size = self.config.batch_size,
            "Starting threshold detector"
        );

        let mut consecutive_failures = 0u32;

        while !shutdown.is_shutdown() {
            match self.drain_locked(&shutdown).await {
                Ok(_) => consecutive_failures = 0,
                Err(InventoryError::Cancelled) => break,
                Err(e) => {
                    self.stats.write().await.errors += 1;
                    let delay = self.config.error_backoff.delay_for_attempt(consecutive_failures);
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    error!(
                        cursor = self.cursor(),
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Threshold detector drain failed"
                    );
                    if !shutdown.sleep(delay).await {
                        break;
                    }
                    continue;
                }
            }

            match self
                .source
                .wait_for_change(self.cursor(), self.config.poll_interval, &shutdown)
                .await
            {
                Ok(_) => {}
                Err(InventoryError::Cancelled) => break,
                Err(e) => {
                    warn!(error = %e, "Waiting for changes failed");
                    if !shutdown.sleep(self.config.poll_interval).await {
                        break;
                    }
                }
            }
        }

        info!(cursor = self.cursor(), "Threshold detector stopped");
        Ok(())
    }

    async fn drain_locked(&self, shutdown: &ShutdownSignal) -> Result<u64> {
        self.ensure_cursor_loaded().await?;

        let batch_size = self.config.batch_size.max(1);
        let mut acknowledged = 0u64;

        loop {
            let after = self.cursor();
            let batch = self.source.read_batch(after, batch_size).await?;
            let caught_up = batch.len() < batch_size;

            for record in &batch {
                // Finish the record in hand, never start a new one after shutdown
                if shutdown.is_shutdown() {
                    return Ok(acknowledged);
                }

                self.process_record(record).await?;
                self.acknowledge(record.sequence).await?;
                acknowledged += 1;
            }

            if caught_up {
                break;
            }
        }

        if let Some(metrics) = &self.metrics {
            if let Ok(head) = self.source.head().await {
                metrics.set_gauge(metric_names::STREAM_HEAD, head).await;
            }
        }

        if acknowledged > 0 {
            debug!(acknowledged, cursor = self.cursor(), "Drained change stream");
        }
        Ok(acknowledged)
    }

    async fn ensure_cursor_loaded(&self) -> Result<()> {
        if self.cursor_loaded.load(Ordering::SeqCst) {
            return Ok(());
        }

        let persisted = self
            .cursors
            .load(&self.config.consumer_id)
            .await?
            .map(|c| c.last_acknowledged_sequence)
            .unwrap_or(0);

        self.acknowledged.store(persisted, Ordering::SeqCst);
        self.cursor_loaded.store(true, Ordering::SeqCst);

        info!(
            consumer_id = %self.config.consumer_id,
            cursor = persisted,
            "Resuming from persisted cursor"
        );
        Ok(())
    }

    /// Evaluate one record and hand any alert to the sink
    pub async fn process_record(&self, record: &ChangeRecord) -> Result<RecordOutcome> {
        if let Err(reason) = check_record(record) {
            warn!(
                sequence = record.sequence,
                reason = %reason,
                "Skipping malformed change record"
            );
            self.stats.write().await.records_skipped += 1;
            self.count(metric_names::RECORDS_SKIPPED).await;
            return Ok(RecordOutcome::Skipped { reason });
        }

        self.stats.write().await.records_evaluated += 1;
        self.count(metric_names::RECORDS_EVALUATED).await;

        let Some(alert) = AlertEvent::evaluate(record, self.config.threshold) else {
            return Ok(RecordOutcome::NoAlert);
        };

        info!(
            store = %alert.store,
            item = %alert.item,
            quantity = alert.quantity,
            threshold = alert.threshold,
            sequence = alert.sequence,
            "Low stock crossing detected"
        );
        self.stats.write().await.alerts_emitted += 1;
        self.count(metric_names::ALERTS_EMITTED).await;

        let outcome = self.sink.emit(&alert).await?;

        {
            let mut stats = self.stats.write().await;
            match outcome {
                DispatchOutcome::Delivered { .. } => stats.alerts_delivered += 1,
                DispatchOutcome::Suppressed => stats.alerts_suppressed += 1,
                DispatchOutcome::Retryable { .. } | DispatchOutcome::Fatal { .. } => {
                    stats.alerts_failed += 1
                }
            }
        }

        Ok(RecordOutcome::Alerted(outcome))
    }

    /// Persist `sequence`, then advance the in-memory cursor
    async fn acknowledge(&self, sequence: u64) -> Result<()> {
        let retry = Retry::new(self.config.cursor_retry.clone());
        let saved = retry
            .run_with_context(
                "cursor_save",
                || self.cursors.save(&self.config.consumer_id, sequence),
                |e| e.is_retryable(),
            )
            .await;

        if let Err(e) = saved.result {
            self.stats.write().await.cursor_save_failures += 1;
            error!(
                sequence,
                cursor = self.cursor(),
                error = %e,
                "Cursor persistence failed, record will be re-evaluated"
            );
            return Err(e);
        }

        self.acknowledged.store(sequence, Ordering::SeqCst);
        self.stats.write().await.last_sequence = Some(sequence);
        if let Some(metrics) = &self.metrics {
            metrics.set_gauge(metric_names::DETECTOR_CURSOR, sequence).await;
        }
        Ok(())
    }

    async fn count(&self, name: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.inc_counter(name).await;
        }
    }
}

/// Structural checks a change record must pass before evaluation
fn check_record(record: &ChangeRecord) -> std::result::Result<(), String> {
    if record.store.as_str().trim().is_empty() {
        return Err("empty store".to_string());
    }
    if record.item.as_str().trim().is_empty() {
        return Err("empty item".to_string());
    }
    if record.version == 0 {
        return Err("version 0".to_string());
    }
    if (record.version == 1) != record.previous_quantity.is_none() {
        return Err(format!(
            "version {} inconsistent with previous quantity {:?}",
            record.version, record.previous_quantity
        ));
    }
    Ok(())
}
