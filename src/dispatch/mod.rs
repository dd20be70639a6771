//! Notification dispatcher
//!
//! Delivers alert events to the external fan-out channel. Re-emitted alerts
//! with a `dedup_key` seen inside the dedup window are suppressed. The window
//! is an in-process cache in front of the durable dispatch log, so replays
//! after a restart are suppressed too. Transient channel failures are retried
//! with exponential backoff, and failures that cannot be delivered end up in
//! the failed alert store.

mod channel;

pub use channel::TracingChannel;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::domain::{AlertEvent, DedupKey};
use crate::infra::{
    AlertChannel, ChannelError, DedupWindow, DispatchLog, FailedAlert, FailedAlertStore,
    FailureReason, Result, Retry, RetryConfig,
};
use crate::metrics::{metric_names, MetricsRegistry};

/// Result of one dispatch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// The channel accepted the alert
    Delivered { attempts: u32 },

    /// Same `dedup_key` already delivered within the window
    Suppressed,

    /// Transient failures persisted through every attempt; recorded as failed
    Retryable { attempts: u32 },

    /// The channel rejected the alert permanently; recorded as failed
    Fatal { error: String },
}

/// Dispatcher configuration
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Delivery attempts per alert, including the first
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub dedup_window: Duration,
    pub dedup_max_entries: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_millis(200),
            backoff_max: Duration::from_secs(30),
            dedup_window: Duration::from_secs(3600),
            dedup_max_entries: 100_000,
        }
    }
}

/// Deduplicating, retrying alert dispatcher.
///
/// Callers are expected to dispatch one alert at a time; two concurrent
/// dispatches of the same key may both reach the channel.
pub struct NotificationDispatcher {
    channel: Arc<dyn AlertChannel>,
    failed_alerts: Arc<dyn FailedAlertStore>,
    dispatch_log: Arc<dyn DispatchLog>,
    recent: DedupWindow<DedupKey>,
    window: Duration,
    retry: Retry,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl NotificationDispatcher {
    pub fn new(
        config: DispatcherConfig,
        channel: Arc<dyn AlertChannel>,
        failed_alerts: Arc<dyn FailedAlertStore>,
        dispatch_log: Arc<dyn DispatchLog>,
    ) -> Self {
        let retry = Retry::new(RetryConfig::dispatch(
            config.max_attempts,
            config.backoff_base,
            config.backoff_max,
        ));

        Self {
            channel,
            failed_alerts,
            dispatch_log,
            recent: DedupWindow::new(config.dedup_window, config.dedup_max_entries),
            window: config.dedup_window,
            retry,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Deliver one alert.
    ///
    /// `Err` means the outcome could not be persisted; the caller must not
    /// treat the alert as handled.
    #[instrument(skip(self, event), fields(store = %event.store, item = %event.item, sequence = event.sequence))]
    pub async fn dispatch(&self, event: &AlertEvent) -> Result<DispatchOutcome> {
        if self.recent.contains(&event.dedup_key).await {
            debug!(dedup_key = %event.dedup_key, "Duplicate alert suppressed");
            self.count(metric_names::ALERTS_SUPPRESSED).await;
            return Ok(DispatchOutcome::Suppressed);
        }

        if self
            .dispatch_log
            .dispatched_since(event.dedup_key.as_str(), self.window_start())
            .await?
        {
            debug!(dedup_key = %event.dedup_key, "Alert already dispatched before restart, suppressed");
            self.recent.mark(event.dedup_key.clone()).await;
            self.count(metric_names::ALERTS_SUPPRESSED).await;
            return Ok(DispatchOutcome::Suppressed);
        }

        let payload = event.payload();
        let started = std::time::Instant::now();
        let outcome = self
            .retry
            .run_with_context(
                "alert_dispatch",
                || self.channel.send(&payload),
                |e| matches!(e, ChannelError::Retryable(_)),
            )
            .await;

        if let Some(metrics) = &self.metrics {
            metrics
                .observe_histogram(metric_names::DISPATCH_LATENCY, started.elapsed().as_secs_f64())
                .await;
        }

        let attempts = outcome.attempts;
        match outcome.result {
            Ok(()) => {
                self.count(metric_names::ALERTS_DELIVERED).await;
                info!(
                    channel = self.channel.name(),
                    quantity = event.quantity,
                    threshold = event.threshold,
                    attempts,
                    "Low stock alert delivered"
                );
                self.mark_dispatched(&event.dedup_key).await?;

                // An earlier exhausted attempt for this key is no longer outstanding
                if let Err(e) = self.failed_alerts.resolve(event.dedup_key.as_str()).await {
                    warn!(dedup_key = %event.dedup_key, error = %e, "Failed to resolve failed alert");
                }
                Ok(DispatchOutcome::Delivered { attempts })
            }
            Err(ChannelError::Fatal(error)) => {
                self.record_failure(event, FailureReason::Fatal, &error, attempts)
                    .await?;
                // Replays of a fatal failure are absorbed as well
                self.mark_dispatched(&event.dedup_key).await?;
                Ok(DispatchOutcome::Fatal { error })
            }
            Err(ChannelError::Retryable(error)) => {
                self.record_failure(event, FailureReason::RetriesExhausted, &error, attempts)
                    .await?;
                Ok(DispatchOutcome::Retryable { attempts })
            }
        }
    }

    /// Drop dedup entries older than the window, in memory and in the
    /// dispatch log. Returns the number of log entries removed.
    pub async fn purge_expired(&self) -> Result<u64> {
        self.recent.cleanup_expired().await;
        self.dispatch_log.purge_before(self.window_start()).await
    }

    /// Number of keys currently held in the in-process dedup window
    pub async fn recent_len(&self) -> usize {
        self.recent.len().await
    }

    /// Cache first, then the log. A key cached but not logged is still
    /// suppressed for the life of this process.
    async fn mark_dispatched(&self, key: &DedupKey) -> Result<()> {
        self.recent.mark(key.clone()).await;
        self.dispatch_log.mark_dispatched(key.as_str(), Utc::now()).await
    }

    fn window_start(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.window)
            .ok()
            .and_then(|window| Utc::now().checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    async fn record_failure(
        &self,
        event: &AlertEvent,
        reason: FailureReason,
        error: &str,
        attempts: u32,
    ) -> Result<()> {
        warn!(
            channel = self.channel.name(),
            dedup_key = %event.dedup_key,
            reason = %reason,
            attempts,
            error = %error,
            "Alert delivery failed"
        );

        self.failed_alerts
            .record(&FailedAlert::new(event, reason, error, attempts))
            .await?;
        self.count(metric_names::ALERTS_FAILED).await;
        Ok(())
    }

    async fn count(&self, name: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.inc_counter(name).await;
        }
    }
}
