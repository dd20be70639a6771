//! Common test utilities and fixtures for integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use stateset_inventory::config::AppConfig;
use stateset_inventory::detector::ThresholdDetector;
use stateset_inventory::dispatch::NotificationDispatcher;
use stateset_inventory::domain::{AlertPayload, RawMutation};
use stateset_inventory::infra::{
    AlertChannel, ChannelError, CursorStore, InMemoryCursorStore, InMemoryDispatchLog,
    InMemoryFailedAlertStore, InMemoryInventoryStore, InventoryStore,
};
use stateset_inventory::server::AppState;
use stateset_inventory::stream::ChangeStream;

/// How a [`RecordingChannel`] answers sends
#[derive(Debug, Clone, Copy)]
pub enum ChannelBehavior {
    Accept,
    /// Fail with a retryable error this many times, then accept
    FailTimes(usize),
    AlwaysRetryable,
    AlwaysFatal,
}

/// Channel that records every accepted payload
pub struct RecordingChannel {
    behavior: ChannelBehavior,
    calls: AtomicUsize,
    delivered: Mutex<Vec<AlertPayload>>,
}

impl RecordingChannel {
    pub fn new(behavior: ChannelBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            calls: AtomicUsize::new(0),
            delivered: Mutex::new(Vec::new()),
        })
    }

    pub fn accepting() -> Arc<Self> {
        Self::new(ChannelBehavior::Accept)
    }

    pub fn delivered(&self) -> Vec<AlertPayload> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AlertChannel for RecordingChannel {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, payload: &AlertPayload) -> Result<(), ChannelError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            ChannelBehavior::FailTimes(n) if call < n => {
                return Err(ChannelError::Retryable("subscriber timed out".into()))
            }
            ChannelBehavior::AlwaysRetryable => {
                return Err(ChannelError::Retryable("subscriber timed out".into()))
            }
            ChannelBehavior::AlwaysFatal => {
                return Err(ChannelError::Fatal("topic does not exist".into()))
            }
            _ => {}
        }
        self.delivered.lock().unwrap().push(payload.clone());
        Ok(())
    }
}

/// Configuration with millisecond backoff and polling
pub fn test_config() -> AppConfig {
    AppConfig {
        dispatch_max_attempts: 3,
        dispatch_backoff_base: Duration::from_millis(1),
        dispatch_backoff_max: Duration::from_millis(2),
        detector_poll_interval: Duration::from_millis(20),
        ..AppConfig::default()
    }
}

pub struct InMemoryPipeline {
    pub state: AppState,
    pub store: Arc<InMemoryInventoryStore>,
    pub cursors: Arc<InMemoryCursorStore>,
    pub failed_alerts: Arc<InMemoryFailedAlertStore>,
    pub dispatch_log: Arc<InMemoryDispatchLog>,
    pub channel: Arc<RecordingChannel>,
}

impl InMemoryPipeline {
    pub fn new(channel: Arc<RecordingChannel>) -> Self {
        Self::with_config(&test_config(), channel)
    }

    pub fn with_config(config: &AppConfig, channel: Arc<RecordingChannel>) -> Self {
        let store = Arc::new(InMemoryInventoryStore::new());
        let cursors = Arc::new(InMemoryCursorStore::new());
        let failed_alerts = Arc::new(InMemoryFailedAlertStore::new());
        let dispatch_log = Arc::new(InMemoryDispatchLog::new());

        let state = AppState::build(
            config,
            store.clone(),
            cursors.clone(),
            failed_alerts.clone(),
            dispatch_log.clone(),
            channel.clone(),
        );

        Self {
            state,
            store,
            cursors,
            failed_alerts,
            dispatch_log,
            channel,
        }
    }

    /// A second detector over the same stream and dispatcher, with its own cursors
    pub fn detector_with_cursors(&self, cursors: Arc<dyn CursorStore>) -> ThresholdDetector {
        detector_over(
            self.store.clone(),
            cursors,
            self.state.dispatcher.clone(),
        )
    }
}

pub fn detector_over(
    store: Arc<dyn InventoryStore>,
    cursors: Arc<dyn CursorStore>,
    dispatcher: Arc<NotificationDispatcher>,
) -> ThresholdDetector {
    ThresholdDetector::new(
        test_config().detector(),
        Arc::new(ChangeStream::new(store)),
        cursors,
        dispatcher,
    )
}

pub fn raw(store: &str, item: &str, count: &str) -> RawMutation {
    RawMutation::new(store, item, count)
}

/// Poll `check` until it holds or `timeout` passes
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
