//! HTTP server bootstrap for the inventory service.
//!
//! This module wires together:
//! - configuration and logging
//! - the SQLite pool and the stores built on it
//! - the mutation applier, threshold detector and notification dispatcher
//! - the Axum router

use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderValue, Method};
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::api::QueryService;
use crate::config::AppConfig;
use crate::detector::ThresholdDetector;
use crate::dispatch::{NotificationDispatcher, TracingChannel};
use crate::infra::{
    serve_with_shutdown, shutdown_signal, AlertChannel, CursorStore, DispatchLog,
    FailedAlertStore, InventoryStore, ShutdownCoordinator, SqliteCursorStore, SqliteDispatchLog,
    SqliteFailedAlertStore, SqliteInventoryStore,
};
use crate::ingest::MutationApplier;
use crate::metrics::MetricsRegistry;
use crate::stream::{ChangeStream, ChangeStreamConfig};
use crate::telemetry::{init_telemetry, TelemetryConfig};

/// How often expired dedup entries are purged
const DEDUP_PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn InventoryStore>,
    pub query: QueryService,
    pub applier: Arc<MutationApplier>,
    pub detector: Arc<ThresholdDetector>,
    pub dispatcher: Arc<NotificationDispatcher>,
    pub failed_alerts: Arc<dyn FailedAlertStore>,
    pub metrics: Arc<MetricsRegistry>,
}

impl AppState {
    /// Wire the pipeline components over the given stores and channel.
    pub fn build(
        config: &AppConfig,
        store: Arc<dyn InventoryStore>,
        cursors: Arc<dyn CursorStore>,
        failed_alerts: Arc<dyn FailedAlertStore>,
        dispatch_log: Arc<dyn DispatchLog>,
        channel: Arc<dyn AlertChannel>,
    ) -> Self {
        let metrics = Arc::new(MetricsRegistry::new());

        let applier = Arc::new(
            MutationApplier::new(config.applier(), store.clone()).with_metrics(metrics.clone()),
        );

        let dispatcher = Arc::new(
            NotificationDispatcher::new(
                config.dispatcher(),
                channel,
                failed_alerts.clone(),
                dispatch_log,
            )
            .with_metrics(metrics.clone()),
        );

        let stream = ChangeStream::with_config(
            store.clone(),
            ChangeStreamConfig {
                batch_size: config.detector_batch_size,
                poll_interval: config.detector_poll_interval,
            },
        );

        let detector = Arc::new(
            ThresholdDetector::new(
                config.detector(),
                Arc::new(stream),
                cursors,
                dispatcher.clone(),
            )
            .with_metrics(metrics.clone()),
        );

        Self {
            query: QueryService::new(store.clone()),
            store,
            applier,
            detector,
            dispatcher,
            failed_alerts,
            metrics,
        }
    }
}

/// Start the HTTP server and the detector loop.
pub async fn run() -> anyhow::Result<()> {
    init_telemetry(&TelemetryConfig::from_env())?;

    info!("Starting StateSet Inventory v{}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::from_env()?;
    info!("Configuration loaded");
    info!("  Listen address: {}", config.listen_addr);
    info!("  Max connections: {}", config.max_connections);
    info!("  Low-stock threshold: {}", config.threshold);
    info!("  Detector consumer: {}", config.consumer_id);

    let pool = crate::infra::sqlite::connect(&config.database_url, config.max_connections).await?;

    let store = Arc::new(SqliteInventoryStore::new(pool.clone()).await?);
    let cursors = Arc::new(SqliteCursorStore::new(pool.clone()));
    let failed_alerts = Arc::new(SqliteFailedAlertStore::new(pool.clone()));
    let dispatch_log = Arc::new(SqliteDispatchLog::new(pool.clone()));
    let channel = Arc::new(TracingChannel::new());

    let state = AppState::build(&config, store, cursors, failed_alerts, dispatch_log, channel);
    let coordinator = Arc::new(ShutdownCoordinator::new());
    coordinator
        .register_hook(|| info!("Stopping threshold detector and dedup housekeeping"))
        .await;

    // Threshold detector
    let detector_task = {
        let detector = state.detector.clone();
        let signal = coordinator.signal();
        tokio::spawn(async move {
            if let Err(e) = detector.run(signal).await {
                error!(error = %e, "Threshold detector stopped with error");
            }
        })
    };

    // Dedup window housekeeping
    {
        let dispatcher = state.dispatcher.clone();
        let signal = coordinator.signal();
        tokio::spawn(async move {
            while signal.sleep(DEDUP_PURGE_INTERVAL).await {
                match dispatcher.purge_expired().await {
                    Ok(0) => {}
                    Ok(purged) => debug!(purged, "Expired dispatch log entries purged"),
                    Err(e) => warn!(error = %e, "Failed to purge dispatch log"),
                }
            }
        });
    }

    // OS signals
    {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            coordinator.shutdown().await;
        });
    }

    let app = build_router(state.clone(), config.cors_allow_origins.as_deref())?;

    info!("Starting HTTP server on {}", config.listen_addr);
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;

    info!("StateSet Inventory is ready to accept connections");
    let served = serve_with_shutdown(listener, app, coordinator.clone()).await;

    // The server may also stop on an I/O error; make sure the detector stops too
    coordinator.shutdown().await;
    if let Err(e) = detector_task.await {
        warn!(error = %e, "Detector task did not finish cleanly");
    }

    info!(
        consumer_id = state.detector.consumer_id(),
        cursor = state.detector.cursor(),
        "Detector stopped"
    );

    pool.close().await;
    served?;
    Ok(())
}

/// Build the full router with tracing and optional CORS.
pub fn build_router(state: AppState, cors_allow_origins: Option<&str>) -> anyhow::Result<Router> {
    let mut router = crate::api::router().layer(TraceLayer::new_for_http());

    if let Some(cors_layer) = cors_layer(cors_allow_origins)? {
        router = router.layer(cors_layer);
    }

    Ok(router.with_state(state))
}

fn cors_layer(origins: Option<&str>) -> anyhow::Result<Option<CorsLayer>> {
    let origins = match origins.map(str::trim) {
        Some(v) if !v.is_empty() => v,
        _ => return Ok(None),
    };

    let allow_origin = if origins == "*" {
        AllowOrigin::any()
    } else {
        let origins: Vec<HeaderValue> = origins
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<HeaderValue>()
                    .map_err(|e| anyhow::anyhow!("Invalid CORS origin {s:?}: {e}"))
            })
            .collect::<anyhow::Result<_>>()?;
        AllowOrigin::list(origins)
    };

    Ok(Some(
        CorsLayer::new()
            .allow_origin(allow_origin)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([axum::http::header::CONTENT_TYPE]),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cors_disabled_when_unset() {
        assert!(cors_layer(None).unwrap().is_none());
        assert!(cors_layer(Some("  ")).unwrap().is_none());
    }

    #[test]
    fn test_cors_origin_list() {
        assert!(cors_layer(Some("*")).unwrap().is_some());
        assert!(cors_layer(Some("https://a.example, https://b.example"))
            .unwrap()
            .is_some());
        assert!(cors_layer(Some("bad\norigin")).is_err());
    }
}
