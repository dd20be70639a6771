//! REST API endpoints for the inventory service.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use super::error::ApiError;
use super::query::{ItemView, ItemsResponse, StoreItemsResponse};
use crate::domain::RawMutation;
use crate::infra::ComponentHealth;
use crate::ingest::csv::parse_inventory_csv;
use crate::server::AppState;

const DEFAULT_FAILED_ALERT_LIMIT: usize = 50;
const MAX_FAILED_ALERT_LIMIT: usize = 1000;

/// Build the inventory router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/items", get(list_items).post(upsert_item))
        .route("/items/:store", get(list_store_items))
        .route("/ingest", post(ingest_csv))
        .route("/alerts/failed", get(list_failed_alerts))
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_json))
        .route("/metrics/prometheus", get(metrics_prometheus))
}

// ============================================================================
// Queries
// ============================================================================

async fn list_items(State(state): State<AppState>) -> Result<Json<ItemsResponse>, ApiError> {
    Ok(Json(state.query.get_all_items().await?))
}

async fn list_store_items(
    State(state): State<AppState>,
    Path(store): Path<String>,
) -> Result<Json<StoreItemsResponse>, ApiError> {
    Ok(Json(state.query.get_items_by_store(&store).await?))
}

// ============================================================================
// Mutations
// ============================================================================

/// Single mutation body. `Count` may be a JSON number or a numeric string.
#[derive(Debug, Deserialize)]
pub struct UpsertItemRequest {
    #[serde(rename = "Store", default)]
    pub store: String,
    #[serde(rename = "Item", default)]
    pub item: String,
    #[serde(rename = "Count", default)]
    pub count: serde_json::Value,
    #[serde(default)]
    pub expected_version: Option<u64>,
}

impl UpsertItemRequest {
    fn to_raw(&self) -> RawMutation {
        let quantity = match &self.count {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        };
        RawMutation::new(self.store.clone(), self.item.clone(), quantity)
    }
}

async fn upsert_item(
    State(state): State<AppState>,
    body: Result<Json<UpsertItemRequest>, JsonRejection>,
) -> Result<Json<ItemView>, ApiError> {
    let Json(request) = body.map_err(|e| ApiError::invalid_body(e.body_text()))?;

    let record = match request.expected_version {
        None => state.applier.apply_raw(&request.to_raw()).await?,
        Some(version) => {
            let mutation = request.to_raw().validate()?.with_expected_version(version);
            state.applier.apply_one(&mutation).await?
        }
    };

    Ok(Json(ItemView::from(record)))
}

async fn ingest_csv(
    State(state): State<AppState>,
    body: String,
) -> Result<Json<serde_json::Value>, ApiError> {
    let rows = parse_inventory_csv(&body)?;
    let report = state.applier.apply_batch(rows).await;
    Ok(Json(report.summary()))
}

// ============================================================================
// Operator endpoints
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct FailedAlertsQuery {
    pub limit: Option<usize>,
}

async fn list_failed_alerts(
    State(state): State<AppState>,
    Query(query): Query<FailedAlertsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_FAILED_ALERT_LIMIT)
        .clamp(1, MAX_FAILED_ALERT_LIMIT);

    let alerts = state.failed_alerts.list(limit).await?;
    let total = state.failed_alerts.count().await?;

    Ok(Json(serde_json::json!({
        "failed_alerts": alerts,
        "count": alerts.len(),
        "total": total,
    })))
}

/// Health check endpoint.
async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "stateset-inventory",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

fn health_json(health: &ComponentHealth) -> serde_json::Value {
    match health {
        ComponentHealth::Healthy => serde_json::json!({ "status": "healthy" }),
        ComponentHealth::Degraded { reason } => {
            serde_json::json!({ "status": "degraded", "reason": reason })
        }
        ComponentHealth::Unhealthy { reason } => {
            serde_json::json!({ "status": "unhealthy", "reason": reason })
        }
    }
}

/// Readiness check endpoint.
///
/// 503 when the store cannot be read; a lagging detector only degrades.
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let cursor = state.detector.cursor();

    let (store_health, head) = match state.store.head().await {
        Ok(head) => (ComponentHealth::Healthy, Some(head)),
        Err(e) => (
            ComponentHealth::Unhealthy {
                reason: format!("store unavailable: {e}"),
            },
            None,
        ),
    };

    let lag = head.map(|h| h.saturating_sub(cursor));
    let detector_health = match lag {
        Some(0) | None => ComponentHealth::Healthy,
        Some(n) => ComponentHealth::Degraded {
            reason: format!("{n} change records not yet evaluated"),
        },
    };

    let status = if store_health.is_unhealthy() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    let body = serde_json::json!({
        "status": if status == StatusCode::OK { "ready" } else { "not_ready" },
        "store": health_json(&store_health),
        "detector": health_json(&detector_health),
        "consumer_id": state.detector.consumer_id(),
        "stream_head": head,
        "detector_cursor": cursor,
        "lag": lag,
    });

    (status, Json(body))
}

async fn metrics_json(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.metrics.to_json().await)
}

async fn metrics_prometheus(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.to_prometheus().await,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(count: serde_json::Value) -> UpsertItemRequest {
        UpsertItemRequest {
            store: "Berlin".into(),
            item: "Widget-001".into(),
            count,
            expected_version: None,
        }
    }

    #[test]
    fn test_numeric_count_is_accepted() {
        let m = request(serde_json::json!(42)).to_raw().validate().unwrap();
        assert_eq!(m.quantity, 42);
    }

    #[test]
    fn test_string_count_is_accepted() {
        let m = request(serde_json::json!(" 7 ")).to_raw().validate().unwrap();
        assert_eq!(m.quantity, 7);
    }

    #[test]
    fn test_missing_count_is_invalid() {
        assert!(request(serde_json::Value::Null).to_raw().validate().is_err());
        assert!(request(serde_json::json!(1.5)).to_raw().validate().is_err());
    }
}
