//! Health, readiness and liveness endpoints.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use crate::health::{self, HealthResponse};
use crate::server::AppState;

/// `GET /api/health`. Always 200; `status` says whether the link is up.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let stats = state.registry.stats();
    Json(health::health_check(
        state.start_time,
        state.bridge.is_connected(),
        stats.consumer_count,
        stats.total_subscription_edges,
    ))
}

/// `GET /api/health/ready`. 503 while the datastore is unreachable.
pub async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    let body = health::readiness(state.bridge.is_connected());
    let status = if body.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

/// `GET /api/health/live`.
pub async fn live() -> impl IntoResponse {
    Json(json!({"alive": true}))
}
