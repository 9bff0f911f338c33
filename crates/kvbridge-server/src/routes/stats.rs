//! Diagnostics.

use axum::Json;
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;

use crate::registry::RegistryStats;
use crate::server::AppState;

/// `GET /api/ws/stats`.
pub async fn ws_stats(State(state): State<AppState>) -> Json<RegistryStats> {
    Json(state.registry.stats())
}

/// `GET /metrics`.
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        crate::metrics::render(&state.metrics),
    )
}
