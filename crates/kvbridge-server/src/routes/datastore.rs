//! `GET`/`PUT /api/datastore/{key}`.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use kvbridge_core::{VersionedValue, WriteAck};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::catalog::ValidationError;
use crate::error::ApiError;
use crate::server::AppState;

/// Read a key through the bridge.
#[instrument(skip_all, fields(key = %key))]
pub async fn read_key(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<VersionedValue>, ApiError> {
    if !state.catalog.has_key(&key) {
        return Err(ApiError::key_not_found(&key));
    }
    if !state.catalog.can_read(&key) {
        return Err(ApiError::permission_denied(&key, "Read", "nonrt_read"));
    }
    let value = state.bridge.read(&key).await?;
    debug!(version = value.version, "read served");
    Ok(Json(value))
}

/// Validate and write a key through the bridge.
#[instrument(skip_all, fields(key = %key))]
pub async fn write_key(
    State(state): State<AppState>,
    Path(key): Path<String>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<WriteAck>, ApiError> {
    if !state.catalog.has_key(&key) {
        return Err(ApiError::key_not_found(&key));
    }
    if !state.catalog.can_write(&key) {
        return Err(ApiError::permission_denied(&key, "Write", "nonrt_write"));
    }
    let Json(body) = body.map_err(|rejection| ApiError::invalid_request(rejection.body_text()))?;
    let Some(value) = body.get("value").cloned() else {
        return Err(ApiError::invalid_request("Missing 'value' in request body"));
    };

    match state.catalog.validate(&key, &value) {
        Ok(()) => {}
        Err(ValidationError::UnknownKey(_)) => return Err(ApiError::key_not_found(&key)),
        Err(ValidationError::TypeMismatch { expected, .. }) => {
            return Err(ApiError::type_mismatch(&key, &expected));
        }
    }

    let ack = state.bridge.write(&key, value).await?;
    debug!(version = ack.version, "write applied");
    Ok(Json(ack))
}
