//! HTTP error responses.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use kvbridge_core::BridgeError;
use serde_json::{Map, Value, json};
use tracing::{error, warn};

/// Machine-readable API error codes.
pub mod codes {
    /// Key absent from the catalog or datastore.
    pub const KEY_NOT_FOUND: &str = "KEY_NOT_FOUND";
    /// Access flag not granted.
    pub const PERMISSION_DENIED: &str = "PERMISSION_DENIED";
    /// Value does not match the declared type.
    pub const TYPE_MISMATCH: &str = "TYPE_MISMATCH";
    /// Malformed request body.
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    /// Datastore temporarily unreachable.
    pub const SERVICE_UNAVAILABLE: &str = "SERVICE_UNAVAILABLE";
    /// Link to the datastore is down.
    pub const IPC_CONNECTION_FAILED: &str = "IPC_CONNECTION_FAILED";
    /// Datastore did not answer in time.
    pub const IPC_TIMEOUT: &str = "IPC_TIMEOUT";
    /// Anything else.
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

/// An error rendered as `{error: CODE, message, ...details}`.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Map<String, Value>,
}

impl ApiError {
    /// Build an error with no details.
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: Map::new(),
        }
    }

    /// Attach an extra field to the body.
    #[must_use]
    pub fn with_detail(mut self, name: &str, value: impl Into<Value>) -> Self {
        let _ = self.details.insert(name.to_string(), value.into());
        self
    }

    /// 404 for a key missing from the catalog.
    pub fn key_not_found(key: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            codes::KEY_NOT_FOUND,
            format!("Key '{key}' not found in schema"),
        )
        .with_detail("key", key)
    }

    /// 403 for a missing access flag.
    pub fn permission_denied(key: &str, operation: &str, required: &str) -> Self {
        Self::new(
            StatusCode::FORBIDDEN,
            codes::PERMISSION_DENIED,
            format!("{operation} permission denied for key '{key}'"),
        )
        .with_detail("key", key)
        .with_detail("required_permission", required)
    }

    /// 400 for a value that does not fit the declared type.
    pub fn type_mismatch(key: &str, expected: &str) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            codes::TYPE_MISMATCH,
            format!("Type mismatch for key '{key}'"),
        )
        .with_detail("key", key)
        .with_detail("expected_type", expected)
    }

    /// 400 for a malformed request.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, codes::INVALID_REQUEST, message)
    }

    /// HTTP status.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Error code.
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// JSON body.
    pub fn body(&self) -> Value {
        let mut body = Map::new();
        let _ = body.insert("error".into(), json!(self.code));
        let _ = body.insert("message".into(), json!(self.message));
        for (name, value) in &self.details {
            let _ = body.insert(name.clone(), value.clone());
        }
        Value::Object(body)
    }
}

impl From<BridgeError> for ApiError {
    fn from(err: BridgeError) -> Self {
        let message = err.to_string();
        let mapped = match &err {
            BridgeError::NotConnected
            | BridgeError::Connection(_)
            | BridgeError::ConnectionClosed
            | BridgeError::Write(_) => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                codes::IPC_CONNECTION_FAILED,
                message,
            ),
            BridgeError::Timeout { .. } => {
                Self::new(StatusCode::GATEWAY_TIMEOUT, codes::IPC_TIMEOUT, message)
            }
            BridgeError::Remote(text) if text.contains("not found") => {
                Self::new(StatusCode::NOT_FOUND, codes::KEY_NOT_FOUND, message)
            }
            BridgeError::Remote(_) | BridgeError::Protocol(_) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                codes::INTERNAL_ERROR,
                message,
            ),
        };
        mapped.with_detail("ipc_error", err.code())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(code = self.code, message = %self.message, "request failed");
        } else {
            warn!(code = self.code, message = %self.message, "request rejected");
        }
        (self.status, Json(self.body())).into_response()
    }
}
