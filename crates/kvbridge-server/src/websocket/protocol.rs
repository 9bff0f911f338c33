//! Consumer-facing WebSocket message formats.

use chrono::Utc;
use kvbridge_core::VersionedValue;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Inbound client message.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct ClientMessage {
    /// `subscribe`, `unsubscribe` or `ping`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Single key.
    #[serde(default)]
    pub key: Option<String>,
    /// Multiple keys.
    #[serde(default)]
    pub keys: Option<Vec<String>>,
}

impl ClientMessage {
    /// Parse a text frame.
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }

    /// Keys named by `keys`, falling back to `key`.
    pub fn requested_keys(&self) -> Vec<String> {
        match (&self.keys, &self.key) {
            (Some(keys), _) if !keys.is_empty() => keys.clone(),
            (_, Some(key)) => vec![key.clone()],
            _ => Vec::new(),
        }
    }
}

/// Outcome for one key of a subscribe/unsubscribe request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct KeyResult {
    /// Key.
    pub key: String,
    /// Whether the edge was added or removed.
    pub success: bool,
    /// Reason for failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl KeyResult {
    /// Successful result.
    pub fn ok(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            success: true,
            error: None,
        }
    }

    /// Failed result.
    pub fn failed(key: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Error strings sent to consumers.
pub mod errors {
    /// Subscribe without keys.
    pub const NO_KEYS: &str = "No keys specified for subscription";
    /// Unsubscribe without keys.
    pub const NO_KEYS_UNSUBSCRIBE: &str = "No keys specified for unsubscription";
    /// Key absent from the catalog.
    pub const KEY_NOT_FOUND: &str = "Key not found in schema";
    /// Key lacks `nonrt_read`.
    pub const READ_DENIED: &str = "Read permission denied";
    /// Frame is not JSON or lacks `type`.
    pub const INVALID_FORMAT: &str = "Invalid message format";
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

/// Greeting sent right after the upgrade.
pub fn connected(consumer_id: &str) -> Value {
    json!({
        "type": "connected",
        "data": {"consumer_id": consumer_id},
        "timestamp": now(),
    })
}

/// Reply to a subscribe request.
pub fn subscribed(results: &[KeyResult]) -> Value {
    json!({"type": "subscribed", "data": results, "timestamp": now()})
}

/// Reply to an unsubscribe request.
pub fn unsubscribed(results: &[KeyResult]) -> Value {
    json!({"type": "unsubscribed", "data": results, "timestamp": now()})
}

/// Reply to a ping.
pub fn pong() -> Value {
    json!({"type": "pong", "timestamp": now()})
}

/// Error reply.
pub fn error(message: &str) -> Value {
    json!({"type": "error", "error": message, "timestamp": now()})
}

/// Value change pushed to subscribers.
pub fn notification(value: &VersionedValue) -> Value {
    json!({
        "type": "notification",
        "key": value.key,
        "data": value,
        "timestamp": now(),
    })
}
