//! Lifecycle and data events published by the bridge.
//!
//! Events go out on a `tokio::sync::broadcast` channel, so any number of
//! independent listeners can each hold their own receiver.

use kvbridge_core::{BridgeError, VersionedValue};
use serde_json::{Value, json};
use tokio::sync::broadcast;

/// Capacity of the event channel; slow listeners observe `Lagged`.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Something the bridge wants collaborators to know about.
#[derive(Clone, Debug, PartialEq)]
pub enum BridgeEvent {
    /// Stream established (initially or after a reconnect).
    Connected,
    /// Stream lost or closed.
    Disconnected,
    /// A reconnect attempt is scheduled.
    Reconnecting {
        /// 1-based attempt number.
        attempt: u32,
    },
    /// A transport, parse, or reconnect failure.
    Error(BridgeError),
    /// The link was idle past the liveness window and is being torn down.
    Timeout,
    /// Reconnect attempts exhausted; no further automatic retries.
    MaxReconnectAttemptsReached,
    /// A key changed upstream.
    ValueChanged {
        /// Key that changed.
        key: String,
        /// Normalized value.
        value: VersionedValue,
    },
}

impl BridgeEvent {
    /// Stable event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Reconnecting { .. } => "reconnecting",
            Self::Error(_) => "error",
            Self::Timeout => "timeout",
            Self::MaxReconnectAttemptsReached => "maxReconnectAttemptsReached",
            Self::ValueChanged { .. } => "valueChanged",
        }
    }

    /// JSON view for diagnostics.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Reconnecting { attempt } => json!({"event": self.name(), "attempt": attempt}),
            Self::Error(err) => {
                json!({"event": self.name(), "code": err.code(), "message": err.to_string()})
            }
            Self::ValueChanged { key, value } => {
                json!({"event": self.name(), "key": key, "version": value.version})
            }
            _ => json!({"event": self.name()}),
        }
    }
}

/// Sending side of the event channel.
pub type EventSender = broadcast::Sender<BridgeEvent>;

/// Publish an event; having no listeners is fine.
pub(crate) fn emit(events: &EventSender, event: BridgeEvent) {
    let _ = events.send(event);
}
