//! Error taxonomy for bridge operations.
//!
//! Transport and correlator failures surface to callers unchanged as a
//! [`BridgeError`]. Registry lookups on unknown consumers are not errors;
//! those operations return `false` instead.

use thiserror::Error;

// ─────────────────────────────────────────────────────────────────────────────
// Error codes
// ─────────────────────────────────────────────────────────────────────────────

/// Stream could not be established.
pub const CONNECTION_ERROR: &str = "CONNECTION_ERROR";
/// Request attempted while the transport is down.
pub const NOT_CONNECTED: &str = "NOT_CONNECTED";
/// Frame could not be written.
pub const WRITE_ERROR: &str = "WRITE_ERROR";
/// Stream closed while the request was in flight.
pub const CONNECTION_CLOSED: &str = "CONNECTION_CLOSED";
/// No response arrived before the deadline.
pub const TIMEOUT: &str = "TIMEOUT";
/// The datastore process reported a failure for the command.
pub const REMOTE_ERROR: &str = "REMOTE_ERROR";
/// A frame did not match the expected shape.
pub const PROTOCOL_ERROR: &str = "PROTOCOL_ERROR";

// ─────────────────────────────────────────────────────────────────────────────
// BridgeError
// ─────────────────────────────────────────────────────────────────────────────

/// Failure of a transport, correlator, or bridge operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// The datastore endpoint is unreachable.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The transport is not connected; nothing was sent.
    #[error("not connected to datastore")]
    NotConnected,

    /// Writing the frame failed.
    #[error("write failed: {0}")]
    Write(String),

    /// The stream went away before a response arrived.
    #[error("connection closed")]
    ConnectionClosed,

    /// The request deadline elapsed.
    #[error("request timed out after {timeout_ms}ms")]
    Timeout {
        /// The deadline that elapsed.
        timeout_ms: u64,
    },

    /// The datastore answered with an `error` field.
    #[error("{0}")]
    Remote(String),

    /// A frame or payload was malformed.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl BridgeError {
    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Connection(_) => CONNECTION_ERROR,
            Self::NotConnected => NOT_CONNECTED,
            Self::Write(_) => WRITE_ERROR,
            Self::ConnectionClosed => CONNECTION_CLOSED,
            Self::Timeout { .. } => TIMEOUT,
            Self::Remote(_) => REMOTE_ERROR,
            Self::Protocol(_) => PROTOCOL_ERROR,
        }
    }

    /// Whether the failure stems from the link rather than the command.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::NotConnected | Self::Write(_) | Self::ConnectionClosed
        )
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

/// Result alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
