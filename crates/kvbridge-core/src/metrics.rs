//! Metric names shared across crates.
//!
//! The recorder itself is installed by the server; libraries only emit
//! through the `metrics` facade using these names.

/// Datastore requests sent (counter, labels: command).
pub const IPC_REQUESTS_TOTAL: &str = "ipc_requests_total";
/// Datastore requests that failed (counter, labels: code).
pub const IPC_REQUEST_ERRORS_TOTAL: &str = "ipc_request_errors_total";
/// Datastore request latency (histogram, labels: command).
pub const IPC_REQUEST_DURATION_SECONDS: &str = "ipc_request_duration_seconds";
/// Requests awaiting a response (gauge).
pub const IPC_PENDING_REQUESTS: &str = "ipc_pending_requests";
/// Reconnect attempts started (counter).
pub const IPC_RECONNECTS_TOTAL: &str = "ipc_reconnects_total";
/// Notifications received from the datastore (counter).
pub const IPC_NOTIFICATIONS_TOTAL: &str = "ipc_notifications_total";
/// WebSocket consumers accepted (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket consumers gone (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Connected WebSocket consumers (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Notification frames delivered to consumers (counter).
pub const REGISTRY_FANOUT_DELIVERIES_TOTAL: &str = "registry_fanout_deliveries_total";
/// Consumers removed after a failed delivery or inactivity (counter, labels: reason).
pub const REGISTRY_CONSUMERS_EVICTED_TOTAL: &str = "registry_consumers_evicted_total";
