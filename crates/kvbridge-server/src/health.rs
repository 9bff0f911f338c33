//! Health, readiness and liveness bodies.

use std::time::Instant;

use chrono::Utc;
use serde::Serialize;

/// Per-service status.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    /// `connected` or `disconnected`.
    pub ipc: &'static str,
    /// Always `running` while the server answers.
    pub api_server: &'static str,
}

/// Live counters included with the health body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthDetails {
    /// Registered WebSocket consumers.
    pub connections: usize,
    /// Subscription edges across all consumers.
    pub subscriptions: usize,
}

/// `GET /api/health` body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `healthy` when the datastore link is up, else `degraded`.
    pub status: &'static str,
    /// Service breakdown.
    pub services: ServiceStatus,
    /// Seconds since start.
    pub uptime_secs: u64,
    /// RFC 3339 time of the check.
    pub timestamp: String,
    /// Counters.
    pub details: HealthDetails,
}

/// Build a health body.
pub fn health_check(
    start_time: Instant,
    ipc_connected: bool,
    connections: usize,
    subscriptions: usize,
) -> HealthResponse {
    HealthResponse {
        status: if ipc_connected { "healthy" } else { "degraded" },
        services: ServiceStatus {
            ipc: if ipc_connected { "connected" } else { "disconnected" },
            api_server: "running",
        },
        uptime_secs: start_time.elapsed().as_secs(),
        timestamp: Utc::now().to_rfc3339(),
        details: HealthDetails {
            connections,
            subscriptions,
        },
    }
}

/// `GET /api/health/ready` body.
#[derive(Debug, Clone, Serialize)]
pub struct ReadinessResponse {
    /// Whether requests can be served.
    pub ready: bool,
    /// Why not.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

/// Ready exactly when the datastore link is up.
pub fn readiness(ipc_connected: bool) -> ReadinessResponse {
    ReadinessResponse {
        ready: ipc_connected,
        reason: (!ipc_connected).then_some("IPC not connected"),
    }
}
