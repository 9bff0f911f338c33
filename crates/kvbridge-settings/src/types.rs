//! Settings types with compiled defaults.
//!
//! Every struct is `#[serde(default)]` so a partial settings file only has
//! to name the fields it changes.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root settings object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    /// Datastore link.
    pub ipc: IpcSettings,
    /// HTTP / WebSocket listener.
    pub server: ServerSettings,
    /// Subscriber registry housekeeping.
    pub registry: RegistrySettings,
    /// Key catalog file.
    pub schema_path: PathBuf,
    /// Log output.
    pub logging: LoggingSettings,
}

/// Connection to the datastore process.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcSettings {
    /// Unix domain socket path.
    pub socket_path: PathBuf,
    /// TCP `host:port`; used instead of the socket when set.
    pub tcp_addr: Option<String>,
    /// Fixed delay between reconnect attempts.
    pub reconnect_delay_ms: u64,
    /// Reconnect attempts before giving up.
    pub max_reconnect_attempts: u32,
    /// Per-request deadline.
    pub request_timeout_ms: u64,
    /// Inactivity window after which the link is torn down (0 disables).
    pub idle_timeout_ms: u64,
}

impl IpcSettings {
    /// Reconnect delay as a [`Duration`].
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Request deadline as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Idle window, `None` when disabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }
}

impl Default for IpcSettings {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/tmp/kvbridge_ipc.sock"),
            tcp_addr: None,
            reconnect_delay_ms: 5_000,
            max_reconnect_attempts: 10,
            request_timeout_ms: 5_000,
            idle_timeout_ms: 30_000,
        }
    }
}

/// HTTP / WebSocket listener.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Bind host.
    pub host: String,
    /// Bind port (0 picks a free one).
    pub port: u16,
    /// Seconds between server pings.
    pub ping_interval_secs: u64,
    /// Seconds without a pong before a consumer is dropped.
    pub pong_timeout_secs: u64,
    /// Per-consumer outbound queue depth.
    pub send_buffer: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3000,
            ping_interval_secs: 30,
            pong_timeout_secs: 90,
            send_buffer: 256,
        }
    }
}

/// Registry housekeeping.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    /// Seconds between cleanup sweeps.
    pub cleanup_interval_secs: u64,
    /// Seconds of inactivity before a consumer is evicted.
    pub inactive_threshold_secs: u64,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            cleanup_interval_secs: 60,
            inactive_threshold_secs: 300,
        }
    }
}

/// Log output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            ipc: IpcSettings::default(),
            server: ServerSettings::default(),
            registry: RegistrySettings::default(),
            schema_path: PathBuf::from("config/datastore-schema.json"),
            logging: LoggingSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipc_defaults() {
        let ipc = IpcSettings::default();
        assert_eq!(ipc.socket_path, PathBuf::from("/tmp/kvbridge_ipc.sock"));
        assert_eq!(ipc.reconnect_delay(), Duration::from_secs(5));
        assert_eq!(ipc.max_reconnect_attempts, 10);
        assert_eq!(ipc.request_timeout(), Duration::from_secs(5));
        assert_eq!(ipc.idle_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn idle_timeout_zero_disables() {
        let ipc = IpcSettings {
            idle_timeout_ms: 0,
            ..IpcSettings::default()
        };
        assert_eq!(ipc.idle_timeout(), None);
    }

    #[test]
    fn server_defaults() {
        let server = ServerSettings::default();
        assert_eq!(server.host, "0.0.0.0");
        assert_eq!(server.port, 3000);
        assert_eq!(server.ping_interval_secs, 30);
    }

    #[test]
    fn registry_defaults() {
        let reg = RegistrySettings::default();
        assert_eq!(reg.cleanup_interval_secs, 60);
        assert_eq!(reg.inactive_threshold_secs, 300);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let s: BridgeSettings =
            serde_json::from_str(r#"{"server": {"port": 8080}}"#).unwrap();
        assert_eq!(s.server.port, 8080);
        assert_eq!(s.server.host, "0.0.0.0");
        assert_eq!(s.ipc, IpcSettings::default());
    }

    #[test]
    fn roundtrips_through_json_value() {
        let s = BridgeSettings::default();
        let v = serde_json::to_value(&s).unwrap();
        assert_eq!(v["ipc"]["tcp_addr"], serde_json::Value::Null);
        let back: BridgeSettings = serde_json::from_value(v).unwrap();
        assert_eq!(back, s);
    }
}
