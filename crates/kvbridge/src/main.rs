//! # kvbridge
//!
//! Bridge server binary: loads settings and the key catalog, connects to
//! the datastore process and serves HTTP + `WebSocket` consumers.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use kvbridge_ipc::DatastoreBridge;
use kvbridge_server::{BridgeServer, KeyCatalog};
use kvbridge_settings::BridgeSettings;

/// How long background tasks get to stop after a signal.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Datastore bridge server.
#[derive(Parser, Debug)]
#[command(name = "kvbridge", about = "Bridge HTTP/WebSocket consumers to a datastore process")]
struct Cli {
    /// Settings file (defaults to `KVBRIDGE_CONFIG` or `~/.kvbridge/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Datastore Unix socket path.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Datastore TCP address, used instead of the socket.
    #[arg(long)]
    tcp: Option<String>,

    /// Key catalog file.
    #[arg(long)]
    schema: Option<PathBuf>,

    /// Log level or filter directive.
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    /// Apply flags over loaded settings.
    fn apply(&self, settings: &mut BridgeSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(socket) = &self.socket {
            settings.ipc.socket_path.clone_from(socket);
        }
        if let Some(tcp) = &self.tcp {
            settings.ipc.tcp_addr = Some(tcp.clone());
        }
        if let Some(schema) = &self.schema {
            settings.schema_path.clone_from(schema);
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
    }
}

fn load_settings(cli: &Cli) -> Result<BridgeSettings> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(kvbridge_settings::settings_path);
    let mut settings = kvbridge_settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    cli.apply(&mut settings);
    Ok(settings)
}

async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("Failed to install SIGTERM handler")?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res.context("Failed to listen for ctrl-c")?,
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(&cli)?;

    kvbridge_core::logging::init_subscriber(&settings.logging.level, settings.logging.json);
    let metrics = kvbridge_server::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;

    let catalog = KeyCatalog::load(&settings.schema_path)
        .with_context(|| format!("Failed to load key catalog {}", settings.schema_path.display()))?;

    let bridge = DatastoreBridge::from_settings(&settings.ipc);
    match bridge.connect().await {
        Ok(()) => tracing::info!(endpoint = %bridge.endpoint(), "connected to datastore"),
        Err(err) => tracing::warn!(
            endpoint = %bridge.endpoint(),
            error = %err,
            "datastore unavailable, retrying in background"
        ),
    }

    let server = BridgeServer::new(bridge.clone(), catalog, &settings, metrics);
    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let handle = server
        .listen(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!("kvbridge listening on http://{}", handle.addr());

    wait_for_signal().await?;

    tracing::info!("shutting down");
    handle.shutdown(Some(SHUTDOWN_TIMEOUT)).await;
    bridge.disconnect().await;
    tracing::info!("shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_default_to_none() {
        let cli = Cli::parse_from(["kvbridge"]);
        assert!(cli.config.is_none());
        assert!(cli.port.is_none());
        let mut settings = BridgeSettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings, BridgeSettings::default());
    }

    #[test]
    fn flags_override_settings() {
        let cli = Cli::parse_from([
            "kvbridge",
            "--port",
            "8080",
            "--socket",
            "/run/ds.sock",
            "--schema",
            "/etc/kv/schema.json",
            "--log-level",
            "debug",
            "--tcp",
            "127.0.0.1:7000",
        ]);
        let mut settings = BridgeSettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.ipc.socket_path, PathBuf::from("/run/ds.sock"));
        assert_eq!(settings.ipc.tcp_addr.as_deref(), Some("127.0.0.1:7000"));
        assert_eq!(settings.schema_path, PathBuf::from("/etc/kv/schema.json"));
        assert_eq!(settings.logging.level, "debug");
    }

    #[test]
    fn config_file_is_layered_under_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server": {"port": 4000, "host": "127.0.0.1"}}"#).unwrap();
        let cli = Cli::parse_from([
            "kvbridge",
            "--config",
            path.to_str().unwrap(),
            "--port",
            "5000",
        ]);
        let settings = load_settings(&cli).unwrap();
        assert_eq!(settings.server.port, 5000);
        assert_eq!(settings.server.host, "127.0.0.1");
    }

    #[test]
    fn shipped_catalog_loads() {
        let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("../../config/datastore-schema.json");
        let catalog = KeyCatalog::load(&path).unwrap();
        assert!(catalog.has_key("robot_position"));
        assert!(catalog.can_read("robot_position"));
    }
}
