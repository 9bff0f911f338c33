//! `BridgeServer`: Axum HTTP + WebSocket front end over a `DatastoreBridge`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::response::IntoResponse;
use axum::routing::get;
use kvbridge_ipc::DatastoreBridge;
use kvbridge_settings::{BridgeSettings, RegistrySettings};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::catalog::KeyCatalog;
use crate::cleanup;
use crate::interest::InterestManager;
use crate::registry::SubscriberRegistry;
use crate::routes;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::event_bridge::EventBridge;
use crate::websocket::session::{self, SessionConfig, SessionDeps};

/// Shared state for handlers.
#[derive(Clone)]
pub struct AppState {
    /// Link to the datastore.
    pub bridge: DatastoreBridge,
    /// WebSocket consumers.
    pub registry: Arc<SubscriberRegistry>,
    /// Key metadata.
    pub catalog: Arc<KeyCatalog>,
    /// Upstream subscriptions.
    pub interest: Arc<InterestManager>,
    /// Per-session heartbeat settings.
    pub session: SessionConfig,
    /// Prometheus renderer.
    pub metrics: PrometheusHandle,
    /// When the server was built.
    pub start_time: Instant,
}

impl AppState {
    fn session_deps(&self) -> SessionDeps {
        SessionDeps {
            registry: self.registry.clone(),
            catalog: self.catalog.clone(),
            interest: self.interest.clone(),
            config: self.session,
        }
    }
}

/// Build the router over `state`.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/datastore/{key}",
            get(routes::datastore::read_key).put(routes::datastore::write_key),
        )
        .route("/api/health", get(routes::health::health))
        .route("/api/health/ready", get(routes::health::ready))
        .route("/api/health/live", get(routes::health::live))
        .route("/api/ws/stats", get(routes::stats::ws_stats))
        .route("/api/ws", get(ws_handler))
        .route("/metrics", get(routes::stats::metrics))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let deps = state.session_deps();
    ws.on_upgrade(move |socket| session::run_ws_session(socket, deps))
}

/// The bridge server before it starts listening.
pub struct BridgeServer {
    state: AppState,
    cleanup: RegistrySettings,
    shutdown: Arc<ShutdownCoordinator>,
}

impl BridgeServer {
    /// Assemble the server around a bridge and a loaded catalog.
    pub fn new(
        bridge: DatastoreBridge,
        catalog: KeyCatalog,
        settings: &BridgeSettings,
        metrics: PrometheusHandle,
    ) -> Self {
        let registry = Arc::new(SubscriberRegistry::new());
        let interest = Arc::new(InterestManager::new(bridge.clone(), registry.clone()));
        Self {
            state: AppState {
                bridge,
                registry,
                catalog: Arc::new(catalog),
                interest,
                session: SessionConfig::from_settings(&settings.server),
                metrics,
                start_time: Instant::now(),
            },
            cleanup: settings.registry.clone(),
            shutdown: Arc::new(ShutdownCoordinator::new()),
        }
    }

    /// Handler state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// The router, without background tasks.
    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    /// Shutdown coordinator shared by the background tasks.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Start the fanout and cleanup tasks.
    pub fn spawn_background(&self) -> Vec<JoinHandle<()>> {
        let forwarder = EventBridge::new(self.state.registry.clone(), self.state.interest.clone());
        let events = forwarder.start(self.state.bridge.events(), self.shutdown.token());
        let cleanup = cleanup::start_cleanup_task(
            self.state.registry.clone(),
            self.state.interest.clone(),
            Duration::from_secs(self.cleanup.cleanup_interval_secs.max(1)),
            Duration::from_secs(self.cleanup.inactive_threshold_secs),
            self.shutdown.token(),
        );
        vec![events, cleanup]
    }

    /// Bind `addr`, start background tasks, and serve until shutdown.
    pub async fn listen(self, addr: &str) -> std::io::Result<ServerHandle> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let mut tasks = self.spawn_background();

        let router = self.router();
        let token = self.shutdown.token();
        tasks.push(tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, router)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                error!(error = %err, "http server failed");
            }
        }));
        info!(addr = %local_addr, "bridge server listening");

        Ok(ServerHandle {
            addr: local_addr,
            state: self.state,
            shutdown: self.shutdown,
            tasks,
        })
    }
}

/// A running server.
pub struct ServerHandle {
    addr: SocketAddr,
    state: AppState,
    shutdown: Arc<ShutdownCoordinator>,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    /// Bound address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Handler state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Stop accepting, close every consumer socket, and drain background
    /// tasks. The bridge itself is left to the caller.
    pub async fn shutdown(self, timeout: Option<Duration>) {
        self.shutdown.shutdown();
        let closed = self.state.registry.disconnect_all();
        info!(closed, "closed websocket consumers");
        self.shutdown.graceful_shutdown(self.tasks, timeout).await;
        self.state.interest.clear();
    }
}
