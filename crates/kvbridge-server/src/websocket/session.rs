//! WebSocket session lifecycle: one consumer from upgrade through
//! disconnect.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use kvbridge_core::ConsumerId;
use kvbridge_core::metrics::{WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL};
use kvbridge_settings::ServerSettings;
use metrics::{counter, gauge};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use super::connection::ConsumerConnection;
use super::protocol::{self, ClientMessage, KeyResult, errors};
use crate::catalog::KeyCatalog;
use crate::interest::InterestManager;
use crate::registry::SubscriberRegistry;

/// How long the outbound task gets to flush a close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Heartbeat and queue sizing for sessions.
#[derive(Clone, Copy, Debug)]
pub struct SessionConfig {
    /// Interval between server pings.
    pub ping_interval: Duration,
    /// Silence after which a consumer is dropped.
    pub pong_timeout: Duration,
    /// Outbound queue capacity per consumer.
    pub send_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_settings(&ServerSettings::default())
    }
}

impl SessionConfig {
    /// Derive from the `server` settings section.
    pub fn from_settings(settings: &ServerSettings) -> Self {
        Self {
            ping_interval: Duration::from_secs(settings.ping_interval_secs),
            pong_timeout: Duration::from_secs(settings.pong_timeout_secs),
            send_buffer: settings.send_buffer.max(1),
        }
    }
}

/// What a session needs from the server.
#[derive(Clone)]
pub struct SessionDeps {
    /// Consumer registry.
    pub registry: Arc<SubscriberRegistry>,
    /// Key metadata.
    pub catalog: Arc<KeyCatalog>,
    /// Upstream interest.
    pub interest: Arc<InterestManager>,
    /// Heartbeat settings.
    pub config: SessionConfig,
}

/// Run a session for an upgraded socket.
///
/// 1. Registers the consumer and sends the `connected` greeting
/// 2. Handles subscribe/unsubscribe/ping frames
/// 3. Forwards queued frames and pings from a separate task
/// 4. Removes the consumer and reconciles upstream interest on exit
#[instrument(skip_all, fields(consumer_id = tracing::field::Empty))]
pub async fn run_ws_session(ws: WebSocket, deps: SessionDeps) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (send_tx, mut send_rx) = mpsc::channel::<Arc<String>>(deps.config.send_buffer);
    let connection = Arc::new(ConsumerConnection::new(send_tx));
    let consumer_id = deps.registry.add_consumer(connection.clone());
    let _ = tracing::Span::current().record("consumer_id", tracing::field::display(&consumer_id));

    info!("consumer connected");
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    let _ = connection.send_json(&protocol::connected(consumer_id.as_str()));

    let outbound_conn = connection.clone();
    let SessionConfig {
        ping_interval,
        pong_timeout,
        ..
    } = deps.config;
    let mut outbound = tokio::spawn(async move {
        let mut ping = tokio::time::interval(ping_interval);
        let _ = ping.tick().await;

        loop {
            tokio::select! {
                msg = send_rx.recv() => {
                    let Some(text) = msg else { break };
                    if ws_tx.send(Message::Text(text.as_str().into())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if !outbound_conn.check_alive()
                        && outbound_conn.last_pong_elapsed() > pong_timeout
                    {
                        warn!(timeout_secs = pong_timeout.as_secs(), "consumer unresponsive, disconnecting");
                        break;
                    }
                    if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
                () = outbound_conn.closed() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        outbound_conn.close();
    });

    loop {
        let msg = tokio::select! {
            msg = ws_rx.next() => msg,
            () = connection.closed() => {
                debug!("session closed by server");
                break;
            }
        };
        let Some(Ok(msg)) = msg else { break };

        connection.mark_alive();
        let _ = deps.registry.touch(&consumer_id);

        let text = match msg {
            Message::Text(ref t) => Some(t.as_str().to_string()),
            Message::Binary(ref data) => std::str::from_utf8(data).ok().map(str::to_string),
            Message::Close(_) => {
                info!("consumer sent close frame");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => None,
        };
        let Some(text) = text else { continue };

        let reply = handle_text(&text, &consumer_id, &deps).await;
        if let Err(reason) = connection.send_json(&reply) {
            info!(reason = reason.as_str(), "failed to enqueue reply");
        }
    }

    let keys = deps.registry.remove_consumer(&consumer_id);
    deps.interest.reconcile(&keys).await;
    info!(held_keys = keys.len(), age_secs = connection.age().as_secs(), "consumer disconnected");
    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);

    connection.close();
    if tokio::time::timeout(CLOSE_GRACE, &mut outbound).await.is_err() {
        outbound.abort();
    }
}

/// Handle one inbound text frame and build the reply.
pub async fn handle_text(text: &str, consumer_id: &ConsumerId, deps: &SessionDeps) -> Value {
    let Some(message) = ClientMessage::parse(text) else {
        return protocol::error(errors::INVALID_FORMAT);
    };

    match message.kind.as_str() {
        "subscribe" => {
            let keys = message.requested_keys();
            if keys.is_empty() {
                return protocol::error(errors::NO_KEYS);
            }
            let results = subscribe_keys(&keys, consumer_id, deps);
            let accepted: Vec<String> = results
                .iter()
                .filter(|r| r.success)
                .map(|r| r.key.clone())
                .collect();
            deps.interest.reconcile(&accepted).await;
            debug!(requested = keys.len(), accepted = accepted.len(), "subscription processed");
            protocol::subscribed(&results)
        }
        "unsubscribe" => {
            let keys = message.requested_keys();
            if keys.is_empty() {
                return protocol::error(errors::NO_KEYS_UNSUBSCRIBE);
            }
            let results: Vec<KeyResult> = keys
                .iter()
                .map(|key| KeyResult {
                    key: key.clone(),
                    success: deps.registry.unsubscribe(consumer_id, key),
                    error: None,
                })
                .collect();
            deps.interest.reconcile(&keys).await;
            protocol::unsubscribed(&results)
        }
        "ping" => protocol::pong(),
        other => protocol::error(&format!("Unknown message type: {other}")),
    }
}

fn subscribe_keys(keys: &[String], consumer_id: &ConsumerId, deps: &SessionDeps) -> Vec<KeyResult> {
    keys.iter()
        .map(|key| {
            if !deps.catalog.has_key(key) {
                KeyResult::failed(key.as_str(), errors::KEY_NOT_FOUND)
            } else if !deps.catalog.can_read(key) {
                KeyResult::failed(key.as_str(), errors::READ_DENIED)
            } else if deps.registry.subscribe(consumer_id, key) {
                KeyResult::ok(key.as_str())
            } else {
                KeyResult::failed(key.as_str(), "Consumer not found")
            }
        })
        .collect()
}
