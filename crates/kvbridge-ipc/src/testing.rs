//! In-process datastore double for tests and local development.
//!
//! Speaks the same newline-delimited JSON protocol as the real datastore
//! over TCP on `127.0.0.1`. Writes bump the key's version and notify every
//! connection subscribed to the key.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use kvbridge_core::wire::{IpcResponse, Notification, encode_frame, encode_notification};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connector::{Connector, TcpConnector};

/// A scripted datastore process.
pub struct MockDatastore {
    addr: SocketAddr,
    state: Arc<MockState>,
    shutdown: CancellationToken,
}

#[derive(Default)]
struct MockState {
    store: Mutex<HashMap<String, Entry>>,
    connections: Mutex<HashMap<u64, MockConnection>>,
    requests: Mutex<Vec<Value>>,
    silent: AtomicBool,
    next_connection: AtomicU64,
}

#[derive(Clone)]
struct Entry {
    value: Value,
    version: u64,
    timestamp: i64,
}

struct MockConnection {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    keys: HashSet<String>,
    close: CancellationToken,
}

impl MockDatastore {
    /// Bind to an ephemeral port and start accepting.
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(MockState::default());
        let shutdown = CancellationToken::new();
        let _ = tokio::spawn(accept_loop(listener, state.clone(), shutdown.clone()));
        debug!(%addr, "mock datastore listening");
        Ok(Self {
            addr,
            state,
            shutdown,
        })
    }

    /// Listening address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Connector pointing at this mock.
    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(TcpConnector::new(self.addr.to_string()))
    }

    /// Seed or replace a key at version 1.
    pub fn set(&self, key: &str, value: Value) {
        let _ = self.state.store.lock().insert(
            key.to_string(),
            Entry {
                value,
                version: 1,
                timestamp: now_ms(),
            },
        );
    }

    /// Current version of `key`, if present.
    pub fn version(&self, key: &str) -> Option<u64> {
        self.state.store.lock().get(key).map(|e| e.version)
    }

    /// Bump `key` to `value` and notify its subscribers. Returns the number
    /// of connections notified.
    pub fn notify(&self, key: &str, value: Value) -> usize {
        self.state.update(key, value, true).map_or(0, |(_, n)| n)
    }

    /// Write a raw line (a newline is appended) to every connection.
    pub fn push_raw(&self, line: &str) {
        let mut frame = line.as_bytes().to_vec();
        frame.push(b'\n');
        for conn in self.state.connections.lock().values() {
            let _ = conn.outbound.send(frame.clone());
        }
    }

    /// Every request received so far, in arrival order.
    pub fn requests(&self) -> Vec<Value> {
        self.state.requests.lock().clone()
    }

    /// Requests received with the given command.
    pub fn requests_for(&self, command: &str) -> Vec<Value> {
        self.requests()
            .into_iter()
            .filter(|r| r.get("command").and_then(Value::as_str) == Some(command))
            .collect()
    }

    /// Stop answering requests (they are still recorded).
    pub fn set_silent(&self, silent: bool) {
        self.state.silent.store(silent, Ordering::SeqCst);
    }

    /// Close every open connection; the listener keeps accepting.
    pub fn drop_connections(&self) {
        for (_, conn) in self.state.connections.lock().drain() {
            conn.close.cancel();
        }
    }

    /// Open connections.
    pub fn connection_count(&self) -> usize {
        self.state.connections.lock().len()
    }

    /// Stop the listener and close every connection.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.drop_connections();
    }
}

impl Drop for MockDatastore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl MockState {
    /// Apply a write. Returns the new version and how many subscribers were
    /// notified, or `None` for an unknown key.
    fn update(&self, key: &str, value: Value, notify: bool) -> Option<(u64, usize)> {
        let entry = {
            let mut store = self.store.lock();
            let entry = store.get_mut(key)?;
            entry.value = value;
            entry.version += 1;
            entry.timestamp = now_ms();
            entry.clone()
        };
        let notified = if notify {
            self.broadcast(key, &entry)
        } else {
            0
        };
        Some((entry.version, notified))
    }

    fn broadcast(&self, key: &str, entry: &Entry) -> usize {
        let notification = Notification {
            key: key.to_string(),
            value: entry.value.clone(),
            version: entry.version,
            timestamp: json!(entry.timestamp),
        };
        let Ok(frame) = encode_notification(&notification) else {
            return 0;
        };
        self.connections
            .lock()
            .values()
            .filter(|conn| conn.keys.contains(key))
            .filter(|conn| conn.outbound.send(frame.clone()).is_ok())
            .count()
    }

    fn handle(&self, connection: u64, request: &Value) -> Option<IpcResponse> {
        let request_id = request.get("request_id").and_then(Value::as_u64)?;
        let key = request.get("key").and_then(Value::as_str).unwrap_or_default();
        let keys: Vec<String> = request
            .get("keys")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(|k| k.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let response = match request.get("command").and_then(Value::as_str) {
            Some("read") => match self.store.lock().get(key) {
                Some(entry) => IpcResponse::ok(
                    request_id,
                    json!({"value": entry.value, "version": entry.version, "timestamp": entry.timestamp}),
                ),
                None => IpcResponse::err(request_id, format!("Key '{key}' not found")),
            },
            Some("write") => {
                let value = request.get("value").cloned().unwrap_or(Value::Null);
                match self.update(key, value, true) {
                    Some((version, _)) => {
                        IpcResponse::ok(request_id, json!({"success": true, "version": version}))
                    }
                    None => IpcResponse::err(request_id, format!("Key '{key}' not found")),
                }
            }
            Some("subscribe") => {
                if let Some(conn) = self.connections.lock().get_mut(&connection) {
                    conn.keys.extend(keys.iter().cloned());
                }
                IpcResponse::ok(request_id, json!({"subscribed": keys}))
            }
            Some("unsubscribe") => {
                if let Some(conn) = self.connections.lock().get_mut(&connection) {
                    for key in &keys {
                        let _ = conn.keys.remove(key);
                    }
                }
                IpcResponse::ok(request_id, json!({"unsubscribed": keys}))
            }
            _ => IpcResponse::err(request_id, "Unknown command"),
        };
        Some(response)
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<MockState>, shutdown: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            () = shutdown.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                debug!(%peer, "mock datastore accepted connection");
                let _ = tokio::spawn(serve_connection(stream, state.clone()));
            }
            Err(err) => warn!(error = %err, "mock datastore accept failed"),
        }
    }
}

async fn serve_connection(stream: TcpStream, state: Arc<MockState>) {
    let id = state.next_connection.fetch_add(1, Ordering::Relaxed);
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let close = CancellationToken::new();
    let _ = state.connections.lock().insert(
        id,
        MockConnection {
            outbound: tx.clone(),
            keys: HashSet::new(),
            close: close.clone(),
        },
    );

    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        tokio::select! {
            () = close.cancelled() => break,
            Some(frame) = rx.recv() => {
                if writer.write_all(&frame).await.is_err() {
                    break;
                }
            }
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                if line.trim().is_empty() {
                    continue;
                }
                let Ok(request) = serde_json::from_str::<Value>(&line) else {
                    warn!("mock datastore received malformed line");
                    continue;
                };
                state.requests.lock().push(request.clone());
                if state.silent.load(Ordering::SeqCst) {
                    continue;
                }
                if let Some(response) = state.handle(id, &request) {
                    if let Ok(frame) = encode_frame(&response) {
                        let _ = tx.send(frame);
                    }
                }
            }
        }
    }

    let _ = state.connections.lock().remove(&id);
    let _ = writer.shutdown().await;
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
