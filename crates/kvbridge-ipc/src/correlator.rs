//! Request correlator.
//!
//! Allocates request ids, keeps one pending entry per outstanding request,
//! and resolves the waiting caller when the matching response arrives.
//! The pending table lock is held only around map mutations, never while
//! writing to the stream or waiting for a response.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use kvbridge_core::metrics::{
    IPC_PENDING_REQUESTS, IPC_REQUESTS_TOTAL, IPC_REQUEST_DURATION_SECONDS,
    IPC_REQUEST_ERRORS_TOTAL,
};
use kvbridge_core::wire::{Command, IpcCommand, IpcRequest, IpcResponse, encode_frame};
use kvbridge_core::{BridgeError, RequestId, Result};
use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, instrument};

use crate::transport::FrameSink;

struct PendingRequest {
    command: Command,
    sent_at: Instant,
    reply: oneshot::Sender<Result<Value>>,
}

/// Matches responses to requests by id.
pub struct Correlator {
    next_id: AtomicU64,
    pending: Mutex<HashMap<RequestId, PendingRequest>>,
    timeout: Duration,
}

/// Removes the pending entry when the waiting caller finishes or is dropped.
struct PendingSlot<'a> {
    correlator: &'a Correlator,
    id: RequestId,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        if self.correlator.pending.lock().remove(&self.id).is_some() {
            self.correlator.record_pending();
        }
    }
}

impl Correlator {
    /// Create a correlator with a per-request deadline.
    pub fn new(timeout: Duration) -> Self {
        Self {
            next_id: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// The configured deadline.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send `body` and wait for its response.
    ///
    /// Fails with [`BridgeError::NotConnected`] without sending anything if
    /// the sink is down, [`BridgeError::Timeout`] when the deadline passes,
    /// [`BridgeError::ConnectionClosed`] when the link drops first, and
    /// [`BridgeError::Remote`] when the response carries an `error`.
    #[instrument(skip_all, fields(command = body.command.as_str(), request_id = tracing::field::Empty))]
    pub async fn request(&self, sink: &dyn FrameSink, body: IpcCommand) -> Result<Value> {
        let command = body.command;
        if !sink.is_connected() {
            counter!(IPC_REQUEST_ERRORS_TOTAL, "code" => BridgeError::NotConnected.code())
                .increment(1);
            return Err(BridgeError::NotConnected);
        }

        let id = self.next_id();
        let _ = tracing::Span::current().record("request_id", id);
        let frame = encode_frame(&IpcRequest {
            request_id: id,
            body,
        })?;

        let (reply, rx) = oneshot::channel();
        let started = Instant::now();
        let _ = self.pending.lock().insert(
            id,
            PendingRequest {
                command,
                sent_at: started,
                reply,
            },
        );
        self.record_pending();
        let slot = PendingSlot {
            correlator: self,
            id,
        };
        counter!(IPC_REQUESTS_TOTAL, "command" => command.as_str()).increment(1);

        let outcome = tokio::time::timeout(self.timeout, async {
            sink.send(&frame).await?;
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(BridgeError::ConnectionClosed),
            }
        })
        .await;
        drop(slot);

        let result = outcome.unwrap_or_else(|_| {
            debug!(request_id = id, "request timed out");
            Err(BridgeError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            })
        });

        histogram!(IPC_REQUEST_DURATION_SECONDS, "command" => command.as_str())
            .record(started.elapsed().as_secs_f64());
        if let Err(err) = &result {
            counter!(IPC_REQUEST_ERRORS_TOTAL, "code" => err.code()).increment(1);
        }
        result
    }

    /// Resolve the caller waiting on `response.request_id`.
    ///
    /// Returns `false` when no such request is pending, which covers late
    /// arrivals after a timeout; those responses are dropped.
    pub fn complete(&self, response: IpcResponse) -> bool {
        let id = response.request_id;
        let Some(pending) = self.pending.lock().remove(&id) else {
            debug!(request_id = id, "dropping response for unknown request");
            return false;
        };
        self.record_pending();
        debug!(
            request_id = id,
            command = pending.command.as_str(),
            elapsed_ms = pending.sent_at.elapsed().as_millis() as u64,
            "response matched"
        );
        // The caller may have given up already.
        let _ = pending.reply.send(response.into_result());
        true
    }

    /// Reject every pending request with `error` and clear the table.
    pub fn fail_all(&self, error: &BridgeError) -> usize {
        let drained: Vec<PendingRequest> = self.pending.lock().drain().map(|(_, p)| p).collect();
        self.record_pending();
        let count = drained.len();
        for pending in drained {
            let _ = pending.reply.send(Err(error.clone()));
        }
        if count > 0 {
            debug!(count, code = error.code(), "rejected pending requests");
        }
        count
    }

    /// Number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Whether `id` is awaiting a response.
    pub fn is_pending(&self, id: RequestId) -> bool {
        self.pending.lock().contains_key(&id)
    }

    /// Id the next request will get.
    pub fn peek_next_id(&self) -> RequestId {
        self.next_id.load(Ordering::Relaxed) + 1
    }

    fn next_id(&self) -> RequestId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn record_pending(&self) {
        gauge!(IPC_PENDING_REQUESTS).set(self.pending.lock().len() as f64);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
