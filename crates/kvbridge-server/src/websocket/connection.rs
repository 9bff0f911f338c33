//! Handle to one connected WebSocket consumer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a frame could not be queued for a consumer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendFailure {
    /// The outbound queue is full; the consumer is not keeping up.
    Full,
    /// The consumer's write task is gone.
    Closed,
}

impl SendFailure {
    /// Short label for logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Closed => "closed",
        }
    }
}

/// Transport handle the registry delivers through.
pub struct ConsumerConnection {
    tx: mpsc::Sender<Arc<String>>,
    close: CancellationToken,
    /// When this connection was established.
    pub connected_at: Instant,
    is_alive: AtomicBool,
    last_pong: Mutex<Instant>,
    dropped_messages: AtomicU64,
}

impl ConsumerConnection {
    /// Wrap the sending side of the consumer's outbound queue.
    pub fn new(tx: mpsc::Sender<Arc<String>>) -> Self {
        let now = Instant::now();
        Self {
            tx,
            close: CancellationToken::new(),
            connected_at: now,
            is_alive: AtomicBool::new(true),
            last_pong: Mutex::new(now),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Queue a text frame without waiting.
    pub fn send(&self, message: Arc<String>) -> Result<(), SendFailure> {
        if self.close.is_cancelled() {
            return Err(SendFailure::Closed);
        }
        match self.tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                Err(SendFailure::Full)
            }
            Err(TrySendError::Closed(_)) => {
                let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                Err(SendFailure::Closed)
            }
        }
    }

    /// Serialize and queue a JSON value.
    pub fn send_json(&self, value: &serde_json::Value) -> Result<(), SendFailure> {
        match serde_json::to_string(value) {
            Ok(json) => self.send(Arc::new(json)),
            Err(_) => Err(SendFailure::Closed),
        }
    }

    /// Frames that could not be queued.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Ask the session to close the socket.
    pub fn close(&self) {
        self.close.cancel();
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled()
    }

    /// Resolves once the connection is asked to close.
    pub async fn closed(&self) {
        self.close.cancelled().await;
    }

    /// Record inbound traffic or a pong.
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_pong.lock() = Instant::now();
    }

    /// Time since the last pong or inbound frame.
    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    /// Read and reset the alive flag.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}
