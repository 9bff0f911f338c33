//! Connection transport: a single duplex byte stream to the datastore
//! process with newline framing, a liveness timeout, and bounded
//! fixed-delay reconnection.
//!
//! Lifecycle:
//!
//! ```text
//! Disconnected -> Connecting -> Connected
//!                                  | close / error / idle
//!                                  v
//!                            Reconnecting{n} -> Connected
//!                                  | n == max
//!                                  v
//!                            ExhaustedRetries
//! ```
//!
//! One supervisor task per lifecycle owns the read half. Writes go through
//! an async mutex around the write half so frames never interleave.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use kvbridge_core::metrics::IPC_RECONNECTS_TOTAL;
use kvbridge_core::wire::InboundFrame;
use kvbridge_core::{BridgeError, Result};
use metrics::counter;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connector::{BoxedStream, Connector};
use crate::events::{BridgeEvent, EventSender, emit};
use crate::framing::{DEFAULT_MAX_FRAME_LEN, LineBuffer};

const READ_CHUNK: usize = 8192;

/// Where the transport is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// No stream and no retries pending.
    Disconnected,
    /// First connect in progress.
    Connecting,
    /// Stream open.
    Connected,
    /// Waiting for or performing a reconnect attempt.
    Reconnecting {
        /// 1-based attempt number.
        attempt: u32,
    },
    /// Automatic retries are used up; only an explicit `connect()` restarts.
    ExhaustedRetries,
}

impl ConnectionState {
    /// Stable name for logs and health output.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting { .. } => "reconnecting",
            Self::ExhaustedRetries => "exhausted_retries",
        }
    }
}

/// Reconnect and liveness tuning.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Fixed delay before each reconnect attempt.
    pub reconnect_delay: Duration,
    /// Attempts before giving up.
    pub max_reconnect_attempts: u32,
    /// Tear the stream down after this long without reads or writes.
    pub idle_timeout: Option<Duration>,
    /// Largest accepted frame.
    pub max_frame_len: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_attempts: 10,
            idle_timeout: Some(Duration::from_secs(30)),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

/// Receives decoded frames and link transitions from the transport.
///
/// Called from the reader task; implementations must not block.
pub trait FrameHandler: Send + Sync + 'static {
    /// One complete, well-formed inbound frame.
    fn on_frame(&self, frame: InboundFrame);

    /// The stream was (re)established.
    fn on_connected(&self) {}

    /// The stream went away. Runs before the `disconnected` event.
    fn on_disconnected(&self) {}
}

/// Outbound side used by the correlator.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Whether a stream is currently open.
    fn is_connected(&self) -> bool;

    /// Write one encoded frame (delimiter included).
    async fn send(&self, frame: &[u8]) -> Result<()>;
}

/// The connection transport.
pub struct Transport {
    shared: Arc<Shared>,
    connect_lock: tokio::sync::Mutex<()>,
}

struct Shared {
    connector: Arc<dyn Connector>,
    config: TransportConfig,
    handler: Arc<dyn FrameHandler>,
    events: EventSender,
    writer: tokio::sync::Mutex<Option<Attached>>,
    state: watch::Sender<ConnectionState>,
    lifecycle: Mutex<Option<CancellationToken>>,
    epoch: AtomicU64,
    last_activity: Mutex<Instant>,
}

struct Attached {
    epoch: u64,
    writer: WriteHalf<BoxedStream>,
}

#[derive(Debug)]
enum SessionEnd {
    Cancelled,
    Closed,
    IdleTimeout,
    Failed,
}

enum Step {
    Cancelled,
    Read(std::io::Result<usize>),
    IdleCheck,
}

impl Transport {
    /// Create a transport. Nothing happens until [`connect`](Self::connect).
    pub fn new(
        connector: Arc<dyn Connector>,
        config: TransportConfig,
        handler: Arc<dyn FrameHandler>,
        events: EventSender,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                connector,
                config,
                handler,
                events,
                writer: tokio::sync::Mutex::new(None),
                state,
                lifecycle: Mutex::new(None),
                epoch: AtomicU64::new(0),
                last_activity: Mutex::new(Instant::now()),
            }),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Establish the stream.
    ///
    /// On failure returns [`BridgeError::Connection`] and starts the
    /// reconnection path in the background. A no-op when already connected.
    pub async fn connect(&self) -> Result<()> {
        let _guard = self.connect_lock.lock().await;
        if self.shared.is_connected() {
            return Ok(());
        }

        let token = self.shared.begin_lifecycle();
        self.shared.set_state(ConnectionState::Connecting);
        let endpoint = self.shared.connector.endpoint();
        info!(%endpoint, "connecting to datastore");

        match self.shared.connector.connect().await {
            Ok(stream) => match self.shared.attach(stream, &token).await {
                Some(session) => {
                    let _ = tokio::spawn(supervise(self.shared.clone(), token, Some(session)));
                    Ok(())
                }
                None => {
                    self.shared.set_state(ConnectionState::Disconnected);
                    Err(BridgeError::Connection("connect cancelled".into()))
                }
            },
            Err(err) => {
                let error = BridgeError::Connection(err.to_string());
                warn!(%endpoint, error = %err, "datastore connection failed");
                self.shared.set_state(ConnectionState::Disconnected);
                emit(&self.shared.events, BridgeEvent::Error(error.clone()));
                let _ = tokio::spawn(supervise(self.shared.clone(), token, None));
                Err(error)
            }
        }
    }

    /// Tear the stream down without reconnecting.
    ///
    /// Pending work observes the disconnect before this returns.
    pub async fn disconnect(&self) {
        let _guard = self.connect_lock.lock().await;
        self.shared.end_lifecycle();
        self.shared.detach(None).await;
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Number of streams established so far.
    pub fn epoch(&self) -> u64 {
        self.shared.epoch.load(Ordering::SeqCst)
    }

    /// Endpoint description.
    pub fn endpoint(&self) -> String {
        self.shared.connector.endpoint()
    }
}

#[async_trait]
impl FrameSink for Transport {
    fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    async fn send(&self, frame: &[u8]) -> Result<()> {
        let mut guard = self.shared.writer.lock().await;
        let Some(attached) = guard.as_mut() else {
            return Err(BridgeError::Write("transport is not open".into()));
        };
        attached
            .writer
            .write_all(frame)
            .await
            .map_err(|e| BridgeError::Write(e.to_string()))?;
        attached
            .writer
            .flush()
            .await
            .map_err(|e| BridgeError::Write(e.to_string()))?;
        drop(guard);
        self.shared.touch();
        Ok(())
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shared.end_lifecycle();
    }
}

impl Shared {
    fn is_connected(&self) -> bool {
        *self.state.borrow() == ConnectionState::Connected
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = previous.as_str(), to = state.as_str(), "transport state");
        }
    }

    fn begin_lifecycle(&self) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(previous) = self.lifecycle.lock().replace(token.clone()) {
            previous.cancel();
        }
        token
    }

    fn end_lifecycle(&self) {
        if let Some(token) = self.lifecycle.lock().take() {
            token.cancel();
        }
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn idle_deadline(&self) -> Option<Instant> {
        self.config
            .idle_timeout
            .map(|window| *self.last_activity.lock() + window)
    }

    fn idle_expired(&self) -> bool {
        self.config
            .idle_timeout
            .is_some_and(|window| self.last_activity.lock().elapsed() >= window)
    }

    /// Install `stream` as the live connection.
    ///
    /// The lifecycle token is checked under the writer lock, so a concurrent
    /// [`Transport::disconnect`] either sees the new writer and detaches it,
    /// or wins and the stream is dropped here. `None` in the latter case.
    async fn attach(
        &self,
        stream: BoxedStream,
        token: &CancellationToken,
    ) -> Option<(ReadHalf<BoxedStream>, u64)> {
        let mut guard = self.writer.lock().await;
        if token.is_cancelled() {
            debug!("lifecycle cancelled before attach, dropping stream");
            return None;
        }
        let (reader, writer) = tokio::io::split(stream);
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        *guard = Some(Attached { epoch, writer });
        self.touch();
        self.set_state(ConnectionState::Connected);
        info!(epoch, endpoint = %self.connector.endpoint(), "connected to datastore");
        emit(&self.events, BridgeEvent::Connected);
        self.handler.on_connected();
        drop(guard);
        Some((reader, epoch))
    }

    /// Drop the write half and announce the disconnect.
    ///
    /// With `Some(epoch)` only that stream is detached; a stale supervisor
    /// cannot tear down a newer connection.
    async fn detach(&self, epoch: Option<u64>) {
        let attached = {
            let mut guard = self.writer.lock().await;
            if let (Some(current), Some(expected)) = (guard.as_ref(), epoch) {
                if current.epoch != expected {
                    return;
                }
            }
            guard.take()
        };

        let Some(mut attached) = attached else {
            if epoch.is_none() {
                self.set_state(ConnectionState::Disconnected);
            }
            return;
        };

        let _ = attached.writer.shutdown().await;
        self.set_state(ConnectionState::Disconnected);
        info!(epoch = attached.epoch, "disconnected from datastore");
        self.handler.on_disconnected();
        emit(&self.events, BridgeEvent::Disconnected);
    }

    async fn read_loop(
        &self,
        mut reader: ReadHalf<BoxedStream>,
        token: &CancellationToken,
    ) -> SessionEnd {
        let mut lines = LineBuffer::with_max_frame_len(self.config.max_frame_len);
        let mut chunk = vec![0u8; READ_CHUNK];

        loop {
            let idle_deadline = self.idle_deadline();
            let step = tokio::select! {
                biased;
                () = token.cancelled() => Step::Cancelled,
                read = reader.read(&mut chunk) => Step::Read(read),
                () = sleep_until_opt(idle_deadline) => Step::IdleCheck,
            };

            match step {
                Step::Cancelled => return SessionEnd::Cancelled,
                Step::Read(Ok(0)) => {
                    info!("datastore closed the connection");
                    return SessionEnd::Closed;
                }
                Step::Read(Ok(n)) => {
                    self.touch();
                    if let Err(too_long) = lines.extend(&chunk[..n]) {
                        warn!(discarded = too_long.discarded, "oversized frame dropped");
                        emit(
                            &self.events,
                            BridgeEvent::Error(BridgeError::Protocol(format!(
                                "frame exceeds {} bytes",
                                self.config.max_frame_len
                            ))),
                        );
                    }
                    while let Some(line) = lines.next_line() {
                        self.dispatch_line(&line);
                    }
                }
                Step::Read(Err(err)) => {
                    warn!(error = %err, "datastore read failed");
                    emit(
                        &self.events,
                        BridgeEvent::Error(BridgeError::Connection(err.to_string())),
                    );
                    return SessionEnd::Failed;
                }
                Step::IdleCheck => {
                    if self.idle_expired() {
                        warn!(
                            idle_ms = self.config.idle_timeout.map_or(0, |d| d.as_millis() as u64),
                            "datastore link idle, tearing down"
                        );
                        emit(&self.events, BridgeEvent::Timeout);
                        return SessionEnd::IdleTimeout;
                    }
                }
            }
        }
    }

    fn dispatch_line(&self, line: &[u8]) {
        if line.iter().all(u8::is_ascii_whitespace) {
            return;
        }
        match InboundFrame::parse(line) {
            Ok(frame) => self.handler.on_frame(frame),
            Err(err) => {
                warn!(error = %err, len = line.len(), "malformed frame from datastore");
                emit(&self.events, BridgeEvent::Error(err));
            }
        }
    }

    /// Fixed-delay reconnect loop. Returns the new session, or `None` when
    /// cancelled or out of attempts.
    async fn reconnect(&self, token: &CancellationToken) -> Option<(ReadHalf<BoxedStream>, u64)> {
        let max = self.config.max_reconnect_attempts;
        let delay = self.config.reconnect_delay;

        for attempt in 1..=max {
            if token.is_cancelled() {
                return None;
            }
            self.set_state(ConnectionState::Reconnecting { attempt });
            info!(attempt, max, delay_ms = delay.as_millis() as u64, "scheduling datastore reconnect");
            counter!(IPC_RECONNECTS_TOTAL).increment(1);
            emit(&self.events, BridgeEvent::Reconnecting { attempt });

            tokio::select! {
                () = token.cancelled() => return None,
                () = tokio::time::sleep(delay) => {}
            }

            let result = tokio::select! {
                () = token.cancelled() => return None,
                result = self.connector.connect() => result,
            };

            match result {
                Ok(stream) => return self.attach(stream, token).await,
                Err(err) => {
                    warn!(attempt, error = %err, "reconnect attempt failed");
                    emit(
                        &self.events,
                        BridgeEvent::Error(BridgeError::Connection(format!(
                            "reconnect failed: {err}"
                        ))),
                    );
                }
            }
        }

        if token.is_cancelled() {
            return None;
        }
        self.set_state(ConnectionState::ExhaustedRetries);
        warn!(max, "max reconnect attempts reached, giving up");
        emit(&self.events, BridgeEvent::MaxReconnectAttemptsReached);
        None
    }
}

async fn supervise(
    shared: Arc<Shared>,
    token: CancellationToken,
    mut session: Option<(ReadHalf<BoxedStream>, u64)>,
) {
    loop {
        if let Some((reader, epoch)) = session.take() {
            let end = shared.read_loop(reader, &token).await;
            debug!(epoch, reason = ?end, "transport session ended");
            if matches!(end, SessionEnd::Cancelled) {
                return;
            }
            shared.detach(Some(epoch)).await;
        }
        if token.is_cancelled() {
            return;
        }
        match shared.reconnect(&token).await {
            Some(next) => session = Some(next),
            None => return,
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
