//! Datastore bridge: the public façade over transport, correlator, and
//! notification multiplexer.
//!
//! ```text
//!  read / write / subscribe ──► Correlator ──► Transport ──► datastore
//!                                   ▲              │
//!                      Response ────┘              │ frames
//!                                                  ▼
//!                      Notification ──► NotificationHub ──► local listeners
//!                                                      └──► ValueChanged event
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use kvbridge_core::wire::{InboundFrame, IpcCommand, Notification};
use kvbridge_core::{BridgeError, Result, VersionedValue, WriteAck};
use kvbridge_settings::IpcSettings;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, instrument, warn};

use crate::connector::{Connector, connector_from_settings};
use crate::correlator::Correlator;
use crate::events::{BridgeEvent, EVENT_CHANNEL_CAPACITY, EventSender, emit};
use crate::notifications::{ListenerHandle, NotificationHub, NotificationListener};
use crate::subscriptions::{Listener, SubscriptionTable};
use crate::transport::{ConnectionState, FrameHandler, FrameSink, Transport, TransportConfig};

/// Tunables for a [`DatastoreBridge`].
#[derive(Clone, Debug)]
pub struct BridgeOptions {
    /// Deadline for each request.
    pub request_timeout: Duration,
    /// Transport reconnect and liveness settings.
    pub transport: TransportConfig,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self::from_settings(&IpcSettings::default())
    }
}

impl BridgeOptions {
    /// Derive options from the `ipc` settings section.
    pub fn from_settings(settings: &IpcSettings) -> Self {
        Self {
            request_timeout: settings.request_timeout(),
            transport: TransportConfig {
                reconnect_delay: settings.reconnect_delay(),
                max_reconnect_attempts: settings.max_reconnect_attempts,
                idle_timeout: settings.idle_timeout(),
                ..TransportConfig::default()
            },
        }
    }
}

/// Handle to the datastore. Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct DatastoreBridge {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Transport,
    correlator: Arc<Correlator>,
    hub: Arc<NotificationHub>,
    subscriptions: Arc<SubscriptionTable>,
    events: EventSender,
    restore_started: AtomicBool,
}

/// Routes inbound frames to the correlator or the notification hub.
struct Dispatcher {
    correlator: Arc<Correlator>,
    hub: Arc<NotificationHub>,
}

impl FrameHandler for Dispatcher {
    fn on_frame(&self, frame: InboundFrame) {
        match frame {
            InboundFrame::Response(response) => {
                let _ = self.correlator.complete(response);
            }
            InboundFrame::Notification(notification) => {
                let _ = self.hub.dispatch(&notification);
            }
            InboundFrame::Unrecognized(value) => {
                debug!(frame = %value, "ignoring unrecognized frame");
            }
        }
    }

    fn on_disconnected(&self) {
        let rejected = self.correlator.fail_all(&BridgeError::ConnectionClosed);
        if rejected > 0 {
            info!(rejected, "rejected in-flight requests on disconnect");
        }
    }
}

impl DatastoreBridge {
    /// Build a bridge over `connector`. Nothing connects until
    /// [`connect`](Self::connect).
    pub fn new(connector: Arc<dyn Connector>, options: BridgeOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let correlator = Arc::new(Correlator::new(options.request_timeout));
        let hub = Arc::new(NotificationHub::new());
        let subscriptions = Arc::new(SubscriptionTable::default());

        let table = subscriptions.clone();
        let sender = events.clone();
        let _ = hub.add_listener(Arc::new(move |notification: &Notification| {
            deliver(&table, &sender, notification);
        }));

        let dispatcher = Arc::new(Dispatcher {
            correlator: correlator.clone(),
            hub: hub.clone(),
        });
        let transport = Transport::new(connector, options.transport, dispatcher, events.clone());

        Self {
            inner: Arc::new(Inner {
                transport,
                correlator,
                hub,
                subscriptions,
                events,
                restore_started: AtomicBool::new(false),
            }),
        }
    }

    /// Build a bridge from settings, choosing TCP or Unix socket.
    pub fn from_settings(settings: &IpcSettings) -> Self {
        Self::new(
            connector_from_settings(settings),
            BridgeOptions::from_settings(settings),
        )
    }

    /// Connect to the datastore.
    ///
    /// A failure is returned and reconnection keeps running in the
    /// background. Keys with local listeners are resubscribed upstream on
    /// every (re)connect.
    pub async fn connect(&self) -> Result<()> {
        if !self.inner.restore_started.swap(true, Ordering::SeqCst) {
            let rx = self.inner.events.subscribe();
            let _ = tokio::spawn(restore_subscriptions(Arc::downgrade(&self.inner), rx));
        }
        self.inner.transport.connect().await
    }

    /// Drop local subscriptions and close the connection without
    /// reconnecting.
    pub async fn disconnect(&self) {
        self.inner.subscriptions.clear();
        self.inner.transport.disconnect().await;
    }

    /// Read the current value of `key`.
    #[instrument(skip(self))]
    pub async fn read(&self, key: &str) -> Result<VersionedValue> {
        let data = self.request(IpcCommand::read(key)).await?;
        VersionedValue::from_data(key, data)
    }

    /// Write `value` to `key`. The value is passed through unchecked.
    #[instrument(skip(self, value))]
    pub async fn write(&self, key: &str, value: Value) -> Result<WriteAck> {
        let data = self.request(IpcCommand::write(key, value)).await?;
        WriteAck::from_data(key, data)
    }

    /// Subscribe `listener` to `keys`.
    ///
    /// The upstream subscribe covers the whole key set; the listener is
    /// registered locally once it is acknowledged.
    #[instrument(skip(self, listener), fields(listener = listener.id()))]
    pub async fn subscribe(&self, keys: &[String], listener: &Listener) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let _ = self.request(IpcCommand::subscribe(keys.to_vec())).await?;
        self.inner.subscriptions.add(keys, listener);
        Ok(())
    }

    /// Remove `listener` (or all listeners) from `keys`.
    ///
    /// Upstream is only told about keys left without any local listener.
    #[instrument(skip(self, listener))]
    pub async fn unsubscribe(&self, keys: &[String], listener: Option<&Listener>) -> Result<()> {
        let emptied = self.inner.subscriptions.remove(keys, listener);
        if emptied.is_empty() {
            return Ok(());
        }
        let _ = self.request(IpcCommand::unsubscribe(emptied)).await?;
        Ok(())
    }

    /// Independent receiver for bridge events.
    pub fn events(&self) -> broadcast::Receiver<BridgeEvent> {
        self.inner.events.subscribe()
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.transport.state()
    }

    /// Watch connection state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.transport.state_changes()
    }

    /// Whether the stream is open.
    pub fn is_connected(&self) -> bool {
        self.inner.transport.is_connected()
    }

    /// Requests awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.correlator.pending_count()
    }

    /// Keys with at least one local listener.
    pub fn subscribed_keys(&self) -> Vec<String> {
        self.inner.subscriptions.keys()
    }

    /// Datastore endpoint description.
    pub fn endpoint(&self) -> String {
        self.inner.transport.endpoint()
    }

    /// Attach a listener that sees every raw notification.
    pub fn add_notification_listener(&self, listener: NotificationListener) -> ListenerHandle {
        self.inner.hub.add_listener(listener)
    }

    /// Detach a raw notification listener.
    pub fn remove_notification_listener(&self, handle: ListenerHandle) -> bool {
        self.inner.hub.remove_listener(handle)
    }

    async fn request(&self, body: IpcCommand) -> Result<Value> {
        self.inner.request(body).await
    }
}

impl Inner {
    async fn request(&self, body: IpcCommand) -> Result<Value> {
        self.correlator.request(&self.transport, body).await
    }

    async fn resubscribe(&self) {
        let keys = self.subscriptions.keys();
        if keys.is_empty() {
            return;
        }
        let count = keys.len();
        match self.request(IpcCommand::subscribe(keys)).await {
            Ok(_) => info!(keys = count, "restored upstream subscriptions"),
            Err(err) => {
                warn!(keys = count, error = %err, "failed to restore subscriptions");
                emit(&self.events, BridgeEvent::Error(err));
            }
        }
    }
}

/// Normalize a notification, raise `ValueChanged`, and run the key's local
/// listeners.
fn deliver(table: &SubscriptionTable, events: &EventSender, notification: &Notification) {
    let value = match notification.to_versioned() {
        Ok(value) => value,
        Err(err) => {
            warn!(key = %notification.key, error = %err, "unusable notification");
            emit(events, BridgeEvent::Error(err));
            return;
        }
    };

    for listener in table.listeners_for(&value.key) {
        let _ = listener.invoke(&value);
    }
    emit(
        events,
        BridgeEvent::ValueChanged {
            key: value.key.clone(),
            value,
        },
    );
}

async fn restore_subscriptions(inner: Weak<Inner>, mut rx: broadcast::Receiver<BridgeEvent>) {
    loop {
        match rx.recv().await {
            Ok(BridgeEvent::Connected) => {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                inner.resubscribe().await;
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "subscription restorer lagged behind bridge events");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
