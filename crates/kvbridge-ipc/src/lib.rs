//! # kvbridge-ipc
//!
//! Self-healing link to the datastore process.
//!
//! - [`transport`]: one duplex byte stream with newline framing, liveness
//!   timeout and bounded fixed-delay reconnection
//! - [`correlator`]: request ids, pending table, per-request deadlines
//! - [`notifications`]: fanout of unsolicited notifications to listeners
//! - [`bridge`]: the [`DatastoreBridge`] façade (read, write, subscribe)
//! - [`events`]: lifecycle and value events on a broadcast channel
//! - `testing` (feature `testing`): an in-process datastore double

#![deny(unsafe_code)]

pub mod bridge;
pub mod connector;
pub mod correlator;
pub mod events;
pub mod framing;
pub mod notifications;
pub mod subscriptions;
#[cfg(feature = "testing")]
pub mod testing;
pub mod transport;

pub use bridge::{BridgeOptions, DatastoreBridge};
pub use connector::{Connector, TcpConnector, connector_from_settings};
#[cfg(unix)]
pub use connector::UnixConnector;
pub use events::{BridgeEvent, EventSender};
pub use notifications::{ListenerHandle, NotificationHub, NotificationListener};
pub use subscriptions::Listener;
pub use transport::{ConnectionState, TransportConfig};
