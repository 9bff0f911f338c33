//! WebSocket consumer handling: connection handles, wire messages, session
//! lifecycle, and the bridge-event forwarder.

pub mod connection;
pub mod event_bridge;
pub mod protocol;
pub mod session;
