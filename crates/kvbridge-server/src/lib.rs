//! # kvbridge-server
//!
//! HTTP + `WebSocket` front end for the datastore bridge.
//!
//! - [`registry`]: consumers and their key subscriptions, fanout
//! - [`catalog`]: key metadata (permissions, declared types, validation)
//! - [`interest`]: keeps upstream subscriptions equal to registry interest
//! - [`websocket`]: consumer sessions, wire messages, event forwarding
//! - [`routes`]: datastore, health and diagnostics endpoints
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod catalog;
pub mod cleanup;
pub mod error;
pub mod health;
pub mod interest;
pub mod metrics;
pub mod registry;
pub mod routes;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use catalog::KeyCatalog;
pub use error::ApiError;
pub use registry::{RegistryStats, SubscriberRegistry};
pub use server::{AppState, BridgeServer, ServerHandle, build_router};
pub use shutdown::ShutdownCoordinator;
