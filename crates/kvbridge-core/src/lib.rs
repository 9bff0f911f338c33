//! # kvbridge-core
//!
//! Foundation types shared by every kvbridge crate:
//!
//! - [`ids`]: consumer and request identifiers
//! - [`errors`]: the [`BridgeError`] taxonomy with stable machine codes
//! - [`value`]: [`VersionedValue`] and timestamp normalization
//! - [`wire`]: newline-delimited JSON frames exchanged with the datastore process
//! - [`logging`]: `tracing` subscriber bootstrap
//! - [`metrics`]: metric names emitted through the `metrics` facade

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod logging;
pub mod metrics;
pub mod value;
pub mod wire;

pub use errors::{BridgeError, Result};
pub use ids::{ConsumerId, RequestId};
pub use value::{VersionedValue, WriteAck};
