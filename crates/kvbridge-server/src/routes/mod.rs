//! HTTP route handlers.

pub mod datastore;
pub mod health;
pub mod stats;
