//! mealsync
//!
//! Offline-first sync for a nutrition tracker: a device-local store with a
//! durable change queue, a sync coordinator that pushes and pulls against
//! the server, and the server's reconciliation service.

pub mod clock;
pub mod config;
pub mod db;
pub mod models;
pub mod server;
pub mod sync;

pub use sync::{SyncContext, SyncError};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
