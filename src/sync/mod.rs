//! Client side of offline-first synchronization.
//!
//! Local edits are written to the [`LocalStore`](crate::db::LocalStore) and
//! queued. A [`SyncCoordinator`] pushes the queue, settles conflicts through
//! the [`ConflictResolver`] and pulls server changes per collection.
//!
//! # Usage
//!
//! ```no_run
//! use mealsync::clock::SystemClock;
//! use mealsync::db::LocalStore;
//! use mealsync::sync::{
//!     CollectionRegistry, HttpTransport, SyncContext, SyncCoordinator, SyncOptions, Trigger,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn demo() -> Result<(), mealsync::sync::SyncError> {
//! let store = LocalStore::open("mealsync.db".as_ref()).await?;
//! let ctx = SyncContext::open(store, Arc::new(SystemClock), CollectionRegistry::default()).await?;
//! let transport = HttpTransport::new("https://sync.example.com", "key", Duration::from_secs(30))?;
//!
//! let handle = SyncCoordinator::spawn(ctx.clone(), transport, SyncOptions::default());
//! handle.trigger(Trigger::AppForeground);
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod protocol;
pub mod pull;
pub mod push;
pub mod registry;
pub mod resolver;
pub mod transport;

#[cfg(test)]
mod scenarios;

pub use backoff::RetryPolicy;
pub use context::SyncContext;
pub use coordinator::{
    run_cycle, CycleReport, SyncCoordinator, SyncHandle, SyncOptions, SyncState, Trigger,
};
pub use error::SyncError;
pub use events::{EventBus, SyncEvent};
pub use pull::{PullHandler, PullReport};
pub use push::{PushHandler, PushReport};
pub use registry::{CollectionRegistry, MergeKind, DISHES};
pub use resolver::{
    merge_items, ConflictResolver, ConflictStrategy, ItemMergeStrategy, LastWriterWinsStrategy,
    ResolutionOutcome,
};
pub use transport::{HttpTransport, SyncTransport};
#[cfg(test)]
pub(crate) use transport::LocalTransport;
