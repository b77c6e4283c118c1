use std::sync::Arc;

use super::coordinator::SyncHandle;
use super::events::EventBus;
use super::registry::CollectionRegistry;
use super::SyncError;
use crate::clock::Clock;
use crate::db::{LocalStore, MealLogRepository, WeightRepository};

/// Everything a sync session needs, built once when a user session starts.
///
/// Cloning is cheap; clones share the store, the clock and the event bus.
#[derive(Debug, Clone)]
pub struct SyncContext {
    device_id: String,
    store: LocalStore,
    clock: Arc<dyn Clock>,
    registry: CollectionRegistry,
    events: EventBus,
}

impl SyncContext {
    /// Opens a session on `store`, creating the device id on first use.
    pub async fn open(
        store: LocalStore,
        clock: Arc<dyn Clock>,
        registry: CollectionRegistry,
    ) -> Result<Self, SyncError> {
        let device_id = store.device_id().await?;
        tracing::debug!("Sync session for device {}", device_id);
        Ok(Self {
            device_id,
            store,
            clock,
            registry,
            events: EventBus::default(),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn registry(&self) -> &CollectionRegistry {
        &self.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn meal_logs(&self) -> MealLogRepository {
        MealLogRepository::new(self.store.clone(), self.clock.clone(), &self.device_id)
    }

    pub fn weights(&self) -> WeightRepository {
        WeightRepository::new(self.store.clone(), self.clock.clone(), &self.device_id)
    }

    /// Ends the session. A running coordinator is stopped first, cancelling
    /// any cycle in flight. With `wipe` (account deletion) all local state
    /// goes too, including queued changes that were never pushed.
    pub async fn teardown(self, coordinator: Option<SyncHandle>, wipe: bool) -> Result<(), SyncError> {
        if let Some(handle) = coordinator {
            handle.shutdown().await;
        }
        if wipe {
            tracing::info!("Wiping local data for device {}", self.device_id);
            self.store.wipe().await?;
        }
        Ok(())
    }
}
