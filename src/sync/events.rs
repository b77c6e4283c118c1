//! Typed notifications for sync subscribers.

use tokio::sync::broadcast;

use super::coordinator::{CycleReport, SyncState};

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    StateChanged(SyncState),
    CycleCompleted(CycleReport),
    CycleFailed {
        message: String,
        retry_in_ms: Option<u64>,
    },
    /// Remote changes were written to the local store.
    DocumentsChanged { collection: String, count: usize },
    /// The server refused the credentials. Sync stays paused until a new
    /// session is built.
    AuthExpired,
    /// A local record could not be sent and was dropped.
    RecordDropped {
        collection: String,
        document_id: String,
        reason: String,
    },
}

/// Broadcast bus. Receivers unsubscribe by being dropped; slow receivers
/// lose the oldest events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Publishing with no subscribers is not an error.
    pub fn publish(&self, event: SyncEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}
