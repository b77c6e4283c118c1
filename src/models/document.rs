use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A versioned document as the server stores and serves it.
///
/// `version` and `updated_at` are assigned by the server only. A non-null
/// `deleted_at` is a tombstone: the document stays around so the deletion
/// can propagate to every device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncableDocument {
    pub collection: String,
    pub id: String,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_writer_device: String,
    pub payload: serde_json::Value,
}

impl SyncableDocument {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// A document as this device currently believes it to be.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalDocument {
    pub document: SyncableDocument,
    /// Set while a local mutation of this document awaits acknowledgement.
    pub pending_sync: bool,
}

impl LocalDocument {
    pub fn id(&self) -> &str {
        &self.document.id
    }

    pub fn collection(&self) -> &str {
        &self.document.collection
    }

    pub fn is_deleted(&self) -> bool {
        self.document.is_deleted()
    }
}
