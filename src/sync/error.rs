//! Sync error types.

use thiserror::Error;

/// Errors that can occur while synchronizing.
///
/// Network and server failures abort the running cycle without touching the
/// checkpoint or the change queue, so the work is retried on the next cycle.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Sync is not configured
    #[error("Sync not configured. Add server_url and api_key to config.")]
    NotConfigured,

    /// Server could not be reached, or the request timed out
    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    /// Credentials were refused; the caller must re-authenticate
    #[error("Authentication expired")]
    AuthExpired,

    /// Server answered with a 5xx or an unexpected status
    #[error("Server error ({status}): {message}")]
    ServerError { status: u16, message: String },

    /// Server response did not match the protocol
    #[error("Sync protocol error: {0}")]
    Protocol(String),

    /// A single record could not be (de)serialized
    #[error("Serialization error for {document_id}: {message}")]
    Serialization {
        document_id: String,
        message: String,
    },

    /// A local edit referred to a document this device does not hold
    #[error("Document not found: {collection}/{document_id}")]
    UnknownDocument {
        collection: String,
        document_id: String,
    },

    /// Local state is unreadable; a full resync is required
    #[error("Local storage corrupted: {0}")]
    StorageCorruption(String),

    /// Local database error
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Database migration error
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// The cycle was cancelled by shutdown or logout
    #[error("Sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Whether the coordinator should schedule a retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::NetworkUnavailable(_)
                | SyncError::ServerError { .. }
                | SyncError::Protocol(_)
                | SyncError::Storage(_)
        )
    }

    /// A copy of this error for handing to more than one waiter. Database
    /// errors keep only their message.
    pub(crate) fn to_shared(&self) -> SyncError {
        match self {
            SyncError::NotConfigured => SyncError::NotConfigured,
            SyncError::NetworkUnavailable(m) => SyncError::NetworkUnavailable(m.clone()),
            SyncError::AuthExpired => SyncError::AuthExpired,
            SyncError::ServerError { status, message } => SyncError::ServerError {
                status: *status,
                message: message.clone(),
            },
            SyncError::Protocol(m) => SyncError::Protocol(m.clone()),
            SyncError::Serialization {
                document_id,
                message,
            } => SyncError::Serialization {
                document_id: document_id.clone(),
                message: message.clone(),
            },
            SyncError::UnknownDocument {
                collection,
                document_id,
            } => SyncError::UnknownDocument {
                collection: collection.clone(),
                document_id: document_id.clone(),
            },
            SyncError::StorageCorruption(m) => SyncError::StorageCorruption(m.clone()),
            SyncError::Storage(e) => SyncError::Storage(sqlx::Error::Protocol(e.to_string())),
            SyncError::Migration(e) => SyncError::StorageCorruption(e.to_string()),
            SyncError::Cancelled => SyncError::Cancelled,
        }
    }

    pub(crate) fn serialization(document_id: impl Into<String>, err: impl ToString) -> Self {
        SyncError::Serialization {
            document_id: document_id.into(),
            message: err.to_string(),
        }
    }
}
