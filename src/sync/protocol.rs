//! Wire types for the `/sync/*` HTTP protocol.
//!
//! Field names use camelCase on the wire. The same types are used by the
//! server handlers and by the client transports.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::{ChangeRecord, SyncableDocument};

/// How a conflict is to be settled on the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    ServerWins,
    ClientWins,
    Merge,
}

/// A push record the server refused to apply as sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub document_id: String,
    pub collection: String,
    pub client_version: u64,
    pub server_version: u64,
    /// Current server state; `None` when the document does not exist upstream.
    pub server_snapshot: Option<SyncableDocument>,
    pub resolution: Resolution,
}

/// A push record whose payload the server could not interpret.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rejection {
    pub document_id: String,
    pub collection: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub device_id: String,
    #[serde(default)]
    pub last_pulled_at: Option<DateTime<Utc>>,
    pub changes: Vec<ChangeRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    pub success: bool,
    pub applied: Vec<String>,
    pub conflicts: Vec<Conflict>,
    #[serde(default)]
    pub rejected: Vec<Rejection>,
    pub server_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PullOperation {
    Upsert,
    Delete,
}

/// One server-side change as served by `/sync/pull`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PulledChange {
    pub collection: String,
    pub document_id: String,
    pub operation: PullOperation,
    pub data: serde_json::Value,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_writer_device: String,
}

impl PulledChange {
    pub fn from_document(doc: &SyncableDocument) -> Self {
        Self {
            collection: doc.collection.clone(),
            document_id: doc.id.clone(),
            operation: if doc.is_deleted() {
                PullOperation::Delete
            } else {
                PullOperation::Upsert
            },
            data: doc.payload.clone(),
            version: doc.version,
            updated_at: doc.updated_at,
            deleted_at: doc.deleted_at,
            last_writer_device: doc.last_writer_device.clone(),
        }
    }

    pub fn into_document(self) -> SyncableDocument {
        // Older servers send no deletedAt; a delete still has to tombstone.
        let deleted_at = match self.operation {
            PullOperation::Delete => self.deleted_at.or(Some(self.updated_at)),
            PullOperation::Upsert => None,
        };
        SyncableDocument {
            collection: self.collection,
            id: self.document_id,
            version: self.version,
            updated_at: self.updated_at,
            deleted_at,
            last_writer_device: self.last_writer_device,
            payload: self.data,
        }
    }
}

/// Query string of `GET /sync/pull`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PullQuery {
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    /// Comma separated collection names.
    #[serde(default)]
    pub collections: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl PullQuery {
    pub fn collection_filter(&self) -> Option<Vec<String>> {
        self.collections.as_ref().map(|csv| {
            csv.split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect()
        })
    }

    /// Renders the query string, percent-encoding every value.
    pub fn to_query_string(&self) -> String {
        let mut parts = Vec::new();
        if let Some(since) = &self.since {
            parts.push(format!(
                "since={}",
                urlencoding::encode(&format_timestamp(since))
            ));
        }
        if let Some(collections) = &self.collections {
            parts.push(format!("collections={}", urlencoding::encode(collections)));
        }
        if let Some(limit) = self.limit {
            parts.push(format!("limit={}", limit));
        }
        parts.join("&")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    pub changes: Vec<PulledChange>,
    pub server_time: DateTime<Utc>,
    pub has_more: bool,
    #[serde(default)]
    pub cursor: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullRequest {
    #[serde(default)]
    pub collections: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullResponse {
    pub collections: BTreeMap<String, Vec<SyncableDocument>>,
    pub server_time: DateTime<Utc>,
}

/// RFC 3339 with microseconds and a `Z` suffix.
pub fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}
