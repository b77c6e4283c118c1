//! Client-side conflict resolution.
//!
//! The server reports a conflict together with a suggested [`Resolution`].
//! A [`ConflictStrategy`] chosen through the [`CollectionRegistry`] decides
//! what actually happens, and [`ConflictResolver::apply`] writes the outcome
//! to the local store and queue.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use super::protocol::{Conflict, Resolution};
use super::registry::{CollectionRegistry, MergeKind};
use super::SyncError;
use crate::db::LocalStore;
use crate::models::{ChangeRecord, FoodItem, MealLog, Operation, SyncableDocument};

/// Decides how one conflicted push record is settled.
pub trait ConflictStrategy: Send + Sync + Debug {
    fn resolve(&self, local: &ChangeRecord, conflict: &Conflict) -> Resolution;
}

/// Whole-document last writer wins.
///
/// Server verdicts other than `merge` are taken as final. A `merge`
/// suggestion is turned into a timestamp comparison, remote winning ties.
#[derive(Debug, Default, Clone, Copy)]
pub struct LastWriterWinsStrategy;

impl ConflictStrategy for LastWriterWinsStrategy {
    fn resolve(&self, local: &ChangeRecord, conflict: &Conflict) -> Resolution {
        match (conflict.resolution, &conflict.server_snapshot) {
            (Resolution::Merge, Some(remote)) if local.local_timestamp > remote.updated_at => {
                Resolution::ClientWins
            }
            (Resolution::Merge, _) => Resolution::ServerWins,
            (verdict, _) => verdict,
        }
    }
}

/// Item-level merge for composite meal logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct ItemMergeStrategy;

impl ConflictStrategy for ItemMergeStrategy {
    fn resolve(&self, local: &ChangeRecord, conflict: &Conflict) -> Resolution {
        let mergeable = matches!(
            &conflict.server_snapshot,
            Some(remote) if !remote.is_deleted()
        ) && local.operation != Operation::Delete;

        if conflict.resolution == Resolution::Merge && mergeable {
            Resolution::Merge
        } else {
            LastWriterWinsStrategy.resolve(local, conflict)
        }
    }
}

/// Merges two diverged copies of a meal log.
///
/// Header fields come from whichever side has the later document
/// `updated_at` (remote on a tie). Items are unioned by id; the later item
/// `updated_at` wins, a tombstone wins an exact tie, and otherwise the item
/// with the greater canonical JSON wins so every replica picks the same one.
/// Remote item order is kept, local-only items follow.
pub fn merge_items(
    local: &MealLog,
    local_updated_at: DateTime<Utc>,
    remote: &MealLog,
    remote_updated_at: DateTime<Utc>,
) -> MealLog {
    let base = if local_updated_at > remote_updated_at {
        local
    } else {
        remote
    };

    let mut order: Vec<String> = Vec::with_capacity(remote.items.len() + local.items.len());
    let mut by_id: HashMap<String, FoodItem> = HashMap::new();

    for item in &remote.items {
        if by_id.insert(item.id.clone(), item.clone()).is_none() {
            order.push(item.id.clone());
        }
    }

    for item in &local.items {
        match by_id.get(&item.id) {
            None => {
                order.push(item.id.clone());
                by_id.insert(item.id.clone(), item.clone());
            }
            Some(existing) if item_wins(item, existing) => {
                by_id.insert(item.id.clone(), item.clone());
            }
            Some(_) => {}
        }
    }

    let items = order
        .into_iter()
        .filter_map(|id| by_id.remove(&id))
        .collect();

    let mut merged = MealLog::new(base.date, base.meal_type);
    merged.notes = base.notes.clone();
    merged.set_items(items);
    merged
}

fn item_wins(candidate: &FoodItem, current: &FoodItem) -> bool {
    if candidate.updated_at != current.updated_at {
        return candidate.updated_at > current.updated_at;
    }
    match (candidate.is_deleted(), current.is_deleted()) {
        (true, false) => true,
        (false, true) => false,
        _ => canonical(candidate) > canonical(current),
    }
}

fn canonical(item: &FoodItem) -> String {
    serde_json::to_string(item).unwrap_or_default()
}

/// What applying a resolution did locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionOutcome {
    /// Local copy replaced by the server state, queue entry dropped.
    ServerAccepted,
    /// Local payload kept and re-queued against the server version.
    ClientRequeued,
    /// Merged result stored and re-queued.
    Merged,
    /// Merge produced the remote state; adopted without a re-push.
    MergedIntoRemote,
    /// A newer local edit replaced the pushed record; left for the next push.
    Superseded,
}

impl ResolutionOutcome {
    pub fn requeued(&self) -> bool {
        matches!(self, ResolutionOutcome::ClientRequeued | ResolutionOutcome::Merged)
    }
}

/// Maps collections to strategies and applies their decisions.
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    registry: CollectionRegistry,
    lww: Arc<dyn ConflictStrategy>,
    item_merge: Arc<dyn ConflictStrategy>,
}

impl ConflictResolver {
    pub fn new(registry: CollectionRegistry) -> Self {
        Self {
            registry,
            lww: Arc::new(LastWriterWinsStrategy),
            item_merge: Arc::new(ItemMergeStrategy),
        }
    }

    pub fn strategy_for(&self, collection: &str) -> &dyn ConflictStrategy {
        match self.registry.kind_of(collection) {
            MergeKind::Lww => self.lww.as_ref(),
            MergeKind::ItemMerge => self.item_merge.as_ref(),
        }
    }

    pub async fn apply(
        &self,
        store: &LocalStore,
        pushed: &ChangeRecord,
        conflict: &Conflict,
    ) -> Result<ResolutionOutcome, SyncError> {
        let resolution = self.strategy_for(&pushed.collection).resolve(pushed, conflict);
        tracing::debug!(
            "Conflict on {}/{} (client v{}, server v{}): {:?}",
            conflict.collection,
            conflict.document_id,
            conflict.client_version,
            conflict.server_version,
            resolution
        );

        match (resolution, &conflict.server_snapshot) {
            (Resolution::Merge, Some(remote)) => self.merge(store, pushed, remote).await,
            (Resolution::ClientWins, _) => self.client_wins(store, pushed, conflict).await,
            _ => Self::server_wins(store, pushed, conflict.server_snapshot.as_ref()).await,
        }
    }

    async fn server_wins(
        store: &LocalStore,
        pushed: &ChangeRecord,
        snapshot: Option<&SyncableDocument>,
    ) -> Result<ResolutionOutcome, SyncError> {
        if store.accept_server_state(pushed, snapshot).await? {
            Ok(ResolutionOutcome::ServerAccepted)
        } else {
            Ok(ResolutionOutcome::Superseded)
        }
    }

    async fn client_wins(
        &self,
        store: &LocalStore,
        pushed: &ChangeRecord,
        conflict: &Conflict,
    ) -> Result<ResolutionOutcome, SyncError> {
        let local_version = store
            .get(&pushed.collection, &pushed.document_id)
            .await?
            .map(|doc| doc.document.version)
            .unwrap_or(pushed.expected_version);

        let (operation, expected_version) = match &conflict.server_snapshot {
            None => (Operation::Create, 0),
            Some(_) if pushed.operation == Operation::Create => {
                (Operation::Update, conflict.server_version)
            }
            Some(_) => (pushed.operation, conflict.server_version),
        };

        let requeue = ChangeRecord {
            operation,
            expected_version,
            ..pushed.clone()
        };
        let doc = SyncableDocument {
            collection: pushed.collection.clone(),
            id: pushed.document_id.clone(),
            version: local_version.max(conflict.server_version) + 1,
            updated_at: pushed.local_timestamp,
            deleted_at: (operation == Operation::Delete).then_some(pushed.local_timestamp),
            last_writer_device: pushed.device_id.clone(),
            payload: pushed.payload.clone(),
        };

        if store.store_resolved(pushed, &doc, &requeue).await? {
            Ok(ResolutionOutcome::ClientRequeued)
        } else {
            Ok(ResolutionOutcome::Superseded)
        }
    }

    async fn merge(
        &self,
        store: &LocalStore,
        pushed: &ChangeRecord,
        remote: &SyncableDocument,
    ) -> Result<ResolutionOutcome, SyncError> {
        let remote_log = MealLog::from_payload(&remote.payload)
            .map_err(|e| SyncError::Protocol(format!("server snapshot of {}: {}", remote.id, e)))?;
        let local_log = match MealLog::from_payload(&pushed.payload) {
            Ok(log) => log,
            Err(e) => {
                tracing::warn!(
                    "Unreadable local meal log {}, keeping server copy: {}",
                    pushed.document_id,
                    e
                );
                return Self::server_wins(store, pushed, Some(remote)).await;
            }
        };

        let merged = merge_items(
            &local_log,
            pushed.local_timestamp,
            &remote_log,
            remote.updated_at,
        );

        if merged.to_payload() == remote_log.to_payload() {
            return Ok(match Self::server_wins(store, pushed, Some(remote)).await? {
                ResolutionOutcome::ServerAccepted => ResolutionOutcome::MergedIntoRemote,
                other => other,
            });
        }

        let local_version = store
            .get(&pushed.collection, &pushed.document_id)
            .await?
            .map(|doc| doc.document.version)
            .unwrap_or(pushed.expected_version);
        let payload = merged.to_payload();

        let doc = SyncableDocument {
            collection: pushed.collection.clone(),
            id: pushed.document_id.clone(),
            version: local_version.max(remote.version) + 1,
            updated_at: pushed.local_timestamp.max(remote.updated_at),
            deleted_at: None,
            last_writer_device: pushed.device_id.clone(),
            payload: payload.clone(),
        };
        let requeue = ChangeRecord {
            operation: Operation::Update,
            expected_version: remote.version,
            payload,
            ..pushed.clone()
        };

        if store.store_resolved(pushed, &doc, &requeue).await? {
            Ok(ResolutionOutcome::Merged)
        } else {
            Ok(ResolutionOutcome::Superseded)
        }
    }
}
