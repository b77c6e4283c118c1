//! Authoritative server-side reconciliation.
//!
//! The service owns `version` and `updated_at` for every document. It
//! applies pushed change records under optimistic concurrency, reports
//! conflicts with a suggested resolution, and serves change pages ordered
//! by `updated_at`.

use chrono::{DateTime, Duration, SubsecRound, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::storage::{ServerStorage, ServerStorageError};
use crate::clock::Clock;
use crate::models::{ChangeRecord, Operation, SyncableDocument};
use crate::sync::protocol::{
    Conflict, FullRequest, FullResponse, PullQuery, PullResponse, PulledChange, PushRequest,
    PushResponse, Rejection, Resolution,
};
use crate::sync::CollectionRegistry;

pub const DEFAULT_PAGE_SIZE: usize = 200;
pub const MAX_PAGE_SIZE: usize = 1000;

type Collection = BTreeMap<String, SyncableDocument>;

#[derive(Debug, Default)]
struct UserState {
    collections: BTreeMap<String, Collection>,
    last_issued: Option<DateTime<Utc>>,
}

impl UserState {
    fn collection_mut(&mut self, name: &str) -> &mut Collection {
        self.collections.entry(name.to_string()).or_default()
    }
}

enum Outcome {
    Applied(SyncableDocument),
    /// Already in the requested state; nothing to write.
    Unchanged,
    Conflict(Conflict),
    Rejected(String),
}

pub struct ReconciliationService {
    storage: ServerStorage,
    registry: CollectionRegistry,
    clock: Arc<dyn Clock>,
    users: Mutex<HashMap<String, UserState>>,
}

impl ReconciliationService {
    pub fn new(storage: ServerStorage, registry: CollectionRegistry, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            registry,
            clock,
            users: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &CollectionRegistry {
        &self.registry
    }

    fn load_user(&self, user_id: &str) -> Result<UserState, ServerStorageError> {
        let mut state = UserState::default();
        for name in self.storage.list_collections(user_id)? {
            let docs = self.storage.load_collection(user_id, &name)?;
            for doc in docs {
                state.last_issued = state.last_issued.max(Some(doc.updated_at));
                state
                    .collection_mut(&name)
                    .insert(doc.id.clone(), doc);
            }
        }
        Ok(state)
    }

    /// Strictly increasing per user, millisecond resolution.
    fn next_timestamp(&self, state: &mut UserState) -> DateTime<Utc> {
        let now = self.clock.now().trunc_subsecs(3);
        let issued = match state.last_issued {
            Some(last) if now <= last => last + Duration::milliseconds(1),
            _ => now,
        };
        state.last_issued = Some(issued);
        issued
    }

    pub async fn push(
        &self,
        user_id: &str,
        request: PushRequest,
    ) -> Result<PushResponse, ServerStorageError> {
        let mut users = self.users.lock().await;
        if !users.contains_key(user_id) {
            let loaded = self.load_user(user_id)?;
            users.insert(user_id.to_string(), loaded);
        }
        let Some(state) = users.get_mut(user_id) else {
            return Err(ServerStorageError::InvalidUserId(user_id.to_string()));
        };

        let mut applied = Vec::new();
        let mut conflicts = Vec::new();
        let mut rejected = Vec::new();
        let mut touched = BTreeSet::new();

        for change in &request.changes {
            match self.decide(state, change) {
                Outcome::Applied(doc) => {
                    tracing::debug!(
                        "Applied {} {}/{} -> v{}",
                        change.operation,
                        change.collection,
                        change.document_id,
                        doc.version
                    );
                    touched.insert(change.collection.clone());
                    state
                        .collection_mut(&change.collection)
                        .insert(doc.id.clone(), doc);
                    applied.push(change.document_id.clone());
                }
                Outcome::Unchanged => applied.push(change.document_id.clone()),
                Outcome::Conflict(conflict) => {
                    tracing::debug!(
                        "Conflict on {}/{}: {:?}",
                        change.collection,
                        change.document_id,
                        conflict.resolution
                    );
                    conflicts.push(conflict);
                }
                Outcome::Rejected(reason) => {
                    tracing::warn!(
                        "Rejected {}/{} from {}: {}",
                        change.collection,
                        change.document_id,
                        request.device_id,
                        reason
                    );
                    rejected.push(Rejection {
                        document_id: change.document_id.clone(),
                        collection: change.collection.clone(),
                        reason,
                    });
                }
            }
        }

        for name in &touched {
            let docs: Vec<SyncableDocument> = state
                .collections
                .get(name)
                .map(|c| c.values().cloned().collect())
                .unwrap_or_default();
            if let Err(e) = self.storage.save_collection(user_id, name, &docs) {
                // Drop the cached state so it is reloaded from disk.
                users.remove(user_id);
                return Err(e);
            }
        }

        tracing::info!(
            "Push from {} ({}): {} applied, {} conflicts, {} rejected",
            request.device_id,
            user_id,
            applied.len(),
            conflicts.len(),
            rejected.len()
        );

        Ok(PushResponse {
            success: true,
            applied,
            conflicts,
            rejected,
            server_time: self.clock.now(),
        })
    }

    fn decide(&self, state: &mut UserState, change: &ChangeRecord) -> Outcome {
        if let Err(e) = validate_collection_name(&change.collection) {
            return Outcome::Rejected(e);
        }

        let existing = state
            .collections
            .get(&change.collection)
            .and_then(|c| c.get(&change.document_id))
            .cloned();

        let conflict = |resolution: Resolution, snapshot: Option<SyncableDocument>| {
            Outcome::Conflict(Conflict {
                document_id: change.document_id.clone(),
                collection: change.collection.clone(),
                client_version: change.expected_version,
                server_version: snapshot.as_ref().map(|s| s.version).unwrap_or(0),
                server_snapshot: snapshot,
                resolution,
            })
        };

        let current = match (change.operation, existing) {
            (Operation::Create, Some(doc)) => return conflict(Resolution::ServerWins, Some(doc)),
            (Operation::Create, None) => {
                let payload = match self.registry.normalize(&change.collection, &change.payload) {
                    Ok(payload) => payload,
                    Err(reason) => return Outcome::Rejected(reason),
                };
                let updated_at = self.next_timestamp(state);
                return Outcome::Applied(SyncableDocument {
                    collection: change.collection.clone(),
                    id: change.document_id.clone(),
                    version: 1,
                    updated_at,
                    deleted_at: None,
                    last_writer_device: change.device_id.clone(),
                    payload,
                });
            }
            (_, None) => return conflict(Resolution::ServerWins, None),
            (Operation::Delete, Some(doc)) if doc.is_deleted() => return Outcome::Unchanged,
            (_, Some(doc)) if doc.is_deleted() => return conflict(Resolution::ServerWins, Some(doc)),
            (_, Some(doc)) => doc,
        };

        if change.expected_version != current.version {
            if self.registry.is_composite(&change.collection)
                && change.operation == Operation::Update
            {
                return conflict(Resolution::Merge, Some(current));
            }
            if change.local_timestamp <= current.updated_at {
                return conflict(Resolution::ServerWins, Some(current));
            }
        }

        let payload = match change.operation {
            Operation::Delete => current.payload.clone(),
            _ => match self.registry.normalize(&change.collection, &change.payload) {
                Ok(payload) => payload,
                Err(reason) => return Outcome::Rejected(reason),
            },
        };

        let updated_at = self.next_timestamp(state);
        Outcome::Applied(SyncableDocument {
            version: current.version + 1,
            updated_at,
            deleted_at: (change.operation == Operation::Delete).then_some(updated_at),
            last_writer_device: change.device_id.clone(),
            payload,
            ..current
        })
    }

    pub async fn pull(
        &self,
        user_id: &str,
        query: &PullQuery,
    ) -> Result<PullResponse, ServerStorageError> {
        let filter = query.collection_filter();
        if let Some(names) = &filter {
            for name in names {
                validate_collection_name(name).map_err(ServerStorageError::InvalidCollection)?;
            }
        }
        let limit = query
            .limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);

        let mut users = self.users.lock().await;
        if !users.contains_key(user_id) {
            let loaded = self.load_user(user_id)?;
            users.insert(user_id.to_string(), loaded);
        }
        let state = users.get(user_id);

        let mut changes: Vec<&SyncableDocument> = state
            .into_iter()
            .flat_map(|s| s.collections.iter())
            .filter(|(name, _)| filter.as_ref().map_or(true, |f| f.contains(*name)))
            .flat_map(|(_, docs)| docs.values())
            .filter(|doc| query.since.map_or(true, |since| doc.updated_at > since))
            .collect();
        changes.sort_by(|a, b| {
            (a.updated_at, &a.collection, &a.id).cmp(&(b.updated_at, &b.collection, &b.id))
        });

        let has_more = changes.len() > limit;
        changes.truncate(limit);
        let cursor = changes.last().map(|doc| doc.updated_at);

        Ok(PullResponse {
            changes: changes.into_iter().map(PulledChange::from_document).collect(),
            server_time: self.clock.now(),
            has_more,
            cursor,
        })
    }

    /// Every document, tombstones included, of the requested collections
    /// (all registered and stored collections when none are named).
    pub async fn full(
        &self,
        user_id: &str,
        request: &FullRequest,
    ) -> Result<FullResponse, ServerStorageError> {
        if let Some(names) = &request.collections {
            for name in names {
                validate_collection_name(name).map_err(ServerStorageError::InvalidCollection)?;
            }
        }

        let mut users = self.users.lock().await;
        if !users.contains_key(user_id) {
            let loaded = self.load_user(user_id)?;
            users.insert(user_id.to_string(), loaded);
        }
        let state = users.get(user_id);

        let names: BTreeSet<String> = match &request.collections {
            Some(names) => names.iter().cloned().collect(),
            None => self
                .registry
                .collections()
                .into_iter()
                .chain(state.into_iter().flat_map(|s| s.collections.keys().cloned()))
                .collect(),
        };

        let collections = names
            .into_iter()
            .map(|name| {
                let docs = state
                    .and_then(|s| s.collections.get(&name))
                    .map(|c| c.values().cloned().collect())
                    .unwrap_or_default();
                (name, docs)
            })
            .collect();

        Ok(FullResponse {
            collections,
            server_time: self.clock.now(),
        })
    }
}

fn validate_collection_name(name: &str) -> Result<(), String> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(format!("invalid collection name '{}'", name))
    }
}
