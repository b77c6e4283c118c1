use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use super::{LocalChange, LocalStore};
use crate::clock::Clock;
use crate::models::{FoodItem, LocalDocument, MealLog, Operation, MEAL_LOGS};
use crate::sync::SyncError;

/// A meal log together with its sync bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MealLogEntry {
    pub id: String,
    pub version: u64,
    pub pending_sync: bool,
    pub log: MealLog,
}

impl MealLogEntry {
    fn from_local(doc: LocalDocument) -> Result<Self, SyncError> {
        let log = MealLog::from_payload(&doc.document.payload)
            .map_err(|e| SyncError::serialization(&doc.document.id, e))?;
        Ok(Self {
            id: doc.document.id,
            version: doc.document.version,
            pending_sync: doc.pending_sync,
            log,
        })
    }
}

/// Local edits of meal logs. Every mutation is recorded in the change queue.
pub struct MealLogRepository {
    store: LocalStore,
    clock: Arc<dyn Clock>,
    device_id: String,
}

impl MealLogRepository {
    pub fn new(store: LocalStore, clock: Arc<dyn Clock>, device_id: impl Into<String>) -> Self {
        Self {
            store,
            clock,
            device_id: device_id.into(),
        }
    }

    pub async fn create(&self, log: MealLog) -> Result<MealLogEntry, SyncError> {
        let id = Uuid::new_v4().to_string();
        let mut log = log;
        log.recompute_totals();
        self.record(&id, Operation::Create, log.to_payload(), self.clock.now())
            .await?;
        self.require(&id).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<MealLogEntry>, SyncError> {
        match self.store.get(MEAL_LOGS, id).await? {
            Some(doc) if !doc.is_deleted() => MealLogEntry::from_local(doc).map(Some),
            _ => Ok(None),
        }
    }

    pub async fn list(&self) -> Result<Vec<MealLogEntry>, SyncError> {
        let mut entries = self
            .store
            .list_live(MEAL_LOGS)
            .await?
            .into_iter()
            .map(MealLogEntry::from_local)
            .collect::<Result<Vec<_>, _>>()?;
        entries.sort_by(|a, b| {
            (a.log.date, a.log.meal_type.as_str()).cmp(&(b.log.date, b.log.meal_type.as_str()))
        });
        Ok(entries)
    }

    pub async fn list_range(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<MealLogEntry>, SyncError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|e| e.log.date >= from && e.log.date <= to)
            .collect())
    }

    /// Appends an item, stamping it with the current time.
    pub async fn add_item(&self, log_id: &str, item: FoodItem) -> Result<FoodItem, SyncError> {
        let mut added = None;
        self.mutate(log_id, |log, at| {
            let mut item = item;
            item.updated_at = at;
            added = Some(item.clone());
            log.add_item(item);
            true
        })
        .await?;
        added.ok_or_else(|| self.unknown(log_id))
    }

    /// Returns false when the log has no live item with that id.
    pub async fn edit_item(
        &self,
        log_id: &str,
        item_id: &str,
        edit: impl FnOnce(&mut FoodItem),
    ) -> Result<bool, SyncError> {
        self.mutate(log_id, |log, at| log.edit_item(item_id, at, edit))
            .await
    }

    pub async fn remove_item(&self, log_id: &str, item_id: &str) -> Result<bool, SyncError> {
        self.mutate(log_id, |log, at| log.remove_item(item_id, at))
            .await
    }

    pub async fn set_notes(&self, log_id: &str, notes: Option<String>) -> Result<bool, SyncError> {
        self.mutate(log_id, |log, _| {
            log.notes = notes;
            true
        })
        .await
    }

    pub async fn delete(&self, log_id: &str) -> Result<(), SyncError> {
        self.require(log_id).await?;
        self.record(log_id, Operation::Delete, serde_json::Value::Null, self.clock.now())
            .await
    }

    async fn mutate(
        &self,
        log_id: &str,
        apply: impl FnOnce(&mut MealLog, DateTime<Utc>) -> bool,
    ) -> Result<bool, SyncError> {
        let mut entry = self.require(log_id).await?;
        let at = self.clock.now();
        if !apply(&mut entry.log, at) {
            return Ok(false);
        }
        self.record(log_id, Operation::Update, entry.log.to_payload(), at)
            .await?;
        Ok(true)
    }

    async fn record(
        &self,
        id: &str,
        operation: Operation,
        payload: serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        self.store
            .record_local_change(&LocalChange {
                collection: MEAL_LOGS.to_string(),
                id: id.to_string(),
                operation,
                payload,
                at,
                device_id: self.device_id.clone(),
            })
            .await?;
        Ok(())
    }

    async fn require(&self, id: &str) -> Result<MealLogEntry, SyncError> {
        self.get(id).await?.ok_or_else(|| self.unknown(id))
    }

    fn unknown(&self, id: &str) -> SyncError {
        SyncError::UnknownDocument {
            collection: MEAL_LOGS.to_string(),
            document_id: id.to_string(),
        }
    }
}
