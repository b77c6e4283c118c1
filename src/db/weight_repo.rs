use std::sync::Arc;
use uuid::Uuid;

use super::{LocalChange, LocalStore};
use crate::clock::Clock;
use crate::models::{Operation, WeightEntry, WEIGHTS};
use crate::sync::SyncError;

pub struct WeightRepository {
    store: LocalStore,
    clock: Arc<dyn Clock>,
    device_id: String,
}

impl WeightRepository {
    pub fn new(store: LocalStore, clock: Arc<dyn Clock>, device_id: impl Into<String>) -> Self {
        Self {
            store,
            clock,
            device_id: device_id.into(),
        }
    }

    /// Records a new weight entry and returns its id.
    pub async fn record(&self, entry: &WeightEntry) -> Result<String, SyncError> {
        let id = Uuid::new_v4().to_string();
        self.write(&id, Operation::Create, entry.to_payload()).await?;
        Ok(id)
    }

    pub async fn update(&self, id: &str, entry: &WeightEntry) -> Result<(), SyncError> {
        self.write(id, Operation::Update, entry.to_payload()).await
    }

    pub async fn delete(&self, id: &str) -> Result<(), SyncError> {
        self.write(id, Operation::Delete, serde_json::Value::Null)
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<WeightEntry>, SyncError> {
        match self.store.get(WEIGHTS, id).await? {
            Some(doc) if !doc.is_deleted() => serde_json::from_value(doc.document.payload)
                .map(Some)
                .map_err(|e| SyncError::serialization(id, e)),
            _ => Ok(None),
        }
    }

    /// Live entries with their ids, by date.
    pub async fn list(&self) -> Result<Vec<(String, WeightEntry)>, SyncError> {
        let mut entries = Vec::new();
        for doc in self.store.list_live(WEIGHTS).await? {
            let entry: WeightEntry = serde_json::from_value(doc.document.payload)
                .map_err(|e| SyncError::serialization(&doc.document.id, e))?;
            entries.push((doc.document.id, entry));
        }
        entries.sort_by(|a, b| a.1.date.cmp(&b.1.date));
        Ok(entries)
    }

    async fn write(
        &self,
        id: &str,
        operation: Operation,
        payload: serde_json::Value,
    ) -> Result<(), SyncError> {
        self.store
            .record_local_change(&LocalChange {
                collection: WEIGHTS.to_string(),
                id: id.to_string(),
                operation,
                payload,
                at: self.clock.now(),
                device_id: self.device_id.clone(),
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_record_update_delete() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalStore::open(&temp_dir.path().join("device.db"))
            .await
            .unwrap();
        let repo = WeightRepository::new(store.clone(), Arc::new(ManualClock::at_secs(1)), "d1");
        let day = NaiveDate::from_ymd_opt(2025, 3, 2).unwrap();

        let id = repo.record(&WeightEntry::new(day, 81.0)).await.unwrap();
        repo.update(&id, &WeightEntry::new(day, 80.6)).await.unwrap();

        let listed = repo.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].1.kilograms, 80.6);

        repo.delete(&id).await.unwrap();
        assert!(repo.get(&id).await.unwrap().is_none());

        // The never-pushed create collapses into a single delete.
        let queued = store.queue().dequeue_batch(10).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].operation, "delete");
        assert_eq!(queued[0].expected_version, 0);
    }
}
