//! Durable queue of local mutations awaiting server acknowledgement.
//!
//! The queue lives in the same SQLite file as the documents, so a mutation
//! and its queue entry are committed together. Entries are removed only when
//! the server acknowledges them or when they cannot be serialized at all.

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{from_db_version, to_db_version};
use crate::models::{ChangeRecord, Operation};
use crate::sync::protocol::format_timestamp;
use crate::sync::SyncError;

/// A raw queue row. The payload stays as stored text until it is turned
/// into a [`ChangeRecord`], so one unreadable entry cannot poison a batch.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueuedChange {
    pub seq: i64,
    pub collection: String,
    pub document_id: String,
    pub operation: String,
    pub expected_version: i64,
    pub payload: String,
    pub local_timestamp: String,
    pub device_id: String,
}

impl QueuedChange {
    pub fn to_record(&self) -> Result<ChangeRecord, SyncError> {
        let operation: Operation = self
            .operation
            .parse()
            .map_err(|e: String| SyncError::serialization(&self.document_id, e))?;
        let payload = serde_json::from_str(&self.payload)
            .map_err(|e| SyncError::serialization(&self.document_id, e))?;
        let local_timestamp = DateTime::parse_from_rfc3339(&self.local_timestamp)
            .map_err(|e| SyncError::serialization(&self.document_id, e))?
            .with_timezone(&Utc);

        Ok(ChangeRecord {
            collection: self.collection.clone(),
            document_id: self.document_id.clone(),
            operation,
            expected_version: from_db_version(self.expected_version),
            payload,
            local_timestamp,
            device_id: self.device_id.clone(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ChangeQueue {
    pool: SqlitePool,
    writer: Arc<Mutex<()>>,
}

impl ChangeQueue {
    pub(crate) fn new(pool: SqlitePool, writer: Arc<Mutex<()>>) -> Self {
        Self { pool, writer }
    }

    /// Enqueues a change, coalescing with a pending entry for the same document.
    pub async fn enqueue(&self, record: &ChangeRecord) -> Result<(), SyncError> {
        let _lane = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;
        Self::enqueue_in(&mut tx, record).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Coalescing insert on an open transaction.
    ///
    /// An existing entry keeps its queue position and its expected version;
    /// only payload, timestamp and operation move forward.
    pub(crate) async fn enqueue_in(
        conn: &mut SqliteConnection,
        record: &ChangeRecord,
    ) -> Result<(), SyncError> {
        let existing: Option<(i64, String)> = sqlx::query_as(
            "SELECT seq, operation FROM change_queue WHERE collection = ? AND document_id = ?",
        )
        .bind(&record.collection)
        .bind(&record.document_id)
        .fetch_optional(&mut *conn)
        .await?;

        let payload = serde_json::to_string(&record.payload)
            .map_err(|e| SyncError::serialization(&record.document_id, e))?;
        let local_timestamp = format_timestamp(&record.local_timestamp);

        match existing {
            Some((_, op)) if op == Operation::Delete.as_str() => {
                tracing::debug!(
                    "Ignoring {} after pending delete of {}/{}",
                    record.operation,
                    record.collection,
                    record.document_id
                );
            }
            Some((seq, op)) => {
                let previous: Operation = op
                    .parse()
                    .map_err(SyncError::StorageCorruption)?;
                let operation = previous.coalesce(record.operation);
                sqlx::query(
                    "UPDATE change_queue SET operation = ?, payload = ?, local_timestamp = ?, device_id = ? WHERE seq = ?",
                )
                .bind(operation.as_str())
                .bind(&payload)
                .bind(&local_timestamp)
                .bind(&record.device_id)
                .bind(seq)
                .execute(&mut *conn)
                .await?;
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO change_queue (collection, document_id, operation, expected_version, payload, local_timestamp, device_id)
                    VALUES (?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&record.collection)
                .bind(&record.document_id)
                .bind(record.operation.as_str())
                .bind(to_db_version(record.expected_version))
                .bind(&payload)
                .bind(&local_timestamp)
                .bind(&record.device_id)
                .execute(&mut *conn)
                .await?;
            }
        }

        Ok(())
    }

    /// Replaces whatever is queued for the document with `record`, keeping
    /// its position. Used after conflict resolution, where the expected
    /// version has to move as well.
    pub(crate) async fn replace_in(
        conn: &mut SqliteConnection,
        record: &ChangeRecord,
    ) -> Result<(), SyncError> {
        let payload = serde_json::to_string(&record.payload)
            .map_err(|e| SyncError::serialization(&record.document_id, e))?;

        sqlx::query(
            r#"
            INSERT INTO change_queue (collection, document_id, operation, expected_version, payload, local_timestamp, device_id)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (collection, document_id) DO UPDATE SET
                operation = excluded.operation,
                expected_version = excluded.expected_version,
                payload = excluded.payload,
                local_timestamp = excluded.local_timestamp,
                device_id = excluded.device_id
            "#,
        )
        .bind(&record.collection)
        .bind(&record.document_id)
        .bind(record.operation.as_str())
        .bind(to_db_version(record.expected_version))
        .bind(&payload)
        .bind(format_timestamp(&record.local_timestamp))
        .bind(&record.device_id)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Re-inserts a record produced by conflict resolution.
    pub async fn requeue(&self, record: &ChangeRecord) -> Result<(), SyncError> {
        let _lane = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;
        Self::replace_in(&mut tx, record).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Whether the queued entry for the record's document is still exactly
    /// the one that was pushed.
    pub(crate) async fn is_current_in(
        conn: &mut SqliteConnection,
        record: &ChangeRecord,
    ) -> Result<bool, SyncError> {
        let row: Option<(String, String, String)> = sqlx::query_as(
            "SELECT operation, local_timestamp, payload FROM change_queue WHERE collection = ? AND document_id = ?",
        )
        .bind(&record.collection)
        .bind(&record.document_id)
        .fetch_optional(&mut *conn)
        .await?;

        let Some((op, ts, payload)) = row else {
            return Ok(false);
        };
        if op != record.operation.as_str() || ts != format_timestamp(&record.local_timestamp) {
            return Ok(false);
        }
        // Two edits can share a timestamp, so the content decides.
        let stored: Option<serde_json::Value> = serde_json::from_str(&payload).ok();
        Ok(stored.as_ref() == Some(&record.payload))
    }

    pub(crate) async fn remove_in(
        conn: &mut SqliteConnection,
        collection: &str,
        document_id: &str,
    ) -> Result<(), SyncError> {
        sqlx::query("DELETE FROM change_queue WHERE collection = ? AND document_id = ?")
            .bind(collection)
            .bind(document_id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Returns up to `max_size` entries, oldest first, without removing them.
    pub async fn dequeue_batch(&self, max_size: usize) -> Result<Vec<QueuedChange>, SyncError> {
        let limit = i64::try_from(max_size).unwrap_or(i64::MAX);
        let rows = sqlx::query_as("SELECT * FROM change_queue ORDER BY seq LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Removes an entry the server accepted and clears the document's
    /// pending flag. Returns false when the entry was replaced by a newer
    /// local edit while the push was in flight; that edit stays queued,
    /// rebased on the version the server just assigned.
    pub async fn acknowledge(&self, record: &ChangeRecord) -> Result<bool, SyncError> {
        let _lane = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;

        if !Self::is_current_in(&mut tx, record).await? {
            sqlx::query(
                r#"
                UPDATE change_queue
                SET expected_version = ?,
                    operation = CASE operation WHEN 'create' THEN 'update' ELSE operation END
                WHERE collection = ? AND document_id = ?
                "#,
            )
            .bind(to_db_version(record.expected_version + 1))
            .bind(&record.collection)
            .bind(&record.document_id)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            return Ok(false);
        }

        Self::remove_in(&mut tx, &record.collection, &record.document_id).await?;
        sqlx::query("UPDATE documents SET pending_sync = 0 WHERE collection = ? AND id = ?")
            .bind(&record.collection)
            .bind(&record.document_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Removes an entry the server rejected. Same supersession rule as
    /// [`acknowledge`](Self::acknowledge); the local document is left as is.
    pub async fn discard(&self, record: &ChangeRecord) -> Result<bool, SyncError> {
        let _lane = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;

        if !Self::is_current_in(&mut tx, record).await? {
            return Ok(false);
        }

        Self::remove_in(&mut tx, &record.collection, &record.document_id).await?;
        sqlx::query("UPDATE documents SET pending_sync = 0 WHERE collection = ? AND id = ?")
            .bind(&record.collection)
            .bind(&record.document_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Drops an entry that can never be sent.
    pub async fn drop_entry(&self, entry: &QueuedChange) -> Result<(), SyncError> {
        let _lane = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM change_queue WHERE seq = ?")
            .bind(entry.seq)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE documents SET pending_sync = 0 WHERE collection = ? AND id = ?")
            .bind(&entry.collection)
            .bind(&entry.document_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn get(
        &self,
        collection: &str,
        document_id: &str,
    ) -> Result<Option<QueuedChange>, SyncError> {
        let row = sqlx::query_as(
            "SELECT * FROM change_queue WHERE collection = ? AND document_id = ?",
        )
        .bind(collection)
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn len(&self) -> Result<usize, SyncError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM change_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    pub async fn is_empty(&self) -> Result<bool, SyncError> {
        Ok(self.len().await? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::epoch_plus_secs;
    use crate::db::LocalStore;
    use serde_json::json;
    use tempfile::TempDir;

    async fn setup() -> (ChangeQueue, LocalStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalStore::open(&temp_dir.path().join("device.db"))
            .await
            .unwrap();
        (store.queue(), store, temp_dir)
    }

    fn record(id: &str, operation: Operation, secs: i64, payload: serde_json::Value) -> ChangeRecord {
        ChangeRecord {
            collection: "weights".to_string(),
            document_id: id.to_string(),
            operation,
            expected_version: 1,
            payload,
            local_timestamp: epoch_plus_secs(secs),
            device_id: "device-a".to_string(),
        }
    }

    #[tokio::test]
    async fn test_enqueue_coalesces_per_document() {
        let (queue, _store, _temp) = setup().await;

        queue
            .enqueue(&record("w1", Operation::Update, 1, json!({"kilograms": 80})))
            .await
            .unwrap();
        queue
            .enqueue(&record("w2", Operation::Update, 2, json!({"kilograms": 70})))
            .await
            .unwrap();
        let mut later = record("w1", Operation::Update, 3, json!({"kilograms": 79}));
        later.expected_version = 5;
        queue.enqueue(&later).await.unwrap();

        assert_eq!(queue.len().await.unwrap(), 2);

        let batch = queue.dequeue_batch(10).await.unwrap();
        assert_eq!(batch[0].document_id, "w1");
        assert_eq!(batch[1].document_id, "w2");

        let first = batch[0].to_record().unwrap();
        assert_eq!(first.payload, json!({"kilograms": 79}));
        assert_eq!(first.local_timestamp, epoch_plus_secs(3));
        // The base version of the first unflushed edit is kept.
        assert_eq!(first.expected_version, 1);
    }

    #[tokio::test]
    async fn test_enqueue_escalates_to_delete_and_never_back() {
        let (queue, _store, _temp) = setup().await;

        queue
            .enqueue(&record("w1", Operation::Update, 1, json!({})))
            .await
            .unwrap();
        queue
            .enqueue(&record("w1", Operation::Delete, 2, json!({})))
            .await
            .unwrap();
        queue
            .enqueue(&record("w1", Operation::Update, 3, json!({"kilograms": 1})))
            .await
            .unwrap();

        let entry = queue.get("weights", "w1").await.unwrap().unwrap();
        assert_eq!(entry.operation, "delete");
        assert_eq!(entry.to_record().unwrap().local_timestamp, epoch_plus_secs(2));
    }

    #[tokio::test]
    async fn test_dequeue_does_not_remove() {
        let (queue, _store, _temp) = setup().await;
        for i in 0..5 {
            queue
                .enqueue(&record(&format!("w{}", i), Operation::Create, i, json!({})))
                .await
                .unwrap();
        }

        let batch = queue.dequeue_batch(3).await.unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].document_id, "w0");
        assert_eq!(queue.len().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_acknowledge_skips_superseded_entry() {
        let (queue, _store, _temp) = setup().await;
        let pushed = record("w1", Operation::Update, 1, json!({"kilograms": 80}));
        queue.enqueue(&pushed).await.unwrap();

        // A newer edit lands while the push is in flight.
        queue
            .enqueue(&record("w1", Operation::Update, 2, json!({"kilograms": 81})))
            .await
            .unwrap();

        assert!(!queue.acknowledge(&pushed).await.unwrap());
        assert_eq!(queue.len().await.unwrap(), 1);

        let current = queue.dequeue_batch(1).await.unwrap()[0].to_record().unwrap();
        assert_eq!(current.expected_version, 2);
        assert_eq!(current.payload, json!({"kilograms": 81}));
        assert!(queue.acknowledge(&current).await.unwrap());
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_same_timestamp_edit_during_push_is_kept() {
        let (queue, _store, _temp) = setup().await;
        queue
            .enqueue(&record("w1", Operation::Update, 20, json!({"kilograms": 79})))
            .await
            .unwrap();
        let pushed = queue.dequeue_batch(1).await.unwrap()[0].to_record().unwrap();

        // Coarse clocks can stamp the next edit with the same instant.
        queue
            .enqueue(&record("w1", Operation::Update, 20, json!({"kilograms": 70})))
            .await
            .unwrap();

        assert!(!queue.acknowledge(&pushed).await.unwrap());
        assert_eq!(queue.len().await.unwrap(), 1);
        let current = queue.dequeue_batch(1).await.unwrap()[0].to_record().unwrap();
        assert_eq!(current.payload, json!({"kilograms": 70}));
        assert_eq!(current.local_timestamp, epoch_plus_secs(20));

        assert!(!queue.discard(&pushed).await.unwrap());
        assert_eq!(queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_superseded_create_is_rebased_as_update() {
        let (queue, _store, _temp) = setup().await;
        let mut pushed = record("w1", Operation::Create, 1, json!({"kilograms": 80}));
        pushed.expected_version = 0;
        queue.enqueue(&pushed).await.unwrap();
        queue
            .enqueue(&record("w1", Operation::Update, 2, json!({"kilograms": 81})))
            .await
            .unwrap();

        assert!(!queue.acknowledge(&pushed).await.unwrap());

        let entry = queue.get("weights", "w1").await.unwrap().unwrap();
        assert_eq!(entry.operation, "update");
        assert_eq!(entry.expected_version, 1);
    }

    #[tokio::test]
    async fn test_discard_removes_only_current_entry() {
        let (queue, _store, _temp) = setup().await;
        let rejected = record("w1", Operation::Update, 1, json!("not an object"));
        queue.enqueue(&rejected).await.unwrap();

        let stale = record("w1", Operation::Update, 0, json!("older"));
        assert!(!queue.discard(&stale).await.unwrap());
        assert!(queue.discard(&rejected).await.unwrap());
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_unreadable_payload_is_isolated() {
        let (queue, store, _temp) = setup().await;
        queue
            .enqueue(&record("good", Operation::Create, 1, json!({})))
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO change_queue (collection, document_id, operation, expected_version, payload, local_timestamp, device_id) VALUES ('weights', 'bad', 'update', 1, '{not json', '1970-01-01T00:00:02Z', 'device-a')",
        )
        .execute(store.pool())
        .await
        .unwrap();

        let batch = queue.dequeue_batch(10).await.unwrap();
        assert!(batch[0].to_record().is_ok());
        let err = batch[1].to_record().unwrap_err();
        assert!(matches!(err, SyncError::Serialization { .. }));

        queue.drop_entry(&batch[1]).await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_queue_survives_restart() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("device.db");

        {
            let store = LocalStore::open(&path).await.unwrap();
            store
                .queue()
                .enqueue(&record("w1", Operation::Create, 1, json!({"kilograms": 80})))
                .await
                .unwrap();
            // Simulated crash: the process goes away before any push.
            store.pool().close().await;
        }

        let reopened = LocalStore::open(&path).await.unwrap();
        let batch = reopened.queue().dequeue_batch(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(
            batch[0].to_record().unwrap().payload,
            json!({"kilograms": 80})
        );
    }
}
