use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{from_db_version, init_db, to_db_version, ChangeQueue};
use crate::models::{ChangeRecord, LocalDocument, Operation, SyncableDocument};
use crate::sync::protocol::format_timestamp;
use crate::sync::SyncError;

const DEVICE_ID_KEY: &str = "device_id";

/// Device-local replica of the server's documents.
///
/// Every write goes through one writer lane (an async mutex held for the
/// whole transaction). Reads use the pool directly and never wait on each
/// other.
#[derive(Debug, Clone)]
pub struct LocalStore {
    pool: SqlitePool,
    writer: Arc<Mutex<()>>,
}

#[derive(sqlx::FromRow)]
struct DocumentRow {
    collection: String,
    id: String,
    version: i64,
    updated_at: String,
    deleted_at: Option<String>,
    last_writer_device: String,
    payload: String,
    pending_sync: bool,
}

impl DocumentRow {
    fn into_local(self) -> Result<LocalDocument, SyncError> {
        let corrupt = |what: &str, err: &dyn std::fmt::Display| {
            SyncError::StorageCorruption(format!(
                "{}/{}: bad {}: {}",
                self.collection, self.id, what, err
            ))
        };

        let updated_at = parse_timestamp(&self.updated_at).map_err(|e| corrupt("updated_at", &e))?;
        let deleted_at = match &self.deleted_at {
            Some(raw) => Some(parse_timestamp(raw).map_err(|e| corrupt("deleted_at", &e))?),
            None => None,
        };
        let payload = serde_json::from_str(&self.payload).map_err(|e| corrupt("payload", &e))?;

        Ok(LocalDocument {
            document: SyncableDocument {
                collection: self.collection,
                id: self.id,
                version: from_db_version(self.version),
                updated_at,
                deleted_at,
                last_writer_device: self.last_writer_device,
                payload,
            },
            pending_sync: self.pending_sync,
        })
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc))
}

/// A mutation made by the user on this device.
#[derive(Debug, Clone)]
pub struct LocalChange {
    pub collection: String,
    pub id: String,
    pub operation: Operation,
    pub payload: serde_json::Value,
    pub at: DateTime<Utc>,
    pub device_id: String,
}

/// Outcome of applying a page of remote documents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageReport {
    pub applied: usize,
    /// Documents kept because a newer local edit is pending.
    pub skipped: usize,
}

impl LocalStore {
    pub async fn open(path: &Path) -> Result<Self, SyncError> {
        let pool = init_db(path).await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            writer: Arc::new(Mutex::new(())),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// The change queue sharing this store's file and writer lane.
    pub fn queue(&self) -> ChangeQueue {
        ChangeQueue::new(self.pool.clone(), self.writer.clone())
    }

    /// Returns this device's id, generating and persisting it on first use.
    pub async fn device_id(&self) -> Result<String, SyncError> {
        if let Some(id) = self.meta(DEVICE_ID_KEY).await? {
            return Ok(id);
        }

        let _lane = self.writer.lock().await;
        sqlx::query("INSERT OR IGNORE INTO sync_meta (key, value) VALUES (?, ?)")
            .bind(DEVICE_ID_KEY)
            .bind(Uuid::new_v4().to_string())
            .execute(&self.pool)
            .await?;

        self.meta(DEVICE_ID_KEY)
            .await?
            .ok_or_else(|| SyncError::StorageCorruption("device id not persisted".to_string()))
    }

    async fn meta(&self, key: &str) -> Result<Option<String>, SyncError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM sync_meta WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.0))
    }

    pub async fn get(&self, collection: &str, id: &str) -> Result<Option<LocalDocument>, SyncError> {
        let row: Option<DocumentRow> =
            sqlx::query_as("SELECT * FROM documents WHERE collection = ? AND id = ?")
                .bind(collection)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(DocumentRow::into_local).transpose()
    }

    /// Non-tombstoned documents of a collection, oldest edit first.
    pub async fn list_live(&self, collection: &str) -> Result<Vec<LocalDocument>, SyncError> {
        let rows: Vec<DocumentRow> = sqlx::query_as(
            "SELECT * FROM documents WHERE collection = ? AND deleted_at IS NULL ORDER BY updated_at, id",
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(DocumentRow::into_local).collect()
    }

    pub async fn query_pending(&self, collection: &str) -> Result<Vec<LocalDocument>, SyncError> {
        let rows: Vec<DocumentRow> = sqlx::query_as(
            "SELECT * FROM documents WHERE collection = ? AND pending_sync = 1 ORDER BY updated_at, id",
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(DocumentRow::into_local).collect()
    }

    pub async fn mark_pending(&self, collection: &str, id: &str) -> Result<(), SyncError> {
        self.set_pending(collection, id, true).await
    }

    pub async fn clear_pending(&self, collection: &str, id: &str) -> Result<(), SyncError> {
        self.set_pending(collection, id, false).await
    }

    async fn set_pending(&self, collection: &str, id: &str, pending: bool) -> Result<(), SyncError> {
        let _lane = self.writer.lock().await;
        sqlx::query("UPDATE documents SET pending_sync = ? WHERE collection = ? AND id = ?")
            .bind(pending)
            .bind(collection)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Applies one remote document. Returns false when the local copy was
    /// kept because it carries a newer pending edit.
    pub async fn upsert(&self, doc: &SyncableDocument) -> Result<bool, SyncError> {
        let _lane = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;
        let applied = Self::upsert_in(&mut tx, doc).await?;
        tx.commit().await?;
        Ok(applied)
    }

    async fn upsert_in(conn: &mut SqliteConnection, doc: &SyncableDocument) -> Result<bool, SyncError> {
        let local: Option<(bool, String)> = sqlx::query_as(
            "SELECT pending_sync, updated_at FROM documents WHERE collection = ? AND id = ?",
        )
        .bind(&doc.collection)
        .bind(&doc.id)
        .fetch_optional(&mut *conn)
        .await?;

        if let Some((true, local_updated_at)) = local {
            let local_updated_at = parse_timestamp(&local_updated_at).map_err(|e| {
                SyncError::StorageCorruption(format!("{}/{}: {}", doc.collection, doc.id, e))
            })?;
            if local_updated_at > doc.updated_at {
                tracing::debug!(
                    "Keeping pending local edit of {}/{} over remote v{}",
                    doc.collection,
                    doc.id,
                    doc.version
                );
                return Ok(false);
            }
        }

        // The pending flag follows the queue: an overwritten edit that is
        // still queued will be pushed and reconciled on the next cycle.
        Self::write_document_in(conn, doc, None).await?;
        Ok(true)
    }

    /// Writes `doc` as-is. `pending = None` derives the flag from the queue.
    async fn write_document_in(
        conn: &mut SqliteConnection,
        doc: &SyncableDocument,
        pending: Option<bool>,
    ) -> Result<(), SyncError> {
        let payload = serde_json::to_string(&doc.payload)
            .map_err(|e| SyncError::serialization(&doc.id, e))?;

        sqlx::query(
            r#"
            INSERT INTO documents (collection, id, version, updated_at, deleted_at, last_writer_device, payload, pending_sync)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7,
                COALESCE(?8, EXISTS (SELECT 1 FROM change_queue WHERE collection = ?1 AND document_id = ?2)))
            ON CONFLICT (collection, id) DO UPDATE SET
                version = excluded.version,
                updated_at = excluded.updated_at,
                deleted_at = excluded.deleted_at,
                last_writer_device = excluded.last_writer_device,
                payload = excluded.payload,
                pending_sync = excluded.pending_sync
            "#,
        )
        .bind(&doc.collection)
        .bind(&doc.id)
        .bind(to_db_version(doc.version))
        .bind(format_timestamp(&doc.updated_at))
        .bind(doc.deleted_at.as_ref().map(format_timestamp))
        .bind(&doc.last_writer_device)
        .bind(&payload)
        .bind(pending)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Writes a local mutation and enqueues its change record in one
    /// transaction.
    pub async fn record_local_change(&self, change: &LocalChange) -> Result<ChangeRecord, SyncError> {
        let _lane = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;

        let row: Option<DocumentRow> =
            sqlx::query_as("SELECT * FROM documents WHERE collection = ? AND id = ?")
                .bind(&change.collection)
                .bind(&change.id)
                .fetch_optional(&mut *tx)
                .await?;
        let existing = row.map(DocumentRow::into_local).transpose()?;

        let unknown = || SyncError::UnknownDocument {
            collection: change.collection.clone(),
            document_id: change.id.clone(),
        };

        let (operation, base) = match (change.operation, existing) {
            (_, Some(local)) if local.is_deleted() => return Err(unknown()),
            (Operation::Create, Some(local)) => (Operation::Update, Some(local.document)),
            (Operation::Create, None) => (Operation::Create, None),
            (_, None) => return Err(unknown()),
            (op, Some(local)) => (op, Some(local.document)),
        };

        let expected_version = base.as_ref().map(|d| d.version).unwrap_or(0);
        let payload = match (operation, &base) {
            (Operation::Delete, Some(doc)) if change.payload.is_null() => doc.payload.clone(),
            _ => change.payload.clone(),
        };

        let doc = SyncableDocument {
            collection: change.collection.clone(),
            id: change.id.clone(),
            version: expected_version,
            updated_at: change.at,
            deleted_at: (operation == Operation::Delete).then_some(change.at),
            last_writer_device: change.device_id.clone(),
            payload: payload.clone(),
        };
        Self::write_document_in(&mut tx, &doc, Some(true)).await?;

        let record = ChangeRecord {
            collection: change.collection.clone(),
            document_id: change.id.clone(),
            operation,
            expected_version,
            payload,
            local_timestamp: change.at,
            device_id: change.device_id.clone(),
        };
        ChangeQueue::enqueue_in(&mut tx, &record).await?;

        tx.commit().await?;

        tracing::debug!(
            "Recorded local {} of {}/{}",
            operation,
            change.collection,
            change.id
        );
        Ok(record)
    }

    /// Applies a downloaded page and advances the collection checkpoint in
    /// the same transaction. If `validate` rejects any document, nothing
    /// from the page is kept.
    pub async fn apply_pull_page<F>(
        &self,
        collection: &str,
        docs: &[SyncableDocument],
        cursor: Option<DateTime<Utc>>,
        validate: F,
    ) -> Result<PageReport, SyncError>
    where
        F: Fn(&SyncableDocument) -> Result<(), SyncError>,
    {
        let _lane = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;
        let mut report = PageReport::default();

        for doc in docs {
            validate(doc)?;
            if Self::upsert_in(&mut tx, doc).await? {
                report.applied += 1;
            } else {
                report.skipped += 1;
            }
        }

        if let Some(cursor) = cursor {
            Self::advance_checkpoint_in(&mut tx, collection, &cursor).await?;
        }

        tx.commit().await?;
        Ok(report)
    }

    /// Bootstraps a collection from a full snapshot.
    pub async fn apply_snapshot<F>(
        &self,
        collection: &str,
        docs: &[SyncableDocument],
        checkpoint: DateTime<Utc>,
        validate: F,
    ) -> Result<PageReport, SyncError>
    where
        F: Fn(&SyncableDocument) -> Result<(), SyncError>,
    {
        self.apply_pull_page(collection, docs, Some(checkpoint), validate)
            .await
    }

    async fn advance_checkpoint_in(
        conn: &mut SqliteConnection,
        collection: &str,
        cursor: &DateTime<Utc>,
    ) -> Result<(), SyncError> {
        // Fixed-width UTC timestamps compare correctly as text.
        sqlx::query(
            r#"
            INSERT INTO checkpoints (collection, since) VALUES (?, ?)
            ON CONFLICT (collection) DO UPDATE SET since = MAX(since, excluded.since)
            "#,
        )
        .bind(collection)
        .bind(format_timestamp(cursor))
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn checkpoint(&self, collection: &str) -> Result<Option<DateTime<Utc>>, SyncError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT since FROM checkpoints WHERE collection = ?")
                .bind(collection)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(since,)| {
            parse_timestamp(&since).map_err(|e| {
                SyncError::StorageCorruption(format!("checkpoint for {}: {}", collection, e))
            })
        })
        .transpose()
    }

    pub async fn reset_checkpoints(&self) -> Result<(), SyncError> {
        let _lane = self.writer.lock().await;
        sqlx::query("DELETE FROM checkpoints")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Settles a pushed record in favour of the server: the local copy
    /// becomes `snapshot` (or disappears when there is none) and the queue
    /// entry is removed. Returns false, changing nothing, when the entry was
    /// replaced by a newer local edit while the push was in flight.
    pub async fn accept_server_state(
        &self,
        pushed: &ChangeRecord,
        snapshot: Option<&SyncableDocument>,
    ) -> Result<bool, SyncError> {
        let _lane = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;

        if !ChangeQueue::is_current_in(&mut tx, pushed).await? {
            return Ok(false);
        }

        ChangeQueue::remove_in(&mut tx, &pushed.collection, &pushed.document_id).await?;
        match snapshot {
            Some(doc) => Self::write_document_in(&mut tx, doc, Some(false)).await?,
            None => {
                sqlx::query("DELETE FROM documents WHERE collection = ? AND id = ?")
                    .bind(&pushed.collection)
                    .bind(&pushed.document_id)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(true)
    }

    /// Stores a locally resolved document as pending and replaces the
    /// pushed queue entry with `requeue`. Same supersession rule as
    /// [`accept_server_state`](Self::accept_server_state).
    pub async fn store_resolved(
        &self,
        pushed: &ChangeRecord,
        doc: &SyncableDocument,
        requeue: &ChangeRecord,
    ) -> Result<bool, SyncError> {
        let _lane = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;

        if !ChangeQueue::is_current_in(&mut tx, pushed).await? {
            return Ok(false);
        }

        Self::write_document_in(&mut tx, doc, Some(true)).await?;
        ChangeQueue::replace_in(&mut tx, requeue).await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Decodes every stored document and checkpoint.
    pub async fn integrity_check(&self) -> Result<(), SyncError> {
        let (status,): (String,) = sqlx::query_as("PRAGMA quick_check")
            .fetch_one(&self.pool)
            .await?;
        if status != "ok" {
            return Err(SyncError::StorageCorruption(status));
        }

        let rows: Vec<DocumentRow> = sqlx::query_as("SELECT * FROM documents")
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            row.into_local()?;
        }

        let checkpoints: Vec<(String, String)> =
            sqlx::query_as("SELECT collection, since FROM checkpoints")
                .fetch_all(&self.pool)
                .await?;
        for (collection, since) in checkpoints {
            parse_timestamp(&since).map_err(|e| {
                SyncError::StorageCorruption(format!("checkpoint for {}: {}", collection, e))
            })?;
        }

        Ok(())
    }

    /// Removes documents that can no longer be decoded, so a snapshot can
    /// rebuild them. Returns how many were removed.
    pub async fn purge_undecodable(&self) -> Result<usize, SyncError> {
        let rows: Vec<DocumentRow> = sqlx::query_as("SELECT * FROM documents")
            .fetch_all(&self.pool)
            .await?;
        let broken: Vec<(String, String)> = rows
            .into_iter()
            .filter_map(|row| {
                let key = (row.collection.clone(), row.id.clone());
                row.into_local().err().map(|_| key)
            })
            .collect();

        if broken.is_empty() {
            return Ok(0);
        }

        let _lane = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;
        for (collection, id) in &broken {
            tracing::warn!("Discarding undecodable document {}/{}", collection, id);
            sqlx::query("DELETE FROM documents WHERE collection = ? AND id = ?")
                .bind(collection)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("DELETE FROM checkpoints WHERE since NOT LIKE '____-__-__T%Z'")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(broken.len())
    }

    /// Deletes all local state, including the device id.
    pub async fn wipe(&self) -> Result<(), SyncError> {
        let _lane = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;
        for table in ["documents", "change_queue", "checkpoints", "sync_meta"] {
            sqlx::query(&format!("DELETE FROM {}", table))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
