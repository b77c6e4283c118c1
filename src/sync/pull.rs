//! Downloads server changes collection by collection.
//!
//! A collection without a checkpoint is bootstrapped from `/sync/full`.
//! After that it follows `/sync/pull` pages. Each page is received in full
//! before anything is written, then applied together with the checkpoint
//! advance in one transaction.

use chrono::{DateTime, Utc};
use std::time::Duration;

use super::context::SyncContext;
use super::events::SyncEvent;
use super::protocol::{FullRequest, PullQuery, PulledChange};
use super::registry::CollectionRegistry;
use super::transport::{with_timeout, SyncTransport};
use super::SyncError;
use crate::db::PageReport;
use crate::models::{MealLog, SyncableDocument};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PullReport {
    pub pages: usize,
    pub applied: usize,
    /// Remote changes not applied because a newer local edit is pending.
    pub skipped: usize,
    /// Collections initialised from a full snapshot.
    pub bootstrapped: usize,
}

impl PullReport {
    fn add(&mut self, page: PageReport) {
        self.applied += page.applied;
        self.skipped += page.skipped;
    }
}

#[derive(Debug, Clone)]
pub struct PullHandler {
    page_size: usize,
    timeout: Duration,
}

impl PullHandler {
    pub fn new(page_size: usize, timeout: Duration) -> Self {
        Self {
            page_size: page_size.max(1),
            timeout,
        }
    }

    pub async fn run<T: SyncTransport>(
        &self,
        ctx: &SyncContext,
        transport: &T,
    ) -> Result<PullReport, SyncError> {
        let mut report = PullReport::default();
        for collection in ctx.registry().collections() {
            let applied_before = report.applied;

            match ctx.store().checkpoint(&collection).await? {
                None => self.bootstrap(ctx, transport, &collection, &mut report).await?,
                Some(since) => {
                    self.follow(ctx, transport, &collection, since, &mut report)
                        .await?
                }
            }

            let count = report.applied - applied_before;
            if count > 0 {
                ctx.events().publish(SyncEvent::DocumentsChanged {
                    collection: collection.clone(),
                    count,
                });
            }
        }

        if report.applied > 0 || report.skipped > 0 {
            tracing::info!(
                "Pulled {} change(s) in {} page(s), {} kept local",
                report.applied,
                report.pages,
                report.skipped
            );
        }
        Ok(report)
    }

    async fn bootstrap<T: SyncTransport>(
        &self,
        ctx: &SyncContext,
        transport: &T,
        collection: &str,
        report: &mut PullReport,
    ) -> Result<(), SyncError> {
        let request = FullRequest {
            collections: Some(vec![collection.to_string()]),
        };
        let mut response = with_timeout(self.timeout, transport.full(&request)).await?;
        let docs = response.collections.remove(collection).unwrap_or_default();

        let checkpoint = docs
            .iter()
            .map(|d| d.updated_at)
            .max()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

        let registry = ctx.registry();
        let page = ctx
            .store()
            .apply_snapshot(collection, &docs, checkpoint, |doc| {
                validate(registry, collection, doc)
            })
            .await?;

        tracing::info!(
            "Bootstrapped {} with {} document(s)",
            collection,
            docs.len()
        );
        report.pages += 1;
        report.bootstrapped += 1;
        report.add(page);
        Ok(())
    }

    async fn follow<T: SyncTransport>(
        &self,
        ctx: &SyncContext,
        transport: &T,
        collection: &str,
        mut since: DateTime<Utc>,
        report: &mut PullReport,
    ) -> Result<(), SyncError> {
        let registry = ctx.registry();

        loop {
            let query = PullQuery {
                since: Some(since),
                collections: Some(collection.to_string()),
                limit: Some(self.page_size),
            };
            let response = with_timeout(self.timeout, transport.pull(&query)).await?;

            let docs: Vec<SyncableDocument> = response
                .changes
                .into_iter()
                .map(PulledChange::into_document)
                .collect();
            let cursor = response
                .cursor
                .or_else(|| docs.iter().map(|d| d.updated_at).max());

            let page = ctx
                .store()
                .apply_pull_page(collection, &docs, cursor, |doc| {
                    validate(registry, collection, doc)
                })
                .await?;
            report.pages += 1;
            report.add(page);

            match cursor {
                Some(next) if response.has_more && next > since => since = next,
                Some(_) if response.has_more => {
                    tracing::warn!(
                        "Pull cursor for {} did not advance past {}; stopping",
                        collection,
                        since
                    );
                    return Ok(());
                }
                _ => return Ok(()),
            }
        }
    }
}

/// A page is refused as a whole if any document in it does not belong to
/// the collection or cannot be read.
fn validate(
    registry: &CollectionRegistry,
    collection: &str,
    doc: &SyncableDocument,
) -> Result<(), SyncError> {
    if doc.collection != collection {
        return Err(SyncError::Protocol(format!(
            "{}/{} served in a page for {}",
            doc.collection, doc.id, collection
        )));
    }
    if registry.is_composite(collection) && !doc.is_deleted() {
        MealLog::from_payload(&doc.payload).map_err(|e| {
            SyncError::Protocol(format!("unreadable {}/{}: {}", collection, doc.id, e))
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{epoch_plus_secs, Clock, ManualClock};
    use crate::db::LocalStore;
    use crate::models::{ChangeRecord, Operation, MEAL_LOGS, WEIGHTS};
    use crate::server::{ReconciliationService, ServerStorage};
    use crate::sync::protocol::PushRequest;
    use crate::sync::transport::LocalTransport;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        ctx: SyncContext,
        service: Arc<ReconciliationService>,
        transport: LocalTransport,
        clock: Arc<ManualClock>,
        _temp: TempDir,
    }

    async fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::at_secs(100));
        let service = Arc::new(ReconciliationService::new(
            ServerStorage::new(temp.path().join("server")),
            CollectionRegistry::default(),
            clock.clone(),
        ));
        let store = LocalStore::open(&temp.path().join("device.db")).await.unwrap();
        let ctx = SyncContext::open(store, clock.clone(), CollectionRegistry::default())
            .await
            .unwrap();
        Fixture {
            ctx,
            transport: LocalTransport::new(service.clone(), "alice"),
            service,
            clock,
            _temp: temp,
        }
    }

    /// Writes weights on the server as another device would.
    async fn server_weights(f: &Fixture, ids: &[&str]) {
        let changes = ids
            .iter()
            .map(|id| ChangeRecord {
                collection: WEIGHTS.to_string(),
                document_id: id.to_string(),
                operation: Operation::Create,
                expected_version: 0,
                payload: json!({"date": "2025-03-01", "kilograms": 70.0}),
                local_timestamp: f.clock.now(),
                device_id: "device-b".to_string(),
            })
            .collect();
        f.service
            .push(
                "alice",
                PushRequest {
                    device_id: "device-b".to_string(),
                    last_pulled_at: None,
                    changes,
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_first_pull_bootstraps_from_snapshot() {
        let f = fixture().await;
        server_weights(&f, &["w1", "w2"]).await;

        let report = PullHandler::new(200, Duration::from_secs(5))
            .run(&f.ctx, &f.transport)
            .await
            .unwrap();

        assert_eq!(report.bootstrapped, 3);
        assert_eq!(report.applied, 2);
        assert_eq!(f.ctx.store().list_live(WEIGHTS).await.unwrap().len(), 2);
        assert_eq!(
            f.ctx.store().checkpoint(MEAL_LOGS).await.unwrap(),
            Some(DateTime::<Utc>::UNIX_EPOCH)
        );
        assert!(f.ctx.store().checkpoint(WEIGHTS).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_pages_follow_cursor_without_skipping() {
        let f = fixture().await;
        let handler = PullHandler::new(2, Duration::from_secs(5));
        handler.run(&f.ctx, &f.transport).await.unwrap();

        // Five documents written in the same instant still get distinct
        // server timestamps, so no page boundary can lose one.
        server_weights(&f, &["a", "b", "c", "d", "e"]).await;

        let report = handler.run(&f.ctx, &f.transport).await.unwrap();

        assert_eq!(report.applied, 5);
        assert!(report.pages >= 3 + 2);
        assert_eq!(f.ctx.store().list_live(WEIGHTS).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_repeated_pull_is_idempotent() {
        let f = fixture().await;
        let handler = PullHandler::new(200, Duration::from_secs(5));
        server_weights(&f, &["w1"]).await;

        handler.run(&f.ctx, &f.transport).await.unwrap();
        let before = f.ctx.store().get(WEIGHTS, "w1").await.unwrap();
        let report = handler.run(&f.ctx, &f.transport).await.unwrap();

        assert_eq!(report.applied, 0);
        assert_eq!(f.ctx.store().get(WEIGHTS, "w1").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_failed_pull_keeps_checkpoint() {
        let f = fixture().await;
        let handler = PullHandler::new(200, Duration::from_secs(5));
        handler.run(&f.ctx, &f.transport).await.unwrap();
        let checkpoint = f.ctx.store().checkpoint(WEIGHTS).await.unwrap();

        server_weights(&f, &["w1"]).await;
        f.transport.fail_next_pulls(1);
        let err = handler.run(&f.ctx, &f.transport).await.unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(f.ctx.store().checkpoint(WEIGHTS).await.unwrap(), checkpoint);
        assert!(f.ctx.store().get(WEIGHTS, "w1").await.unwrap().is_none());
    }

    #[test]
    fn test_validate_rejects_unreadable_meal_log() {
        let registry = CollectionRegistry::default();
        let doc = SyncableDocument {
            collection: MEAL_LOGS.to_string(),
            id: "m1".to_string(),
            version: 1,
            updated_at: epoch_plus_secs(1),
            deleted_at: None,
            last_writer_device: String::new(),
            payload: json!({"items": "nope"}),
        };

        assert!(matches!(
            validate(&registry, MEAL_LOGS, &doc),
            Err(SyncError::Protocol(_))
        ));
        assert!(matches!(
            validate(&registry, WEIGHTS, &doc),
            Err(SyncError::Protocol(_))
        ));

        let tombstone = SyncableDocument {
            deleted_at: Some(epoch_plus_secs(2)),
            ..doc
        };
        assert!(validate(&registry, MEAL_LOGS, &tombstone).is_ok());
    }
}
