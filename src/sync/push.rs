//! Sends queued local mutations and settles the server's verdicts.

use std::collections::HashSet;
use std::time::Duration;

use super::context::SyncContext;
use super::events::SyncEvent;
use super::protocol::{PushRequest, PushResponse};
use super::resolver::{ConflictResolver, ResolutionOutcome};
use super::transport::{with_timeout, SyncTransport};
use super::SyncError;
use crate::models::ChangeRecord;

/// Rounds allowed on top of what the queue length needs, for records that
/// come back re-queued by conflict resolution.
const EXTRA_ROUNDS: usize = 8;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushReport {
    pub pushed: usize,
    pub applied: usize,
    pub conflicts: usize,
    pub merged: usize,
    /// Conflicted records queued again for another round.
    pub requeued: usize,
    /// Records removed without reaching the server state.
    pub dropped: usize,
    pub rounds: usize,
}

#[derive(Debug, Clone)]
pub struct PushHandler {
    batch_size: usize,
    timeout: Duration,
}

impl PushHandler {
    pub fn new(batch_size: usize, timeout: Duration) -> Self {
        Self {
            batch_size: batch_size.max(1),
            timeout,
        }
    }

    /// Pushes batches until the queue holds nothing sendable or the round
    /// limit is hit. A transport error aborts the push; entries that were
    /// not settled stay queued.
    pub async fn run<T: SyncTransport>(
        &self,
        ctx: &SyncContext,
        transport: &T,
    ) -> Result<PushReport, SyncError> {
        let queue = ctx.store().queue();
        let resolver = ConflictResolver::new(ctx.registry().clone());
        let mut report = PushReport::default();

        let max_rounds = queue.len().await?.div_ceil(self.batch_size) + EXTRA_ROUNDS;
        let last_pulled_at = self.last_pulled_at(ctx).await?;

        while report.rounds < max_rounds {
            let batch = queue.dequeue_batch(self.batch_size).await?;
            if batch.is_empty() {
                break;
            }
            report.rounds += 1;

            let mut records = Vec::with_capacity(batch.len());
            for entry in &batch {
                match entry.to_record() {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        tracing::warn!(
                            "Dropping unsendable change {}/{}: {}",
                            entry.collection,
                            entry.document_id,
                            e
                        );
                        queue.drop_entry(entry).await?;
                        ctx.events().publish(SyncEvent::RecordDropped {
                            collection: entry.collection.clone(),
                            document_id: entry.document_id.clone(),
                            reason: e.to_string(),
                        });
                        report.dropped += 1;
                    }
                }
            }
            if records.is_empty() {
                continue;
            }

            let request = PushRequest {
                device_id: ctx.device_id().to_string(),
                last_pulled_at,
                changes: records,
            };
            let response = with_timeout(self.timeout, transport.push(&request)).await?;
            report.pushed += request.changes.len();

            self.settle(ctx, &resolver, &request.changes, response, &mut report)
                .await?;
        }

        if report.rounds == max_rounds && !queue.is_empty().await? {
            tracing::warn!(
                "Push stopped after {} rounds with changes still queued",
                report.rounds
            );
        }

        if report.pushed > 0 {
            tracing::info!(
                "Pushed {} change(s): {} applied, {} conflicts ({} merged), {} dropped",
                report.pushed,
                report.applied,
                report.conflicts,
                report.merged,
                report.dropped
            );
        }
        Ok(report)
    }

    async fn last_pulled_at(
        &self,
        ctx: &SyncContext,
    ) -> Result<Option<chrono::DateTime<chrono::Utc>>, SyncError> {
        let mut latest = None;
        for collection in ctx.registry().collections() {
            latest = latest.max(ctx.store().checkpoint(&collection).await?);
        }
        Ok(latest)
    }

    async fn settle(
        &self,
        ctx: &SyncContext,
        resolver: &ConflictResolver,
        sent: &[ChangeRecord],
        response: PushResponse,
        report: &mut PushReport,
    ) -> Result<(), SyncError> {
        let queue = ctx.store().queue();
        let find = |collection: &str, id: &str| {
            sent.iter()
                .find(|r| r.collection == collection && r.document_id == id)
        };

        let mut unsettled: HashSet<(&str, &str)> = HashSet::new();

        for conflict in &response.conflicts {
            let Some(record) = find(&conflict.collection, &conflict.document_id) else {
                tracing::warn!(
                    "Server reported a conflict for unsent {}/{}",
                    conflict.collection,
                    conflict.document_id
                );
                continue;
            };
            unsettled.insert((record.collection.as_str(), record.document_id.as_str()));
            report.conflicts += 1;

            let outcome = resolver.apply(ctx.store(), record, conflict).await?;
            match outcome {
                ResolutionOutcome::Merged | ResolutionOutcome::MergedIntoRemote => {
                    report.merged += 1
                }
                _ => {}
            }
            if outcome.requeued() {
                report.requeued += 1;
            }
        }

        for rejection in &response.rejected {
            let Some(record) = find(&rejection.collection, &rejection.document_id) else {
                continue;
            };
            unsettled.insert((record.collection.as_str(), record.document_id.as_str()));

            tracing::warn!(
                "Server rejected {}/{}: {}",
                rejection.collection,
                rejection.document_id,
                rejection.reason
            );
            if queue.discard(record).await? {
                report.dropped += 1;
                ctx.events().publish(SyncEvent::RecordDropped {
                    collection: rejection.collection.clone(),
                    document_id: rejection.document_id.clone(),
                    reason: rejection.reason.clone(),
                });
            }
        }

        let applied: HashSet<&str> = response.applied.iter().map(String::as_str).collect();
        for record in sent {
            if !applied.contains(record.document_id.as_str())
                || unsettled.contains(&(record.collection.as_str(), record.document_id.as_str()))
            {
                continue;
            }
            report.applied += 1;
            if !queue.acknowledge(record).await? {
                tracing::debug!(
                    "{}/{} changed while in flight; keeping newer edit queued",
                    record.collection,
                    record.document_id
                );
            }
        }

        Ok(())
    }
}
