// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync queue processor.
//!
//! Mutations recorded while the remote ledger was unreachable are persisted
//! as [`PendingSyncOperation`] rows and replayed when connectivity returns.
//! The queue is a durability buffer, not a tier: a row lives only until the
//! remote ledger acknowledges it.
//!
//! # Ordering
//!
//! Due rows replay by `(priority DESC, seq ASC)`. A row never runs while an
//! earlier row for the same entity is still queued, so a `create` always
//! lands before the `update` that cancels it. A `create` that exhausted its
//! retries holds back its entity's later rows until it is retried.
//!
//! # Failure handling
//!
//! | Outcome            | Row                                   | Cache                           |
//! |--------------------|---------------------------------------|---------------------------------|
//! | Success            | deleted                               | marked synced, ids rewritten    |
//! | Transient failure  | `retry_count += 1`, rescheduled       | untouched                       |
//! | Retries exhausted  | `Failed` (kept for diagnostics)       | placeholder released (`failed`) |
//! | Business rejection | `Failed`                              | refreshed from the server       |
//!
//! A connectivity failure ends the pass early; the remaining rows would only
//! burn a retry each. A replayed transition the server already shows counts
//! as synced.
//!
//! Local rows and their operations are written together through
//! [`LedgerStore::stage_transaction`] and [`LedgerStore::stage_option`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::cache::CacheManager;
use crate::config::LedgerConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::metrics;
use crate::model::{
    now_millis, queue_order, EntityType, OperationKind, PendingSyncOperation, QueueState, RedeemRequest,
    RedemptionOption, RedemptionTransaction, StatusChange, TransactionStatus,
};
use crate::remote::traits::RemoteLedger;
use crate::resilience::retry::RetryConfig;
use crate::storage::traits::LedgerStore;

/// Queue state for observability
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub queued: usize,
    /// Queued rows whose `scheduled_at` has passed
    pub due: usize,
    pub failed: usize,
    pub oldest_queued_at: Option<i64>,
    /// Totals since startup
    pub total_enqueued: u64,
    pub total_synced: u64,
    pub draining: bool,
}

/// A queued redemption the server refused.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedCreate {
    pub seq: u64,
    pub placeholder_id: String,
    pub request: Option<RedeemRequest>,
    pub error: LedgerError,
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    pub synced: usize,
    pub retried: usize,
    pub failed: usize,
    pub rejected: Vec<RejectedCreate>,
    /// Another drain was already running
    pub skipped: bool,
}

impl DrainReport {
    #[must_use]
    pub fn attempted(&self) -> usize {
        self.synced + self.retried + self.failed
    }
}

pub struct SyncQueue {
    store: Arc<dyn LedgerStore>,
    cache: Arc<CacheManager>,
    backoff: RetryConfig,
    max_retries: u32,
    batch_size: usize,
    draining: AtomicBool,
    total_enqueued: AtomicU64,
    total_synced: AtomicU64,
}

impl SyncQueue {
    pub fn new(store: Arc<dyn LedgerStore>, cache: Arc<CacheManager>, backoff: RetryConfig, batch_size: usize) -> Self {
        let max_retries = backoff.max_retries.unwrap_or(5) as u32;
        Self {
            store,
            cache,
            backoff,
            max_retries,
            batch_size: batch_size.max(1),
            draining: AtomicBool::new(false),
            total_enqueued: AtomicU64::new(0),
            total_synced: AtomicU64::new(0),
        }
    }

    pub fn from_config(store: Arc<dyn LedgerStore>, cache: Arc<CacheManager>, config: &LedgerConfig) -> Self {
        Self::new(store, cache, config.sync_backoff(), config.sync_batch_size)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Enqueue
    // ═══════════════════════════════════════════════════════════════════════

    fn operation(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        kind: OperationKind,
        payload: Value,
    ) -> PendingSyncOperation {
        PendingSyncOperation::new(entity_type, entity_id, kind, payload, self.max_retries)
    }

    fn enqueued(&self, seq: u64, op: &PendingSyncOperation) {
        self.total_enqueued.fetch_add(1, Ordering::Relaxed);
        debug!(
            seq,
            entity = op.entity_type.as_str(),
            entity_id = %op.entity_id,
            kind = op.kind.as_str(),
            "Operation queued"
        );
    }

    /// Queue an operation that has no local row to write.
    pub async fn enqueue(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        kind: OperationKind,
        payload: Value,
    ) -> LedgerResult<u64> {
        let op = self.operation(entity_type, entity_id, kind, payload);
        let seq = self.store.enqueue(&op).await?;
        self.enqueued(seq, &op);
        Ok(seq)
    }

    async fn stage_transaction<T: Serialize>(
        &self,
        local: &RedemptionTransaction,
        kind: OperationKind,
        payload: &T,
    ) -> LedgerResult<u64> {
        let op = self.operation(EntityType::Transaction, &local.id, kind, serde_json::to_value(payload)?);
        let seq = self.cache.stage_local_transaction(local, &op).await?;
        self.enqueued(seq, &op);
        Ok(seq)
    }

    async fn stage_option(&self, local: &RedemptionOption, kind: OperationKind, payload: Value) -> LedgerResult<u64> {
        let op = self.operation(EntityType::Option, &local.id, kind, payload);
        let seq = self.cache.stage_local_option(local, &op).await?;
        self.enqueued(seq, &op);
        Ok(seq)
    }

    /// Store a placeholder redemption and queue the request that replays it.
    pub async fn enqueue_redemption(
        &self,
        placeholder: &RedemptionTransaction,
        request: &RedeemRequest,
    ) -> LedgerResult<u64> {
        self.stage_transaction(placeholder, OperationKind::Create, request).await
    }

    /// Store a locally transitioned transaction and queue the transition.
    pub async fn enqueue_status_change(
        &self,
        local: &RedemptionTransaction,
        change: &StatusChange,
    ) -> LedgerResult<u64> {
        self.stage_transaction(local, OperationKind::Update, change).await
    }

    /// `Create` for options the server has never seen, `Update` otherwise.
    pub async fn enqueue_option_upsert(&self, option: &RedemptionOption, is_new: bool) -> LedgerResult<u64> {
        let kind = if is_new { OperationKind::Create } else { OperationKind::Update };
        self.stage_option(option, kind, serde_json::to_value(option)?).await
    }

    /// Store the locally archived copy and queue the archive.
    pub async fn enqueue_option_archive(&self, archived: &RedemptionOption) -> LedgerResult<u64> {
        self.stage_option(archived, OperationKind::Delete, Value::Null).await
    }

    /// Queue a refresh of a cached row from the server.
    pub async fn enqueue_refresh(&self, entity_type: EntityType, entity_id: &str) -> LedgerResult<u64> {
        self.enqueue(entity_type, entity_id, OperationKind::Sync, Value::Null).await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Inspection
    // ═══════════════════════════════════════════════════════════════════════

    /// Queued (not failed) rows for one entity, in enqueue order.
    pub async fn pending_for(&self, entity_type: EntityType, entity_id: &str) -> LedgerResult<Vec<PendingSyncOperation>> {
        Ok(self
            .store
            .list_operations()
            .await?
            .into_iter()
            .filter(|op| op.state == QueueState::Queued && op.entity_key() == (entity_type, entity_id))
            .collect())
    }

    pub async fn has_pending(&self) -> LedgerResult<bool> {
        Ok(self.store.list_operations().await?.iter().any(|op| op.state == QueueState::Queued))
    }

    pub async fn failed_operations(&self) -> LedgerResult<Vec<PendingSyncOperation>> {
        Ok(self
            .store
            .list_operations()
            .await?
            .into_iter()
            .filter(|op| op.state == QueueState::Failed)
            .collect())
    }

    pub async fn stats(&self) -> LedgerResult<QueueStats> {
        let ops = self.store.list_operations().await?;
        let now = now_millis();
        let queued: Vec<&PendingSyncOperation> = ops.iter().filter(|op| op.state == QueueState::Queued).collect();

        let stats = QueueStats {
            queued: queued.len(),
            due: queued.iter().filter(|op| op.is_due(now)).count(),
            failed: ops.len() - queued.len(),
            oldest_queued_at: queued.iter().map(|op| op.created_at).min(),
            total_enqueued: self.total_enqueued.load(Ordering::Relaxed),
            total_synced: self.total_synced.load(Ordering::Relaxed),
            draining: self.draining.load(Ordering::Acquire),
        };
        metrics::set_queue_depth(stats.queued, stats.failed);
        Ok(stats)
    }

    /// Put a failed row back in the queue with a fresh retry budget.
    pub async fn retry_failed(&self, seq: u64) -> LedgerResult<()> {
        let mut op = self
            .store
            .list_operations()
            .await?
            .into_iter()
            .find(|op| op.seq == seq)
            .ok_or_else(|| LedgerError::NotFound(format!("sync operation #{}", seq)))?;
        if op.state != QueueState::Failed {
            return Err(LedgerError::Validation(format!("sync operation #{} is not failed", seq)));
        }
        op.state = QueueState::Queued;
        op.retry_count = 0;
        op.scheduled_at = now_millis();
        op.last_error = None;
        self.store.update_operation(&op).await?;
        if (op.entity_type, op.kind) == (EntityType::Transaction, OperationKind::Create) {
            self.cache.mark_sync_pending(&op.entity_id).await?;
        }
        info!(seq, "Failed sync operation re-queued");
        Ok(())
    }

    /// Settle a queued redemption whose earlier write reached the ledger
    /// after the caller gave up on it. Returns `false` when no queued create
    /// exists for `placeholder_id` or a drain currently owns the queue.
    pub async fn settle_landed_redemption(
        &self,
        placeholder_id: &str,
        server_tx: &RedemptionTransaction,
    ) -> LedgerResult<bool> {
        if self.draining.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        let _guard = DrainGuard(&self.draining);

        let create = self
            .pending_for(EntityType::Transaction, placeholder_id)
            .await?
            .into_iter()
            .find(|op| op.kind == OperationKind::Create);
        let Some(create) = create else {
            return Ok(false);
        };

        self.cache.replace_placeholder(placeholder_id, server_tx).await?;
        self.store.delete_operation(create.seq).await?;
        self.total_synced.fetch_add(1, Ordering::Relaxed);
        metrics::record_replay(create.kind.as_str(), "settled");
        info!(
            seq = create.seq,
            placeholder = placeholder_id,
            id = %server_tx.id,
            "Timed-out redemption found on the ledger"
        );
        Ok(true)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Drain
    // ═══════════════════════════════════════════════════════════════════════

    /// Replay due operations against the remote ledger, at most one batch.
    pub async fn drain(&self, remote: &dyn RemoteLedger) -> LedgerResult<DrainReport> {
        if self.draining.swap(true, Ordering::AcqRel) {
            // Already draining
            return Ok(DrainReport { skipped: true, ..Default::default() });
        }
        let _guard = DrainGuard(&self.draining);

        let start = Instant::now();
        let mut report = DrainReport::default();
        let mut attempted = HashSet::new();

        while attempted.len() < self.batch_size {
            let ops = self.store.list_operations().await?;
            let Some(op) = next_runnable(&ops, now_millis(), &attempted) else {
                break;
            };
            attempted.insert(op.seq);

            match self.replay(remote, &op).await {
                Ok(()) => {
                    self.store.delete_operation(op.seq).await?;
                    self.total_synced.fetch_add(1, Ordering::Relaxed);
                    metrics::record_replay(op.kind.as_str(), "synced");
                    report.synced += 1;
                }
                Err(e) if e.is_transient() => {
                    let stop = e.is_connectivity();
                    if self.schedule_retry(op, &e).await? {
                        report.failed += 1;
                    } else {
                        report.retried += 1;
                    }
                    if stop {
                        debug!(error = %e, "Remote unreachable, ending drain pass");
                        break;
                    }
                }
                Err(e) => {
                    self.reject(remote, op, e, &mut report).await?;
                    report.failed += 1;
                }
            }
        }

        if report.attempted() > 0 {
            info!(
                synced = report.synced,
                retried = report.retried,
                failed = report.failed,
                "Sync queue drain pass complete"
            );
            metrics::record_queue_drain(report.synced, start.elapsed());
        }
        self.stats().await?;
        Ok(report)
    }

    async fn replay(&self, remote: &dyn RemoteLedger, op: &PendingSyncOperation) -> LedgerResult<()> {
        match (op.entity_type, op.kind) {
            (EntityType::Transaction, OperationKind::Create) => {
                let request: RedeemRequest = payload_of(op)?;
                let server_tx = remote.redeem_points(&request).await?;
                self.cache.replace_placeholder(&op.entity_id, &server_tx).await?;
                debug!(placeholder = %op.entity_id, id = %server_tx.id, "Queued redemption committed");
            }
            (EntityType::Transaction, OperationKind::Update) => {
                let change: StatusChange = payload_of(op)?;
                let result = match change.status {
                    TransactionStatus::Cancelled => {
                        remote.cancel_redemption(&op.entity_id, change.reason.as_deref()).await
                    }
                    TransactionStatus::Completed => remote.complete_redemption(&op.entity_id).await,
                    TransactionStatus::Pending => {
                        return Err(LedgerError::Validation("cannot move a transaction back to pending".into()))
                    }
                };
                let server_tx = match result {
                    Ok(server_tx) => server_tx,
                    Err(e) if !e.is_transient() => match remote.get_transaction(&op.entity_id).await {
                        // An earlier attempt landed before we lost the response
                        Ok(current) if current.status == change.status => {
                            debug!(id = %op.entity_id, status = %change.status, "Transition already applied");
                            current
                        }
                        _ => return Err(e),
                    },
                    Err(e) => return Err(e),
                };
                if !self.has_followups(op).await? {
                    self.cache.confirm_transaction(&server_tx).await?;
                }
            }
            (EntityType::Transaction, OperationKind::Delete) => {
                return Err(LedgerError::Validation("transactions are never deleted".into()));
            }
            (EntityType::Transaction, OperationKind::Sync) => {
                let server_tx = remote.get_transaction(&op.entity_id).await?;
                if self.has_followups(op).await? {
                    self.cache.mirror_transaction(&server_tx).await?;
                } else {
                    self.cache.confirm_transaction(&server_tx).await?;
                }
            }
            (EntityType::Option, OperationKind::Create | OperationKind::Update) => {
                let option: RedemptionOption = payload_of(op)?;
                let stored = remote.upsert_option(&option).await?;
                if !self.has_followups(op).await? {
                    self.cache.confirm_option(&stored).await?;
                }
            }
            (EntityType::Option, OperationKind::Delete) => {
                let archived = remote.archive_option(&op.entity_id).await?;
                if !self.has_followups(op).await? {
                    self.cache.confirm_option(&archived).await?;
                }
            }
            (EntityType::Option, OperationKind::Sync) => {
                let option = remote.get_option(&op.entity_id).await?;
                if self.has_followups(op).await? {
                    self.cache.mirror_option(&option).await?;
                } else {
                    self.cache.confirm_option(&option).await?;
                }
            }
        }
        Ok(())
    }

    /// Whether later rows for the same entity are still queued.
    async fn has_followups(&self, op: &PendingSyncOperation) -> LedgerResult<bool> {
        Ok(self
            .pending_for(op.entity_type, &op.entity_id)
            .await?
            .iter()
            .any(|other| other.seq > op.seq))
    }

    /// Returns `true` when the row ran out of retries.
    async fn schedule_retry(&self, mut op: PendingSyncOperation, err: &LedgerError) -> LedgerResult<bool> {
        op.retry_count += 1;
        op.last_error = Some(err.to_string());

        let exhausted = op.retry_count > op.max_retries;
        if exhausted {
            op.state = QueueState::Failed;
            if (op.entity_type, op.kind) == (EntityType::Transaction, OperationKind::Create) {
                self.cache.mark_sync_failed(&op.entity_id, &err.to_string()).await?;
            }
            error!(
                seq = op.seq,
                entity_id = %op.entity_id,
                retries = op.max_retries,
                error = %err,
                "Sync operation exhausted its retries"
            );
            metrics::record_replay(op.kind.as_str(), "exhausted");
        } else {
            let delay = self.backoff.delay_for_attempt(op.retry_count);
            op.scheduled_at = now_millis() + delay.as_millis() as i64;
            warn!(
                seq = op.seq,
                attempt = op.retry_count,
                max = op.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Sync operation failed, rescheduled"
            );
            metrics::record_replay(op.kind.as_str(), "retry");
        }
        self.store.update_operation(&op).await?;
        Ok(exhausted)
    }

    /// Business rejection: fail the row, let the server win in the cache.
    async fn reject(
        &self,
        remote: &dyn RemoteLedger,
        mut op: PendingSyncOperation,
        err: LedgerError,
        report: &mut DrainReport,
    ) -> LedgerResult<()> {
        warn!(seq = op.seq, entity_id = %op.entity_id, kind = op.kind.as_str(), error = %err, "Sync operation rejected");
        metrics::record_replay(op.kind.as_str(), "rejected");

        op.state = QueueState::Failed;
        op.last_error = Some(err.to_string());
        self.store.update_operation(&op).await?;

        match (op.entity_type, op.kind) {
            (EntityType::Transaction, OperationKind::Create) => {
                self.fail_dependents(&op).await?;
                report.rejected.push(RejectedCreate {
                    seq: op.seq,
                    placeholder_id: op.entity_id.clone(),
                    request: serde_json::from_value(op.payload.clone()).ok(),
                    error: err,
                });
            }
            (EntityType::Transaction, _) => match remote.get_transaction(&op.entity_id).await {
                Ok(server_tx) => self.cache.confirm_transaction(&server_tx).await?,
                Err(e) => debug!(entity_id = %op.entity_id, error = %e, "Could not refresh rejected transaction"),
            },
            (EntityType::Option, _) => match remote.get_option(&op.entity_id).await {
                Ok(option) => self.cache.confirm_option(&option).await?,
                Err(LedgerError::NotFound(_)) => self.store.delete_option(&op.entity_id).await?,
                Err(e) => debug!(entity_id = %op.entity_id, error = %e, "Could not refresh rejected option"),
            },
        }
        Ok(())
    }

    /// Later rows for an entity whose create was refused can never apply.
    async fn fail_dependents(&self, op: &PendingSyncOperation) -> LedgerResult<()> {
        for mut dependent in self.pending_for(op.entity_type, &op.entity_id).await? {
            if dependent.seq <= op.seq {
                continue;
            }
            dependent.state = QueueState::Failed;
            dependent.last_error = Some(format!("create #{} was rejected", op.seq));
            self.store.update_operation(&dependent).await?;
        }
        Ok(())
    }
}

fn payload_of<T: DeserializeOwned>(op: &PendingSyncOperation) -> LedgerResult<T> {
    Ok(serde_json::from_value(op.payload.clone())?)
}

/// Highest-priority due row that heads its entity's queue. A failed create
/// keeps blocking the rows queued behind it until it is retried.
fn next_runnable(ops: &[PendingSyncOperation], now: i64, attempted: &HashSet<u64>) -> Option<PendingSyncOperation> {
    let mut heads: HashMap<(EntityType, &str), u64> = HashMap::new();
    let blocking = |op: &&PendingSyncOperation| {
        op.state == QueueState::Queued || (op.state == QueueState::Failed && op.kind == OperationKind::Create)
    };
    for op in ops.iter().filter(blocking) {
        heads
            .entry(op.entity_key())
            .and_modify(|seq| *seq = (*seq).min(op.seq))
            .or_insert(op.seq);
    }

    ops.iter()
        .filter(|op| op.is_due(now) && !attempted.contains(&op.seq))
        .filter(|op| heads.get(&op.entity_key()) == Some(&op.seq))
        .min_by(|a, b| queue_order(a, b))
        .cloned()
}

/// RAII guard to reset draining flag.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RedemptionTransaction, SyncStatus};
    use crate::remote::memory::InMemoryLedger;
    use crate::remote::LedgerRules;
    use crate::storage::memory::MemoryStore;
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        store: Arc<MemoryStore>,
        cache: Arc<CacheManager>,
        queue: SyncQueue,
        ledger: InMemoryLedger,
    }

    async fn fixture(rules: LedgerRules) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(CacheManager::new(store.clone()));
        let queue = SyncQueue::new(store.clone(), cache.clone(), RetryConfig::test(), 50);
        let ledger = InMemoryLedger::new(rules);
        ledger.insert_option(RedemptionOption::new("movie", "Movie night", 300));
        ledger.insert_option(RedemptionOption::new("ice-cream", "Ice cream", 100));
        ledger.award_points("alice", 500, "chores").await.unwrap();
        Fixture { store, cache, queue, ledger }
    }

    async fn queue_offline_redemption(f: &Fixture, option: &str, points: i64) -> RedemptionTransaction {
        let request = RedeemRequest::new("alice", option, points, None);
        let local = RedemptionTransaction::local_pending(&request, option);
        f.queue.enqueue_redemption(&local, &request).await.unwrap();
        local
    }

    fn op(seq: u64, entity: &str, kind: OperationKind) -> PendingSyncOperation {
        let mut op = PendingSyncOperation::new(EntityType::Transaction, entity, kind, json!({}), 3);
        op.seq = seq;
        op
    }

    #[test]
    fn test_next_runnable_respects_entity_fifo() {
        let ops = vec![
            op(1, "a", OperationKind::Create),
            op(2, "a", OperationKind::Update),
            op(3, "b", OperationKind::Update),
        ];
        let now = now_millis() + 1;
        let mut attempted = HashSet::new();

        let first = next_runnable(&ops, now, &attempted).unwrap();
        assert_eq!(first.seq, 1);
        attempted.insert(1);

        // "a" still has seq 1 queued, so its update waits
        let second = next_runnable(&ops, now, &attempted).unwrap();
        assert_eq!(second.seq, 3);
        attempted.insert(3);
        assert!(next_runnable(&ops, now, &attempted).is_none());
    }

    #[test]
    fn test_next_runnable_skips_future_rows() {
        let mut later = op(1, "a", OperationKind::Create);
        later.scheduled_at = i64::MAX;
        let ops = vec![later, op(2, "a", OperationKind::Update)];
        assert!(next_runnable(&ops, now_millis(), &HashSet::new()).is_none());
    }

    #[tokio::test]
    async fn test_drain_replays_queued_redemption() {
        let f = fixture(LedgerRules::default()).await;
        let local = queue_offline_redemption(&f, "ice-cream", 100).await;

        let report = f.queue.drain(&f.ledger).await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(f.store.queue_len(), 0);

        assert!(f.cache.get_transaction(&local.id).await.unwrap().is_none());
        let synced = f.cache.find_by_client_ref(&local.client_ref).await.unwrap().unwrap();
        assert_eq!(synced.sync_status, SyncStatus::Synced);
        assert!(!synced.value.is_placeholder());
        assert_eq!(f.ledger.get_points("alice").await.unwrap().summary.balance, 400);
    }

    #[tokio::test]
    async fn test_replay_is_idempotent() {
        let f = fixture(LedgerRules::default()).await;
        let local = queue_offline_redemption(&f, "ice-cream", 100).await;
        let queued = f.queue.pending_for(EntityType::Transaction, &local.id).await.unwrap();
        let request: RedeemRequest = serde_json::from_value(queued[0].payload.clone()).unwrap();

        // The first attempt landed even though the client never heard back
        f.ledger.redeem_points(&request).await.unwrap();

        f.queue.drain(&f.ledger).await.unwrap();
        assert_eq!(f.ledger.transaction_count(), 1);
        assert_eq!(f.ledger.get_points("alice").await.unwrap().summary.balance, 400);
    }

    #[tokio::test]
    async fn test_create_then_cancel_replay_in_order() {
        let f = fixture(LedgerRules { auto_complete: false, ..Default::default() }).await;
        let mut local = queue_offline_redemption(&f, "movie", 300).await;

        local.status = TransactionStatus::Cancelled;
        f.queue
            .enqueue_status_change(&local, &StatusChange { status: TransactionStatus::Cancelled, reason: Some("oops".into()) })
            .await
            .unwrap();

        let report = f.queue.drain(&f.ledger).await.unwrap();
        assert_eq!(report.synced, 2);

        let cached = f.cache.find_by_client_ref(&local.client_ref).await.unwrap().unwrap();
        assert_eq!(cached.value.status, TransactionStatus::Cancelled);
        assert_eq!(cached.sync_status, SyncStatus::Synced);
        assert_eq!(f.ledger.get_points("alice").await.unwrap().summary.balance, 500);
    }

    #[tokio::test]
    async fn test_offline_drain_reschedules() {
        let f = fixture(LedgerRules::default()).await;
        queue_offline_redemption(&f, "ice-cream", 100).await;
        queue_offline_redemption(&f, "ice-cream", 100).await;
        f.ledger.set_online(false);

        let report = f.queue.drain(&f.ledger).await.unwrap();
        // Connectivity failure ends the pass after the first row
        assert_eq!(report.retried, 1);
        assert_eq!(report.synced, 0);

        let ops = f.store.list_operations().await.unwrap();
        assert_eq!(ops.iter().map(|o| o.retry_count).sum::<u32>(), 1);
        assert!(ops.iter().any(|o| o.last_error.as_deref().is_some_and(|e| e.contains("unreachable"))));
    }

    #[tokio::test]
    async fn test_exhausted_retries_become_failed() {
        let f = fixture(LedgerRules::default()).await;
        queue_offline_redemption(&f, "ice-cream", 100).await;
        f.ledger.set_online(false);

        // max_retries = 3 from RetryConfig::test(): four attempts in total
        for _ in 0..4 {
            f.queue.drain(&f.ledger).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let failed = f.queue.failed_operations().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].retry_count, 4);
        assert!(!f.queue.has_pending().await.unwrap());

        let stats = f.queue.stats().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.queued, 0);

        // Back online: a manual retry succeeds
        f.ledger.set_online(true);
        f.queue.retry_failed(failed[0].seq).await.unwrap();
        assert_eq!(f.queue.drain(&f.ledger).await.unwrap().synced, 1);
        assert!(f.queue.failed_operations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_create_is_reported() {
        let f = fixture(LedgerRules::default()).await;
        let mut local = queue_offline_redemption(&f, "movie", 300).await;
        local.status = TransactionStatus::Cancelled;
        f.queue
            .enqueue_status_change(&local, &StatusChange { status: TransactionStatus::Cancelled, reason: None })
            .await
            .unwrap();
        // Spent elsewhere before we reconnected
        f.ledger.redeem_points(&RedeemRequest::new("alice", "movie", 300, None)).await.unwrap();

        let report = f.queue.drain(&f.ledger).await.unwrap();
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].placeholder_id, local.id);
        assert!(matches!(report.rejected[0].error, LedgerError::InsufficientPoints { .. }));

        // The dependent cancel was failed with it, never replayed
        assert_eq!(f.queue.failed_operations().await.unwrap().len(), 2);
        assert_eq!(f.ledger.transaction_count(), 1);
    }

    #[tokio::test]
    async fn test_rejected_update_lets_server_win() {
        let f = fixture(LedgerRules::default()).await;
        let server = f.ledger.redeem_points(&RedeemRequest::new("alice", "movie", 300, None)).await.unwrap();
        assert_eq!(server.status, TransactionStatus::Completed);

        let mut local = server.clone();
        local.status = TransactionStatus::Cancelled;
        f.queue
            .enqueue_status_change(&local, &StatusChange { status: TransactionStatus::Cancelled, reason: None })
            .await
            .unwrap();

        let report = f.queue.drain(&f.ledger).await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(report.rejected.is_empty());

        let cached = f.cache.get_transaction(&server.id).await.unwrap().unwrap();
        assert_eq!(cached.value.status, TransactionStatus::Completed);
        assert_eq!(cached.sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_option_ops_replay() {
        let f = fixture(LedgerRules::default()).await;
        let option = RedemptionOption::new("bike", "Bike ride", 200);
        f.queue.enqueue_option_upsert(&option, true).await.unwrap();
        let mut archived = f.ledger.get_option("movie").await.unwrap();
        archived.is_active = false;
        f.queue.enqueue_option_archive(&archived).await.unwrap();
        assert!(f.cache.get_option("movie").await.unwrap().unwrap().is_dirty());

        let report = f.queue.drain(&f.ledger).await.unwrap();
        assert_eq!(report.synced, 2);
        assert!(!f.cache.get_option("bike").await.unwrap().unwrap().is_dirty());
        assert!(!f.ledger.get_option("movie").await.unwrap().is_active);
        assert!(!f.cache.get_option("movie").await.unwrap().unwrap().value.is_active);
    }

    #[tokio::test]
    async fn test_priority_create_before_sync() {
        let f = fixture(LedgerRules::default()).await;
        f.queue.enqueue_refresh(EntityType::Option, "movie").await.unwrap();
        queue_offline_redemption(&f, "ice-cream", 100).await;

        let ops = f.store.list_operations().await.unwrap();
        let first = next_runnable(&ops, now_millis() + 1, &HashSet::new()).unwrap();
        assert_eq!(first.kind, OperationKind::Create);

        assert_eq!(f.queue.drain(&f.ledger).await.unwrap().synced, 2);
    }

    #[tokio::test]
    async fn test_concurrent_drain_is_skipped() {
        let f = fixture(LedgerRules::default()).await;
        f.queue.draining.store(true, Ordering::Release);
        let report = f.queue.drain(&f.ledger).await.unwrap();
        assert!(report.skipped);
    }

    #[tokio::test]
    async fn test_retry_failed_validates_state() {
        let f = fixture(LedgerRules::default()).await;
        let seq = f.queue.enqueue_refresh(EntityType::Option, "movie").await.unwrap();
        assert!(matches!(f.queue.retry_failed(seq).await, Err(LedgerError::Validation(_))));
        assert!(matches!(f.queue.retry_failed(999).await, Err(LedgerError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_exhausted_create_releases_its_hold() {
        let f = fixture(LedgerRules::default()).await;
        f.cache.save_snapshot("alice", 500).await.unwrap();
        let local = queue_offline_redemption(&f, "movie", 300).await;
        assert_eq!(f.cache.offline_balance("alice").await.unwrap(), Some(200));
        f.ledger.set_online(false);

        for _ in 0..4 {
            f.queue.drain(&f.ledger).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let failed = f.queue.failed_operations().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(f.cache.offline_balance("alice").await.unwrap(), Some(500));
        let cached = f.cache.get_transaction(&local.id).await.unwrap().unwrap();
        assert_eq!(cached.sync_status, SyncStatus::Failed);
        assert!(cached.value.notes.unwrap().contains("sync failed"));

        // Re-queueing puts the hold back until the replay lands
        f.queue.retry_failed(failed[0].seq).await.unwrap();
        assert_eq!(f.cache.offline_balance("alice").await.unwrap(), Some(200));
        f.ledger.set_online(true);
        assert_eq!(f.queue.drain(&f.ledger).await.unwrap().synced, 1);
        assert_eq!(f.ledger.get_points("alice").await.unwrap().summary.balance, 200);
    }

    #[test]
    fn test_failed_create_blocks_later_rows() {
        let mut create = op(1, "a", OperationKind::Create);
        create.state = QueueState::Failed;
        let ops = vec![create, op(2, "a", OperationKind::Update), op(3, "b", OperationKind::Update)];

        let next = next_runnable(&ops, now_millis() + 1, &HashSet::new()).unwrap();
        assert_eq!(next.seq, 3);
        assert!(next_runnable(&ops, now_millis() + 1, &HashSet::from([3])).is_none());
    }

    #[tokio::test]
    async fn test_replayed_approval_already_applied_is_synced() {
        let f = fixture(LedgerRules { auto_complete: false, ..Default::default() }).await;
        let server = f.ledger.redeem_points(&RedeemRequest::new("alice", "movie", 300, None)).await.unwrap();

        let mut local = server.clone();
        local.status = TransactionStatus::Completed;
        f.queue
            .enqueue_status_change(&local, &StatusChange { status: TransactionStatus::Completed, reason: None })
            .await
            .unwrap();
        // The approval landed but its response was lost
        f.ledger.complete_redemption(&server.id).await.unwrap();

        let report = f.queue.drain(&f.ledger).await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(report.failed, 0);
        assert!(f.queue.failed_operations().await.unwrap().is_empty());
        let cached = f.cache.get_transaction(&server.id).await.unwrap().unwrap();
        assert_eq!(cached.value.status, TransactionStatus::Completed);
        assert_eq!(cached.sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_settle_landed_redemption() {
        let f = fixture(LedgerRules::default()).await;
        let local = queue_offline_redemption(&f, "ice-cream", 100).await;
        let request: RedeemRequest =
            serde_json::from_value(f.store.list_operations().await.unwrap()[0].payload.clone()).unwrap();
        let server = f.ledger.redeem_points(&request).await.unwrap();

        f.queue.draining.store(true, Ordering::Release);
        assert!(!f.queue.settle_landed_redemption(&local.id, &server).await.unwrap());
        f.queue.draining.store(false, Ordering::Release);

        assert!(f.queue.settle_landed_redemption(&local.id, &server).await.unwrap());
        assert_eq!(f.store.queue_len(), 0);
        assert!(f.cache.get_transaction(&local.id).await.unwrap().is_none());
        assert!(f.cache.get_transaction(&server.id).await.unwrap().unwrap().is_synced());
        assert_eq!(f.queue.stats().await.unwrap().total_synced, 1);
        assert!(!f.queue.settle_landed_redemption(&local.id, &server).await.unwrap());
    }
}
