// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local cache manager.
//!
//! Durable mirror of remote state on top of a [`LedgerStore`], tagged with
//! sync metadata:
//!
//! - **Synced** rows mirror something the remote ledger confirmed.
//! - **Dirty** rows carry local mutations the remote has not acknowledged.
//! - **Failed** rows are placeholder redemptions whose replay gave up. They
//!   stay visible in history but hold no points until re-queued.
//!
//! Mirroring never overwrites an unsynced row, and TTL eviction never removes one.
//! Reads use the same filter/sort/page contract as the remote ledger so an
//! offline answer has the same shape as an online one.
//!
//! The balance is never stored locally. The offline balance is recomputed from
//! the last earned-total snapshot minus what the cached transactions hold.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::LedgerResult;
use crate::metrics;
use crate::model::{
    now_millis, CachedRecord, PendingSyncOperation, PointsSnapshot, RedemptionOption, RedemptionTransaction,
    SyncStatus, TransactionStatus,
};
use crate::query::{sort_by_recency, OptionFilter, OptionSort, PageRequest, PaginatedResult, TransactionFilter};
use crate::storage::traits::{CachedOption, CachedTransaction, LedgerStore};

/// Row counts and dirty-row diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub options: usize,
    pub transactions: usize,
    pub dirty_options: usize,
    pub dirty_transactions: usize,
    /// Placeholder redemptions whose replay was abandoned
    pub failed_transactions: usize,
    /// `updated_at` of the oldest row still waiting for the remote
    pub oldest_dirty_at: Option<i64>,
}

impl CacheStats {
    #[must_use]
    pub fn dirty_total(&self) -> usize {
        self.dirty_options + self.dirty_transactions
    }
}

pub struct CacheManager {
    store: Arc<dyn LedgerStore>,
}

impl CacheManager {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> Arc<dyn LedgerStore> {
        Arc::clone(&self.store)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Options
    // ═══════════════════════════════════════════════════════════════════════

    /// Mirror a confirmed option. Returns `false` when an unsynced row was kept.
    pub async fn mirror_option(&self, option: &RedemptionOption) -> LedgerResult<bool> {
        if let Some(existing) = self.store.get_option(&option.id).await? {
            if !existing.is_synced() {
                debug!(id = %option.id, "Keeping dirty option over remote copy");
                return Ok(false);
            }
        }
        self.store.put_option(&CachedRecord::synced(option.clone())).await?;
        Ok(true)
    }

    /// Mirror a full catalog fetch. Returns how many rows were written.
    pub async fn mirror_options(&self, options: &[RedemptionOption]) -> LedgerResult<usize> {
        let mut written = 0;
        for option in options {
            if self.mirror_option(option).await? {
                written += 1;
            }
        }
        Ok(written)
    }

    /// Store a confirmed option even over a dirty row (the queue confirmed it).
    pub async fn confirm_option(&self, option: &RedemptionOption) -> LedgerResult<()> {
        self.store.put_option(&CachedRecord::synced(option.clone())).await?;
        Ok(())
    }

    /// Record a local catalog edit together with the operation replaying it.
    /// Returns the operation's sequence number.
    pub async fn stage_local_option(&self, option: &RedemptionOption, op: &PendingSyncOperation) -> LedgerResult<u64> {
        Ok(self.store.stage_option(&CachedRecord::dirty(option.clone()), op).await?)
    }

    pub async fn get_option(&self, id: &str) -> LedgerResult<Option<CachedOption>> {
        Ok(self.store.get_option(id).await?)
    }

    pub async fn cached_options(
        &self,
        filter: &OptionFilter,
        sort: OptionSort,
        page: PageRequest,
    ) -> LedgerResult<PaginatedResult<RedemptionOption>> {
        let now = now_millis();
        let mut options: Vec<RedemptionOption> = self
            .store
            .list_options()
            .await?
            .into_iter()
            .map(|r| r.value)
            .filter(|o| filter.matches(o, now))
            .collect();
        sort.sort(&mut options);
        Ok(PaginatedResult::from_sorted(options, page))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Transactions
    // ═══════════════════════════════════════════════════════════════════════

    /// Mirror a confirmed transaction. Returns `false` when an unsynced row was kept.
    pub async fn mirror_transaction(&self, tx: &RedemptionTransaction) -> LedgerResult<bool> {
        if let Some(existing) = self.store.get_transaction(&tx.id).await? {
            if !existing.is_synced() {
                debug!(id = %tx.id, "Keeping dirty transaction over remote copy");
                return Ok(false);
            }
        }
        self.store.put_transaction(&CachedRecord::synced(tx.clone())).await?;
        Ok(true)
    }

    pub async fn mirror_transactions(&self, txs: &[RedemptionTransaction]) -> LedgerResult<usize> {
        let mut written = 0;
        for tx in txs {
            if self.mirror_transaction(tx).await? {
                written += 1;
            }
        }
        Ok(written)
    }

    /// Store a confirmed transaction even over a dirty row.
    pub async fn confirm_transaction(&self, tx: &RedemptionTransaction) -> LedgerResult<()> {
        self.store.put_transaction(&CachedRecord::synced(tx.clone())).await?;
        Ok(())
    }

    /// Record an optimistic local transaction or transition together with the
    /// operation replaying it. Returns the operation's sequence number.
    pub async fn stage_local_transaction(
        &self,
        tx: &RedemptionTransaction,
        op: &PendingSyncOperation,
    ) -> LedgerResult<u64> {
        Ok(self.store.stage_transaction(&CachedRecord::dirty(tx.clone()), op).await?)
    }

    /// Release the hold of a placeholder whose create was abandoned. The row
    /// stays, annotated, so history still shows the attempt. Returns `false`
    /// when there is no unsynced placeholder under `id`.
    pub async fn mark_sync_failed(&self, id: &str, reason: &str) -> LedgerResult<bool> {
        let Some(mut record) = self.store.get_transaction(id).await? else {
            return Ok(false);
        };
        if record.is_synced() || !record.value.is_placeholder() {
            return Ok(false);
        }
        record.value.annotate(&format!("sync failed: {}", reason));
        record.sync_status = SyncStatus::Failed;
        record.updated_at = now_millis();
        self.store.put_transaction(&record).await?;
        debug!(id, "Placeholder marked sync-failed");
        Ok(true)
    }

    /// Put a sync-failed placeholder back on hold ahead of a manual retry.
    pub async fn mark_sync_pending(&self, id: &str) -> LedgerResult<bool> {
        let Some(mut record) = self.store.get_transaction(id).await? else {
            return Ok(false);
        };
        if record.sync_status != SyncStatus::Failed {
            return Ok(false);
        }
        record.sync_status = SyncStatus::Dirty;
        record.updated_at = now_millis();
        self.store.put_transaction(&record).await?;
        Ok(true)
    }

    pub async fn get_transaction(&self, id: &str) -> LedgerResult<Option<CachedTransaction>> {
        Ok(self.store.get_transaction(id).await?)
    }

    pub async fn find_by_client_ref(&self, client_ref: &str) -> LedgerResult<Option<CachedTransaction>> {
        Ok(self.store.find_transaction_by_client_ref(client_ref).await?)
    }

    pub async fn cached_transactions(
        &self,
        user_id: &str,
        filter: &TransactionFilter,
        page: PageRequest,
    ) -> LedgerResult<PaginatedResult<RedemptionTransaction>> {
        let mut txs: Vec<RedemptionTransaction> = self
            .store
            .list_transactions(Some(user_id))
            .await?
            .into_iter()
            .map(|r| r.value)
            .filter(|tx| filter.matches(tx))
            .collect();
        sort_by_recency(&mut txs);
        Ok(PaginatedResult::from_sorted(txs, page))
    }

    /// Placeholder rows for a user that the remote has not acknowledged,
    /// including ones whose replay failed.
    pub async fn unsynced_transactions(&self, user_id: &str) -> LedgerResult<Vec<RedemptionTransaction>> {
        let mut txs: Vec<RedemptionTransaction> = self
            .store
            .list_transactions(Some(user_id))
            .await?
            .into_iter()
            .filter(|r| !r.is_synced() && r.value.is_placeholder())
            .map(|r| r.value)
            .collect();
        sort_by_recency(&mut txs);
        Ok(txs)
    }

    /// Swap a placeholder for its server row and rewrite queued references.
    ///
    /// A placeholder that already moved past `Pending` locally carries a
    /// queued transition: the merged row keeps the local status and notes
    /// and stays dirty until that transition replays.
    pub async fn replace_placeholder(
        &self,
        placeholder_id: &str,
        server_tx: &RedemptionTransaction,
    ) -> LedgerResult<usize> {
        let local = self.store.get_transaction(placeholder_id).await?;

        let record = match local {
            Some(local) if local.value.status != TransactionStatus::Pending && local.value.status != server_tx.status => {
                CachedRecord::dirty(RedemptionTransaction {
                    status: local.value.status,
                    notes: local.value.notes,
                    completed_at: local.value.completed_at,
                    ..server_tx.clone()
                })
            }
            _ => CachedRecord::synced(server_tx.clone()),
        };

        let rewritten = self.store.replace_transaction(placeholder_id, &record).await?;
        debug!(placeholder_id, server_id = %server_tx.id, rewritten, "Placeholder replaced");
        Ok(rewritten)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Points
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn save_snapshot(&self, user_id: &str, earned_total: i64) -> LedgerResult<()> {
        let snapshot = PointsSnapshot {
            user_id: user_id.to_string(),
            earned_total,
            captured_at: now_millis(),
        };
        self.store.put_points_snapshot(&snapshot).await?;
        Ok(())
    }

    pub async fn snapshot(&self, user_id: &str) -> LedgerResult<Option<PointsSnapshot>> {
        Ok(self.store.get_points_snapshot(user_id).await?)
    }

    /// Sum of `points_used` over cached transactions whose status is in `statuses`
    /// (every status when empty). Sync-failed placeholders hold nothing.
    pub async fn cached_redeemed_points(&self, user_id: &str, statuses: &[TransactionStatus]) -> LedgerResult<i64> {
        Ok(self
            .store
            .list_transactions(Some(user_id))
            .await?
            .iter()
            .filter(|r| r.sync_status != SyncStatus::Failed)
            .filter(|r| statuses.is_empty() || statuses.contains(&r.value.status))
            .map(|r| r.value.points_used)
            .sum())
    }

    /// Snapshot earned total minus pending and completed cached redemptions.
    /// `None` when no snapshot was ever captured for the user.
    pub async fn offline_balance(&self, user_id: &str) -> LedgerResult<Option<i64>> {
        let Some(snapshot) = self.snapshot(user_id).await? else {
            return Ok(None);
        };
        let held = self
            .cached_redeemed_points(user_id, &[TransactionStatus::Pending, TransactionStatus::Completed])
            .await?;
        Ok(Some(snapshot.earned_total - held))
    }

    /// Difference between local optimistic state and the remote balance.
    ///
    /// Unacknowledged placeholder redemptions debit; unacknowledged local
    /// cancellations of server transactions credit back.
    pub async fn unsynced_adjustment(&self, user_id: &str) -> LedgerResult<i64> {
        let mut adjustment = 0;
        for record in self.store.list_transactions(Some(user_id)).await? {
            if !record.is_dirty() {
                continue;
            }
            let tx = &record.value;
            if tx.is_placeholder() {
                if tx.status.debits_balance() {
                    adjustment -= tx.points_used;
                }
            } else if tx.status == TransactionStatus::Cancelled {
                adjustment += tx.points_used;
            }
        }
        Ok(adjustment)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Maintenance
    // ═══════════════════════════════════════════════════════════════════════

    /// Evict synced rows last written before `now - older_than`.
    ///
    /// Pending and completed transactions stay: the offline balance is
    /// recomputed from them.
    pub async fn clear_expired(&self, older_than: Duration) -> LedgerResult<usize> {
        let cutoff = now_millis() - older_than.as_millis() as i64;
        let mut evicted = 0;

        for record in self.store.list_options().await? {
            if record.is_synced() && record.updated_at < cutoff {
                self.store.delete_option(&record.value.id).await?;
                evicted += 1;
            }
        }
        for record in self.store.list_transactions(None).await? {
            if record.is_synced() && !record.value.status.debits_balance() && record.updated_at < cutoff {
                self.store.delete_transaction(&record.value.id).await?;
                evicted += 1;
            }
        }

        if evicted > 0 {
            debug!(evicted, "Evicted expired cache rows");
            metrics::record_eviction(evicted);
        }
        Ok(evicted)
    }

    pub async fn stats(&self) -> LedgerResult<CacheStats> {
        let options = self.store.list_options().await?;
        let transactions = self.store.list_transactions(None).await?;

        let dirty_options: Vec<i64> = options.iter().filter(|r| r.is_dirty()).map(|r| r.updated_at).collect();
        let dirty_transactions: Vec<i64> =
            transactions.iter().filter(|r| r.is_dirty()).map(|r| r.updated_at).collect();

        let stats = CacheStats {
            options: options.len(),
            transactions: transactions.len(),
            dirty_options: dirty_options.len(),
            dirty_transactions: dirty_transactions.len(),
            failed_transactions: transactions.iter().filter(|r| r.sync_status == SyncStatus::Failed).count(),
            oldest_dirty_at: dirty_options.iter().chain(dirty_transactions.iter()).min().copied(),
        };
        metrics::set_cache_rows(stats.options, stats.transactions, stats.dirty_total());
        Ok(stats)
    }
}
