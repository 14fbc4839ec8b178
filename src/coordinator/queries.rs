// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Read surface, with cache fallback when the remote ledger is unreachable.

use tokio::sync::watch;
use tracing::{debug, warn};

use super::RedemptionCoordinator;
use crate::error::{LedgerError, LedgerResult};
use crate::metrics;
use crate::model::{now_millis, PointsAccount, RedemptionOption, RedemptionStats, RedemptionTransaction};
use crate::query::{OptionFilter, OptionSort, PageRequest, PaginatedResult, TransactionFilter};
use crate::remote::check_redemption;
use crate::remote::traits::RemoteLedger;

impl RedemptionCoordinator {
    /// Best-known available balance (see [`redeem_points`](Self::redeem_points)).
    pub async fn available_points(&self, user_id: &str) -> LedgerResult<i64> {
        self.best_known_balance(user_id).await.map(|(balance, _)| balance)
    }

    /// Watch a user's available points.
    ///
    /// The receiver starts at the current value and is updated after every
    /// write that touches the user's balance, online or offline.
    pub async fn subscribe_available_points(&self, user_id: &str) -> LedgerResult<watch::Receiver<i64>> {
        let current = self.available_points(user_id).await?;
        let sender = self
            .points_watchers
            .entry(user_id.to_string())
            .or_insert_with(|| watch::channel(current).0);
        sender.send_replace(current);
        Ok(sender.subscribe())
    }

    /// A user's redemptions, most recent first.
    ///
    /// Online results overlay locally modified rows and, on the first page,
    /// lead with redemptions still waiting for sync.
    #[tracing::instrument(skip(self, filter))]
    pub async fn redemption_history(
        &self,
        user_id: &str,
        filter: &TransactionFilter,
        page: PageRequest,
    ) -> LedgerResult<PaginatedResult<RedemptionTransaction>> {
        match self.remote.get_redemption_history(user_id, page, filter).await {
            Ok(mut result) => {
                if let Err(e) = self.cache.mirror_transactions(&result.items).await {
                    warn!(error = %e, "Failed to mirror history");
                }
                for item in result.items.iter_mut() {
                    if let Some(local) = self.cache.get_transaction(&item.id).await? {
                        if !local.is_synced() {
                            *item = local.value;
                        }
                    }
                }
                let unsynced: Vec<RedemptionTransaction> = self
                    .cache
                    .unsynced_transactions(user_id)
                    .await?
                    .into_iter()
                    .filter(|tx| filter.matches(tx))
                    .collect();
                result.total += unsynced.len() as u64;
                if page.page == 1 && !unsynced.is_empty() {
                    result.items.splice(0..0, unsynced);
                }
                Ok(result)
            }
            Err(e) if e.is_transient() => {
                debug!(error = %e, "Serving history from cache");
                metrics::record_cache_fallback("history");
                self.cache.cached_transactions(user_id, filter, page).await
            }
            Err(e) => Err(e),
        }
    }

    /// Catalog view. Online reads refresh the cache first, so locally edited
    /// options still show their pending values.
    #[tracing::instrument(skip(self, filter))]
    pub async fn redemption_options(
        &self,
        filter: &OptionFilter,
        sort: OptionSort,
        page: PageRequest,
    ) -> LedgerResult<PaginatedResult<RedemptionOption>> {
        match self.remote.get_options().await {
            Ok(mut options) => match self.cache.mirror_options(&options).await {
                Ok(_) => self.cache.cached_options(filter, sort, page).await,
                Err(e) => {
                    warn!(error = %e, "Failed to mirror catalog, serving remote copy");
                    let now = now_millis();
                    options.retain(|o| filter.matches(o, now));
                    sort.sort(&mut options);
                    Ok(PaginatedResult::from_sorted(options, page))
                }
            },
            Err(e) if e.is_transient() => {
                debug!(error = %e, "Serving catalog from cache");
                metrics::record_cache_fallback("options");
                self.cache.cached_options(filter, sort, page).await
            }
            Err(e) => Err(e),
        }
    }

    pub async fn redemption_stats(&self, user_id: &str) -> LedgerResult<RedemptionStats> {
        match self.remote.get_stats(user_id).await {
            Ok(stats) => Ok(stats),
            Err(e) if e.is_transient() => {
                metrics::record_cache_fallback("stats");
                let rows = self.cache.store().list_transactions(Some(user_id)).await?;
                Ok(RedemptionStats::from_transactions(rows.iter().map(|r| &r.value)))
            }
            Err(e) => Err(e),
        }
    }

    /// Dry run of [`redeem_points`](Self::redeem_points).
    ///
    /// Offline, the cached option (when known) and the cached balance are
    /// checked with the same rules the ledger applies.
    pub async fn check_eligibility(&self, user_id: &str, option_id: &str, points_used: i64) -> LedgerResult<()> {
        self.validate_shape(user_id, option_id, points_used)?;

        match self.remote.validate_redemption_eligibility(user_id, option_id, points_used).await {
            Ok(()) => {
                // The ledger cannot see redemptions still in the queue
                if self.cache.unsynced_adjustment(user_id).await? < 0 {
                    let (available, _) = self.best_known_balance(user_id).await?;
                    if available < points_used {
                        return Err(LedgerError::InsufficientPoints { required: points_used, available });
                    }
                }
                Ok(())
            }
            Err(e) if e.is_transient() => {
                metrics::record_cache_fallback("eligibility");
                let available = self.cache.offline_balance(user_id).await?.ok_or(e)?;
                match self.cache.get_option(option_id).await? {
                    Some(cached) => {
                        check_redemption(Some(&cached.value), option_id, points_used, available, now_millis())
                    }
                    None if available < points_used => {
                        Err(LedgerError::InsufficientPoints { required: points_used, available })
                    }
                    None => Ok(()),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// One transaction. Locally modified rows win over the remote copy.
    pub async fn transaction(&self, transaction_id: &str) -> LedgerResult<RedemptionTransaction> {
        let cached = self.cache.get_transaction(transaction_id).await?;
        if let Some(record) = &cached {
            if !record.is_synced() {
                return Ok(record.value.clone());
            }
        }

        match self.remote.get_transaction(transaction_id).await {
            Ok(tx) => {
                if let Err(e) = self.cache.mirror_transaction(&tx).await {
                    warn!(id = %tx.id, error = %e, "Failed to mirror transaction");
                }
                Ok(tx)
            }
            Err(e) if e.is_transient() => cached.map(|r| r.value).ok_or(e),
            Err(e) => Err(e),
        }
    }

    /// Credit earned points. Requires the remote ledger.
    #[tracing::instrument(skip(self, reason))]
    pub async fn award_points(&self, user_id: &str, points: i64, reason: &str) -> LedgerResult<PointsAccount> {
        if points <= 0 {
            return Err(LedgerError::Validation(format!("award must be positive, got {}", points)));
        }
        let account = self.remote.award_points(user_id, points, reason).await?;
        if let Err(e) = self.cache.save_snapshot(user_id, account.summary.earned_total).await {
            warn!(user_id, error = %e, "Failed to snapshot points");
        }
        self.notify_points(user_id).await;
        Ok(account)
    }
}
