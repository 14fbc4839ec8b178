// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redemption write path.

use tracing::{debug, info, warn};

use super::{RedemptionCoordinator, TransactionResult};
use crate::error::{LedgerError, LedgerResult};
use crate::metrics;
use crate::model::{now_millis, RedeemRequest, RedemptionTransaction};
use crate::remote::traits::RemoteLedger;

impl RedemptionCoordinator {
    /// Redeem `points_used` points for `option_id`.
    ///
    /// The balance check uses the best-known balance: the remote one when
    /// reachable, otherwise the cached aggregate. A transient remote failure
    /// records a local `Pending` placeholder and queues the request, so the
    /// result carries `pending_sync = true`. Business errors
    /// (`InsufficientPoints`, `OptionUnavailable`, `Validation`) are returned
    /// and nothing is queued.
    #[tracing::instrument(skip(self, notes), fields(user_id = %user_id, option_id = %option_id, points = points_used))]
    pub async fn redeem_points(
        &self,
        user_id: &str,
        option_id: &str,
        points_used: i64,
        notes: Option<String>,
    ) -> LedgerResult<TransactionResult> {
        self.validate_shape(user_id, option_id, points_used)?;

        let (available, online) = self.best_known_balance(user_id).await?;
        if available < points_used {
            metrics::record_redemption("rejected", points_used);
            debug!(available, "Insufficient points");
            return Err(LedgerError::InsufficientPoints { required: points_used, available });
        }

        let request = RedeemRequest::new(user_id, option_id, points_used, notes);

        // A reachable ledger during the balance read still gets a fresh
        // attempt here; it re-validates everything at commit time.
        let remote_result = if online || self.remote.is_healthy() {
            self.remote.redeem_points(&request).await
        } else {
            Err(LedgerError::Network("remote ledger marked unhealthy".into()))
        };

        match remote_result {
            Ok(tx) => {
                self.confirm_quietly(&tx).await;
                metrics::record_redemption("online", points_used);
                info!(id = %tx.id, status = %tx.status, "Redemption committed");
                self.notify_points(user_id).await;
                Ok(TransactionResult { transaction: tx, pending_sync: false })
            }
            Err(e) if e.is_transient() => {
                warn!(error = %e, "Remote ledger unavailable, recording redemption offline");
                let tx = self.record_offline_redemption(&request).await?;
                metrics::record_redemption("offline", points_used);
                self.notify_points(user_id).await;
                Ok(TransactionResult { transaction: tx, pending_sync: true })
            }
            Err(e) => {
                metrics::record_redemption("rejected", points_used);
                Err(e)
            }
        }
    }

    /// Local placeholder plus queued `create` for a redemption the remote
    /// could not take.
    async fn record_offline_redemption(&self, request: &RedeemRequest) -> LedgerResult<RedemptionTransaction> {
        let title = match self.cache.get_option(&request.option_id).await? {
            Some(cached) => {
                let option = &cached.value;
                if !option.is_redeemable(now_millis()) {
                    return Err(LedgerError::OptionUnavailable(option.id.clone()));
                }
                if option.points_cost != request.points_used {
                    return Err(LedgerError::Validation(format!(
                        "option '{}' costs {} points, request used {}",
                        option.id, option.points_cost, request.points_used
                    )));
                }
                option.title.clone()
            }
            None => {
                debug!(option_id = %request.option_id, "Option not cached, server will validate on replay");
                request.option_id.clone()
            }
        };

        let tx = RedemptionTransaction::local_pending(request, title);
        let seq = self.queue.enqueue_redemption(&tx, request).await?;
        info!(id = %tx.id, seq, "Redemption queued for sync");
        Ok(tx)
    }
}
