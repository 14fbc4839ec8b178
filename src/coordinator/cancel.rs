// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Status transitions: cancellation (with refund) and approval.

use tracing::{info, warn};

use super::{RedemptionCoordinator, TransactionResult};
use crate::error::{LedgerError, LedgerResult};
use crate::metrics;
use crate::model::{now_millis, RedemptionTransaction, StatusChange, TransactionStatus, PLACEHOLDER_PREFIX};
use crate::remote::check_cancellation;
use crate::remote::traits::RemoteLedger;

impl RedemptionCoordinator {
    /// Cancel a pending redemption and refund its points.
    ///
    /// Only `Pending` transactions inside the cancellation window can be
    /// cancelled. Offline, the cancellation is applied to the cached row and
    /// queued; a placeholder that never reached the server is cancelled
    /// locally and its queued create replays before the cancellation.
    #[tracing::instrument(skip(self, reason))]
    pub async fn cancel_redemption(&self, transaction_id: &str, reason: Option<String>) -> LedgerResult<TransactionResult> {
        let result = self
            .transition(transaction_id, StatusChange { status: TransactionStatus::Cancelled, reason })
            .await;
        let outcome = match &result {
            Ok(r) if r.pending_sync => "offline",
            Ok(_) => "online",
            Err(_) => "rejected",
        };
        metrics::record_cancellation(outcome);
        result
    }

    /// Move a transaction to `status`.
    ///
    /// `Cancelled` behaves like [`cancel_redemption`](Self::cancel_redemption);
    /// `Completed` approves a pending redemption. `Pending` is never a valid
    /// target.
    #[tracing::instrument(skip(self))]
    pub async fn update_transaction_status(
        &self,
        transaction_id: &str,
        status: TransactionStatus,
    ) -> LedgerResult<TransactionResult> {
        match status {
            TransactionStatus::Cancelled => self.cancel_redemption(transaction_id, None).await,
            TransactionStatus::Completed => {
                let result = self.transition(transaction_id, StatusChange { status, reason: None }).await;
                metrics::record_operation("coordinator", "complete", if result.is_ok() { "ok" } else { "error" });
                result
            }
            TransactionStatus::Pending => Err(LedgerError::Validation(format!(
                "'{}' cannot be moved back to pending",
                transaction_id
            ))),
        }
    }

    async fn transition(&self, transaction_id: &str, change: StatusChange) -> LedgerResult<TransactionResult> {
        if change.status == TransactionStatus::Pending {
            return Err(LedgerError::Validation("pending is not a transition target".into()));
        }

        let cached = self.cache.get_transaction(transaction_id).await?.map(|r| r.value);
        if let Some(tx) = &cached {
            self.precheck(tx, change.status)?;
        }

        if transaction_id.starts_with(PLACEHOLDER_PREFIX) {
            // The server has never seen this id: everything stays local
            let tx = cached.ok_or_else(|| LedgerError::NotFound(format!("transaction '{}'", transaction_id)))?;
            let tx = self.apply_locally(tx, &change).await?;
            return Ok(TransactionResult { transaction: tx, pending_sync: true });
        }

        let remote_result = match change.status {
            TransactionStatus::Cancelled => {
                self.remote.cancel_redemption(transaction_id, change.reason.as_deref()).await
            }
            _ => self.remote.complete_redemption(transaction_id).await,
        };

        match remote_result {
            Ok(tx) => {
                self.confirm_quietly(&tx).await;
                info!(id = %tx.id, status = %tx.status, "Transition committed");
                self.notify_points(&tx.user_id).await;
                Ok(TransactionResult { transaction: tx, pending_sync: false })
            }
            Err(e) if e.is_transient() => match cached {
                Some(tx) => {
                    warn!(error = %e, "Remote ledger unavailable, recording transition offline");
                    let tx = self.apply_locally(tx, &change).await?;
                    Ok(TransactionResult { transaction: tx, pending_sync: true })
                }
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    /// State machine and window checks against the local copy.
    fn precheck(&self, tx: &RedemptionTransaction, target: TransactionStatus) -> LedgerResult<()> {
        match target {
            TransactionStatus::Cancelled => check_cancellation(tx, &self.config.ledger_rules(), now_millis()),
            _ => tx.status.ensure_transition(target),
        }
    }

    async fn apply_locally(&self, mut tx: RedemptionTransaction, change: &StatusChange) -> LedgerResult<RedemptionTransaction> {
        tx.status = change.status;
        match change.status {
            TransactionStatus::Cancelled => {
                tx.annotate(&format!("cancelled: {}", change.reason.as_deref().unwrap_or("no reason given")));
            }
            TransactionStatus::Completed => tx.completed_at = Some(now_millis()),
            TransactionStatus::Pending => {}
        }

        let seq = self.queue.enqueue_status_change(&tx, change).await?;
        info!(id = %tx.id, status = %tx.status, seq, "Transition queued for sync");
        self.notify_points(&tx.user_id).await;
        Ok(tx)
    }
}
