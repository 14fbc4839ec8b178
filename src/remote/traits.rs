// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;

use crate::error::LedgerResult;
use crate::model::{PointsAccount, RedeemRequest, RedemptionOption, RedemptionStats, RedemptionTransaction};
use crate::query::{PageRequest, PaginatedResult, TransactionFilter};

/// The authoritative points ledger.
///
/// Every mutation is a single atomic unit on the implementation side: either
/// all of its effects (balance, option counter, transaction row) are applied
/// or none are.
#[async_trait]
pub trait RemoteLedger: Send + Sync {
    /// Redeem points for an option.
    ///
    /// Re-validates the option and the balance at commit time and fails with
    /// `InsufficientPoints` when the balance cannot cover `points_used`.
    /// A request whose `client_ref` was already committed returns the
    /// existing transaction unchanged.
    async fn redeem_points(&self, request: &RedeemRequest) -> LedgerResult<RedemptionTransaction>;

    /// Cancel a pending redemption within the cancellation window and refund its points.
    async fn cancel_redemption(
        &self,
        transaction_id: &str,
        reason: Option<&str>,
    ) -> LedgerResult<RedemptionTransaction>;

    /// Approve a pending redemption.
    async fn complete_redemption(&self, transaction_id: &str) -> LedgerResult<RedemptionTransaction>;

    async fn get_options(&self) -> LedgerResult<Vec<RedemptionOption>>;

    async fn get_option(&self, option_id: &str) -> LedgerResult<RedemptionOption>;

    async fn get_transaction(&self, transaction_id: &str) -> LedgerResult<RedemptionTransaction>;

    /// The transaction committed for an idempotency key, if any.
    async fn find_transaction_by_client_ref(&self, client_ref: &str) -> LedgerResult<Option<RedemptionTransaction>>;

    /// A user's transactions, most recent first.
    async fn get_redemption_history(
        &self,
        user_id: &str,
        page: PageRequest,
        filter: &TransactionFilter,
    ) -> LedgerResult<PaginatedResult<RedemptionTransaction>>;

    /// Dry run of the checks `redeem_points` performs.
    async fn validate_redemption_eligibility(
        &self,
        user_id: &str,
        option_id: &str,
        points_used: i64,
    ) -> LedgerResult<()>;

    async fn get_points(&self, user_id: &str) -> LedgerResult<PointsAccount>;

    async fn get_stats(&self, user_id: &str) -> LedgerResult<RedemptionStats>;

    /// Credit earned points (task completion, bonuses).
    async fn award_points(&self, user_id: &str, points: i64, reason: &str) -> LedgerResult<PointsAccount>;

    /// Create or replace a catalog entry.
    async fn upsert_option(&self, option: &RedemptionOption) -> LedgerResult<RedemptionOption>;

    /// Soft-delete a catalog entry.
    async fn archive_option(&self, option_id: &str) -> LedgerResult<RedemptionOption>;

    /// Cheap reachability check.
    async fn ping(&self) -> LedgerResult<()>;
}
