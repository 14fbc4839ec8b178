// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Single-process ledger.
//!
//! All state sits behind one mutex and every operation runs under a single
//! acquisition, which makes each mutation atomic and serializes concurrent
//! redemptions against the same balance. Connectivity can be switched off
//! and latency injected to exercise the offline paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::traits::RemoteLedger;
use super::{check_cancellation, check_redemption, LedgerRules};
use crate::error::{LedgerError, LedgerResult};
use crate::model::{
    now_millis, PointsAccount, PointsSummary, RedeemRequest, RedemptionOption, RedemptionStats,
    RedemptionTransaction, TransactionStatus,
};
use crate::query::{sort_by_recency, PageRequest, PaginatedResult, TransactionFilter};

#[derive(Default)]
struct LedgerState {
    accounts: HashMap<String, PointsSummary>,
    options: HashMap<String, RedemptionOption>,
    transactions: HashMap<String, RedemptionTransaction>,
    by_client_ref: HashMap<String, String>,
    next_id: u64,
}

impl LedgerState {
    fn account(&self, user_id: &str) -> PointsSummary {
        self.accounts.get(user_id).copied().unwrap_or(PointsSummary {
            earned_total: 0,
            redeemed_total: 0,
            balance: 0,
            updated_at: 0,
        })
    }

    fn transaction_mut(&mut self, id: &str) -> LedgerResult<&mut RedemptionTransaction> {
        self.transactions
            .get_mut(id)
            .ok_or_else(|| LedgerError::NotFound(format!("transaction '{}'", id)))
    }

    fn adjust_redeemed(&mut self, user_id: &str, delta: i64, now: i64) {
        let account = self.accounts.entry(user_id.to_string()).or_insert(PointsSummary {
            earned_total: 0,
            redeemed_total: 0,
            balance: 0,
            updated_at: now,
        });
        account.redeemed_total += delta;
        account.balance = account.earned_total - account.redeemed_total;
        account.updated_at = now;
    }
}

pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
    rules: LedgerRules,
    online: AtomicBool,
    latency_ms: AtomicU64,
    calls: AtomicU64,
}

impl InMemoryLedger {
    pub fn new(rules: LedgerRules) -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            rules,
            online: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
            calls: AtomicU64::new(0),
        }
    }

    /// Simulate losing (or regaining) connectivity.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Delay applied before every call is served.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Calls that reached the ledger (online or not).
    #[must_use]
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Seed an option without going through the API (test fixtures).
    pub fn insert_option(&self, option: RedemptionOption) {
        self.state.lock().options.insert(option.id.clone(), option);
    }

    /// Number of committed transactions.
    #[must_use]
    pub fn transaction_count(&self) -> usize {
        self.state.lock().transactions.len()
    }

    async fn gate(&self) -> LedgerResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.is_online() {
            Ok(())
        } else {
            Err(LedgerError::Network("ledger unreachable".into()))
        }
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new(LedgerRules::default())
    }
}

#[async_trait]
impl RemoteLedger for InMemoryLedger {
    async fn redeem_points(&self, request: &RedeemRequest) -> LedgerResult<RedemptionTransaction> {
        self.gate().await?;
        let now = now_millis();
        let mut state = self.state.lock();

        if let Some(existing) = state.by_client_ref.get(&request.client_ref) {
            if let Some(tx) = state.transactions.get(existing) {
                debug!(client_ref = %request.client_ref, id = %tx.id, "Coalesced duplicate redemption");
                return Ok(tx.clone());
            }
        }

        let account = state.account(&request.user_id);
        let available = account.earned_total - account.redeemed_total;
        check_redemption(
            state.options.get(&request.option_id),
            &request.option_id,
            request.points_used,
            available,
            now,
        )?;

        let option_title = match state.options.get_mut(&request.option_id) {
            Some(option) => {
                option.redemption_count += 1;
                option.version += 1;
                option.updated_at = now;
                option.title.clone()
            }
            None => return Err(LedgerError::NotFound(format!("option '{}'", request.option_id))),
        };
        state.adjust_redeemed(&request.user_id, request.points_used, now);

        state.next_id += 1;
        let status = self.rules.initial_status();
        let tx = RedemptionTransaction {
            id: format!("rdm-{:06}", state.next_id),
            client_ref: request.client_ref.clone(),
            user_id: request.user_id.clone(),
            option_id: request.option_id.clone(),
            option_title,
            points_used: request.points_used,
            status,
            created_at: now,
            redeemed_at: now,
            completed_at: (status == TransactionStatus::Completed).then_some(now),
            notes: request.notes.clone(),
            version: 1,
        };
        state.by_client_ref.insert(tx.client_ref.clone(), tx.id.clone());
        state.transactions.insert(tx.id.clone(), tx.clone());
        Ok(tx)
    }

    async fn cancel_redemption(
        &self,
        transaction_id: &str,
        reason: Option<&str>,
    ) -> LedgerResult<RedemptionTransaction> {
        self.gate().await?;
        let now = now_millis();
        let mut state = self.state.lock();

        let rules = self.rules;
        let tx = state.transaction_mut(transaction_id)?;
        check_cancellation(tx, &rules, now)?;
        tx.status = TransactionStatus::Cancelled;
        tx.version += 1;
        tx.annotate(&format!("cancelled: {}", reason.unwrap_or("no reason given")));
        let tx = tx.clone();

        state.adjust_redeemed(&tx.user_id, -tx.points_used, now);
        if let Some(option) = state.options.get_mut(&tx.option_id) {
            option.redemption_count = option.redemption_count.saturating_sub(1);
            option.version += 1;
            option.updated_at = now;
        }
        Ok(tx)
    }

    async fn complete_redemption(&self, transaction_id: &str) -> LedgerResult<RedemptionTransaction> {
        self.gate().await?;
        let now = now_millis();
        let mut state = self.state.lock();

        let tx = state.transaction_mut(transaction_id)?;
        tx.status.ensure_transition(TransactionStatus::Completed)?;
        tx.status = TransactionStatus::Completed;
        tx.completed_at = Some(now);
        tx.version += 1;
        Ok(tx.clone())
    }

    async fn get_options(&self) -> LedgerResult<Vec<RedemptionOption>> {
        self.gate().await?;
        Ok(self.state.lock().options.values().cloned().collect())
    }

    async fn get_option(&self, option_id: &str) -> LedgerResult<RedemptionOption> {
        self.gate().await?;
        self.state
            .lock()
            .options
            .get(option_id)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("option '{}'", option_id)))
    }

    async fn get_transaction(&self, transaction_id: &str) -> LedgerResult<RedemptionTransaction> {
        self.gate().await?;
        self.state
            .lock()
            .transactions
            .get(transaction_id)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("transaction '{}'", transaction_id)))
    }

    async fn find_transaction_by_client_ref(&self, client_ref: &str) -> LedgerResult<Option<RedemptionTransaction>> {
        self.gate().await?;
        let state = self.state.lock();
        let found = state.by_client_ref.get(client_ref).and_then(|id| state.transactions.get(id)).cloned();
        Ok(found)
    }

    async fn get_redemption_history(
        &self,
        user_id: &str,
        page: PageRequest,
        filter: &TransactionFilter,
    ) -> LedgerResult<PaginatedResult<RedemptionTransaction>> {
        self.gate().await?;
        let mut txs: Vec<RedemptionTransaction> = self
            .state
            .lock()
            .transactions
            .values()
            .filter(|tx| tx.user_id == user_id && filter.matches(tx))
            .cloned()
            .collect();
        sort_by_recency(&mut txs);
        Ok(PaginatedResult::from_sorted(txs, page))
    }

    async fn validate_redemption_eligibility(
        &self,
        user_id: &str,
        option_id: &str,
        points_used: i64,
    ) -> LedgerResult<()> {
        self.gate().await?;
        let state = self.state.lock();
        let account = state.account(user_id);
        check_redemption(
            state.options.get(option_id),
            option_id,
            points_used,
            account.earned_total - account.redeemed_total,
            now_millis(),
        )
    }

    async fn get_points(&self, user_id: &str) -> LedgerResult<PointsAccount> {
        self.gate().await?;
        let mut summary = self.state.lock().account(user_id);
        summary.balance = summary.earned_total - summary.redeemed_total;
        Ok(PointsAccount { user_id: user_id.to_string(), summary })
    }

    async fn get_stats(&self, user_id: &str) -> LedgerResult<RedemptionStats> {
        self.gate().await?;
        let state = self.state.lock();
        Ok(RedemptionStats::from_transactions(
            state.transactions.values().filter(|tx| tx.user_id == user_id),
        ))
    }

    async fn award_points(&self, user_id: &str, points: i64, reason: &str) -> LedgerResult<PointsAccount> {
        self.gate().await?;
        if points <= 0 {
            return Err(LedgerError::Validation(format!("award must be positive, got {}", points)));
        }
        let now = now_millis();
        let mut state = self.state.lock();
        let account = state.accounts.entry(user_id.to_string()).or_insert(PointsSummary {
            earned_total: 0,
            redeemed_total: 0,
            balance: 0,
            updated_at: now,
        });
        account.earned_total += points;
        account.balance = account.earned_total - account.redeemed_total;
        account.updated_at = now;
        debug!(user_id, points, reason, "Points awarded");
        Ok(PointsAccount { user_id: user_id.to_string(), summary: *account })
    }

    async fn upsert_option(&self, option: &RedemptionOption) -> LedgerResult<RedemptionOption> {
        self.gate().await?;
        option.validate()?;
        let now = now_millis();
        let mut state = self.state.lock();
        let stored = match state.options.get(&option.id) {
            Some(existing) => RedemptionOption {
                redemption_count: existing.redemption_count,
                created_at: existing.created_at,
                version: existing.version + 1,
                updated_at: now,
                ..option.clone()
            },
            None => RedemptionOption { version: 1, updated_at: now, ..option.clone() },
        };
        state.options.insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }

    async fn archive_option(&self, option_id: &str) -> LedgerResult<RedemptionOption> {
        self.gate().await?;
        let mut state = self.state.lock();
        let option = state
            .options
            .get_mut(option_id)
            .ok_or_else(|| LedgerError::NotFound(format!("option '{}'", option_id)))?;
        option.is_active = false;
        option.version += 1;
        option.updated_at = now_millis();
        Ok(option.clone())
    }

    async fn ping(&self) -> LedgerResult<()> {
        self.gate().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn seeded(rules: LedgerRules) -> InMemoryLedger {
        let ledger = InMemoryLedger::new(rules);
        ledger.insert_option(RedemptionOption::new("movie", "Movie night", 300));
        ledger.insert_option(RedemptionOption::new("ice-cream", "Ice cream", 100));
        ledger.award_points("alice", 500, "chores").await.unwrap();
        ledger
    }

    fn approval() -> LedgerRules {
        LedgerRules { auto_complete: false, ..Default::default() }
    }

    #[tokio::test]
    async fn test_redeem_debits_and_counts() {
        let ledger = seeded(LedgerRules::default()).await;

        let tx = ledger.redeem_points(&RedeemRequest::new("alice", "movie", 300, None)).await.unwrap();
        assert_eq!(tx.status, TransactionStatus::Completed);
        assert!(tx.completed_at.is_some());
        assert_eq!(tx.option_title, "Movie night");

        let points = ledger.get_points("alice").await.unwrap();
        assert_eq!(points.summary.balance, 200);
        assert_eq!(points.summary.redeemed_total, 300);
        assert_eq!(ledger.get_option("movie").await.unwrap().redemption_count, 1);
    }

    #[tokio::test]
    async fn test_redeem_insufficient() {
        let ledger = seeded(LedgerRules::default()).await;
        ledger.insert_option(RedemptionOption::new("bike", "Bike", 900));

        let err = ledger.redeem_points(&RedeemRequest::new("alice", "bike", 900, None)).await.unwrap_err();
        assert_eq!(err, LedgerError::InsufficientPoints { required: 900, available: 500 });
        assert_eq!(ledger.transaction_count(), 0);
    }

    #[tokio::test]
    async fn test_redeem_is_idempotent_on_client_ref() {
        let ledger = seeded(LedgerRules::default()).await;
        let request = RedeemRequest::new("alice", "ice-cream", 100, None);

        let first = ledger.redeem_points(&request).await.unwrap();
        let second = ledger.redeem_points(&request).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(ledger.transaction_count(), 1);
        assert_eq!(ledger.get_points("alice").await.unwrap().summary.balance, 400);
    }

    #[tokio::test]
    async fn test_cancel_refunds_pending() {
        let ledger = seeded(approval()).await;
        let tx = ledger.redeem_points(&RedeemRequest::new("alice", "movie", 300, None)).await.unwrap();
        assert_eq!(tx.status, TransactionStatus::Pending);

        let cancelled = ledger.cancel_redemption(&tx.id, Some("changed mind")).await.unwrap();
        assert_eq!(cancelled.status, TransactionStatus::Cancelled);
        assert!(cancelled.notes.unwrap().contains("changed mind"));
        assert_eq!(ledger.get_points("alice").await.unwrap().summary.balance, 500);
        assert_eq!(ledger.get_option("movie").await.unwrap().redemption_count, 0);

        // second cancel is a state machine violation
        assert!(matches!(
            ledger.cancel_redemption(&tx.id, None).await,
            Err(LedgerError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_completed_rejected() {
        let ledger = seeded(LedgerRules::default()).await;
        let tx = ledger.redeem_points(&RedeemRequest::new("alice", "movie", 300, None)).await.unwrap();

        assert!(matches!(
            ledger.cancel_redemption(&tx.id, None).await,
            Err(LedgerError::Validation(_))
        ));
        assert_eq!(ledger.get_points("alice").await.unwrap().summary.balance, 200);
    }

    #[tokio::test]
    async fn test_cancel_after_window_rejected() {
        let rules = LedgerRules { cancellation_window: Duration::from_millis(10), auto_complete: false };
        let ledger = seeded(rules).await;
        let tx = ledger.redeem_points(&RedeemRequest::new("alice", "movie", 300, None)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(matches!(
            ledger.cancel_redemption(&tx.id, None).await,
            Err(LedgerError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_complete_only_from_pending() {
        let ledger = seeded(approval()).await;
        let tx = ledger.redeem_points(&RedeemRequest::new("alice", "movie", 300, None)).await.unwrap();

        let done = ledger.complete_redemption(&tx.id).await.unwrap();
        assert_eq!(done.status, TransactionStatus::Completed);
        assert!(ledger.complete_redemption(&tx.id).await.is_err());
    }

    #[tokio::test]
    async fn test_offline_fails_with_network() {
        let ledger = seeded(LedgerRules::default()).await;
        ledger.set_online(false);

        let err = ledger.get_points("alice").await.unwrap_err();
        assert!(err.is_transient());
        assert!(matches!(err, LedgerError::Network(_)));

        ledger.set_online(true);
        assert!(ledger.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_archived_option_unavailable() {
        let ledger = seeded(LedgerRules::default()).await;
        ledger.archive_option("movie").await.unwrap();

        let err = ledger.redeem_points(&RedeemRequest::new("alice", "movie", 300, None)).await.unwrap_err();
        assert!(matches!(err, LedgerError::OptionUnavailable(_)));
        assert!(ledger.validate_redemption_eligibility("alice", "movie", 300).await.is_err());
    }

    #[tokio::test]
    async fn test_history_filters_and_pages() {
        let ledger = seeded(approval()).await;
        ledger.award_points("alice", 1_000, "bonus").await.unwrap();
        for _ in 0..5 {
            ledger.redeem_points(&RedeemRequest::new("alice", "ice-cream", 100, None)).await.unwrap();
        }
        let first = ledger
            .get_redemption_history("alice", PageRequest::new(1, 2).unwrap(), &TransactionFilter::default())
            .await
            .unwrap();
        assert_eq!(first.items.len(), 2);
        assert_eq!(first.total, 5);
        assert!(first.has_more);

        let completed = ledger
            .get_redemption_history(
                "alice",
                PageRequest::default(),
                &TransactionFilter::with_statuses(&[TransactionStatus::Completed]),
            )
            .await
            .unwrap();
        assert_eq!(completed.total, 0);
    }

    #[tokio::test]
    async fn test_upsert_keeps_counter_and_bumps_version() {
        let ledger = seeded(LedgerRules::default()).await;
        ledger.redeem_points(&RedeemRequest::new("alice", "ice-cream", 100, None)).await.unwrap();

        let edited = RedemptionOption::new("ice-cream", "Double scoop", 100);
        let stored = ledger.upsert_option(&edited).await.unwrap();
        assert_eq!(stored.title, "Double scoop");
        assert_eq!(stored.redemption_count, 1);
        assert_eq!(stored.version, 3);

        assert!(ledger.upsert_option(&RedemptionOption::new("free", "Free", 0)).await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_redemptions_never_overdraw() {
        let ledger = Arc::new(seeded(LedgerRules::default()).await);

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move {
                    ledger.redeem_points(&RedeemRequest::new("alice", "ice-cream", 100, None)).await
                })
            })
            .collect();

        let mut ok = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => ok += 1,
                Err(e) => assert!(matches!(e, LedgerError::InsufficientPoints { .. })),
            }
        }

        assert_eq!(ok, 5);
        assert_eq!(ledger.get_points("alice").await.unwrap().summary.balance, 0);
    }
}
