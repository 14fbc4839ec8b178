// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Client-side gateway in front of the authoritative ledger.
//!
//! Every call gets a timeout (reads and writes separately configured), an
//! optional circuit breaker, latency metrics and a running health verdict.
//!
//! Writes run on their own task: when the timeout fires the caller gets
//! `Timeout` but the request keeps going, so a commit that was already in
//! flight still lands. The outcome is unknown to the caller, which is why the
//! coordinator queues such writes for an idempotent replay.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::traits::RemoteLedger;
use crate::config::LedgerConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::metrics::{self, LatencyTimer};
use crate::model::{PointsAccount, RedeemRequest, RedemptionOption, RedemptionStats, RedemptionTransaction};
use crate::query::{PageRequest, PaginatedResult, TransactionFilter};
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitState, CircuitStats};

/// Consecutive transient failures before the remote is reported unhealthy.
const UNHEALTHY_AFTER: u64 = 3;

/// Tracks whether the remote ledger is reachable.
///
/// Only transient failures count: a ledger that answers "insufficient points"
/// is perfectly healthy.
pub struct RemoteHealthChecker {
    /// Last known health state
    healthy: AtomicBool,
    /// Consecutive failure count
    failures: AtomicU64,
    /// Lock for health check (prevent thundering herd)
    checking: Mutex<()>,
}

impl RemoteHealthChecker {
    pub fn new() -> Self {
        Self {
            healthy: AtomicBool::new(true), // Assume healthy until proven otherwise
            failures: AtomicU64::new(0),
            checking: Mutex::new(()),
        }
    }

    pub fn record_success(&self) {
        self.failures.store(0, Ordering::Release);
        self.healthy.store(true, Ordering::Release);
    }

    pub fn record_failure(&self) {
        let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= UNHEALTHY_AFTER {
            self.healthy.store(false, Ordering::Release);
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Acquire)
    }

    /// Ping the ledger and fold the outcome into the verdict.
    pub async fn check(&self, ledger: &dyn RemoteLedger, timeout: Duration) -> bool {
        // Prevent multiple simultaneous checks
        let _guard = self.checking.lock().await;

        match tokio::time::timeout(timeout, ledger.ping()).await {
            Ok(Ok(())) => {
                self.record_success();
                true
            }
            Ok(Err(e)) => {
                debug!(error = %e, "Remote health check failed");
                self.record_failure();
                false
            }
            Err(_) => {
                debug!("Remote health check timed out");
                self.record_failure();
                false
            }
        }
    }
}

impl Default for RemoteHealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

/// Decorator adding timeouts, circuit breaking and health tracking to any
/// [`RemoteLedger`].
pub struct RemoteGateway {
    inner: Arc<dyn RemoteLedger>,
    read_timeout: Duration,
    write_timeout: Duration,
    circuit: Option<CircuitBreaker>,
    health: RemoteHealthChecker,
}

impl RemoteGateway {
    pub fn new(inner: Arc<dyn RemoteLedger>, read_timeout: Duration, write_timeout: Duration) -> Self {
        Self {
            inner,
            read_timeout,
            write_timeout,
            circuit: None,
            health: RemoteHealthChecker::new(),
        }
    }

    #[must_use]
    pub fn with_circuit(mut self, config: CircuitConfig) -> Self {
        self.circuit = Some(CircuitBreaker::new("remote", config));
        self
    }

    pub fn from_config(inner: Arc<dyn RemoteLedger>, config: &LedgerConfig) -> Self {
        let gateway = Self::new(inner, config.read_timeout(), config.write_timeout());
        match config.circuit() {
            Some(circuit) => gateway.with_circuit(circuit),
            None => gateway,
        }
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.health.is_healthy()
    }

    pub fn health(&self) -> &RemoteHealthChecker {
        &self.health
    }

    /// Active ping, bypassing the circuit breaker.
    pub async fn check_health(&self) -> bool {
        let healthy = self.health.check(self.inner.as_ref(), self.read_timeout).await;
        metrics::set_backend_healthy("remote", healthy);
        healthy
    }

    #[must_use]
    pub fn circuit_state(&self) -> Option<CircuitState> {
        self.circuit.as_ref().map(CircuitBreaker::state)
    }

    #[must_use]
    pub fn circuit_stats(&self) -> Option<CircuitStats> {
        self.circuit.as_ref().map(CircuitBreaker::stats)
    }

    fn observe<T>(&self, op: &'static str, result: &LedgerResult<T>) {
        match result {
            Ok(_) => {
                self.health.record_success();
                metrics::record_operation("remote", op, "success");
            }
            Err(e) if e.is_transient() => {
                self.health.record_failure();
                warn!(op, error = %e, failures = self.health.failure_count(), "Remote call failed");
                metrics::record_operation("remote", op, e.kind());
            }
            Err(e) => {
                self.health.record_success();
                debug!(op, error = %e, "Remote rejected call");
                metrics::record_operation("remote", op, e.kind());
            }
        }
        metrics::set_backend_healthy("remote", self.health.is_healthy());
    }

    async fn guarded<T, F, Fut>(&self, op: &'static str, call: F) -> LedgerResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = LedgerResult<T>>,
    {
        match &self.circuit {
            Some(circuit) => circuit.call(op, call).await,
            None => call().await,
        }
    }

    async fn read<T, F, Fut>(&self, op: &'static str, f: F) -> LedgerResult<T>
    where
        F: FnOnce(Arc<dyn RemoteLedger>) -> Fut,
        Fut: Future<Output = LedgerResult<T>>,
    {
        let _timer = LatencyTimer::new("remote", op);
        let timeout = self.read_timeout;
        let inner = Arc::clone(&self.inner);

        let result = self
            .guarded(op, || async move {
                match tokio::time::timeout(timeout, f(inner)).await {
                    Ok(result) => result,
                    Err(_) => {
                        metrics::record_timeout(op);
                        Err(LedgerError::Timeout(format!("{} exceeded {}ms", op, timeout.as_millis())))
                    }
                }
            })
            .await;
        self.observe(op, &result);
        result
    }

    async fn write<T, F, Fut>(&self, op: &'static str, f: F) -> LedgerResult<T>
    where
        F: FnOnce(Arc<dyn RemoteLedger>) -> Fut,
        Fut: Future<Output = LedgerResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let _timer = LatencyTimer::new("remote", op);
        let timeout = self.write_timeout;
        let inner = Arc::clone(&self.inner);

        let result = self
            .guarded(op, || async move {
                // Spawned so the request survives our timeout
                let handle = tokio::spawn(f(inner));
                match tokio::time::timeout(timeout, handle).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(join)) => Err(LedgerError::Server(format!("{} task failed: {}", op, join))),
                    Err(_) => {
                        metrics::record_timeout(op);
                        Err(LedgerError::Timeout(format!(
                            "{} exceeded {}ms, outcome unknown",
                            op,
                            timeout.as_millis()
                        )))
                    }
                }
            })
            .await;
        self.observe(op, &result);
        result
    }
}

#[async_trait]
impl RemoteLedger for RemoteGateway {
    async fn redeem_points(&self, request: &RedeemRequest) -> LedgerResult<RedemptionTransaction> {
        let request = request.clone();
        self.write("redeem", move |ledger| async move { ledger.redeem_points(&request).await })
            .await
    }

    async fn cancel_redemption(
        &self,
        transaction_id: &str,
        reason: Option<&str>,
    ) -> LedgerResult<RedemptionTransaction> {
        let transaction_id = transaction_id.to_string();
        let reason = reason.map(str::to_string);
        self.write("cancel", move |ledger| async move {
            ledger.cancel_redemption(&transaction_id, reason.as_deref()).await
        })
        .await
    }

    async fn complete_redemption(&self, transaction_id: &str) -> LedgerResult<RedemptionTransaction> {
        let transaction_id = transaction_id.to_string();
        self.write("complete", move |ledger| async move { ledger.complete_redemption(&transaction_id).await })
            .await
    }

    async fn get_options(&self) -> LedgerResult<Vec<RedemptionOption>> {
        self.read("options", |ledger| async move { ledger.get_options().await }).await
    }

    async fn get_option(&self, option_id: &str) -> LedgerResult<RedemptionOption> {
        self.read("option", |ledger| async move { ledger.get_option(option_id).await }).await
    }

    async fn get_transaction(&self, transaction_id: &str) -> LedgerResult<RedemptionTransaction> {
        self.read("transaction", |ledger| async move { ledger.get_transaction(transaction_id).await })
            .await
    }

    async fn find_transaction_by_client_ref(&self, client_ref: &str) -> LedgerResult<Option<RedemptionTransaction>> {
        self.read("transaction_by_client_ref", |ledger| async move {
            ledger.find_transaction_by_client_ref(client_ref).await
        })
        .await
    }

    async fn get_redemption_history(
        &self,
        user_id: &str,
        page: PageRequest,
        filter: &TransactionFilter,
    ) -> LedgerResult<PaginatedResult<RedemptionTransaction>> {
        self.read("history", |ledger| async move {
            ledger.get_redemption_history(user_id, page, filter).await
        })
        .await
    }

    async fn validate_redemption_eligibility(
        &self,
        user_id: &str,
        option_id: &str,
        points_used: i64,
    ) -> LedgerResult<()> {
        self.read("eligibility", |ledger| async move {
            ledger.validate_redemption_eligibility(user_id, option_id, points_used).await
        })
        .await
    }

    async fn get_points(&self, user_id: &str) -> LedgerResult<PointsAccount> {
        self.read("points", |ledger| async move { ledger.get_points(user_id).await }).await
    }

    async fn get_stats(&self, user_id: &str) -> LedgerResult<RedemptionStats> {
        self.read("stats", |ledger| async move { ledger.get_stats(user_id).await }).await
    }

    async fn award_points(&self, user_id: &str, points: i64, reason: &str) -> LedgerResult<PointsAccount> {
        let user_id = user_id.to_string();
        let reason = reason.to_string();
        self.write("award", move |ledger| async move { ledger.award_points(&user_id, points, &reason).await })
            .await
    }

    async fn upsert_option(&self, option: &RedemptionOption) -> LedgerResult<RedemptionOption> {
        let option = option.clone();
        self.write("upsert_option", move |ledger| async move { ledger.upsert_option(&option).await })
            .await
    }

    async fn archive_option(&self, option_id: &str) -> LedgerResult<RedemptionOption> {
        let option_id = option_id.to_string();
        self.write("archive_option", move |ledger| async move { ledger.archive_option(&option_id).await })
            .await
    }

    async fn ping(&self) -> LedgerResult<()> {
        self.read("ping", |ledger| async move { ledger.ping().await }).await
    }
}
