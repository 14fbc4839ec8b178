// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Coordinator lifecycle: background sync loop, shutdown, diagnostics.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::{EngineState, HealthReport, RedemptionCoordinator};
use crate::error::LedgerResult;
use crate::model::{PendingSyncOperation, TransactionStatus};
use crate::sync_queue::{DrainReport, RejectedCreate};

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

impl RedemptionCoordinator {
    /// Drain the sync queue once and settle rejected redemptions.
    ///
    /// A queued redemption the ledger refused is turned into a `Cancelled`
    /// local transaction carrying the reason, so it stops holding points.
    #[tracing::instrument(skip(self))]
    pub async fn sync_pending(&self) -> LedgerResult<DrainReport> {
        let report = self.queue.drain(self.remote.as_ref()).await?;
        if report.skipped {
            return Ok(report);
        }

        for rejected in &report.rejected {
            self.settle_rejected(rejected).await?;
        }
        if report.synced > 0 || report.failed > 0 || !report.rejected.is_empty() {
            info!(
                synced = report.synced,
                retried = report.retried,
                failed = report.failed,
                rejected = report.rejected.len(),
                "Sync pass complete"
            );
            self.notify_all_watchers().await;
        }
        Ok(report)
    }

    async fn settle_rejected(&self, rejected: &RejectedCreate) -> LedgerResult<()> {
        let Some(record) = self.cache.get_transaction(&rejected.placeholder_id).await? else {
            debug!(placeholder = %rejected.placeholder_id, "Rejected redemption no longer cached");
            return Ok(());
        };
        let mut tx = record.value;
        tx.status = TransactionStatus::Cancelled;
        tx.annotate(&format!("sync rejected: {}", rejected.error));
        self.cache.confirm_transaction(&tx).await?;
        warn!(id = %tx.id, user_id = %tx.user_id, error = %rejected.error, "Queued redemption rejected, cancelled locally");
        Ok(())
    }

    /// Spawn the periodic sync loop. Calling it twice is a no-op.
    ///
    /// The loop keeps the coordinator alive until [`shutdown()`](Self::shutdown).
    pub fn start(self: &Arc<Self>) {
        let mut task = self.sync_task.lock();
        if task.is_some() {
            warn!("Sync loop already running");
            return;
        }

        let _ = self.shutdown_tx.send_replace(false);
        let shutdown_rx = self.shutdown_tx.subscribe();
        let coordinator = Arc::clone(self);
        *task = Some(tokio::spawn(async move { coordinator.run(shutdown_rx).await }));

        self.set_state(EngineState::Running);
        info!(interval_ms = self.config.sync_interval_ms, "Redemption coordinator running");
    }

    async fn run(self: Arc<Self>, mut shutdown_rx: tokio::sync::watch::Receiver<bool>) {
        let mut sync_interval = tokio::time::interval(self.config.sync_interval());
        sync_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut health_interval = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        health_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!("Sync loop stopping");
                        break;
                    }
                }

                _ = sync_interval.tick() => {
                    self.sync_tick().await;
                }

                _ = health_interval.tick() => {
                    self.remote.check_health().await;
                    if let Err(e) = self.cache.stats().await {
                        warn!(error = %e, "Failed to read cache stats");
                    }
                }
            }
        }
    }

    async fn sync_tick(&self) {
        match self.queue.has_pending().await {
            Ok(false) => return,
            Ok(true) => {}
            Err(e) => {
                warn!(error = %e, "Failed to inspect sync queue");
                return;
            }
        }
        if !self.remote.is_healthy() && !self.remote.check_health().await {
            debug!("Remote ledger still unreachable, skipping sync");
            return;
        }
        if let Err(e) = self.sync_pending().await {
            error!(error = %e, "Sync pass failed");
        }
    }

    /// Stop the sync loop and make a last attempt at the queue.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        let shutdown_start = Instant::now();
        info!("Initiating redemption coordinator shutdown...");
        self.set_state(EngineState::ShuttingDown);

        self.shutdown_tx.send_replace(true);
        let handle = self.sync_task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Sync loop ended abnormally");
            }
        }

        match self.queue.has_pending().await {
            Ok(true) if self.remote.is_healthy() => match self.sync_pending().await {
                Ok(report) => info!(synced = report.synced, "Final sync pass complete"),
                Err(e) => warn!(error = %e, "Final sync pass failed"),
            },
            Ok(true) => info!("Remote ledger unhealthy, queued operations kept for next start"),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "Failed to inspect sync queue"),
        }

        self.set_state(EngineState::Stopped);
        info!(elapsed_ms = shutdown_start.elapsed().as_millis() as u64, "Redemption coordinator shutdown complete");
    }

    /// Live diagnostics, including a fresh ping of the remote ledger.
    pub async fn health(&self) -> LedgerResult<HealthReport> {
        let remote_reachable = self.remote.check_health().await;
        let queue = self.queue.stats().await?;
        let failed_operations = self.queue.failed_operations().await?;
        let cache = self.cache.stats().await?;

        Ok(HealthReport {
            state: self.state(),
            remote_reachable,
            circuit: self.remote.circuit_state(),
            queued_operations: queue.queued,
            failed_operations,
            cache,
        })
    }

    /// Operations that exhausted their retries or were rejected.
    pub async fn failed_operations(&self) -> LedgerResult<Vec<PendingSyncOperation>> {
        self.queue.failed_operations().await
    }

    /// Re-queue a failed operation with a fresh retry budget.
    pub async fn retry_failed(&self, seq: u64) -> LedgerResult<()> {
        self.queue.retry_failed(seq).await?;
        self.notify_all_watchers().await;
        Ok(())
    }

    /// Evict synced cache rows older than the configured TTL.
    pub async fn prune_cache(&self) -> LedgerResult<usize> {
        self.cache.clear_expired(self.config.cache_ttl()).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::super::test_support::harness;
    use super::*;
    use crate::config::LedgerConfig;
    use crate::model::SyncStatus;
    use crate::remote::traits::RemoteLedger;

    fn fast_sync() -> LedgerConfig {
        LedgerConfig { auto_complete: false, sync_interval_ms: 20, ..Default::default() }
    }

    #[tokio::test]
    async fn test_start_and_shutdown_states() {
        let h = harness(fast_sync()).await;
        let c = &h.coordinator;
        let states = c.state_receiver();

        c.start();
        assert_eq!(c.state(), EngineState::Running);
        c.start();

        c.shutdown().await;
        assert_eq!(c.state(), EngineState::Stopped);
        assert!(states.has_changed().unwrap());
        assert!(c.sync_task.lock().is_none());
    }

    #[tokio::test]
    async fn test_background_loop_syncs_after_reconnect() {
        let h = harness(fast_sync()).await;
        let c = &h.coordinator;
        c.available_points("alice").await.unwrap();

        h.ledger.set_online(false);
        let tx = c.redeem_points("alice", "ice-cream", 100, None).await.unwrap().transaction;
        c.start();

        h.ledger.set_online(true);
        let mut synced = false;
        for _ in 0..100 {
            if !c.queue().has_pending().await.unwrap() {
                synced = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(synced);
        assert_eq!(h.ledger.transaction_count(), 1);
        assert!(c.cache().get_transaction(&tx.id).await.unwrap().is_none());

        c.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejected_redemption_is_cancelled_locally() {
        let h = harness(fast_sync()).await;
        let c = &h.coordinator;
        c.available_points("alice").await.unwrap();

        h.ledger.set_online(false);
        let tx = c.redeem_points("alice", "movie", 300, None).await.unwrap().transaction;

        // Spent elsewhere while this device was offline
        h.ledger.set_online(true);
        h.ledger.redeem_points(&crate::model::RedeemRequest::new("alice", "movie", 300, None)).await.unwrap();

        let report = c.sync_pending().await.unwrap();
        assert_eq!(report.rejected.len(), 1);

        let local = c.cache().get_transaction(&tx.id).await.unwrap().unwrap();
        assert_eq!(local.value.status, TransactionStatus::Cancelled);
        assert_eq!(local.sync_status, SyncStatus::Synced);
        assert!(local.value.notes.unwrap().contains("sync rejected"));
        assert_eq!(c.available_points("alice").await.unwrap(), 200);

        let health = c.health().await.unwrap();
        assert_eq!(health.failed_operations.len(), 1);
        assert!(!health.is_healthy());
    }

    #[tokio::test]
    async fn test_abandoned_redemption_frees_points_until_retried() {
        let h = harness(fast_sync()).await;
        let c = &h.coordinator;
        c.available_points("alice").await.unwrap();

        h.ledger.set_online(false);
        let tx = c.redeem_points("alice", "movie", 300, None).await.unwrap().transaction;
        assert_eq!(c.available_points("alice").await.unwrap(), 200);

        for _ in 0..4 {
            c.sync_pending().await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let failed = c.failed_operations().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(c.available_points("alice").await.unwrap(), 500);
        let local = c.transaction(&tx.id).await.unwrap();
        assert!(local.notes.unwrap().contains("sync failed"));
        assert_eq!(c.health().await.unwrap().cache.failed_transactions, 1);

        c.retry_failed(failed[0].seq).await.unwrap();
        assert_eq!(c.available_points("alice").await.unwrap(), 200);
        h.ledger.set_online(true);
        assert_eq!(c.sync_pending().await.unwrap().synced, 1);
        assert_eq!(c.available_points("alice").await.unwrap(), 200);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_queue() {
        let h = harness(fast_sync()).await;
        let c = &h.coordinator;
        c.available_points("alice").await.unwrap();
        h.ledger.set_online(false);
        c.redeem_points("alice", "ice-cream", 100, None).await.unwrap();
        h.ledger.set_online(true);

        c.shutdown().await;
        assert_eq!(h.ledger.transaction_count(), 1);
        assert!(!c.queue().has_pending().await.unwrap());
    }

    #[tokio::test]
    async fn test_health_report() {
        let h = harness(fast_sync()).await;
        let report = h.coordinator.health().await.unwrap();
        assert!(report.is_healthy());
        assert_eq!(report.state, EngineState::Ready);
        assert_eq!(report.circuit, None);

        h.ledger.set_online(false);
        assert!(!h.coordinator.health().await.unwrap().remote_reachable);
    }

    #[tokio::test]
    async fn test_prune_cache_uses_ttl() {
        let config = LedgerConfig { cache_ttl_secs: 0, ..fast_sync() };
        let h = harness(config).await;
        let c = &h.coordinator;
        c.redemption_options(&Default::default(), Default::default(), Default::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(c.prune_cache().await.unwrap(), 2);
    }
}
