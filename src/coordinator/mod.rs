// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redemption coordinator.
//!
//! The [`RedemptionCoordinator`] is the single entry point the rest of the
//! application calls. It ties together:
//! - the remote ledger behind a [`RemoteGateway`] (authoritative balance)
//! - the [`CacheManager`] (offline reads, optimistic local state)
//! - the [`SyncQueue`] (mutations recorded while offline)
//!
//! Every write tries the remote ledger first. A transient failure turns into
//! a local, dirty, queued mutation returned with `pending_sync = true`; a
//! business failure is returned as is and never queued.
//!
//! # Lifecycle
//!
//! ```text
//! Ready → Running → ShuttingDown → Stopped
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use redemption_ledger::{LedgerConfig, RedemptionCoordinator};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), redemption_ledger::LedgerError> {
//! let coordinator = Arc::new(RedemptionCoordinator::connect(LedgerConfig::default()).await?);
//! coordinator.start();
//!
//! let result = coordinator.redeem_points("alice", "movie-night", 300, None).await?;
//! if result.pending_sync {
//!     println!("Recorded offline, will sync later");
//! }
//!
//! coordinator.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod cancel;
mod catalog;
mod lifecycle;
mod queries;
mod redeem;
mod types;

pub use types::{EngineState, HealthReport, OptionResult, TransactionResult};

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::CacheManager;
use crate::config::LedgerConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::model::{EntityType, OperationKind, RedemptionTransaction};
use crate::remote::{connect_remote, RemoteGateway, RemoteLedger};
use crate::storage::memory::MemoryStore;
use crate::storage::sql::SqlStore;
use crate::storage::traits::LedgerStore;
use crate::sync_queue::SyncQueue;

/// Main redemption coordinator.
///
/// `Send + Sync`; share it behind an `Arc`. The background sync loop needs
/// one (see [`start()`](Self::start)).
pub struct RedemptionCoordinator {
    pub(super) config: LedgerConfig,
    pub(super) remote: Arc<RemoteGateway>,
    pub(super) cache: Arc<CacheManager>,
    pub(super) queue: Arc<SyncQueue>,

    /// Lifecycle state (broadcast to watchers)
    pub(super) state: watch::Sender<EngineState>,
    pub(super) state_rx: watch::Receiver<EngineState>,

    /// Per-user available-points broadcasts
    pub(super) points_watchers: DashMap<String, watch::Sender<i64>>,

    /// Stops the background sync loop
    pub(super) shutdown_tx: watch::Sender<bool>,
    pub(super) sync_task: Mutex<Option<JoinHandle<()>>>,
}

impl RedemptionCoordinator {
    /// Assemble a coordinator from explicit components.
    pub fn new(
        config: LedgerConfig,
        remote: Arc<RemoteGateway>,
        cache: Arc<CacheManager>,
        queue: Arc<SyncQueue>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Ready);
        let (shutdown_tx, _) = watch::channel(false);
        crate::metrics::set_engine_state("Ready");

        Self {
            config,
            remote,
            cache,
            queue,
            state: state_tx,
            state_rx,
            points_watchers: DashMap::new(),
            shutdown_tx,
            sync_task: Mutex::new(None),
        }
    }

    /// Build every component from configuration.
    ///
    /// `remote_url` selects the SQL ledger (in-memory otherwise) and
    /// `cache_path` the SQLite cache file (in-memory otherwise).
    #[tracing::instrument(skip(config), fields(has_remote = config.remote_url.is_some(), has_cache_file = config.cache_path.is_some()))]
    pub async fn connect(config: LedgerConfig) -> LedgerResult<Self> {
        let startup_start = Instant::now();

        let remote = connect_remote(&config).await?;
        let gateway = Arc::new(RemoteGateway::from_config(remote, &config));

        let store: Arc<dyn LedgerStore> = match config.cache_path.as_deref() {
            Some(path) => {
                info!(path, "Opening local cache");
                Arc::new(SqlStore::open_file(path).await?)
            }
            None => {
                warn!("No cache path configured - offline state will not survive a restart");
                Arc::new(MemoryStore::new())
            }
        };
        let cache = Arc::new(CacheManager::new(Arc::clone(&store)));
        let queue = Arc::new(SyncQueue::from_config(store, Arc::clone(&cache), &config));

        let leftover = queue.stats().await?;
        if leftover.queued > 0 || leftover.failed > 0 {
            warn!(queued = leftover.queued, failed = leftover.failed, "Sync queue has operations from a previous run");
        }

        crate::metrics::record_startup_total(startup_start.elapsed());
        info!("Redemption coordinator ready");
        Ok(Self::new(config, gateway, cache, queue))
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub(super) fn set_state(&self, state: EngineState) {
        let _ = self.state.send(state);
        crate::metrics::set_engine_state(&state.to_string());
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    pub fn remote(&self) -> &RemoteGateway {
        &self.remote
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Shared helpers
    // ═══════════════════════════════════════════════════════════════════════

    /// Checks that run before any network call.
    pub(super) fn validate_shape(&self, user_id: &str, option_id: &str, points_used: i64) -> LedgerResult<()> {
        if user_id.trim().is_empty() || option_id.trim().is_empty() {
            return Err(LedgerError::Validation("user and option are required".into()));
        }
        if points_used <= 0 {
            return Err(LedgerError::Validation(format!(
                "points_used must be positive, got {}",
                points_used
            )));
        }
        if points_used < self.config.min_redemption_points {
            return Err(LedgerError::Validation(format!(
                "minimum redemption is {} points, got {}",
                self.config.min_redemption_points, points_used
            )));
        }
        Ok(())
    }

    /// Best-known balance and whether it came from the remote ledger.
    ///
    /// Online: remote balance adjusted by unsynced local work, after settling
    /// queued redemptions the ledger already committed. Offline: the cached
    /// aggregate. Without a cached snapshot the remote error stands.
    pub(super) async fn best_known_balance(&self, user_id: &str) -> LedgerResult<(i64, bool)> {
        match self.remote.get_points(user_id).await {
            Ok(account) => {
                if let Err(e) = self.cache.save_snapshot(user_id, account.summary.earned_total).await {
                    warn!(user_id, error = %e, "Failed to snapshot points");
                }
                if let Err(e) = self.settle_landed_redemptions(user_id).await {
                    warn!(user_id, error = %e, "Failed to settle queued redemptions");
                }
                let adjustment = match self.cache.unsynced_adjustment(user_id).await {
                    Ok(adjustment) => adjustment,
                    Err(e) => {
                        warn!(user_id, error = %e, "Failed to read unsynced work, using remote balance");
                        0
                    }
                };
                Ok((account.summary.balance + adjustment, true))
            }
            Err(e) if e.is_transient() => match self.cache.offline_balance(user_id).await? {
                Some(balance) => {
                    debug!(user_id, balance, error = %e, "Using cached balance");
                    crate::metrics::record_cache_fallback("points");
                    Ok((balance, false))
                }
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    /// Settle queued redemptions whose timed-out write already reached the
    /// ledger. Stops at the first lookup failure.
    async fn settle_landed_redemptions(&self, user_id: &str) -> LedgerResult<()> {
        for local in self.cache.unsynced_transactions(user_id).await? {
            let queued_create = self
                .queue
                .pending_for(EntityType::Transaction, &local.id)
                .await?
                .iter()
                .any(|op| op.kind == OperationKind::Create);
            if !queued_create {
                continue;
            }
            match self.remote.find_transaction_by_client_ref(&local.client_ref).await {
                Ok(Some(server_tx)) => {
                    self.queue.settle_landed_redemption(&local.id, &server_tx).await?;
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(user_id, error = %e, "Could not look up queued redemptions");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Mirror a confirmed transaction; the remote already committed, so a
    /// cache failure is logged, not returned.
    pub(super) async fn confirm_quietly(&self, tx: &RedemptionTransaction) {
        if let Err(e) = self.cache.confirm_transaction(tx).await {
            warn!(id = %tx.id, error = %e, "Failed to cache confirmed transaction");
        }
    }

    /// Push a fresh available-points value to the user's subscribers.
    pub(super) async fn notify_points(&self, user_id: &str) {
        let watched = match self.points_watchers.get(user_id) {
            Some(sender) => sender.receiver_count() > 0,
            None => return,
        };
        if !watched {
            self.points_watchers.remove(user_id);
            return;
        }
        match self.available_points(user_id).await {
            Ok(points) => {
                if let Some(sender) = self.points_watchers.get(user_id) {
                    sender.send_replace(points);
                }
            }
            Err(e) => debug!(user_id, error = %e, "Could not refresh available points"),
        }
    }

    pub(super) async fn notify_all_watchers(&self) {
        let users: Vec<String> = self.points_watchers.iter().map(|e| e.key().clone()).collect();
        for user_id in users {
            self.notify_points(&user_id).await;
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::harness;
    use super::*;

    #[tokio::test]
    async fn test_initial_state() {
        let h = harness(LedgerConfig::default()).await;
        assert_eq!(h.coordinator.state(), EngineState::Ready);
    }

    #[tokio::test]
    async fn test_shape_validation_before_network() {
        let config = LedgerConfig { min_redemption_points: 100, ..Default::default() };
        let h = harness(config).await;
        let c = &h.coordinator;
        let calls = h.ledger.call_count();

        for (user, option, points) in [("alice", "movie", 0), ("alice", "movie", -5), ("alice", "movie", 50), ("", "movie", 300)] {
            assert!(matches!(
                c.redeem_points(user, option, points, None).await,
                Err(LedgerError::Validation(_))
            ));
        }
        assert_eq!(h.ledger.call_count(), calls);
    }

    #[tokio::test]
    async fn test_best_known_balance_falls_back_offline() {
        let h = harness(LedgerConfig::default()).await;
        let c = &h.coordinator;

        // No snapshot yet: the connectivity error stands
        h.ledger.set_online(false);
        assert!(c.best_known_balance("alice").await.unwrap_err().is_connectivity());

        h.ledger.set_online(true);
        assert_eq!(c.best_known_balance("alice").await.unwrap(), (500, true));

        h.ledger.set_online(false);
        assert_eq!(c.best_known_balance("alice").await.unwrap(), (500, false));
    }

    #[tokio::test]
    async fn test_connect_in_memory() {
        let coordinator = RedemptionCoordinator::connect(LedgerConfig::default()).await.unwrap();
        assert_eq!(coordinator.state(), EngineState::Ready);
        assert!(coordinator.remote().circuit_state().is_some());
        assert_eq!(coordinator.queue().stats().await.unwrap().queued, 0);
    }

    #[tokio::test]
    async fn test_connect_with_cache_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = LedgerConfig {
            cache_path: Some(dir.path().join("cache.db").display().to_string()),
            ..Default::default()
        };
        let coordinator = RedemptionCoordinator::connect(config).await.unwrap();
        assert_eq!(coordinator.cache().stats().await.unwrap().transactions, 0);
    }
}
