// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The authoritative points ledger and the client-side gateway in front of it.
//!
//! - [`RemoteLedger`]: the capability set every ledger variant implements
//! - [`InMemoryLedger`]: single-process ledger for tests and demos
//! - [`SqlLedger`]: MySQL/SQLite ledger, one database transaction per mutation
//! - [`RemoteGateway`]: timeouts, circuit breaking and health tracking

pub mod gateway;
pub mod memory;
pub mod sql;
pub mod traits;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

pub use gateway::{RemoteGateway, RemoteHealthChecker};
pub use memory::InMemoryLedger;
pub use sql::SqlLedger;
pub use traits::RemoteLedger;

use crate::config::LedgerConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::model::{RedemptionOption, RedemptionTransaction, TransactionStatus};

/// Business rules enforced by the ledger itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerRules {
    /// How long after redemption a pending transaction may be cancelled
    pub cancellation_window: Duration,
    /// `true`: redemptions complete immediately. `false`: they stay
    /// `pending` until approved via `complete_redemption`
    pub auto_complete: bool,
}

impl Default for LedgerRules {
    fn default() -> Self {
        Self {
            cancellation_window: Duration::from_secs(24 * 60 * 60),
            auto_complete: true,
        }
    }
}

impl LedgerRules {
    #[must_use]
    pub fn window_millis(&self) -> i64 {
        self.cancellation_window.as_millis() as i64
    }

    /// Status a freshly committed redemption gets.
    #[must_use]
    pub fn initial_status(&self) -> TransactionStatus {
        if self.auto_complete {
            TransactionStatus::Completed
        } else {
            TransactionStatus::Pending
        }
    }
}

/// Redemption checks shared by `redeem_points` and
/// `validate_redemption_eligibility`, so the dry run can never disagree with
/// the real thing.
pub(crate) fn check_redemption(
    option: Option<&RedemptionOption>,
    option_id: &str,
    points_used: i64,
    available: i64,
    now: i64,
) -> LedgerResult<()> {
    if points_used <= 0 {
        return Err(LedgerError::Validation(format!(
            "points_used must be positive, got {}",
            points_used
        )));
    }
    let option = option.ok_or_else(|| LedgerError::NotFound(format!("option '{}'", option_id)))?;
    if !option.is_redeemable(now) {
        return Err(LedgerError::OptionUnavailable(option.id.clone()));
    }
    if option.points_cost != points_used {
        return Err(LedgerError::Validation(format!(
            "option '{}' costs {} points, request used {}",
            option.id, option.points_cost, points_used
        )));
    }
    if available < points_used {
        return Err(LedgerError::InsufficientPoints { required: points_used, available });
    }
    Ok(())
}

/// Cancellation checks: pending only, and only inside the window.
pub(crate) fn check_cancellation(tx: &RedemptionTransaction, rules: &LedgerRules, now: i64) -> LedgerResult<()> {
    tx.status.ensure_transition(TransactionStatus::Cancelled)?;
    if !tx.within_window(now, rules.window_millis()) {
        return Err(LedgerError::Validation(format!(
            "cancellation window of {}s has elapsed for '{}'",
            rules.cancellation_window.as_secs(),
            tx.id
        )));
    }
    Ok(())
}

/// Build the ledger variant the configuration selects.
pub async fn connect_remote(config: &LedgerConfig) -> LedgerResult<Arc<dyn RemoteLedger>> {
    match config.remote_url.as_deref() {
        Some(url) => {
            info!("Connecting to SQL ledger");
            let ledger = SqlLedger::connect(url, config.ledger_rules()).await?;
            Ok(Arc::new(ledger))
        }
        None => {
            info!("Using in-memory ledger");
            Ok(Arc::new(InMemoryLedger::new(config.ledger_rules())))
        }
    }
}
