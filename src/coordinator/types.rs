// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the redemption coordinator.

use crate::cache::CacheStats;
use crate::model::{PendingSyncOperation, RedemptionOption, RedemptionTransaction};
use crate::resilience::circuit_breaker::CircuitState;

/// Coordinator lifecycle state.
///
/// Use [`super::RedemptionCoordinator::state()`] to check the current state or
/// [`super::RedemptionCoordinator::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Constructed; requests are served, no background sync yet
    Ready,
    /// Background sync loop active
    Running,
    /// Graceful shutdown in progress
    ShuttingDown,
    /// Background sync loop stopped
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready => write!(f, "Ready"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Outcome of a transaction write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionResult {
    pub transaction: RedemptionTransaction,
    /// `true` when the write was recorded locally and queued for replay
    pub pending_sync: bool,
}

/// Outcome of a catalog write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionResult {
    pub option: RedemptionOption,
    pub pending_sync: bool,
}

/// Diagnostics snapshot returned by [`super::RedemptionCoordinator::health()`].
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub state: EngineState,
    /// Result of a live ping
    pub remote_reachable: bool,
    /// `None` when the circuit breaker is disabled
    pub circuit: Option<CircuitState>,
    pub queued_operations: usize,
    /// Rows that exhausted their retries or were rejected
    pub failed_operations: Vec<PendingSyncOperation>,
    pub cache: CacheStats,
}

impl HealthReport {
    /// Reachable, with nothing stuck in the queue.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.remote_reachable && self.failed_operations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_state_display() {
        assert_eq!(format!("{}", EngineState::Ready), "Ready");
        assert_eq!(format!("{}", EngineState::Running), "Running");
        assert_eq!(format!("{}", EngineState::ShuttingDown), "ShuttingDown");
    }

    #[test]
    fn test_health_report_verdict() {
        let report = HealthReport {
            state: EngineState::Running,
            remote_reachable: true,
            circuit: Some(CircuitState::Closed),
            queued_operations: 3,
            failed_operations: Vec::new(),
            cache: CacheStats::default(),
        };
        assert!(report.is_healthy());

        let offline = HealthReport { remote_reachable: false, ..report };
        assert!(!offline.is_healthy());
    }
}
