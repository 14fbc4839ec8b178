// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the redemption ledger.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host application is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `redemption_ledger_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `component`: remote, cache, queue
//! - `operation`: redeem, cancel, history, ...
//! - `status` / `outcome`: success, error, offline, rejected

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a component operation outcome
pub fn record_operation(component: &str, operation: &str, status: &str) {
    counter!(
        "redemption_ledger_operations_total",
        "component" => component.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(component: &str, operation: &str, duration: Duration) {
    histogram!(
        "redemption_ledger_operation_seconds",
        "component" => component.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a timeout error
pub fn record_timeout(operation: &str) {
    counter!(
        "redemption_ledger_timeouts_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// REDEMPTIONS - Business outcomes
// ═══════════════════════════════════════════════════════════════════════════

/// Record a redemption outcome: `online`, `offline` or `rejected`
pub fn record_redemption(outcome: &str, points: i64) {
    counter!(
        "redemption_ledger_redemptions_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
    if outcome != "rejected" {
        counter!("redemption_ledger_points_redeemed_total").increment(points.max(0) as u64);
    }
}

/// Record a cancellation outcome
pub fn record_cancellation(outcome: &str) {
    counter!(
        "redemption_ledger_cancellations_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// SYNC QUEUE - Pending work
// ═══════════════════════════════════════════════════════════════════════════

/// Set sync queue depth by state
pub fn set_queue_depth(queued: usize, failed: usize) {
    gauge!("redemption_ledger_sync_queue_depth", "state" => "queued").set(queued as f64);
    gauge!("redemption_ledger_sync_queue_depth", "state" => "failed").set(failed as f64);
}

/// Record the outcome of one replayed operation
pub fn record_replay(kind: &str, outcome: &str) {
    counter!(
        "redemption_ledger_sync_replays_total",
        "kind" => kind.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a drain pass
pub fn record_queue_drain(synced: usize, duration: Duration) {
    counter!("redemption_ledger_sync_drains_total").increment(1);
    counter!("redemption_ledger_sync_drained_items_total").increment(synced as u64);
    histogram!("redemption_ledger_sync_drain_seconds").record(duration.as_secs_f64());
}

// ═══════════════════════════════════════════════════════════════════════════
// CACHE
// ═══════════════════════════════════════════════════════════════════════════

/// Record a read served from the local cache because the remote was unreachable
pub fn record_cache_fallback(operation: &str) {
    counter!(
        "redemption_ledger_cache_fallbacks_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record eviction event
pub fn record_eviction(count: usize) {
    counter!("redemption_ledger_cache_evictions_total").increment(count as u64);
}

/// Set cached row counts
pub fn set_cache_rows(options: usize, transactions: usize, dirty: usize) {
    gauge!("redemption_ledger_cache_rows", "table" => "options").set(options as f64);
    gauge!("redemption_ledger_cache_rows", "table" => "transactions").set(transactions as f64);
    gauge!("redemption_ledger_cache_dirty_rows").set(dirty as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// BACKEND HEALTH - Connection status
// ═══════════════════════════════════════════════════════════════════════════

/// Set backend health status (1 = healthy, 0 = unhealthy)
pub fn set_backend_healthy(backend: &str, healthy: bool) {
    gauge!(
        "redemption_ledger_backend_healthy",
        "backend" => backend.to_string()
    )
    .set(if healthy { 1.0 } else { 0.0 });
}

/// Record circuit breaker call
pub fn record_circuit_call(circuit: &str, outcome: &str) {
    counter!(
        "redemption_ledger_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set engine state (for monitoring state machine transitions)
pub fn set_engine_state(state: &str) {
    counter!(
        "redemption_ledger_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// Record total startup time
pub fn record_startup_total(duration: Duration) {
    histogram!("redemption_ledger_startup_seconds").record(duration.as_secs_f64());
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    component: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(component: &'static str, operation: &'static str) -> Self {
        Self {
            component,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.component, self.operation, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    fn counter_value(recorder: &DebuggingRecorder, name: &str) -> u64 {
        recorder
            .snapshotter()
            .snapshot()
            .into_vec()
            .into_iter()
            .filter(|(key, _, _, _)| key.key().name() == name)
            .map(|(_, _, _, value)| match value {
                DebugValue::Counter(v) => v,
                _ => 0,
            })
            .sum()
    }

    #[test]
    fn test_redemption_counters_recorded() {
        let recorder = DebuggingRecorder::new();
        metrics::with_local_recorder(&recorder, || {
            record_redemption("online", 300);
            record_redemption("offline", 100);
            record_redemption("rejected", 900);
        });

        assert_eq!(counter_value(&recorder, "redemption_ledger_redemptions_total"), 3);
        assert_eq!(counter_value(&recorder, "redemption_ledger_points_redeemed_total"), 400);
    }

    #[test]
    fn test_record_operation() {
        record_operation("remote", "redeem", "success");
        record_operation("cache", "history", "error");
        record_timeout("redeem");
    }

    #[test]
    fn test_queue_metrics() {
        set_queue_depth(3, 1);
        record_replay("create", "synced");
        record_queue_drain(3, Duration::from_millis(12));
    }

    #[test]
    fn test_cache_metrics() {
        record_cache_fallback("history");
        record_eviction(10);
        set_cache_rows(5, 20, 2);
    }

    #[test]
    fn test_circuit_breaker_metrics() {
        set_backend_healthy("remote", false);
        record_circuit_call("remote", "success");
        record_circuit_call("remote", "rejected");
    }

    #[test]
    fn test_latency_timer() {
        {
            let _timer = LatencyTimer::new("remote", "get_points");
            std::thread::sleep(Duration::from_micros(10));
        }
        // Timer recorded on drop
    }

    #[test]
    fn test_engine_state_tracking() {
        set_engine_state("Created");
        set_engine_state("Running");
        record_startup_total(Duration::from_millis(5));
    }
}
