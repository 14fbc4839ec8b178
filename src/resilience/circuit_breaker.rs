// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breaker in front of the remote ledger, backed by the recloser crate.
//!
//! Only transient failures (network, timeout, server) count toward tripping.
//! Business rejections such as insufficient points are normal answers from a
//! healthy ledger and leave the circuit alone.
//!
//! While open, calls fail fast with [`LedgerError::Network`] so the coordinator
//! takes its offline path without waiting on a timeout.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{LedgerError, LedgerResult};

/// Circuit state as reported in health output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    /// Recovery wait elapsed; the next call is a trial
    HalfOpen,
    Open,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::HalfOpen => "half_open",
            Self::Open => "open",
        })
    }
}

#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Size of the failure window; a full window at 50% failures trips
    pub failure_threshold: u32,
    /// Trial calls in half-open before deciding to close
    pub success_threshold: u32,
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            failure_threshold: 2,
            success_threshold: 1,
            recovery_timeout: Duration::from_millis(50),
        }
    }
}

/// Call counters since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CircuitStats {
    pub calls: u64,
    pub successes: u64,
    /// Transient failures, the only ones that count toward tripping
    pub failures: u64,
    /// Business rejections passed through untouched
    pub rejected_by_ledger: u64,
    /// Calls refused while open
    pub short_circuited: u64,
}

pub struct CircuitBreaker {
    name: String,
    inner: AsyncRecloser,
    recovery_timeout: Duration,
    /// Set on the first short-circuited call, cleared on the next success
    opened_at: Mutex<Option<Instant>>,

    calls: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejected_by_ledger: AtomicU64,
    short_circuited: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let recloser = Recloser::custom()
            .error_rate(0.5)
            .closed_len(config.failure_threshold.max(1) as usize)
            .half_open_len(config.success_threshold.max(1) as usize)
            .open_wait(config.recovery_timeout)
            .build();

        Self {
            name: name.into(),
            inner: recloser.into(),
            recovery_timeout: config.recovery_timeout,
            opened_at: Mutex::new(None),
            calls: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejected_by_ledger: AtomicU64::new(0),
            short_circuited: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// State inferred from call outcomes; recloser keeps its ring private.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        match *self.opened_at.lock() {
            None => CircuitState::Closed,
            Some(since) if since.elapsed() >= self.recovery_timeout => CircuitState::HalfOpen,
            Some(_) => CircuitState::Open,
        }
    }

    #[must_use]
    pub fn stats(&self) -> CircuitStats {
        CircuitStats {
            calls: self.calls.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            rejected_by_ledger: self.rejected_by_ledger.load(Ordering::Relaxed),
            short_circuited: self.short_circuited.load(Ordering::Relaxed),
        }
    }

    /// Run a remote call through the breaker. `op` names it in the error
    /// returned while the circuit is open.
    pub async fn call<F, Fut, T>(&self, op: &str, f: F) -> LedgerResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = LedgerResult<T>>,
    {
        self.calls.fetch_add(1, Ordering::Relaxed);

        match self.inner.call_with(LedgerError::is_transient, f()).await {
            Ok(value) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                self.mark_closed();
                crate::metrics::record_circuit_call(&self.name, "success");
                Ok(value)
            }
            Err(RecloserError::Rejected) => {
                self.short_circuited.fetch_add(1, Ordering::Relaxed);
                self.mark_open();
                crate::metrics::record_circuit_call(&self.name, "rejected");
                Err(LedgerError::Network(format!("circuit open: {}", op)))
            }
            Err(RecloserError::Inner(e)) if e.is_transient() => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                debug!(circuit = %self.name, op, error = %e, "Circuit call failed");
                crate::metrics::record_circuit_call(&self.name, "failure");
                Err(e)
            }
            Err(RecloserError::Inner(e)) => {
                // The ledger answered, so it is up
                self.rejected_by_ledger.fetch_add(1, Ordering::Relaxed);
                self.mark_closed();
                crate::metrics::record_circuit_call(&self.name, "rejected_by_ledger");
                Err(e)
            }
        }
    }

    fn mark_open(&self) {
        let mut opened_at = self.opened_at.lock();
        match *opened_at {
            None => {
                *opened_at = Some(Instant::now());
                warn!(circuit = %self.name, "Circuit opened, failing fast");
            }
            // Still refusing after the wait: the trial failed, restart the clock
            Some(since) if since.elapsed() >= self.recovery_timeout => *opened_at = Some(Instant::now()),
            Some(_) => {}
        }
    }

    fn mark_closed(&self) {
        if self.opened_at.lock().take().is_some() {
            info!(circuit = %self.name, "Circuit closed, remote ledger recovered");
        }
    }
}
