// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Exponential backoff for SQL connections and sync queue replays.
//!
//! SQL backends wrap connects and statements in [`retry`], which sleeps
//! inline between attempts. The sync queue only borrows the schedule
//! ([`RetryConfig::delay_for_attempt`]) and waits between drain passes instead.
//!
//! # Example
//!
//! ```
//! use redemption_ledger::RetryConfig;
//! use std::time::Duration;
//!
//! let sync = RetryConfig::sync_queue();
//! assert_eq!(sync.delay_for_attempt(1), Duration::from_secs(1));
//! assert_eq!(sync.delay_for_attempt(3), Duration::from_secs(4));
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::LedgerError;
use crate::storage::StorageError;

/// Errors that may clear up if the same call is made again.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for LedgerError {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }
}

impl Retryable for StorageError {
    fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Backend(_))
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Attempts before giving up; a queued operation moves to `failed` past this
    pub max_retries: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::sync_queue()
    }
}

impl RetryConfig {
    /// Connecting at startup: five attempts, roughly five seconds, then fail.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Single local-store statements; keeps callers responsive.
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(500),
            factor: 2.0,
        }
    }

    /// Replay schedule for queued mutations: 1s, 2s, 4s ... capped at 5 minutes.
    #[must_use]
    pub fn sync_queue() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            factor: 2.0,
        }
    }

    #[must_use]
    pub fn test() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }

    /// Delay before the next attempt after `attempt` failures (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.factor.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(scaled)
        }
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// runs out of attempts.
pub async fn retry<F, Fut, T, E>(operation_name: &str, config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let mut attempts: u32 = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    debug!(operation = operation_name, attempts, "Succeeded after retry");
                }
                return Ok(val);
            }
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) => {
                attempts += 1;
                if config.max_retries.is_some_and(|max| attempts as usize >= max) {
                    warn!(operation = operation_name, attempts, error = %err, "Giving up");
                    return Err(err);
                }

                let delay = config.delay_for_attempt(attempts);
                warn!(
                    operation = operation_name,
                    attempts,
                    error = %err,
                    retry_in_ms = delay.as_millis() as u64,
                    "Retrying"
                );
                sleep(delay).await;
            }
        }
    }
}
