// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Typed failures returned by every ledger operation.
//!
//! Failures fall into two families:
//! - **Business** failures (validation, insufficient points, unavailable
//!   option, not found, auth) are final for the attempt and never queued.
//! - **Transient** failures (network, timeout, server) are eligible for the
//!   sync queue and for retry with back-off.
//!
//! ```
//! use redemption_ledger::LedgerError;
//!
//! let err = LedgerError::InsufficientPoints { required: 300, available: 200 };
//! assert!(!err.is_transient());
//! assert_eq!(err.to_string(), "insufficient points: required 300, available 200");
//!
//! assert!(LedgerError::Timeout("redeem".into()).is_transient());
//! ```

use thiserror::Error;

use crate::storage::traits::StorageError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Bad input or illegal state transition.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("insufficient points: required {required}, available {available}")]
    InsufficientPoints { required: i64, available: i64 },

    /// Option is inactive, expired or otherwise not redeemable.
    #[error("option unavailable: {0}")]
    OptionUnavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not authorized: {0}")]
    Auth(String),

    #[error("network unavailable: {0}")]
    Network(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("server error: {0}")]
    Server(String),

    /// Local storage failure. The cache can be rebuilt from the remote ledger.
    #[error("cache failure: {0}")]
    Cache(String),
}

impl LedgerError {
    /// Whether the failure may succeed later without any change to the request.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_) | Self::Server(_))
    }

    /// Whether the failure is a connectivity problem (the remote was never reached
    /// or the outcome is unknown).
    #[must_use]
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_))
    }

    /// Short label used for metrics and logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::InsufficientPoints { .. } => "insufficient_points",
            Self::OptionUnavailable(_) => "option_unavailable",
            Self::NotFound(_) => "not_found",
            Self::Auth(_) => "auth",
            Self::Network(_) => "network",
            Self::Timeout(_) => "timeout",
            Self::Server(_) => "server",
            Self::Cache(_) => "cache",
        }
    }
}

impl From<StorageError> for LedgerError {
    fn from(err: StorageError) -> Self {
        LedgerError::Cache(err.to_string())
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        LedgerError::Validation(format!("malformed payload: {}", err))
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;
