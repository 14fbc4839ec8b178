// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Ledger data model.
//!
//! Strictly typed records that flow between the remote ledger, the local
//! cache and the sync queue. All timestamps are epoch milliseconds.
//!
//! # Example
//!
//! ```
//! use redemption_ledger::{RedemptionOption, TransactionStatus};
//!
//! let option = RedemptionOption::new("opt-1", "Movie night", 300);
//! assert!(option.is_redeemable(option.created_at));
//!
//! assert!(TransactionStatus::Pending.can_transition_to(TransactionStatus::Cancelled));
//! assert!(!TransactionStatus::Completed.can_transition_to(TransactionStatus::Cancelled));
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::LedgerError;

/// Prefix of transaction ids generated locally before the server assigns one.
pub const PLACEHOLDER_PREFIX: &str = "local-";

/// Current wall-clock time in epoch millis.
#[must_use]
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

// ═══════════════════════════════════════════════════════════════════════════
// Catalog
// ═══════════════════════════════════════════════════════════════════════════

/// A catalog entry a user can redeem points for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedemptionOption {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Cost in points (always > 0)
    pub points_cost: i64,
    #[serde(default)]
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    /// Number of live redemptions (maintained by the remote ledger)
    #[serde(default)]
    pub redemption_count: u64,
    pub created_at: i64,
    pub updated_at: i64,
    pub version: u64,
}

impl RedemptionOption {
    /// Create an active option with the minimal required fields.
    pub fn new(id: impl Into<String>, title: impl Into<String>, points_cost: i64) -> Self {
        let now = now_millis();
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            points_cost,
            category: String::new(),
            image_url: None,
            is_active: true,
            expires_at: None,
            redemption_count: 0,
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    #[must_use]
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn with_expiry(mut self, expires_at: i64) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    #[must_use]
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Inactive or expired options are never redeemable.
    #[must_use]
    pub fn is_redeemable(&self, now: i64) -> bool {
        self.is_active && !self.is_expired(now)
    }

    /// Boundary validation for records coming from storage or the wire.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.id.trim().is_empty() {
            return Err(LedgerError::Validation("option id is empty".into()));
        }
        if self.points_cost <= 0 {
            return Err(LedgerError::Validation(format!(
                "option '{}' has non-positive cost {}",
                self.id, self.points_cost
            )));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Transactions
// ═══════════════════════════════════════════════════════════════════════════

/// Lifecycle of a redemption transaction.
///
/// `Pending → Completed` and `Pending → Cancelled` are the only transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Cancelled,
}

impl TransactionStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    #[must_use]
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Completed) | (Self::Pending, Self::Cancelled)
        )
    }

    /// Statuses whose points count against the balance.
    #[must_use]
    pub fn debits_balance(&self) -> bool {
        matches!(self, Self::Pending | Self::Completed)
    }

    /// Check a transition and produce the failure callers surface.
    pub fn ensure_transition(&self, next: TransactionStatus) -> Result<(), LedgerError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(LedgerError::Validation(format!(
                "illegal status transition {} -> {}",
                self, next
            )))
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(LedgerError::Validation(format!("unknown status '{}'", other))),
        }
    }
}

/// One redemption attempt and its outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedemptionTransaction {
    pub id: String,
    /// Client-generated idempotency key, stable across retries
    pub client_ref: String,
    pub user_id: String,
    pub option_id: String,
    /// Option title at redemption time
    #[serde(default)]
    pub option_title: String,
    /// Option cost at redemption time
    pub points_used: i64,
    pub status: TransactionStatus,
    pub created_at: i64,
    pub redeemed_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub version: u64,
}

impl RedemptionTransaction {
    /// Placeholder id for a transaction the server has not acknowledged yet.
    #[must_use]
    pub fn placeholder_id(client_ref: &str) -> String {
        format!("{}{}", PLACEHOLDER_PREFIX, client_ref)
    }

    /// Build the local pending transaction recorded while offline.
    pub fn local_pending(request: &RedeemRequest, option_title: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id: Self::placeholder_id(&request.client_ref),
            client_ref: request.client_ref.clone(),
            user_id: request.user_id.clone(),
            option_id: request.option_id.clone(),
            option_title: option_title.into(),
            points_used: request.points_used,
            status: TransactionStatus::Pending,
            created_at: now,
            redeemed_at: now,
            completed_at: None,
            notes: request.notes.clone(),
            version: 0,
        }
    }

    #[must_use]
    pub fn is_placeholder(&self) -> bool {
        self.id.starts_with(PLACEHOLDER_PREFIX)
    }

    /// Whether the cancellation window is still open at `now`.
    #[must_use]
    pub fn within_window(&self, now: i64, window_ms: i64) -> bool {
        now - self.redeemed_at <= window_ms
    }

    /// Append a line to the notes (the only mutation allowed on terminal rows).
    pub fn annotate(&mut self, note: &str) {
        if note.is_empty() {
            return;
        }
        self.notes = Some(match self.notes.take() {
            Some(existing) if !existing.is_empty() => format!("{}\n{}", existing, note),
            _ => note.to_string(),
        });
    }

    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.points_used < 0 {
            return Err(LedgerError::Validation(format!(
                "transaction '{}' has negative points {}",
                self.id, self.points_used
            )));
        }
        if self.user_id.is_empty() || self.option_id.is_empty() {
            return Err(LedgerError::Validation(format!(
                "transaction '{}' is missing user or option",
                self.id
            )));
        }
        Ok(())
    }
}

/// Input of a redemption, also the payload of a queued `create`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedeemRequest {
    pub user_id: String,
    pub option_id: String,
    pub points_used: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub client_ref: String,
}

impl RedeemRequest {
    /// New request with a fresh idempotency key.
    pub fn new(
        user_id: impl Into<String>,
        option_id: impl Into<String>,
        points_used: i64,
        notes: Option<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            option_id: option_id.into(),
            points_used,
            notes,
            client_ref: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// Payload of a queued transaction `update`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: TransactionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Points
// ═══════════════════════════════════════════════════════════════════════════

/// Authoritative per-user balance as reported by the remote ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointsSummary {
    pub earned_total: i64,
    /// Points held by pending and completed redemptions
    pub redeemed_total: i64,
    pub balance: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointsAccount {
    pub user_id: String,
    #[serde(flatten)]
    pub summary: PointsSummary,
}

/// Last known earned total, kept locally for the offline balance computation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointsSnapshot {
    pub user_id: String,
    pub earned_total: i64,
    pub captured_at: i64,
}

/// Per-user redemption aggregates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedemptionStats {
    pub total_redemptions: u64,
    pub pending_count: u64,
    pub completed_count: u64,
    pub cancelled_count: u64,
    /// Points held by pending and completed redemptions
    pub points_redeemed: i64,
    pub points_refunded: i64,
}

impl RedemptionStats {
    /// Fold a set of transactions into aggregates.
    pub fn from_transactions<'a>(txs: impl IntoIterator<Item = &'a RedemptionTransaction>) -> Self {
        let mut stats = Self::default();
        for tx in txs {
            stats.total_redemptions += 1;
            match tx.status {
                TransactionStatus::Pending => stats.pending_count += 1,
                TransactionStatus::Completed => stats.completed_count += 1,
                TransactionStatus::Cancelled => stats.cancelled_count += 1,
            }
            if tx.status.debits_balance() {
                stats.points_redeemed += tx.points_used;
            } else {
                stats.points_refunded += tx.points_used;
            }
        }
        stats
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Cache metadata
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Mirrors confirmed remote state
    Synced,
    /// Carries local mutations the remote has not acknowledged
    Dirty,
    /// Local mutation whose replay gave up; holds nothing until re-queued
    Failed,
}

impl SyncStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::Dirty => "dirty",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for SyncStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "synced" => Ok(Self::Synced),
            "dirty" => Ok(Self::Dirty),
            "failed" => Ok(Self::Failed),
            other => Err(LedgerError::Validation(format!("unknown sync status '{}'", other))),
        }
    }
}

/// A cached row: the value plus its local sync metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedRecord<T> {
    pub value: T,
    pub sync_status: SyncStatus,
    /// Last local write (epoch millis), drives TTL eviction
    pub updated_at: i64,
}

impl<T> CachedRecord<T> {
    pub fn synced(value: T) -> Self {
        Self { value, sync_status: SyncStatus::Synced, updated_at: now_millis() }
    }

    pub fn dirty(value: T) -> Self {
        Self { value, sync_status: SyncStatus::Dirty, updated_at: now_millis() }
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.sync_status == SyncStatus::Dirty
    }

    /// Confirmed by the remote ledger. Dirty and failed rows are local state
    /// that mirroring and eviction must leave alone.
    #[must_use]
    pub fn is_synced(&self) -> bool {
        self.sync_status == SyncStatus::Synced
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Sync queue
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Option,
    Transaction,
}

impl EntityType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Option => "option",
            Self::Transaction => "transaction",
        }
    }
}

impl FromStr for EntityType {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "option" => Ok(Self::Option),
            "transaction" => Ok(Self::Transaction),
            other => Err(LedgerError::Validation(format!("unknown entity type '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    /// Refresh the cached copy from the remote ledger
    Sync,
}

impl OperationKind {
    /// Queue priority: create > update > delete > sync.
    #[must_use]
    pub fn priority(&self) -> i32 {
        match self {
            Self::Create => 3,
            Self::Update => 2,
            Self::Delete => 1,
            Self::Sync => 0,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Sync => "sync",
        }
    }
}

impl FromStr for OperationKind {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            "sync" => Ok(Self::Sync),
            other => Err(LedgerError::Validation(format!("unknown operation '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueState {
    Queued,
    /// Retries exhausted or rejected by the server; kept for diagnostics
    Failed,
}

impl QueueState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for QueueState {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "failed" => Ok(Self::Failed),
            other => Err(LedgerError::Validation(format!("unknown queue state '{}'", other))),
        }
    }
}

/// A mutation recorded locally and not yet acknowledged by the remote ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingSyncOperation {
    /// Assigned by the store on enqueue; FIFO tiebreak within a priority
    pub seq: u64,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub kind: OperationKind,
    pub payload: Value,
    pub priority: i32,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: i64,
    pub scheduled_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub state: QueueState,
}

impl PendingSyncOperation {
    pub fn new(
        entity_type: EntityType,
        entity_id: impl Into<String>,
        kind: OperationKind,
        payload: Value,
        max_retries: u32,
    ) -> Self {
        let now = now_millis();
        Self {
            seq: 0,
            entity_type,
            entity_id: entity_id.into(),
            kind,
            payload,
            priority: kind.priority(),
            retry_count: 0,
            max_retries,
            created_at: now,
            scheduled_at: now,
            last_error: None,
            state: QueueState::Queued,
        }
    }

    /// Key grouping operations that must replay in enqueue order.
    #[must_use]
    pub fn entity_key(&self) -> (EntityType, &str) {
        (self.entity_type, self.entity_id.as_str())
    }

    #[must_use]
    pub fn is_due(&self, now: i64) -> bool {
        self.state == QueueState::Queued && self.scheduled_at <= now
    }
}

/// Queue ordering: priority descending, then enqueue order.
pub fn queue_order(a: &PendingSyncOperation, b: &PendingSyncOperation) -> std::cmp::Ordering {
    b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq))
}
