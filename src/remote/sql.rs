// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL-backed authoritative ledger (MySQL in production, SQLite for tests).
//!
//! Every mutation runs inside one database transaction. The balance is never
//! read-then-written: debits use a conditional update so a concurrent
//! redemption that got there first makes ours affect zero rows.
//!
//! ```sql
//! UPDATE ledger_accounts
//!    SET redeemed_total = redeemed_total + ?
//!  WHERE user_id = ? AND earned_total - redeemed_total >= ?
//! ```
//!
//! Counters that concurrent writers touch (`redemption_count`, `version`,
//! `is_active`) live in their own columns and override the JSON payload on read.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyConnection, AnyPool, Row};
use tracing::{debug, info};

use super::traits::RemoteLedger;
use super::{check_cancellation, check_redemption, LedgerRules};
use crate::error::{LedgerError, LedgerResult};
use crate::model::{
    now_millis, PointsAccount, PointsSummary, RedeemRequest, RedemptionOption, RedemptionStats,
    RedemptionTransaction, TransactionStatus,
};
use crate::query::{PageRequest, PaginatedResult, TransactionFilter};
use crate::resilience::retry::{retry, RetryConfig};
use crate::storage::sql::{install_drivers, text_column};

fn map_sqlx(e: sqlx::Error) -> LedgerError {
    match &e {
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            LedgerError::Network(e.to_string())
        }
        _ => LedgerError::Server(e.to_string()),
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error().is_some_and(|db| db.is_unique_violation())
}

fn corrupt(what: &str, e: impl std::fmt::Display) -> LedgerError {
    LedgerError::Server(format!("corrupt {} row: {}", what, e))
}

/// Integer flag column. MySQL reports `TINYINT(1)` as a boolean through the
/// `Any` driver, SQLite as an integer.
fn flag_column(row: &AnyRow, name: &str) -> Result<bool, sqlx::Error> {
    match row.try_get::<i64, _>(name) {
        Ok(value) => Ok(value != 0),
        Err(_) => row.try_get::<bool, _>(name),
    }
}

/// Dynamic bind value for filtered queries.
enum Bind {
    Text(String),
    Int(i64),
}

pub struct SqlLedger {
    pool: AnyPool,
    is_sqlite: bool,
    rules: LedgerRules,
}

impl SqlLedger {
    /// Connect with startup-mode retry and create the schema if missing.
    pub async fn connect(connection_string: &str, rules: LedgerRules) -> LedgerResult<Self> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("ledger_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(if is_sqlite { 1 } else { 20 })
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(map_sqlx)
        })
        .await?;

        let ledger = Self { pool, is_sqlite, rules };
        if is_sqlite {
            sqlx::query("PRAGMA journal_mode = WAL").execute(&ledger.pool).await.map_err(map_sqlx)?;
            sqlx::query("PRAGMA synchronous = NORMAL").execute(&ledger.pool).await.map_err(map_sqlx)?;
        }
        ledger.init_schema().await?;
        info!(sqlite = is_sqlite, "SQL ledger ready");
        Ok(ledger)
    }

    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    async fn init_schema(&self) -> LedgerResult<()> {
        let statements: &[&str] = if self.is_sqlite {
            &[
                r#"
                CREATE TABLE IF NOT EXISTS ledger_accounts (
                    user_id TEXT PRIMARY KEY,
                    earned_total INTEGER NOT NULL DEFAULT 0,
                    redeemed_total INTEGER NOT NULL DEFAULT 0,
                    updated_at INTEGER NOT NULL
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS ledger_options (
                    id TEXT PRIMARY KEY,
                    points_cost INTEGER NOT NULL,
                    is_active INTEGER NOT NULL,
                    expires_at INTEGER,
                    redemption_count INTEGER NOT NULL DEFAULT 0,
                    version INTEGER NOT NULL DEFAULT 1,
                    updated_at INTEGER NOT NULL,
                    payload TEXT NOT NULL
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS ledger_transactions (
                    id TEXT PRIMARY KEY,
                    client_ref TEXT NOT NULL UNIQUE,
                    user_id TEXT NOT NULL,
                    option_id TEXT NOT NULL,
                    status TEXT NOT NULL,
                    points_used INTEGER NOT NULL,
                    redeemed_at INTEGER NOT NULL,
                    version INTEGER NOT NULL DEFAULT 1,
                    payload TEXT NOT NULL
                )
                "#,
                "CREATE INDEX IF NOT EXISTS idx_ledger_tx_user ON ledger_transactions (user_id, redeemed_at)",
            ]
        } else {
            &[
                r#"
                CREATE TABLE IF NOT EXISTS ledger_accounts (
                    user_id VARCHAR(255) PRIMARY KEY,
                    earned_total BIGINT NOT NULL DEFAULT 0,
                    redeemed_total BIGINT NOT NULL DEFAULT 0,
                    updated_at BIGINT NOT NULL
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS ledger_options (
                    id VARCHAR(255) PRIMARY KEY,
                    points_cost BIGINT NOT NULL,
                    is_active TINYINT NOT NULL,
                    expires_at BIGINT NULL,
                    redemption_count BIGINT NOT NULL DEFAULT 0,
                    version BIGINT NOT NULL DEFAULT 1,
                    updated_at BIGINT NOT NULL,
                    payload LONGTEXT NOT NULL
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS ledger_transactions (
                    id VARCHAR(255) PRIMARY KEY,
                    client_ref VARCHAR(64) NOT NULL UNIQUE,
                    user_id VARCHAR(255) NOT NULL,
                    option_id VARCHAR(255) NOT NULL,
                    status VARCHAR(16) NOT NULL,
                    points_used BIGINT NOT NULL,
                    redeemed_at BIGINT NOT NULL,
                    version BIGINT NOT NULL DEFAULT 1,
                    payload LONGTEXT NOT NULL,
                    INDEX idx_ledger_tx_user (user_id, redeemed_at)
                )
                "#,
            ]
        };

        for sql in statements {
            retry("ledger_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql).execute(&self.pool).await.map_err(map_sqlx)
            })
            .await?;
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Row helpers (run on a pooled connection or inside a transaction)
    // ═══════════════════════════════════════════════════════════════════════

    fn decode_option(row: &AnyRow) -> LedgerResult<RedemptionOption> {
        let payload = text_column(row, "payload").ok_or_else(|| corrupt("option", "missing payload"))?;
        let mut option: RedemptionOption = serde_json::from_str(&payload).map_err(|e| corrupt("option", e))?;
        option.redemption_count = row.try_get::<i64, _>("redemption_count").map_err(|e| corrupt("option", e))? as u64;
        option.version = row.try_get::<i64, _>("version").map_err(|e| corrupt("option", e))? as u64;
        option.is_active = flag_column(row, "is_active").map_err(|e| corrupt("option", e))?;
        option.updated_at = row.try_get("updated_at").map_err(|e| corrupt("option", e))?;
        Ok(option)
    }

    fn decode_transaction(row: &AnyRow) -> LedgerResult<RedemptionTransaction> {
        let payload = text_column(row, "payload").ok_or_else(|| corrupt("transaction", "missing payload"))?;
        serde_json::from_str(&payload).map_err(|e| corrupt("transaction", e))
    }

    async fn load_option(conn: &mut AnyConnection, id: &str) -> LedgerResult<Option<RedemptionOption>> {
        let row = sqlx::query(
            "SELECT redemption_count, version, is_active, updated_at, payload FROM ledger_options WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(map_sqlx)?;
        row.as_ref().map(Self::decode_option).transpose()
    }

    async fn load_transaction(conn: &mut AnyConnection, id: &str) -> LedgerResult<RedemptionTransaction> {
        let row = sqlx::query("SELECT payload FROM ledger_transactions WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(map_sqlx)?;
        match row {
            Some(row) => Self::decode_transaction(&row),
            None => Err(LedgerError::NotFound(format!("transaction '{}'", id))),
        }
    }

    async fn find_by_client_ref(
        conn: &mut AnyConnection,
        client_ref: &str,
    ) -> LedgerResult<Option<RedemptionTransaction>> {
        let row = sqlx::query("SELECT payload FROM ledger_transactions WHERE client_ref = ?")
            .bind(client_ref)
            .fetch_optional(&mut *conn)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(Self::decode_transaction).transpose()
    }

    async fn load_account(conn: &mut AnyConnection, user_id: &str) -> LedgerResult<PointsSummary> {
        let row = sqlx::query("SELECT earned_total, redeemed_total, updated_at FROM ledger_accounts WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(map_sqlx)?;

        Ok(match row {
            Some(row) => {
                let earned_total: i64 = row.try_get("earned_total").map_err(map_sqlx)?;
                let redeemed_total: i64 = row.try_get("redeemed_total").map_err(map_sqlx)?;
                PointsSummary {
                    earned_total,
                    redeemed_total,
                    balance: earned_total - redeemed_total,
                    updated_at: row.try_get("updated_at").map_err(map_sqlx)?,
                }
            }
            None => PointsSummary { earned_total: 0, redeemed_total: 0, balance: 0, updated_at: 0 },
        })
    }

    async fn write_status(
        conn: &mut AnyConnection,
        tx: &RedemptionTransaction,
        expected: TransactionStatus,
    ) -> LedgerResult<bool> {
        let payload = serde_json::to_string(tx).map_err(|e| corrupt("transaction", e))?;
        let result = sqlx::query(
            "UPDATE ledger_transactions SET status = ?, version = ?, payload = ? WHERE id = ? AND status = ?",
        )
        .bind(tx.status.as_str())
        .bind(tx.version as i64)
        .bind(&payload)
        .bind(&tx.id)
        .bind(expected.as_str())
        .execute(&mut *conn)
        .await
        .map_err(map_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    fn account_upsert_sql(&self) -> &'static str {
        if self.is_sqlite {
            "INSERT INTO ledger_accounts (user_id, earned_total, redeemed_total, updated_at) VALUES (?, ?, 0, ?) \
             ON CONFLICT(user_id) DO UPDATE SET earned_total = earned_total + excluded.earned_total, \
             updated_at = excluded.updated_at"
        } else {
            "INSERT INTO ledger_accounts (user_id, earned_total, redeemed_total, updated_at) VALUES (?, ?, 0, ?) \
             ON DUPLICATE KEY UPDATE earned_total = earned_total + VALUES(earned_total), \
             updated_at = VALUES(updated_at)"
        }
    }

    fn option_upsert_sql(&self) -> &'static str {
        if self.is_sqlite {
            "INSERT INTO ledger_options (id, points_cost, is_active, expires_at, redemption_count, version, updated_at, payload) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) ON CONFLICT(id) DO UPDATE SET \
             points_cost = excluded.points_cost, is_active = excluded.is_active, expires_at = excluded.expires_at, \
             version = excluded.version, updated_at = excluded.updated_at, payload = excluded.payload"
        } else {
            "INSERT INTO ledger_options (id, points_cost, is_active, expires_at, redemption_count, version, updated_at, payload) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) ON DUPLICATE KEY UPDATE \
             points_cost = VALUES(points_cost), is_active = VALUES(is_active), expires_at = VALUES(expires_at), \
             version = VALUES(version), updated_at = VALUES(updated_at), payload = VALUES(payload)"
        }
    }
}

#[async_trait]
impl RemoteLedger for SqlLedger {
    async fn redeem_points(&self, request: &RedeemRequest) -> LedgerResult<RedemptionTransaction> {
        let now = now_millis();
        let mut db = self.pool.begin().await.map_err(map_sqlx)?;

        if let Some(existing) = Self::find_by_client_ref(&mut db, &request.client_ref).await? {
            debug!(client_ref = %request.client_ref, id = %existing.id, "Coalesced duplicate redemption");
            return Ok(existing);
        }

        let option = Self::load_option(&mut db, &request.option_id).await?;
        let account = Self::load_account(&mut db, &request.user_id).await?;
        check_redemption(option.as_ref(), &request.option_id, request.points_used, account.balance, now)?;
        let option_title = option.map(|o| o.title).unwrap_or_default();

        let debited = sqlx::query(
            "UPDATE ledger_accounts SET redeemed_total = redeemed_total + ?, updated_at = ? \
             WHERE user_id = ? AND earned_total - redeemed_total >= ?",
        )
        .bind(request.points_used)
        .bind(now)
        .bind(&request.user_id)
        .bind(request.points_used)
        .execute(&mut *db)
        .await
        .map_err(map_sqlx)?;

        if debited.rows_affected() == 0 {
            // A concurrent redemption committed first
            let fresh = Self::load_account(&mut db, &request.user_id).await?;
            return Err(LedgerError::InsufficientPoints {
                required: request.points_used,
                available: fresh.balance,
            });
        }

        sqlx::query(
            "UPDATE ledger_options SET redemption_count = redemption_count + 1, version = version + 1, updated_at = ? \
             WHERE id = ?",
        )
        .bind(now)
        .bind(&request.option_id)
        .execute(&mut *db)
        .await
        .map_err(map_sqlx)?;

        let status = self.rules.initial_status();
        let tx = RedemptionTransaction {
            id: format!("rdm-{}", uuid::Uuid::new_v4()),
            client_ref: request.client_ref.clone(),
            user_id: request.user_id.clone(),
            option_id: request.option_id.clone(),
            option_title,
            points_used: request.points_used,
            status,
            created_at: now,
            redeemed_at: now,
            completed_at: (status == TransactionStatus::Completed).then_some(now),
            notes: request.notes.clone(),
            version: 1,
        };
        let payload = serde_json::to_string(&tx).map_err(|e| corrupt("transaction", e))?;

        let inserted = sqlx::query(
            "INSERT INTO ledger_transactions (id, client_ref, user_id, option_id, status, points_used, redeemed_at, version, payload) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&tx.id)
        .bind(&tx.client_ref)
        .bind(&tx.user_id)
        .bind(&tx.option_id)
        .bind(tx.status.as_str())
        .bind(tx.points_used)
        .bind(tx.redeemed_at)
        .bind(tx.version as i64)
        .bind(&payload)
        .execute(&mut *db)
        .await;

        match inserted {
            Ok(_) => {
                db.commit().await.map_err(map_sqlx)?;
                Ok(tx)
            }
            Err(e) if is_unique_violation(&e) => {
                // Same client_ref committed by a concurrent replay: roll back ours, return theirs
                db.rollback().await.map_err(map_sqlx)?;
                let mut conn = self.pool.acquire().await.map_err(map_sqlx)?;
                Self::find_by_client_ref(&mut conn, &request.client_ref)
                    .await?
                    .ok_or_else(|| LedgerError::Server("duplicate client_ref vanished".into()))
            }
            Err(e) => Err(map_sqlx(e)),
        }
    }

    async fn cancel_redemption(
        &self,
        transaction_id: &str,
        reason: Option<&str>,
    ) -> LedgerResult<RedemptionTransaction> {
        let now = now_millis();
        let mut db = self.pool.begin().await.map_err(map_sqlx)?;

        let mut tx = Self::load_transaction(&mut db, transaction_id).await?;
        check_cancellation(&tx, &self.rules, now)?;
        tx.status = TransactionStatus::Cancelled;
        tx.version += 1;
        tx.annotate(&format!("cancelled: {}", reason.unwrap_or("no reason given")));

        if !Self::write_status(&mut db, &tx, TransactionStatus::Pending).await? {
            return Err(LedgerError::Validation(format!("transaction '{}' is no longer pending", tx.id)));
        }

        sqlx::query("UPDATE ledger_accounts SET redeemed_total = redeemed_total - ?, updated_at = ? WHERE user_id = ?")
            .bind(tx.points_used)
            .bind(now)
            .bind(&tx.user_id)
            .execute(&mut *db)
            .await
            .map_err(map_sqlx)?;

        sqlx::query(
            "UPDATE ledger_options SET redemption_count = redemption_count - 1, version = version + 1, updated_at = ? \
             WHERE id = ? AND redemption_count > 0",
        )
        .bind(now)
        .bind(&tx.option_id)
        .execute(&mut *db)
        .await
        .map_err(map_sqlx)?;

        db.commit().await.map_err(map_sqlx)?;
        Ok(tx)
    }

    async fn complete_redemption(&self, transaction_id: &str) -> LedgerResult<RedemptionTransaction> {
        let mut db = self.pool.begin().await.map_err(map_sqlx)?;

        let mut tx = Self::load_transaction(&mut db, transaction_id).await?;
        tx.status.ensure_transition(TransactionStatus::Completed)?;
        tx.status = TransactionStatus::Completed;
        tx.completed_at = Some(now_millis());
        tx.version += 1;

        if !Self::write_status(&mut db, &tx, TransactionStatus::Pending).await? {
            return Err(LedgerError::Validation(format!("transaction '{}' is no longer pending", tx.id)));
        }
        db.commit().await.map_err(map_sqlx)?;
        Ok(tx)
    }

    async fn get_options(&self) -> LedgerResult<Vec<RedemptionOption>> {
        let rows = sqlx::query("SELECT redemption_count, version, is_active, updated_at, payload FROM ledger_options")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.iter().map(Self::decode_option).collect()
    }

    async fn get_option(&self, option_id: &str) -> LedgerResult<RedemptionOption> {
        let mut conn = self.pool.acquire().await.map_err(map_sqlx)?;
        Self::load_option(&mut conn, option_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("option '{}'", option_id)))
    }

    async fn get_transaction(&self, transaction_id: &str) -> LedgerResult<RedemptionTransaction> {
        let mut conn = self.pool.acquire().await.map_err(map_sqlx)?;
        Self::load_transaction(&mut conn, transaction_id).await
    }

    async fn find_transaction_by_client_ref(&self, client_ref: &str) -> LedgerResult<Option<RedemptionTransaction>> {
        let mut conn = self.pool.acquire().await.map_err(map_sqlx)?;
        Self::find_by_client_ref(&mut conn, client_ref).await
    }

    async fn get_redemption_history(
        &self,
        user_id: &str,
        page: PageRequest,
        filter: &TransactionFilter,
    ) -> LedgerResult<PaginatedResult<RedemptionTransaction>> {
        let mut clauses = vec!["user_id = ?".to_string()];
        let mut binds = vec![Bind::Text(user_id.to_string())];

        if !filter.statuses.is_empty() {
            clauses.push(format!("status IN ({})", vec!["?"; filter.statuses.len()].join(", ")));
            binds.extend(filter.statuses.iter().map(|s| Bind::Text(s.as_str().to_string())));
        }
        if let Some(ref option_id) = filter.option_id {
            clauses.push("option_id = ?".into());
            binds.push(Bind::Text(option_id.clone()));
        }
        if let Some(since) = filter.since {
            clauses.push("redeemed_at >= ?".into());
            binds.push(Bind::Int(since));
        }
        if let Some(until) = filter.until {
            clauses.push("redeemed_at < ?".into());
            binds.push(Bind::Int(until));
        }
        let where_clause = clauses.join(" AND ");

        let count_sql = format!("SELECT COUNT(*) AS cnt FROM ledger_transactions WHERE {}", where_clause);
        let mut count_query = sqlx::query(&count_sql);
        for bind in &binds {
            count_query = match bind {
                Bind::Text(s) => count_query.bind(s.clone()),
                Bind::Int(i) => count_query.bind(*i),
            };
        }
        let total: i64 = count_query
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?
            .try_get("cnt")
            .map_err(map_sqlx)?;

        let page_sql = format!(
            "SELECT payload FROM ledger_transactions WHERE {} ORDER BY redeemed_at DESC, id DESC LIMIT ? OFFSET ?",
            where_clause
        );
        let mut page_query = sqlx::query(&page_sql);
        for bind in &binds {
            page_query = match bind {
                Bind::Text(s) => page_query.bind(s.clone()),
                Bind::Int(i) => page_query.bind(*i),
            };
        }
        let rows = page_query
            .bind(page.limit as i64)
            .bind(page.offset() as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;

        let items = rows.iter().map(Self::decode_transaction).collect::<LedgerResult<Vec<_>>>()?;
        let has_more = (page.offset() + items.len()) < total as usize;
        Ok(PaginatedResult { items, page: page.page, limit: page.limit, total: total as u64, has_more })
    }

    async fn validate_redemption_eligibility(
        &self,
        user_id: &str,
        option_id: &str,
        points_used: i64,
    ) -> LedgerResult<()> {
        let mut conn = self.pool.acquire().await.map_err(map_sqlx)?;
        let option = Self::load_option(&mut conn, option_id).await?;
        let account = Self::load_account(&mut conn, user_id).await?;
        check_redemption(option.as_ref(), option_id, points_used, account.balance, now_millis())
    }

    async fn get_points(&self, user_id: &str) -> LedgerResult<PointsAccount> {
        let mut conn = self.pool.acquire().await.map_err(map_sqlx)?;
        let summary = Self::load_account(&mut conn, user_id).await?;
        Ok(PointsAccount { user_id: user_id.to_string(), summary })
    }

    async fn get_stats(&self, user_id: &str) -> LedgerResult<RedemptionStats> {
        let rows = sqlx::query("SELECT payload FROM ledger_transactions WHERE user_id = ?")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        let txs = rows.iter().map(Self::decode_transaction).collect::<LedgerResult<Vec<_>>>()?;
        Ok(RedemptionStats::from_transactions(&txs))
    }

    async fn award_points(&self, user_id: &str, points: i64, reason: &str) -> LedgerResult<PointsAccount> {
        if points <= 0 {
            return Err(LedgerError::Validation(format!("award must be positive, got {}", points)));
        }
        let now = now_millis();
        let mut db = self.pool.begin().await.map_err(map_sqlx)?;
        sqlx::query(self.account_upsert_sql())
            .bind(user_id)
            .bind(points)
            .bind(now)
            .execute(&mut *db)
            .await
            .map_err(map_sqlx)?;
        let summary = Self::load_account(&mut db, user_id).await?;
        db.commit().await.map_err(map_sqlx)?;

        debug!(user_id, points, reason, "Points awarded");
        Ok(PointsAccount { user_id: user_id.to_string(), summary })
    }

    async fn upsert_option(&self, option: &RedemptionOption) -> LedgerResult<RedemptionOption> {
        option.validate()?;
        let now = now_millis();
        let mut db = self.pool.begin().await.map_err(map_sqlx)?;

        let stored = match Self::load_option(&mut db, &option.id).await? {
            Some(existing) => RedemptionOption {
                redemption_count: existing.redemption_count,
                created_at: existing.created_at,
                version: existing.version + 1,
                updated_at: now,
                ..option.clone()
            },
            None => RedemptionOption { redemption_count: 0, version: 1, updated_at: now, ..option.clone() },
        };
        let payload = serde_json::to_string(&stored).map_err(|e| corrupt("option", e))?;

        sqlx::query(self.option_upsert_sql())
            .bind(&stored.id)
            .bind(stored.points_cost)
            .bind(stored.is_active as i64)
            .bind(stored.expires_at)
            .bind(stored.redemption_count as i64)
            .bind(stored.version as i64)
            .bind(stored.updated_at)
            .bind(&payload)
            .execute(&mut *db)
            .await
            .map_err(map_sqlx)?;

        db.commit().await.map_err(map_sqlx)?;
        Ok(stored)
    }

    async fn archive_option(&self, option_id: &str) -> LedgerResult<RedemptionOption> {
        let mut db = self.pool.begin().await.map_err(map_sqlx)?;
        let updated = sqlx::query("UPDATE ledger_options SET is_active = 0, version = version + 1, updated_at = ? WHERE id = ?")
            .bind(now_millis())
            .bind(option_id)
            .execute(&mut *db)
            .await
            .map_err(map_sqlx)?;
        if updated.rows_affected() == 0 {
            return Err(LedgerError::NotFound(format!("option '{}'", option_id)));
        }
        let option = Self::load_option(&mut db, option_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("option '{}'", option_id)))?;
        db.commit().await.map_err(map_sqlx)?;
        Ok(option)
    }

    async fn ping(&self) -> LedgerResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await.map_err(map_sqlx)?;
        Ok(())
    }
}
