// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL backend for the local ledger store.
//!
//! Normally a SQLite file next to the application, so the cache and the sync
//! queue survive restarts. Rows keep their indexable fields in proper columns
//! and the full record as JSON in a `payload` TEXT column:
//!
//! ```sql
//! CREATE TABLE redemption_transactions (
//!   id TEXT PRIMARY KEY,
//!   client_ref TEXT NOT NULL,
//!   user_id TEXT NOT NULL,
//!   status TEXT NOT NULL,
//!   version INTEGER NOT NULL,
//!   sync_status TEXT NOT NULL,   -- 'synced' | 'dirty' | 'failed'
//!   updated_at INTEGER NOT NULL,
//!   payload TEXT NOT NULL
//! )
//! ```
//!
//! ## sqlx Any Driver Quirks
//!
//! The `Any` driver treats MySQL TEXT columns as BLOB, so text is read as
//! `String` first with a `Vec<u8>` fallback. It also reports no
//! `last_insert_id` for SQLite, so queue inserts use `RETURNING seq` there and
//! `LAST_INSERT_ID()` on the same connection for MySQL.

use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::query::Query;
use sqlx::{Any, AnyConnection, AnyPool, Database, Row};

use super::traits::{CachedOption, CachedTransaction, LedgerStore, StorageError};
use crate::model::{CachedRecord, PendingSyncOperation, PointsSnapshot, QueueState, SyncStatus};
use crate::resilience::retry::{retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

pub(crate) fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

/// Read a text column as String (SQLite) or bytes (MySQL).
pub(crate) fn text_column(row: &AnyRow, name: &str) -> Option<String> {
    row.try_get::<String, _>(name).ok().or_else(|| {
        row.try_get::<Vec<u8>, _>(name)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
    })
}

fn backend(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

const INSERT_OPERATION: &str = "INSERT INTO sync_queue (entity_type, entity_id, kind, priority, retry_count, \
     max_retries, created_at, scheduled_at, last_error, state, payload) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

fn bind_transaction<'q>(
    sql: &'q str,
    record: &'q CachedTransaction,
    payload: &'q str,
) -> Query<'q, Any, <Any as Database>::Arguments<'q>> {
    let tx = &record.value;
    sqlx::query(sql)
        .bind(&tx.id)
        .bind(&tx.client_ref)
        .bind(&tx.user_id)
        .bind(tx.status.as_str())
        .bind(tx.version as i64)
        .bind(record.sync_status.as_str())
        .bind(record.updated_at)
        .bind(payload)
}

fn bind_option<'q>(
    sql: &'q str,
    record: &'q CachedOption,
    payload: &'q str,
) -> Query<'q, Any, <Any as Database>::Arguments<'q>> {
    sqlx::query(sql)
        .bind(&record.value.id)
        .bind(record.value.version as i64)
        .bind(record.sync_status.as_str())
        .bind(record.updated_at)
        .bind(payload)
}

pub struct SqlStore {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlStore {
    /// Create a new SQL store with startup-mode retry (fails fast if config is wrong).
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("cache_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(if is_sqlite { 4 } else { 10 })
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(backend)
        })
        .await?;

        let store = Self { pool, is_sqlite };

        if is_sqlite {
            store.enable_wal_mode().await?;
        }

        store.init_schema().await?;
        Ok(store)
    }

    /// Open (or create) a SQLite cache file.
    pub async fn open_file(path: &str) -> Result<Self, StorageError> {
        Self::new(&format!("sqlite://{}?mode=rwc", path)).await
    }

    /// Get a clone of the connection pool.
    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;

        // WAL mode is safe with NORMAL
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let statements: &[&str] = if self.is_sqlite {
            &[
                r#"
                CREATE TABLE IF NOT EXISTS redemption_options (
                    id TEXT PRIMARY KEY,
                    version INTEGER NOT NULL,
                    sync_status TEXT NOT NULL,
                    updated_at INTEGER NOT NULL,
                    payload TEXT NOT NULL
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS redemption_transactions (
                    id TEXT PRIMARY KEY,
                    client_ref TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    status TEXT NOT NULL,
                    version INTEGER NOT NULL,
                    sync_status TEXT NOT NULL,
                    updated_at INTEGER NOT NULL,
                    payload TEXT NOT NULL
                )
                "#,
                "CREATE INDEX IF NOT EXISTS idx_tx_user ON redemption_transactions (user_id)",
                "CREATE INDEX IF NOT EXISTS idx_tx_client_ref ON redemption_transactions (client_ref)",
                r#"
                CREATE TABLE IF NOT EXISTS sync_queue (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    entity_type TEXT NOT NULL,
                    entity_id TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    priority INTEGER NOT NULL,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    max_retries INTEGER NOT NULL,
                    created_at INTEGER NOT NULL,
                    scheduled_at INTEGER NOT NULL,
                    last_error TEXT,
                    state TEXT NOT NULL DEFAULT 'queued',
                    payload TEXT NOT NULL
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS points_snapshots (
                    user_id TEXT PRIMARY KEY,
                    earned_total INTEGER NOT NULL,
                    captured_at INTEGER NOT NULL
                )
                "#,
            ]
        } else {
            &[
                r#"
                CREATE TABLE IF NOT EXISTS redemption_options (
                    id VARCHAR(255) PRIMARY KEY,
                    version BIGINT NOT NULL,
                    sync_status VARCHAR(16) NOT NULL,
                    updated_at BIGINT NOT NULL,
                    payload LONGTEXT NOT NULL
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS redemption_transactions (
                    id VARCHAR(255) PRIMARY KEY,
                    client_ref VARCHAR(64) NOT NULL,
                    user_id VARCHAR(255) NOT NULL,
                    status VARCHAR(16) NOT NULL,
                    version BIGINT NOT NULL,
                    sync_status VARCHAR(16) NOT NULL,
                    updated_at BIGINT NOT NULL,
                    payload LONGTEXT NOT NULL,
                    INDEX idx_tx_user (user_id),
                    INDEX idx_tx_client_ref (client_ref)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS sync_queue (
                    seq BIGINT PRIMARY KEY AUTO_INCREMENT,
                    entity_type VARCHAR(16) NOT NULL,
                    entity_id VARCHAR(255) NOT NULL,
                    kind VARCHAR(16) NOT NULL,
                    priority INT NOT NULL,
                    retry_count INT NOT NULL DEFAULT 0,
                    max_retries INT NOT NULL,
                    created_at BIGINT NOT NULL,
                    scheduled_at BIGINT NOT NULL,
                    last_error TEXT,
                    state VARCHAR(16) NOT NULL DEFAULT 'queued',
                    payload LONGTEXT NOT NULL
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS points_snapshots (
                    user_id VARCHAR(255) PRIMARY KEY,
                    earned_total BIGINT NOT NULL,
                    captured_at BIGINT NOT NULL
                )
                "#,
            ]
        };

        for sql in statements {
            retry("cache_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql).execute(&self.pool).await.map_err(backend)
            })
            .await?;
        }

        Ok(())
    }

    fn upsert_sql(&self, table: &str, columns: &[&str]) -> String {
        let placeholders = vec!["?"; columns.len()].join(", ");
        let updates: Vec<String> = columns[1..]
            .iter()
            .map(|c| {
                if self.is_sqlite {
                    format!("{c} = excluded.{c}")
                } else {
                    format!("{c} = VALUES({c})")
                }
            })
            .collect();
        let conflict = if self.is_sqlite {
            format!("ON CONFLICT({}) DO UPDATE SET", columns[0])
        } else {
            "ON DUPLICATE KEY UPDATE".to_string()
        };
        format!(
            "INSERT INTO {} ({}) VALUES ({}) {} {}",
            table,
            columns.join(", "),
            placeholders,
            conflict,
            updates.join(", ")
        )
    }

    fn transaction_upsert_sql(&self) -> String {
        self.upsert_sql(
            "redemption_transactions",
            &["id", "client_ref", "user_id", "status", "version", "sync_status", "updated_at", "payload"],
        )
    }

    fn option_upsert_sql(&self) -> String {
        self.upsert_sql("redemption_options", &["id", "version", "sync_status", "updated_at", "payload"])
    }

    /// Insert a queue row on `conn` and read back its sequence number on the
    /// same connection.
    async fn insert_operation(
        &self,
        conn: &mut AnyConnection,
        op: &PendingSyncOperation,
    ) -> Result<u64, StorageError> {
        let payload = Self::encode(&op.entity_id, &op.payload)?;
        let sql = if self.is_sqlite {
            format!("{} RETURNING seq", INSERT_OPERATION)
        } else {
            INSERT_OPERATION.to_string()
        };

        let query = sqlx::query(&sql)
            .bind(op.entity_type.as_str())
            .bind(&op.entity_id)
            .bind(op.kind.as_str())
            .bind(op.priority as i64)
            .bind(op.retry_count as i64)
            .bind(op.max_retries as i64)
            .bind(op.created_at)
            .bind(op.scheduled_at)
            .bind(&op.last_error)
            .bind(op.state.as_str())
            .bind(&payload);

        let row = if self.is_sqlite {
            query.fetch_one(&mut *conn).await.map_err(backend)?
        } else {
            query.execute(&mut *conn).await.map_err(backend)?;
            sqlx::query("SELECT CAST(LAST_INSERT_ID() AS SIGNED) AS seq")
                .fetch_one(&mut *conn)
                .await
                .map_err(backend)?
        };

        let seq: i64 = row.try_get("seq").map_err(backend)?;
        if seq <= 0 {
            return Err(StorageError::Backend(format!("sync_queue insert returned invalid seq {}", seq)));
        }
        Ok(seq as u64)
    }

    fn decode_record<T: serde::de::DeserializeOwned>(row: &AnyRow) -> Result<CachedRecord<T>, StorageError> {
        let id = text_column(row, "id").unwrap_or_default();
        let payload = text_column(row, "payload").ok_or_else(|| StorageError::Corruption {
            id: id.clone(),
            reason: "missing payload".into(),
        })?;
        let value: T = serde_json::from_str(&payload).map_err(|e| StorageError::Corruption {
            id: id.clone(),
            reason: e.to_string(),
        })?;
        let sync_status: SyncStatus = text_column(row, "sync_status")
            .unwrap_or_default()
            .parse()
            .map_err(|e: crate::error::LedgerError| StorageError::Corruption { id, reason: e.to_string() })?;
        let updated_at: i64 = row.try_get("updated_at").map_err(backend)?;
        Ok(CachedRecord { value, sync_status, updated_at })
    }

    fn decode_operation(row: &AnyRow) -> Result<PendingSyncOperation, StorageError> {
        let seq: i64 = row.try_get("seq").map_err(backend)?;
        let corrupt = |reason: String| StorageError::Corruption { id: format!("sync_queue#{}", seq), reason };

        let text = |name: &str| text_column(row, name).ok_or_else(|| corrupt(format!("missing {}", name)));
        let int = |name: &str| row.try_get::<i64, _>(name).map_err(backend);
        let payload = serde_json::from_str(&text("payload")?).map_err(|e| corrupt(e.to_string()))?;

        Ok(PendingSyncOperation {
            seq: seq as u64,
            entity_type: text("entity_type")?.parse().map_err(|e: crate::error::LedgerError| corrupt(e.to_string()))?,
            entity_id: text("entity_id")?,
            kind: text("kind")?.parse().map_err(|e: crate::error::LedgerError| corrupt(e.to_string()))?,
            payload,
            priority: int("priority")? as i32,
            retry_count: int("retry_count")? as u32,
            max_retries: int("max_retries")? as u32,
            created_at: int("created_at")?,
            scheduled_at: int("scheduled_at")?,
            last_error: text_column(row, "last_error"),
            state: text("state")?.parse().map_err(|e: crate::error::LedgerError| corrupt(e.to_string()))?,
        })
    }

    fn encode<T: serde::Serialize>(id: &str, value: &T) -> Result<String, StorageError> {
        serde_json::to_string(value).map_err(|e| StorageError::Corruption { id: id.to_string(), reason: e.to_string() })
    }
}

#[async_trait]
impl LedgerStore for SqlStore {
    async fn get_option(&self, id: &str) -> Result<Option<CachedOption>, StorageError> {
        let row = retry("cache_get_option", &RetryConfig::query(), || async {
            sqlx::query("SELECT id, sync_status, updated_at, payload FROM redemption_options WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)
        })
        .await?;
        row.as_ref().map(Self::decode_record).transpose()
    }

    async fn put_option(&self, record: &CachedOption) -> Result<(), StorageError> {
        let sql = self.option_upsert_sql();
        let payload = Self::encode(&record.value.id, &record.value)?;

        retry("cache_put_option", &RetryConfig::query(), || async {
            bind_option(&sql, record, &payload).execute(&self.pool).await.map_err(backend)?;
            Ok(())
        })
        .await
    }

    async fn delete_option(&self, id: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM redemption_options WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn list_options(&self) -> Result<Vec<CachedOption>, StorageError> {
        let rows = sqlx::query("SELECT id, sync_status, updated_at, payload FROM redemption_options")
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(Self::decode_record).collect()
    }

    async fn get_transaction(&self, id: &str) -> Result<Option<CachedTransaction>, StorageError> {
        let row = retry("cache_get_transaction", &RetryConfig::query(), || async {
            sqlx::query("SELECT id, sync_status, updated_at, payload FROM redemption_transactions WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)
        })
        .await?;
        row.as_ref().map(Self::decode_record).transpose()
    }

    async fn find_transaction_by_client_ref(
        &self,
        client_ref: &str,
    ) -> Result<Option<CachedTransaction>, StorageError> {
        let row = sqlx::query(
            "SELECT id, sync_status, updated_at, payload FROM redemption_transactions WHERE client_ref = ? LIMIT 1",
        )
        .bind(client_ref)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.as_ref().map(Self::decode_record).transpose()
    }

    async fn put_transaction(&self, record: &CachedTransaction) -> Result<(), StorageError> {
        let sql = self.transaction_upsert_sql();
        let payload = Self::encode(&record.value.id, &record.value)?;

        retry("cache_put_transaction", &RetryConfig::query(), || async {
            bind_transaction(&sql, record, &payload).execute(&self.pool).await.map_err(backend)?;
            Ok(())
        })
        .await
    }

    async fn delete_transaction(&self, id: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM redemption_transactions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn list_transactions(&self, user_id: Option<&str>) -> Result<Vec<CachedTransaction>, StorageError> {
        let rows = match user_id {
            Some(user) => {
                sqlx::query(
                    "SELECT id, sync_status, updated_at, payload FROM redemption_transactions WHERE user_id = ?",
                )
                .bind(user)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query("SELECT id, sync_status, updated_at, payload FROM redemption_transactions")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(backend)?;
        rows.iter().map(Self::decode_record).collect()
    }

    async fn get_points_snapshot(&self, user_id: &str) -> Result<Option<PointsSnapshot>, StorageError> {
        let row = sqlx::query("SELECT user_id, earned_total, captured_at FROM points_snapshots WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

        row.map(|row| {
            Ok(PointsSnapshot {
                user_id: text_column(&row, "user_id").unwrap_or_else(|| user_id.to_string()),
                earned_total: row.try_get("earned_total").map_err(backend)?,
                captured_at: row.try_get("captured_at").map_err(backend)?,
            })
        })
        .transpose()
    }

    async fn put_points_snapshot(&self, snapshot: &PointsSnapshot) -> Result<(), StorageError> {
        let sql = self.upsert_sql("points_snapshots", &["user_id", "earned_total", "captured_at"]);
        sqlx::query(&sql)
            .bind(&snapshot.user_id)
            .bind(snapshot.earned_total)
            .bind(snapshot.captured_at)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn enqueue(&self, op: &PendingSyncOperation) -> Result<u64, StorageError> {
        let mut conn = self.pool.acquire().await.map_err(backend)?;
        self.insert_operation(&mut *conn, op).await
    }

    async fn update_operation(&self, op: &PendingSyncOperation) -> Result<(), StorageError> {
        let payload = Self::encode(&op.entity_id, &op.payload)?;
        let result = sqlx::query(
            "UPDATE sync_queue SET entity_id = ?, retry_count = ?, scheduled_at = ?, last_error = ?, \
             state = ?, payload = ? WHERE seq = ?",
        )
        .bind(&op.entity_id)
        .bind(op.retry_count as i64)
        .bind(op.scheduled_at)
        .bind(&op.last_error)
        .bind(op.state.as_str())
        .bind(&payload)
        .bind(op.seq as i64)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    async fn delete_operation(&self, seq: u64) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM sync_queue WHERE seq = ?")
            .bind(seq as i64)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn list_operations(&self) -> Result<Vec<PendingSyncOperation>, StorageError> {
        let rows = sqlx::query(
            "SELECT seq, entity_type, entity_id, kind, priority, retry_count, max_retries, created_at, \
             scheduled_at, last_error, state, payload FROM sync_queue ORDER BY seq ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(Self::decode_operation).collect()
    }

    async fn stage_transaction(
        &self,
        record: &CachedTransaction,
        op: &PendingSyncOperation,
    ) -> Result<u64, StorageError> {
        let sql = self.transaction_upsert_sql();
        let payload = Self::encode(&record.value.id, &record.value)?;

        let mut db_tx = self.pool.begin().await.map_err(backend)?;
        bind_transaction(&sql, record, &payload).execute(&mut *db_tx).await.map_err(backend)?;
        let seq = self.insert_operation(&mut *db_tx, op).await?;
        db_tx.commit().await.map_err(backend)?;
        Ok(seq)
    }

    async fn stage_option(&self, record: &CachedOption, op: &PendingSyncOperation) -> Result<u64, StorageError> {
        let sql = self.option_upsert_sql();
        let payload = Self::encode(&record.value.id, &record.value)?;

        let mut db_tx = self.pool.begin().await.map_err(backend)?;
        bind_option(&sql, record, &payload).execute(&mut *db_tx).await.map_err(backend)?;
        let seq = self.insert_operation(&mut *db_tx, op).await?;
        db_tx.commit().await.map_err(backend)?;
        Ok(seq)
    }

    /// Single database transaction: a crash never leaves both the placeholder
    /// and the server row, or queue entries pointing at a deleted id.
    async fn replace_transaction(
        &self,
        placeholder_id: &str,
        record: &CachedTransaction,
    ) -> Result<usize, StorageError> {
        let tx = &record.value;
        let payload = Self::encode(&tx.id, tx)?;
        let sql = self.transaction_upsert_sql();

        let mut db_tx = self.pool.begin().await.map_err(backend)?;

        bind_transaction(&sql, record, &payload).execute(&mut *db_tx).await.map_err(backend)?;

        if placeholder_id != tx.id {
            sqlx::query("DELETE FROM redemption_transactions WHERE id = ?")
                .bind(placeholder_id)
                .execute(&mut *db_tx)
                .await
                .map_err(backend)?;
        }

        let rewritten = sqlx::query("UPDATE sync_queue SET entity_id = ? WHERE entity_type = 'transaction' AND entity_id = ?")
            .bind(&tx.id)
            .bind(placeholder_id)
            .execute(&mut *db_tx)
            .await
            .map_err(backend)?
            .rows_affected();

        db_tx.commit().await.map_err(backend)?;
        Ok(rewritten as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        EntityType, OperationKind, RedeemRequest, RedemptionOption, RedemptionTransaction, TransactionStatus,
    };
    use serde_json::json;
    use tempfile::TempDir;

    async fn open_store(dir: &TempDir) -> SqlStore {
        let path = dir.path().join("cache.db");
        SqlStore::open_file(&path.display().to_string()).await.unwrap()
    }

    fn test_tx(user: &str) -> RedemptionTransaction {
        RedemptionTransaction::local_pending(&RedeemRequest::new(user, "opt-1", 300, None), "Movie night")
    }

    #[tokio::test]
    async fn test_option_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let option = RedemptionOption::new("opt-1", "Movie night", 300).with_category("leisure");
        store.put_option(&CachedRecord::synced(option.clone())).await.unwrap();

        let fetched = store.get_option("opt-1").await.unwrap().unwrap();
        assert_eq!(fetched.value, option);
        assert_eq!(fetched.sync_status, SyncStatus::Synced);
        assert!(store.get_option("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_overwrites() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let mut tx = test_tx("alice");
        store.put_transaction(&CachedRecord::dirty(tx.clone())).await.unwrap();
        tx.status = TransactionStatus::Cancelled;
        store.put_transaction(&CachedRecord::synced(tx.clone())).await.unwrap();

        let all = store.list_transactions(None).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].value.status, TransactionStatus::Cancelled);
        assert!(!all[0].is_dirty());
    }

    #[tokio::test]
    async fn test_list_transactions_filters_user() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        store.put_transaction(&CachedRecord::synced(test_tx("alice"))).await.unwrap();
        store.put_transaction(&CachedRecord::synced(test_tx("bob"))).await.unwrap();

        let alice = store.list_transactions(Some("alice")).await.unwrap();
        assert_eq!(alice.len(), 1);
        assert_eq!(alice[0].value.user_id, "alice");
    }

    #[tokio::test]
    async fn test_client_ref_lookup() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let tx = test_tx("alice");
        store.put_transaction(&CachedRecord::dirty(tx.clone())).await.unwrap();
        let found = store.find_transaction_by_client_ref(&tx.client_ref).await.unwrap();
        assert_eq!(found.map(|r| r.value.id), Some(tx.id));
    }

    #[tokio::test]
    async fn test_snapshot_upsert() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let mut snap = PointsSnapshot { user_id: "alice".into(), earned_total: 500, captured_at: 1 };
        store.put_points_snapshot(&snap).await.unwrap();
        snap.earned_total = 700;
        store.put_points_snapshot(&snap).await.unwrap();

        assert_eq!(store.get_points_snapshot("alice").await.unwrap(), Some(snap));
        assert!(store.get_points_snapshot("bob").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_queue_persistence_and_update() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let op = PendingSyncOperation::new(
            EntityType::Transaction,
            "local-1",
            OperationKind::Create,
            json!({"points_used": 300}),
            5,
        );
        let seq_a = store.enqueue(&op).await.unwrap();
        let seq_b = store.enqueue(&op).await.unwrap();
        assert!(seq_b > seq_a);

        let mut ops = store.list_operations().await.unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].seq, seq_a);
        assert_eq!(ops[0].payload["points_used"], 300);

        ops[0].retry_count = 2;
        ops[0].state = QueueState::Failed;
        ops[0].last_error = Some("timeout".into());
        store.update_operation(&ops[0]).await.unwrap();

        let reloaded = store.list_operations().await.unwrap();
        assert_eq!(reloaded[0].retry_count, 2);
        assert_eq!(reloaded[0].state, QueueState::Failed);
        assert_eq!(reloaded[0].last_error.as_deref(), Some("timeout"));

        store.delete_operation(seq_a).await.unwrap();
        assert_eq!(store.list_operations().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_queue_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = open_store(&dir).await;
            let op = PendingSyncOperation::new(EntityType::Option, "opt-1", OperationKind::Sync, json!(null), 3);
            store.enqueue(&op).await.unwrap();
            store.pool().close().await;
        }

        let store = open_store(&dir).await;
        let ops = store.list_operations().await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].entity_type, EntityType::Option);
        assert_eq!(ops[0].kind, OperationKind::Sync);
    }

    #[tokio::test]
    async fn test_replace_transaction_is_atomic_swap() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let placeholder = test_tx("alice");
        store.put_transaction(&CachedRecord::dirty(placeholder.clone())).await.unwrap();
        let op = PendingSyncOperation::new(
            EntityType::Transaction,
            placeholder.id.clone(),
            OperationKind::Update,
            json!({"status": "cancelled"}),
            5,
        );
        store.enqueue(&op).await.unwrap();

        let mut server = placeholder.clone();
        server.id = "rdm-42".into();
        server.version = 1;
        let rewritten = store
            .replace_transaction(&placeholder.id, &CachedRecord::synced(server))
            .await
            .unwrap();

        assert_eq!(rewritten, 1);
        assert!(store.get_transaction(&placeholder.id).await.unwrap().is_none());
        assert_eq!(store.get_transaction("rdm-42").await.unwrap().unwrap().value.version, 1);
        assert_eq!(store.list_operations().await.unwrap()[0].entity_id, "rdm-42");
    }

    #[tokio::test]
    async fn test_stage_transaction_commits_row_and_operation() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let placeholder = test_tx("alice");
        let op = PendingSyncOperation::new(
            EntityType::Transaction,
            placeholder.id.clone(),
            OperationKind::Create,
            json!({"points_used": 300}),
            5,
        );
        let first = store.stage_transaction(&CachedRecord::dirty(placeholder.clone()), &op).await.unwrap();
        let second = store.stage_transaction(&CachedRecord::dirty(test_tx("bob")), &op).await.unwrap();

        assert!(first > 0);
        assert!(second > first);
        assert!(store.get_transaction(&placeholder.id).await.unwrap().unwrap().is_dirty());
        let ops = store.list_operations().await.unwrap();
        assert_eq!(ops.iter().map(|o| o.seq).collect::<Vec<_>>(), vec![first, second]);
    }

    #[tokio::test]
    async fn test_stage_rolls_back_row_when_queue_insert_fails() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        sqlx::query("DROP TABLE sync_queue").execute(&store.pool()).await.unwrap();

        let placeholder = test_tx("alice");
        let op = PendingSyncOperation::new(
            EntityType::Transaction,
            placeholder.id.clone(),
            OperationKind::Create,
            json!({}),
            5,
        );
        let result = store.stage_transaction(&CachedRecord::dirty(placeholder.clone()), &op).await;

        assert!(matches!(result, Err(StorageError::Backend(_))));
        assert!(store.get_transaction(&placeholder.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stage_option_commits_row_and_operation() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let option = RedemptionOption::new("bike", "Bike", 800);
        let op = PendingSyncOperation::new(EntityType::Option, "bike", OperationKind::Create, json!({}), 3);
        let seq = store.stage_option(&CachedRecord::dirty(option), &op).await.unwrap();

        assert!(store.get_option("bike").await.unwrap().unwrap().is_dirty());
        assert_eq!(store.list_operations().await.unwrap()[0].seq, seq);
    }

    #[tokio::test]
    async fn test_failed_sync_status_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let tx = test_tx("alice");
        let record = CachedRecord { value: tx.clone(), sync_status: SyncStatus::Failed, updated_at: 7 };
        store.put_transaction(&record).await.unwrap();

        assert_eq!(store.get_transaction(&tx.id).await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn test_unreadable_queue_row_is_reported() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let op = PendingSyncOperation::new(EntityType::Option, "opt-1", OperationKind::Sync, json!(null), 3);
        store.enqueue(&op).await.unwrap();
        sqlx::query("UPDATE sync_queue SET state = 'paused'").execute(&store.pool()).await.unwrap();

        assert!(matches!(store.list_operations().await, Err(StorageError::Corruption { .. })));
    }
}
