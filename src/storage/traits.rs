// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The local ledger store contract.
//!
//! A [`LedgerStore`] is pure persistence for three logical tables
//! (`redemption_options`, `redemption_transactions`, `sync_queue`) plus the
//! per-user points snapshots. It applies no business rules: filtering,
//! sync-status policy and queue ordering live in the cache manager and the
//! sync queue processor.

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use crate::model::{
    CachedRecord, PendingSyncOperation, PointsSnapshot, RedemptionOption, RedemptionTransaction,
};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Item not found")]
    NotFound,
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Data corruption detected for '{id}': {reason}")]
    Corruption {
        id: String,
        reason: String,
    },
}

pub type CachedOption = CachedRecord<RedemptionOption>;
pub type CachedTransaction = CachedRecord<RedemptionTransaction>;

#[async_trait]
pub trait LedgerStore: Send + Sync {
    // ----- redemption_options -----
    async fn get_option(&self, id: &str) -> Result<Option<CachedOption>, StorageError>;
    async fn put_option(&self, record: &CachedOption) -> Result<(), StorageError>;
    async fn delete_option(&self, id: &str) -> Result<(), StorageError>;
    async fn list_options(&self) -> Result<Vec<CachedOption>, StorageError>;

    // ----- redemption_transactions -----
    async fn get_transaction(&self, id: &str) -> Result<Option<CachedTransaction>, StorageError>;
    async fn find_transaction_by_client_ref(
        &self,
        client_ref: &str,
    ) -> Result<Option<CachedTransaction>, StorageError>;
    async fn put_transaction(&self, record: &CachedTransaction) -> Result<(), StorageError>;
    async fn delete_transaction(&self, id: &str) -> Result<(), StorageError>;
    /// All cached transactions, or only one user's when `user_id` is given.
    async fn list_transactions(&self, user_id: Option<&str>) -> Result<Vec<CachedTransaction>, StorageError>;

    // ----- points snapshots -----
    async fn get_points_snapshot(&self, user_id: &str) -> Result<Option<PointsSnapshot>, StorageError>;
    async fn put_points_snapshot(&self, snapshot: &PointsSnapshot) -> Result<(), StorageError>;

    // ----- sync_queue -----
    /// Persist a new operation and return its assigned sequence number.
    async fn enqueue(&self, op: &PendingSyncOperation) -> Result<u64, StorageError>;
    /// Overwrite an existing operation (matched by `seq`).
    async fn update_operation(&self, op: &PendingSyncOperation) -> Result<(), StorageError>;
    async fn delete_operation(&self, seq: u64) -> Result<(), StorageError>;
    /// Every operation, queued or failed, in enqueue order.
    async fn list_operations(&self) -> Result<Vec<PendingSyncOperation>, StorageError>;

    /// Store a locally mutated transaction together with the operation that
    /// will replay it, so neither exists without the other. Returns the
    /// operation's sequence number.
    ///
    /// Default implementation writes the row first and restores the previous
    /// row when the enqueue fails; the SQL store uses one database transaction.
    async fn stage_transaction(
        &self,
        record: &CachedTransaction,
        op: &PendingSyncOperation,
    ) -> Result<u64, StorageError> {
        let previous = self.get_transaction(&record.value.id).await?;
        self.put_transaction(record).await?;
        match self.enqueue(op).await {
            Ok(seq) => Ok(seq),
            Err(e) => {
                let restored = match &previous {
                    Some(prev) => self.put_transaction(prev).await,
                    None => self.delete_transaction(&record.value.id).await,
                };
                if let Err(restore_err) = restored {
                    warn!(id = %record.value.id, error = %restore_err, "Failed to roll back staged transaction");
                }
                Err(e)
            }
        }
    }

    /// [`stage_transaction`](Self::stage_transaction) for catalog options.
    async fn stage_option(&self, record: &CachedOption, op: &PendingSyncOperation) -> Result<u64, StorageError> {
        let previous = self.get_option(&record.value.id).await?;
        self.put_option(record).await?;
        match self.enqueue(op).await {
            Ok(seq) => Ok(seq),
            Err(e) => {
                let restored = match &previous {
                    Some(prev) => self.put_option(prev).await,
                    None => self.delete_option(&record.value.id).await,
                };
                if let Err(restore_err) = restored {
                    warn!(id = %record.value.id, error = %restore_err, "Failed to roll back staged option");
                }
                Err(e)
            }
        }
    }

    /// Replace a placeholder transaction with its server counterpart in one step:
    /// the placeholder row is removed, the server row stored, and queued
    /// operations referencing the placeholder are rewritten to the server id.
    ///
    /// Default implementation is sequential; the SQL store runs it in one
    /// database transaction.
    async fn replace_transaction(
        &self,
        placeholder_id: &str,
        record: &CachedTransaction,
    ) -> Result<usize, StorageError> {
        self.put_transaction(record).await?;
        if placeholder_id != record.value.id {
            self.delete_transaction(placeholder_id).await?;
        }
        let mut rewritten = 0;
        for mut op in self.list_operations().await? {
            if op.entity_id == placeholder_id {
                op.entity_id = record.value.id.clone();
                self.update_operation(&op).await?;
                rewritten += 1;
            }
        }
        Ok(rewritten)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntityType, OperationKind, RedeemRequest, SyncStatus};
    use crate::storage::MemoryStore;
    use serde_json::json;

    /// Delegates to a memory store but refuses every enqueue.
    struct FullQueueStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl LedgerStore for FullQueueStore {
        async fn get_option(&self, id: &str) -> Result<Option<CachedOption>, StorageError> {
            self.inner.get_option(id).await
        }
        async fn put_option(&self, record: &CachedOption) -> Result<(), StorageError> {
            self.inner.put_option(record).await
        }
        async fn delete_option(&self, id: &str) -> Result<(), StorageError> {
            self.inner.delete_option(id).await
        }
        async fn list_options(&self) -> Result<Vec<CachedOption>, StorageError> {
            self.inner.list_options().await
        }
        async fn get_transaction(&self, id: &str) -> Result<Option<CachedTransaction>, StorageError> {
            self.inner.get_transaction(id).await
        }
        async fn find_transaction_by_client_ref(
            &self,
            client_ref: &str,
        ) -> Result<Option<CachedTransaction>, StorageError> {
            self.inner.find_transaction_by_client_ref(client_ref).await
        }
        async fn put_transaction(&self, record: &CachedTransaction) -> Result<(), StorageError> {
            self.inner.put_transaction(record).await
        }
        async fn delete_transaction(&self, id: &str) -> Result<(), StorageError> {
            self.inner.delete_transaction(id).await
        }
        async fn list_transactions(&self, user_id: Option<&str>) -> Result<Vec<CachedTransaction>, StorageError> {
            self.inner.list_transactions(user_id).await
        }
        async fn get_points_snapshot(&self, user_id: &str) -> Result<Option<PointsSnapshot>, StorageError> {
            self.inner.get_points_snapshot(user_id).await
        }
        async fn put_points_snapshot(&self, snapshot: &PointsSnapshot) -> Result<(), StorageError> {
            self.inner.put_points_snapshot(snapshot).await
        }
        async fn enqueue(&self, _op: &PendingSyncOperation) -> Result<u64, StorageError> {
            Err(StorageError::Backend("disk full".into()))
        }
        async fn update_operation(&self, op: &PendingSyncOperation) -> Result<(), StorageError> {
            self.inner.update_operation(op).await
        }
        async fn delete_operation(&self, seq: u64) -> Result<(), StorageError> {
            self.inner.delete_operation(seq).await
        }
        async fn list_operations(&self) -> Result<Vec<PendingSyncOperation>, StorageError> {
            self.inner.list_operations().await
        }
    }

    fn create_op(entity_id: &str) -> PendingSyncOperation {
        PendingSyncOperation::new(EntityType::Transaction, entity_id, OperationKind::Create, json!({}), 5)
    }

    #[tokio::test]
    async fn test_failed_enqueue_drops_new_placeholder() {
        let store = FullQueueStore { inner: MemoryStore::new() };
        let tx = RedemptionTransaction::local_pending(&RedeemRequest::new("alice", "movie", 300, None), "Movie");

        let result = store.stage_transaction(&CachedRecord::dirty(tx.clone()), &create_op(&tx.id)).await;

        assert!(matches!(result, Err(StorageError::Backend(_))));
        assert!(store.get_transaction(&tx.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_enqueue_restores_previous_row() {
        let store = FullQueueStore { inner: MemoryStore::new() };
        let original = RedemptionOption::new("bike", "Bike", 800);
        store.put_option(&CachedRecord::synced(original.clone())).await.unwrap();

        let mut edited = original.clone();
        edited.points_cost = 900;
        let op = PendingSyncOperation::new(EntityType::Option, "bike", OperationKind::Update, json!({}), 3);
        assert!(store.stage_option(&CachedRecord::dirty(edited), &op).await.is_err());

        let kept = store.get_option("bike").await.unwrap().unwrap();
        assert_eq!(kept.value.points_cost, 800);
        assert_eq!(kept.sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_stage_writes_row_and_operation() {
        let store = MemoryStore::new();
        let tx = RedemptionTransaction::local_pending(&RedeemRequest::new("alice", "movie", 300, None), "Movie");

        let seq = store.stage_transaction(&CachedRecord::dirty(tx.clone()), &create_op(&tx.id)).await.unwrap();

        assert!(store.get_transaction(&tx.id).await.unwrap().unwrap().is_dirty());
        let ops = store.list_operations().await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].seq, seq);
    }
}
