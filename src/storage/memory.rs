// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use super::traits::{CachedOption, CachedTransaction, LedgerStore, StorageError};
use crate::model::{PendingSyncOperation, PointsSnapshot};

/// Volatile ledger store for tests and cache-less deployments.
pub struct MemoryStore {
    options: DashMap<String, CachedOption>,
    transactions: DashMap<String, CachedTransaction>,
    snapshots: DashMap<String, PointsSnapshot>,
    queue: DashMap<u64, PendingSyncOperation>,
    next_seq: AtomicU64,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            options: DashMap::new(),
            transactions: DashMap::new(),
            snapshots: DashMap::new(),
            queue: DashMap::new(),
            next_seq: AtomicU64::new(1),
        }
    }

    /// Total rows across the option and transaction tables
    #[must_use]
    pub fn len(&self) -> usize {
        self.options.len() + self.transactions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.options.is_empty() && self.transactions.is_empty()
    }

    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Clear every table
    pub fn clear(&self) {
        self.options.clear();
        self.transactions.clear();
        self.snapshots.clear();
        self.queue.clear();
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn get_option(&self, id: &str) -> Result<Option<CachedOption>, StorageError> {
        Ok(self.options.get(id).map(|r| r.value().clone()))
    }

    async fn put_option(&self, record: &CachedOption) -> Result<(), StorageError> {
        self.options.insert(record.value.id.clone(), record.clone());
        Ok(())
    }

    async fn delete_option(&self, id: &str) -> Result<(), StorageError> {
        self.options.remove(id);
        Ok(())
    }

    async fn list_options(&self) -> Result<Vec<CachedOption>, StorageError> {
        Ok(self.options.iter().map(|r| r.value().clone()).collect())
    }

    async fn get_transaction(&self, id: &str) -> Result<Option<CachedTransaction>, StorageError> {
        Ok(self.transactions.get(id).map(|r| r.value().clone()))
    }

    async fn find_transaction_by_client_ref(
        &self,
        client_ref: &str,
    ) -> Result<Option<CachedTransaction>, StorageError> {
        Ok(self
            .transactions
            .iter()
            .find(|r| r.value().value.client_ref == client_ref)
            .map(|r| r.value().clone()))
    }

    async fn put_transaction(&self, record: &CachedTransaction) -> Result<(), StorageError> {
        self.transactions.insert(record.value.id.clone(), record.clone());
        Ok(())
    }

    async fn delete_transaction(&self, id: &str) -> Result<(), StorageError> {
        self.transactions.remove(id);
        Ok(())
    }

    async fn list_transactions(&self, user_id: Option<&str>) -> Result<Vec<CachedTransaction>, StorageError> {
        Ok(self
            .transactions
            .iter()
            .filter(|r| user_id.map_or(true, |u| r.value().value.user_id == u))
            .map(|r| r.value().clone())
            .collect())
    }

    async fn get_points_snapshot(&self, user_id: &str) -> Result<Option<PointsSnapshot>, StorageError> {
        Ok(self.snapshots.get(user_id).map(|r| r.value().clone()))
    }

    async fn put_points_snapshot(&self, snapshot: &PointsSnapshot) -> Result<(), StorageError> {
        self.snapshots.insert(snapshot.user_id.clone(), snapshot.clone());
        Ok(())
    }

    async fn enqueue(&self, op: &PendingSyncOperation) -> Result<u64, StorageError> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let mut stored = op.clone();
        stored.seq = seq;
        self.queue.insert(seq, stored);
        Ok(seq)
    }

    async fn update_operation(&self, op: &PendingSyncOperation) -> Result<(), StorageError> {
        match self.queue.get_mut(&op.seq) {
            Some(mut entry) => {
                *entry = op.clone();
                Ok(())
            }
            None => Err(StorageError::NotFound),
        }
    }

    async fn delete_operation(&self, seq: u64) -> Result<(), StorageError> {
        self.queue.remove(&seq);
        Ok(())
    }

    async fn list_operations(&self) -> Result<Vec<PendingSyncOperation>, StorageError> {
        let mut ops: Vec<PendingSyncOperation> = self.queue.iter().map(|r| r.value().clone()).collect();
        ops.sort_by_key(|op| op.seq);
        Ok(ops)
    }
}
