//! Persistence port consumed by the balance cache.

use crate::error::StoreError;
use crate::types::{Account, AccountId};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// The persistence port.
///
/// Any durable store that honors these contracts plugs into the cache:
/// `get_by_id` reads one row, `bulk_update` upserts a whole batch in a
/// single transaction, `upsert_one` is the single-row form used by the
/// retry pipeline. An empty bulk batch is a no-op.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Read the durable balance for one account.
    async fn get_by_id(&self, id: AccountId) -> Result<Account, StoreError>;

    /// Upsert every entry of the batch atomically.
    async fn bulk_update(&self, batch: &HashMap<AccountId, i64>) -> Result<(), StoreError>;

    /// Upsert a single row.
    async fn upsert_one(&self, id: AccountId, balance: i64) -> Result<(), StoreError>;
}

/// In-memory implementation of the persistence port.
///
/// This storage is cloneable - clones share the same underlying data.
/// Besides backing local runs, it records the batches it receives so
/// tests can observe exactly what reached the store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    rows: RwLock<HashMap<AccountId, i64>>,
    bulk_batches: RwLock<Vec<HashMap<AccountId, i64>>>,
    get_calls: AtomicU64,
    bulk_calls: AtomicU64,
    upsert_calls: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a row directly, bypassing the port. Test seeding.
    pub fn seed(&self, id: AccountId, balance: i64) {
        self.inner.rows.write().insert(id, balance);
    }

    /// Read a row directly, bypassing the port.
    pub fn row(&self, id: AccountId) -> Option<i64> {
        self.inner.rows.read().get(&id).copied()
    }

    /// Number of rows currently in the store.
    pub fn row_count(&self) -> usize {
        self.inner.rows.read().len()
    }

    /// Number of `get_by_id` calls observed.
    pub fn get_calls(&self) -> u64 {
        self.inner.get_calls.load(Ordering::Relaxed)
    }

    /// Number of `bulk_update` calls observed (empty batches excluded).
    pub fn bulk_calls(&self) -> u64 {
        self.inner.bulk_calls.load(Ordering::Relaxed)
    }

    /// Number of `upsert_one` calls observed.
    pub fn upsert_calls(&self) -> u64 {
        self.inner.upsert_calls.load(Ordering::Relaxed)
    }

    /// All batches received via `bulk_update`, in arrival order.
    pub fn bulk_batches(&self) -> Vec<HashMap<AccountId, i64>> {
        self.inner.bulk_batches.read().clone()
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn get_by_id(&self, id: AccountId) -> Result<Account, StoreError> {
        self.inner.get_calls.fetch_add(1, Ordering::Relaxed);
        match self.inner.rows.read().get(&id) {
            Some(&balance) => Ok(Account::new(id, balance)),
            None => Err(StoreError::NotFound),
        }
    }

    async fn bulk_update(&self, batch: &HashMap<AccountId, i64>) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.inner.bulk_calls.fetch_add(1, Ordering::Relaxed);

        let mut rows = self.inner.rows.write();
        for (&id, &balance) in batch {
            rows.insert(id, balance);
        }
        drop(rows);

        self.inner.bulk_batches.write().push(batch.clone());
        Ok(())
    }

    async fn upsert_one(&self, id: AccountId, balance: i64) -> Result<(), StoreError> {
        self.inner.upsert_calls.fetch_add(1, Ordering::Relaxed);
        self.inner.rows.write().insert(id, balance);
        Ok(())
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("rows", &self.row_count())
            .field("bulk_calls", &self.bulk_calls())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_get_by_id() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        store.seed(id, 1000);

        let account = store.get_by_id(id).await.unwrap();
        assert_eq!(account.balance, 1000);

        let missing = store.get_by_id(Uuid::new_v4()).await;
        assert!(matches!(missing, Err(StoreError::NotFound)));
        assert_eq!(store.get_calls(), 2);
    }

    #[tokio::test]
    async fn test_bulk_update_upserts() {
        let store = MemoryStore::new();
        let existing = Uuid::new_v4();
        let fresh = Uuid::new_v4();
        store.seed(existing, 50);

        let mut batch = HashMap::new();
        batch.insert(existing, 75);
        batch.insert(fresh, 200);
        store.bulk_update(&batch).await.unwrap();

        assert_eq!(store.row(existing), Some(75));
        assert_eq!(store.row(fresh), Some(200));
        assert_eq!(store.bulk_calls(), 1);
        assert_eq!(store.bulk_batches()[0], batch);
    }

    #[tokio::test]
    async fn test_empty_bulk_is_noop() {
        let store = MemoryStore::new();
        store.bulk_update(&HashMap::new()).await.unwrap();
        assert_eq!(store.bulk_calls(), 0);
        assert!(store.bulk_batches().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_one_creates_row() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();

        store.upsert_one(id, 10).await.unwrap();
        assert_eq!(store.row(id), Some(10));

        store.upsert_one(id, 20).await.unwrap();
        assert_eq!(store.row(id), Some(20));
        assert_eq!(store.upsert_calls(), 2);
    }

    #[tokio::test]
    async fn test_clones_share_rows() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();

        let clone = store.clone();
        clone.seed(id, 5);

        assert_eq!(store.row(id), Some(5));
    }
}
