//! Testing utilities for the balance cache.
//!
//! This module provides tools for exercising the cache under failure:
//! - [`FlakyStore`], a persistence-port wrapper with fault injection
//!   (failure counters, artificial latency, held reads)
//! - [`wait_for`], a polling helper for eventually-true conditions

mod service_integration_tests;

use crate::error::StoreError;
use crate::store::{AccountStore, MemoryStore};
use crate::types::{Account, AccountId};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A persistence port that misbehaves on demand.
///
/// Wraps a [`MemoryStore`] and injects failures the way an unreliable
/// database would produce them: the next N calls of an operation can be
/// made to fail, bulk updates can be slowed down, and individual reads
/// can be held open until released. Clones share all state.
#[derive(Clone)]
pub struct FlakyStore {
    inner: MemoryStore,
    shared: Arc<FlakyState>,
}

#[derive(Default)]
struct FlakyState {
    fail_gets: AtomicU32,
    fail_bulks: AtomicU32,
    fail_upserts: AtomicU32,
    bulk_delay_ms: AtomicU64,
    held_gets: RwLock<HashSet<AccountId>>,
}

impl FlakyStore {
    /// Wrap a store with fault injection disabled.
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            shared: Arc::new(FlakyState::default()),
        }
    }

    /// The wrapped store, for seeding and direct inspection.
    pub fn store(&self) -> &MemoryStore {
        &self.inner
    }

    /// Fail the next `n` `get_by_id` calls with a connection error.
    pub fn fail_next_gets(&self, n: u32) {
        self.shared.fail_gets.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` `bulk_update` calls with a query error.
    pub fn fail_next_bulks(&self, n: u32) {
        self.shared.fail_bulks.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` `upsert_one` calls with a query error.
    pub fn fail_next_upserts(&self, n: u32) {
        self.shared.fail_upserts.store(n, Ordering::SeqCst);
    }

    /// Delay every subsequent `bulk_update` by `delay` before it applies.
    pub fn set_bulk_delay(&self, delay: Duration) {
        self.shared
            .bulk_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Hold every `get_by_id` for `id` open until released.
    pub fn hold_get(&self, id: AccountId) {
        self.shared.held_gets.write().insert(id);
    }

    /// Release a held read.
    pub fn release_get(&self, id: AccountId) {
        self.shared.held_gets.write().remove(&id);
    }

    fn consume(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl AccountStore for FlakyStore {
    async fn get_by_id(&self, id: AccountId) -> Result<Account, StoreError> {
        while self.shared.held_gets.read().contains(&id) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        if Self::consume(&self.shared.fail_gets) {
            return Err(StoreError::ConnectionFailed("injected failure".into()));
        }
        self.inner.get_by_id(id).await
    }

    async fn bulk_update(&self, batch: &HashMap<AccountId, i64>) -> Result<(), StoreError> {
        let delay_ms = self.shared.bulk_delay_ms.load(Ordering::SeqCst);
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        if Self::consume(&self.shared.fail_bulks) {
            return Err(StoreError::QueryFailed("injected failure".into()));
        }
        self.inner.bulk_update(batch).await
    }

    async fn upsert_one(&self, id: AccountId, balance: i64) -> Result<(), StoreError> {
        if Self::consume(&self.shared.fail_upserts) {
            return Err(StoreError::QueryFailed("injected failure".into()));
        }
        self.inner.upsert_one(id, balance).await
    }
}

impl std::fmt::Debug for FlakyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlakyStore")
            .field("rows", &self.inner.row_count())
            .finish()
    }
}

/// Poll `condition` every 10 ms until it holds or `timeout` elapses.
/// Returns whether the condition became true.
pub async fn wait_for<F>(condition: F, timeout: Duration) -> bool
where
    F: Fn() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_fail_counters_are_consumed() {
        let flaky = FlakyStore::new(MemoryStore::new());
        let id = Uuid::new_v4();
        flaky.store().seed(id, 10);

        flaky.fail_next_gets(2);
        assert!(flaky.get_by_id(id).await.is_err());
        assert!(flaky.get_by_id(id).await.is_err());
        assert_eq!(flaky.get_by_id(id).await.unwrap().balance, 10);
    }

    #[tokio::test]
    async fn test_bulk_failure_leaves_rows_untouched() {
        let flaky = FlakyStore::new(MemoryStore::new());
        let id = Uuid::new_v4();

        flaky.fail_next_bulks(1);
        let mut batch = HashMap::new();
        batch.insert(id, 99);

        assert!(flaky.bulk_update(&batch).await.is_err());
        assert_eq!(flaky.store().row(id), None);

        flaky.bulk_update(&batch).await.unwrap();
        assert_eq!(flaky.store().row(id), Some(99));
    }

    #[tokio::test]
    async fn test_held_get_blocks_until_release() {
        let flaky = FlakyStore::new(MemoryStore::new());
        let id = Uuid::new_v4();
        flaky.store().seed(id, 7);
        flaky.hold_get(id);

        let reader = flaky.clone();
        let handle = tokio::spawn(async move { reader.get_by_id(id).await });

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!handle.is_finished());

        flaky.release_get(id);
        assert_eq!(handle.await.unwrap().unwrap().balance, 7);
    }

    #[tokio::test]
    async fn test_wait_for() {
        use std::sync::atomic::AtomicBool;

        let flag = Arc::new(AtomicBool::new(false));
        let flag_clone = flag.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            flag_clone.store(true, Ordering::Relaxed);
        });

        assert!(wait_for(|| flag.load(Ordering::Relaxed), Duration::from_secs(2)).await);
        assert!(!wait_for(|| false, Duration::from_millis(50)).await);
    }
}
