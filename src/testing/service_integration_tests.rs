//! End-to-end tests for the balance cache service.
//!
//! These exercise the full write-behind path: operations absorbed into
//! the cache, background flushes reaching the store, failed batches
//! recovering through the retry pipeline, and shutdown draining what
//! is left. Port traffic is observed through [`MemoryStore`]'s call
//! recording and faults are injected with [`FlakyStore`].

#[cfg(test)]
mod tests {
    use crate::cache::flusher::Flusher;
    use crate::cache::retry::RetryQueue;
    use crate::cache::shard::ShardRing;
    use crate::cache::BalanceCache;
    use crate::config::CacheConfig;
    use crate::error::Error;
    use crate::metrics::CacheMetrics;
    use crate::store::MemoryStore;
    use crate::testing::{wait_for, FlakyStore};
    use crate::types::OperationKind;
    use std::sync::Arc;
    use std::time::Duration;
    use uuid::Uuid;

    fn flushing_config(interval: Duration) -> CacheConfig {
        CacheConfig::fast_for_tests().with_flush_interval(interval)
    }

    /// Deposits are visible immediately but reach the store only after
    /// the flush interval, as one bulk upsert carrying the new balance.
    #[tokio::test]
    async fn test_deposit_then_get_flushes_in_background() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        store.seed(id, 1000);

        let cache = BalanceCache::new(
            flushing_config(Duration::from_millis(200)),
            Arc::new(store.clone()),
        )
        .await
        .unwrap();

        cache
            .apply_operation(id, OperationKind::Deposit, 500)
            .await
            .unwrap();

        assert_eq!(cache.get_balance(id).await.unwrap().balance, 1500);

        // The write is only absorbed so far; nothing has hit the port.
        assert_eq!(store.bulk_calls(), 0);
        assert_eq!(cache.stats().dirty, 1);

        let flushed = wait_for(
            || store.bulk_calls() >= 1 && store.row(id) == Some(1500),
            Duration::from_secs(3),
        )
        .await;
        assert!(flushed, "flush never reached the store");

        let batch = &store.bulk_batches()[0];
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[&id], 1500);

        // The generation check cleared the flag: nothing left to flush.
        assert!(wait_for(|| cache.stats().dirty == 0, Duration::from_secs(1)).await);

        cache.shutdown().await;
    }

    /// An underflowing withdraw fails without touching balance or flag.
    #[tokio::test]
    async fn test_withdraw_underflow_leaves_cache_unchanged() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        store.seed(id, 100);

        let cache = BalanceCache::new(
            flushing_config(Duration::from_secs(3600)),
            Arc::new(store),
        )
        .await
        .unwrap();

        let err = cache
            .apply_operation(id, OperationKind::Withdraw, 150)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::InsufficientFunds {
                balance: 100,
                requested: 150
            }
        ));
        assert_eq!(cache.get_balance(id).await.unwrap().balance, 100);
        assert_eq!(cache.stats().dirty, 0);

        cache.shutdown().await;
    }

    /// Equal volumes of concurrent deposits and withdrawals cancel out.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_operations_conserve_balance() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        store.seed(id, 10_000);

        let cache = Arc::new(
            BalanceCache::new(flushing_config(Duration::from_millis(100)), Arc::new(store))
                .await
                .unwrap(),
        );

        let mut handles = Vec::new();
        for _ in 0..4 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..250 {
                    cache
                        .apply_operation(id, OperationKind::Deposit, 10)
                        .await
                        .unwrap();
                }
            }));
        }
        for _ in 0..4 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..250 {
                    cache
                        .apply_operation(id, OperationKind::Withdraw, 10)
                        .await
                        .unwrap();
                }
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(cache.get_balance(id).await.unwrap().balance, 10_000);

        cache.shutdown().await;
    }

    /// A failed bulk flush parks the account in the retry pipeline and
    /// the balance still converges to the store.
    #[tokio::test]
    async fn test_flush_failure_recovers_through_retry() {
        let flaky = FlakyStore::new(MemoryStore::new());
        let id = Uuid::new_v4();
        flaky.store().seed(id, 1000);

        let config = flushing_config(Duration::from_millis(100));
        let cache = BalanceCache::new(config, Arc::new(flaky.clone()))
            .await
            .unwrap();

        flaky.fail_next_bulks(1);

        cache
            .apply_operation(id, OperationKind::Deposit, 500)
            .await
            .unwrap();

        let converged = wait_for(
            || flaky.store().row(id) == Some(1500) && cache.stats().dirty == 0,
            Duration::from_secs(5),
        )
        .await;
        assert!(converged, "balance never converged after flush failure");

        let snapshot = cache.metrics().snapshot();
        assert_eq!(snapshot.flushes_failed, 1);
        assert!(snapshot.retries_total >= 1);

        cache.shutdown().await;
    }

    /// A mutation landing while a flush's I/O is in flight must keep
    /// the flag set; the next pass carries the newer balance.
    #[tokio::test]
    async fn test_mutation_during_flush_keeps_flag_set() {
        let flaky = FlakyStore::new(MemoryStore::new());
        let id = Uuid::new_v4();
        flaky.store().seed(id, 1000);

        let ring = Arc::new(ShardRing::new(1));
        let state = ring.shards()[0].load_or_fetch(id, &flaky).await.unwrap();
        state.add(500);

        let queue = RetryQueue::new(16);
        let flusher = Arc::new(Flusher {
            worker_id: 0,
            ring: ring.clone(),
            store: Arc::new(flaky.clone()),
            retry_tx: queue.sender(),
            metrics: Arc::new(CacheMetrics::new()),
            shard_range: 0..1,
            interval: Duration::from_secs(1),
            max_batch: 500,
            bulk_timeout: Duration::from_secs(5),
        });

        // Stretch the bulk upsert so the withdraw lands between the
        // flusher's snapshot and its conditional clear.
        flaky.set_bulk_delay(Duration::from_millis(100));
        let in_flight = flusher.clone();
        let handle = tokio::spawn(async move { in_flight.flush_shard(0).await });

        tokio::time::sleep(Duration::from_millis(30)).await;
        state.withdraw(200).unwrap();

        assert_eq!(handle.await.unwrap(), 1);

        // The port saw the snapshot, not the racing withdraw.
        assert_eq!(flaky.store().row(id), Some(1500));
        assert!(state.is_dirty());
        assert_eq!(state.snapshot_balance(), 1300);

        flaky.set_bulk_delay(Duration::ZERO);
        assert_eq!(flusher.flush_shard(0).await, 1);

        assert_eq!(flaky.store().row(id), Some(1300));
        assert!(!state.is_dirty());
    }

    /// A store read stuck on one account must not block lookups of
    /// other accounts on the same shard.
    #[tokio::test]
    async fn test_slow_load_does_not_block_shard_siblings() {
        let probe = ShardRing::new(8);
        let stuck = Uuid::new_v4();
        let sibling = loop {
            let candidate = Uuid::new_v4();
            if candidate != stuck && probe.index_for(&candidate) == probe.index_for(&stuck) {
                break candidate;
            }
        };

        let flaky = FlakyStore::new(MemoryStore::new());
        flaky.store().seed(stuck, 10);
        flaky.store().seed(sibling, 20);
        flaky.hold_get(stuck);

        let cache = Arc::new(
            BalanceCache::new(
                flushing_config(Duration::from_secs(3600)),
                Arc::new(flaky.clone()),
            )
            .await
            .unwrap(),
        );

        let blocked = cache.clone();
        let handle = tokio::spawn(async move { blocked.get_balance(stuck).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        // The sibling shares the shard and must still make progress.
        let account = tokio::time::timeout(Duration::from_secs(1), cache.get_balance(sibling))
            .await
            .expect("sibling lookup blocked behind a stuck store read")
            .unwrap();
        assert_eq!(account.balance, 20);

        flaky.release_get(stuck);
        assert_eq!(handle.await.unwrap().unwrap().balance, 10);

        cache.shutdown().await;
    }

    /// Shutdown drains one final flush pass per shard.
    #[tokio::test]
    async fn test_shutdown_drains_dirty_entries() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        store.seed(id, 1000);

        let cache = BalanceCache::new(
            flushing_config(Duration::from_secs(3600)),
            Arc::new(store.clone()),
        )
        .await
        .unwrap();

        cache
            .apply_operation(id, OperationKind::Deposit, 500)
            .await
            .unwrap();
        assert_eq!(store.bulk_calls(), 0);

        cache.shutdown().await;

        assert_eq!(store.row(id), Some(1500));
        assert_eq!(store.bulk_calls(), 1);
    }

    /// A dropped retry item is not lost: the account stays dirty and a
    /// later flush pass carries it.
    #[tokio::test]
    async fn test_full_retry_queue_falls_back_to_next_flush() {
        let flaky = FlakyStore::new(MemoryStore::new());
        let id = Uuid::new_v4();
        flaky.store().seed(id, 1000);

        let config = flushing_config(Duration::from_millis(100)).with_retry_capacity(1);
        let cache = BalanceCache::new(config, Arc::new(flaky.clone()))
            .await
            .unwrap();

        // Two consecutive bulk failures plus a slow first retry keep the
        // item bouncing while the flag stays set.
        flaky.fail_next_bulks(2);
        flaky.fail_next_upserts(1);

        cache
            .apply_operation(id, OperationKind::Deposit, 500)
            .await
            .unwrap();

        let converged = wait_for(
            || flaky.store().row(id) == Some(1500) && cache.stats().dirty == 0,
            Duration::from_secs(5),
        )
        .await;
        assert!(converged, "dirty entry was lost after retry pressure");

        cache.shutdown().await;
    }
}
