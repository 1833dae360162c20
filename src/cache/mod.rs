//! Write-absorbing balance cache.

pub mod state;

pub(crate) mod flusher;
pub(crate) mod retry;
pub(crate) mod shard;

use crate::config::CacheConfig;
use crate::error::{Error, Result, StoreError};
use crate::metrics::CacheMetrics;
use crate::store::AccountStore;
use crate::types::{Account, AccountId, CacheStats, OperationKind, OperationRequest};
use flusher::Flusher;
use parking_lot::Mutex;
use retry::{RetryQueue, RetryWorker};
use shard::ShardRing;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use state::AccountState;

/// Deadline for the startup probe against the persistence port.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// The balance cache service.
///
/// Absorbs deposit/withdraw operations into sharded in-memory state and
/// persists the resulting balances in the background: flush workers
/// coalesce dirty entries into bulk upserts, failed batches drain into
/// a bounded retry pipeline, and a reporter samples the cache
/// periodically. All background tasks are owned by this value and stop
/// on [`shutdown`](BalanceCache::shutdown).
///
/// The request layer sees exactly two operations:
/// [`get_balance`](BalanceCache::get_balance) and
/// [`apply_operation`](BalanceCache::apply_operation). Write-behind I/O
/// failures never surface through either; once an operation is accepted
/// into the cache, the flusher and retry pipeline own its persistence.
pub struct BalanceCache {
    /// Configuration.
    config: CacheConfig,

    /// The shard ring holding all cached account state.
    ring: Arc<ShardRing>,

    /// Persistence port.
    store: Arc<dyn AccountStore>,

    /// Process-wide counters and gauges.
    metrics: Arc<CacheMetrics>,

    /// The retry queue; producers live in the flush workers.
    retry_queue: RetryQueue,

    /// Stop signal for all background tasks.
    shutdown: CancellationToken,

    /// Background task handles, joined on shutdown.
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BalanceCache {
    /// Create the service and start its background tasks.
    ///
    /// This will:
    /// 1. Validate configuration
    /// 2. Probe the persistence port (an unreachable store is fatal here,
    ///    unlike on the write-behind path)
    /// 3. Start the flush workers, retry workers, and metrics reporter
    pub async fn new(config: CacheConfig, store: Arc<dyn AccountStore>) -> Result<Self> {
        config.validate().map_err(Error::Config)?;

        match tokio::time::timeout(CONNECT_TIMEOUT, store.get_by_id(AccountId::nil())).await {
            Ok(Ok(_)) | Ok(Err(StoreError::NotFound)) => {}
            Ok(Err(err)) => return Err(Error::Store(err)),
            Err(_) => return Err(Error::Timeout),
        }

        info!(
            shards = config.shard_count,
            flush_workers = config.flush_workers,
            retry_workers = config.retry_workers,
            flush_interval_ms = config.flush_interval.as_millis() as u64,
            "starting balance cache"
        );

        let ring = Arc::new(ShardRing::new(config.shard_count));
        let metrics = Arc::new(CacheMetrics::new());
        let queue = RetryQueue::new(config.retry_capacity);
        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();

        // Flush workers: each owns a contiguous slice of the ring, the
        // last one takes any remainder.
        let shards_per_worker = config.shard_count / config.flush_workers;
        for worker_id in 0..config.flush_workers {
            let start = worker_id * shards_per_worker;
            let end = if worker_id == config.flush_workers - 1 {
                config.shard_count
            } else {
                start + shards_per_worker
            };

            let flusher = Flusher {
                worker_id,
                ring: ring.clone(),
                store: store.clone(),
                retry_tx: queue.sender(),
                metrics: metrics.clone(),
                shard_range: start..end,
                interval: config.flush_interval,
                max_batch: config.max_batch,
                bulk_timeout: config.bulk_timeout,
            };
            tasks.push(tokio::spawn(flusher.run(shutdown.clone())));
        }

        for worker_id in 0..config.retry_workers {
            let worker = RetryWorker {
                worker_id,
                ring: ring.clone(),
                store: store.clone(),
                queue_tx: queue.sender(),
                queue_rx: queue.receiver(),
                metrics: metrics.clone(),
                max_attempts: config.retry_max_attempts,
                backoff_base: config.retry_backoff_base,
                upsert_timeout: config.upsert_timeout,
            };
            tasks.push(tokio::spawn(worker.run(shutdown.clone())));
        }

        let reporter = MetricsReporter {
            ring: ring.clone(),
            metrics: metrics.clone(),
            retry_tx: queue.sender(),
            interval: config.metrics_interval,
        };
        tasks.push(tokio::spawn(reporter.run(shutdown.clone())));

        Ok(Self {
            config,
            ring,
            store,
            metrics,
            retry_queue: queue,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    /// Read an account's balance, loading it into the cache on a miss.
    ///
    /// Returns [`Error::AccountNotFound`] when the store has no such
    /// account; other store failures propagate verbatim.
    pub async fn get_balance(&self, id: AccountId) -> Result<Account> {
        let state = self
            .ring
            .shard_for(&id)
            .load_or_fetch(id, self.store.as_ref())
            .await?;
        Ok(Account::new(id, state.snapshot_balance()))
    }

    /// Apply a deposit or withdraw to an account.
    ///
    /// The mutation commits against the cache only; persistence happens
    /// in the background. Returns [`Error::InvalidAmount`] for a
    /// non-positive amount, [`Error::AccountNotFound`] when the store
    /// has no such account, and [`Error::InsufficientFunds`] when a
    /// withdraw would take the balance below zero.
    pub async fn apply_operation(
        &self,
        id: AccountId,
        kind: OperationKind,
        amount: i64,
    ) -> Result<()> {
        if amount <= 0 {
            return Err(Error::InvalidAmount(amount));
        }

        let state = self
            .ring
            .shard_for(&id)
            .load_or_fetch(id, self.store.as_ref())
            .await?;

        match kind {
            OperationKind::Deposit => {
                state.add(amount);
                Ok(())
            }
            OperationKind::Withdraw => state.withdraw(amount),
        }
    }

    /// Apply an operation request as decoded from the wire.
    pub async fn apply(&self, request: &OperationRequest) -> Result<()> {
        self.apply_operation(request.account_id, request.kind, request.amount)
            .await
    }

    /// Point-in-time statistics across all shards.
    pub fn stats(&self) -> CacheStats {
        let (accounts, dirty) = census(&self.ring);
        let snapshot = self.metrics.snapshot();
        CacheStats {
            accounts: accounts as u64,
            dirty: dirty as u64,
            flushes_total: snapshot.flushes_total,
            flushes_failed: snapshot.flushes_failed,
            retries_total: snapshot.retries_total,
            retry_queue_len: self.retry_queue_len() as u64,
        }
    }

    /// Process-wide metrics.
    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    /// Current retry queue length.
    pub fn retry_queue_len(&self) -> usize {
        self.retry_queue.len()
    }

    /// The configuration this service runs with.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Stop all background tasks and drain one final flush pass.
    ///
    /// In-flight request-path operations complete against the cache and
    /// are picked up by the final pass; anything still failing at that
    /// point is bounded by the durability the design accepts.
    pub async fn shutdown(&self) {
        info!("shutting down balance cache");
        let start = std::time::Instant::now();

        self.shutdown.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }

        // One last flush attempt per shard so a clean exit persists
        // everything a bulk upsert can still save.
        let drain = Flusher {
            worker_id: 0,
            ring: self.ring.clone(),
            store: self.store.clone(),
            retry_tx: self.retry_queue.sender(),
            metrics: self.metrics.clone(),
            shard_range: 0..self.ring.len(),
            interval: self.config.flush_interval,
            max_batch: self.config.max_batch,
            bulk_timeout: self.config.bulk_timeout,
        };
        let flushed = drain.flush_slice().await;

        info!(
            flushed,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "balance cache shutdown complete"
        );
    }
}

impl std::fmt::Debug for BalanceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (accounts, dirty) = census(&self.ring);
        f.debug_struct("BalanceCache")
            .field("shards", &self.ring.len())
            .field("accounts", &accounts)
            .field("dirty", &dirty)
            .finish()
    }
}

/// Periodic observer of cache population and counter state.
///
/// Walks all shards under shared guards, refreshes the gauges, and
/// emits one structured snapshot line. Never mutates cache state.
struct MetricsReporter {
    ring: Arc<ShardRing>,
    metrics: Arc<CacheMetrics>,
    retry_tx: mpsc::Sender<retry::RetryItem>,
    interval: Duration,
}

impl MetricsReporter {
    async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.report(),
            }
        }

        debug!("metrics reporter stopped");
    }

    fn report(&self) {
        let (accounts, dirty) = census(&self.ring);
        let queue_len = self.retry_tx.max_capacity() - self.retry_tx.capacity();

        self.metrics
            .update_cache_state(accounts as u64, dirty as u64, queue_len as u64);

        info!(
            accounts,
            dirty,
            flushes = self.metrics.flushes_total.get(),
            failed = self.metrics.flushes_failed.get(),
            retries = self.metrics.retries_total.get(),
            queue_len,
            "cache snapshot"
        );
    }
}

/// Count resident and dirty accounts across the whole ring.
fn census(ring: &ShardRing) -> (usize, usize) {
    let mut accounts = 0;
    let mut dirty = 0;
    for shard in ring.shards() {
        let (a, d) = shard.census();
        accounts += a;
        dirty += d;
    }
    (accounts, dirty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use uuid::Uuid;

    fn test_config() -> CacheConfig {
        CacheConfig::fast_for_tests().with_flush_interval(Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn test_create_and_shutdown() {
        let store = MemoryStore::new();
        let cache = BalanceCache::new(test_config(), Arc::new(store)).await.unwrap();

        assert_eq!(cache.stats().accounts, 0);
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let config = CacheConfig::new().with_shard_count(100);
        let result = BalanceCache::new(config, Arc::new(MemoryStore::new())).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_get_balance_loads_from_store() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        store.seed(id, 1000);

        let cache = BalanceCache::new(test_config(), Arc::new(store))
            .await
            .unwrap();

        let account = cache.get_balance(id).await.unwrap();
        assert_eq!(account.balance, 1000);
        assert_eq!(cache.stats().accounts, 1);

        cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_apply_operation_rejects_bad_amount() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        store.seed(id, 100);

        let cache = BalanceCache::new(test_config(), Arc::new(store))
            .await
            .unwrap();

        let err = cache
            .apply_operation(id, OperationKind::Deposit, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidAmount(0)));

        let err = cache
            .apply_operation(id, OperationKind::Withdraw, -5)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidAmount(-5)));

        cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_deposit_and_withdraw() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        store.seed(id, 1000);

        let cache = BalanceCache::new(test_config(), Arc::new(store))
            .await
            .unwrap();

        cache
            .apply_operation(id, OperationKind::Deposit, 500)
            .await
            .unwrap();
        cache
            .apply_operation(id, OperationKind::Withdraw, 200)
            .await
            .unwrap();

        assert_eq!(cache.get_balance(id).await.unwrap().balance, 1300);
        assert_eq!(cache.stats().dirty, 1);

        cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_missing_account_is_not_found() {
        let cache = BalanceCache::new(test_config(), Arc::new(MemoryStore::new()))
            .await
            .unwrap();
        let id = Uuid::new_v4();

        let err = cache
            .apply_operation(id, OperationKind::Deposit, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AccountNotFound(missing) if missing == id));
        assert_eq!(cache.stats().accounts, 0);

        cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_apply_from_request() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        store.seed(id, 50);

        let cache = BalanceCache::new(test_config(), Arc::new(store))
            .await
            .unwrap();

        let request = OperationRequest {
            account_id: id,
            kind: OperationKind::Deposit,
            amount: 25,
            request_id: Uuid::new_v4(),
        };
        cache.apply(&request).await.unwrap();

        assert_eq!(cache.get_balance(id).await.unwrap().balance, 75);

        cache.shutdown().await;
    }
}
