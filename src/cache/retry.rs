//! Bounded retry pipeline for flushes that failed.
//!
//! A bulk flush can fail for reasons that are transient for the batch
//! as a whole (deadlock, lost connection). Each affected account is
//! parked here as a snapshot and retried independently with a
//! single-row upsert, which isolates poison rows and shortens the tail
//! to convergence.

use crate::cache::shard::ShardRing;
use crate::metrics::CacheMetrics;
use crate::store::AccountStore;
use crate::types::AccountId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A parked write: the balance snapshot that failed to flush.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryItem {
    pub account_id: AccountId,
    pub balance: i64,
    pub attempts: u32,
}

/// The bounded queue feeding the retry workers.
///
/// Producers never block: a full queue drops the item, which is safe
/// because the account stays dirty in the cache and the next flush
/// pass picks it up again.
pub(crate) struct RetryQueue {
    tx: mpsc::Sender<RetryItem>,
    rx: Arc<Mutex<mpsc::Receiver<RetryItem>>>,
}

impl RetryQueue {
    /// Create a queue with the given capacity.
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// A producer handle for flushers.
    pub(crate) fn sender(&self) -> mpsc::Sender<RetryItem> {
        self.tx.clone()
    }

    /// The shared consumer end for the worker pool.
    pub(crate) fn receiver(&self) -> Arc<Mutex<mpsc::Receiver<RetryItem>>> {
        self.rx.clone()
    }

    /// Current queue length.
    pub(crate) fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

/// One worker of the retry pool.
pub(crate) struct RetryWorker {
    pub(crate) worker_id: usize,
    pub(crate) ring: Arc<ShardRing>,
    pub(crate) store: Arc<dyn AccountStore>,
    pub(crate) queue_tx: mpsc::Sender<RetryItem>,
    pub(crate) queue_rx: Arc<Mutex<mpsc::Receiver<RetryItem>>>,
    pub(crate) metrics: Arc<CacheMetrics>,
    pub(crate) max_attempts: u32,
    pub(crate) backoff_base: Duration,
    pub(crate) upsert_timeout: Duration,
}

impl RetryWorker {
    /// Drain the queue until shutdown.
    pub(crate) async fn run(self, shutdown: CancellationToken) {
        debug!(worker = self.worker_id, "retry worker started");

        loop {
            let item = tokio::select! {
                _ = shutdown.cancelled() => break,
                item = Self::recv(&self.queue_rx) => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            if item.attempts >= self.max_attempts {
                warn!(
                    worker = self.worker_id,
                    account = %item.account_id,
                    attempts = item.attempts,
                    "dropping retry item, attempt cap reached"
                );
                self.metrics.retries_exhausted.inc();
                continue;
            }

            let backoff = self.backoff_base * (1u32 << item.attempts);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }

            self.attempt(item).await;
        }

        debug!(worker = self.worker_id, "retry worker stopped");
    }

    /// One upsert attempt for a parked item.
    async fn attempt(&self, item: RetryItem) {
        let result = tokio::time::timeout(
            self.upsert_timeout,
            self.store.upsert_one(item.account_id, item.balance),
        )
        .await;

        match result {
            Ok(Ok(())) => {
                debug!(
                    worker = self.worker_id,
                    account = %item.account_id,
                    balance = item.balance,
                    "retry upsert succeeded"
                );
                // The snapshot is durable now; clear the flag unless the
                // balance moved on since it was taken.
                if let Some(state) = self.ring.shard_for(&item.account_id).get(&item.account_id) {
                    state.clear_dirty_if_equals(item.balance);
                }
            }
            outcome => {
                let reason = match outcome {
                    Ok(Err(err)) => err.to_string(),
                    _ => "upsert timed out".to_string(),
                };
                warn!(
                    worker = self.worker_id,
                    account = %item.account_id,
                    attempts = item.attempts,
                    error = %reason,
                    "retry upsert failed"
                );

                let next = RetryItem {
                    attempts: item.attempts + 1,
                    ..item
                };
                if self.queue_tx.try_send(next).is_err() {
                    warn!(
                        worker = self.worker_id,
                        account = %item.account_id,
                        "retry queue full, dropping item"
                    );
                    self.metrics.retries_dropped.inc();
                }
            }
        }
    }

    async fn recv(rx: &Arc<Mutex<mpsc::Receiver<RetryItem>>>) -> Option<RetryItem> {
        rx.lock().await.recv().await
    }
}
