//! Write-behind flusher: coalesces dirty entries into bulk upserts.

use crate::cache::retry::RetryItem;
use crate::cache::shard::ShardRing;
use crate::metrics::CacheMetrics;
use crate::store::AccountStore;
use crate::types::AccountId;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A background flush worker bound to a contiguous slice of shards.
///
/// On every tick it walks its slice, snapshots up to `max_batch` dirty
/// entries per shard, and bulk-upserts them. Dirty flags are cleared
/// afterwards through the generation check, never while I/O is in
/// flight, and never under a shard lock. A failed batch drains into
/// the retry queue item by item.
pub(crate) struct Flusher {
    pub(crate) worker_id: usize,
    pub(crate) ring: Arc<ShardRing>,
    pub(crate) store: Arc<dyn AccountStore>,
    pub(crate) retry_tx: mpsc::Sender<RetryItem>,
    pub(crate) metrics: Arc<CacheMetrics>,
    pub(crate) shard_range: Range<usize>,
    pub(crate) interval: Duration,
    pub(crate) max_batch: usize,
    pub(crate) bulk_timeout: Duration,
}

impl Flusher {
    /// Flush on a fixed interval until shutdown.
    pub(crate) async fn run(self, shutdown: CancellationToken) {
        debug!(
            worker = self.worker_id,
            shards = ?self.shard_range,
            "flush worker started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let flushed = self.flush_slice().await;
                    if flushed > 0 {
                        info!(worker = self.worker_id, flushed, "flushed accounts");
                    }
                }
            }
        }

        debug!(worker = self.worker_id, "flush worker stopped");
    }

    /// One pass over the worker's shard slice.
    /// Returns the number of accounts successfully flushed.
    pub(crate) async fn flush_slice(&self) -> usize {
        let mut total = 0;
        for index in self.shard_range.clone() {
            total += self.flush_shard(index).await;
        }
        total
    }

    /// Flush one shard's dirty entries, at most `max_batch` of them.
    pub(crate) async fn flush_shard(&self, index: usize) -> usize {
        let batch = self.ring.shards()[index].collect_dirty(self.max_batch);
        if batch.is_empty() {
            return 0;
        }

        let updates: HashMap<AccountId, i64> = batch
            .iter()
            .map(|(id, balance, _)| (*id, *balance))
            .collect();

        let result = tokio::time::timeout(self.bulk_timeout, self.store.bulk_update(&updates)).await;

        match result {
            Ok(Ok(())) => {
                self.metrics.record_flush(true, batch.len() as u64);
                // The batch is durable; clear each flag unless the
                // balance moved on since its snapshot was taken.
                for (_, snapshot, state) in &batch {
                    state.clear_dirty_if_equals(*snapshot);
                }
                batch.len()
            }
            outcome => {
                let reason = match outcome {
                    Ok(Err(err)) => err.to_string(),
                    _ => "bulk update timed out".to_string(),
                };
                self.metrics.record_flush(false, 0);
                warn!(
                    worker = self.worker_id,
                    shard = index,
                    accounts = batch.len(),
                    error = %reason,
                    "flush failed, queueing accounts for retry"
                );

                for (id, snapshot, _) in &batch {
                    let item = RetryItem {
                        account_id: *id,
                        balance: *snapshot,
                        attempts: 0,
                    };
                    let accepted = self.retry_tx.try_send(item).is_ok();
                    self.metrics.record_retry_enqueue(accepted);
                    if !accepted {
                        warn!(
                            worker = self.worker_id,
                            account = %id,
                            "retry queue full, dropping item"
                        );
                    }
                }
                0
            }
        }
    }
}
