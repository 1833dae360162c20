//! Configuration types for the balance cache.

use std::time::Duration;

/// Main configuration for the balance cache.
///
/// Every knob has the production default shown in [`Default`]; the
/// builder methods exist so tests and embedders can shrink the timers.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Number of shards the account space is split across.
    /// Must be a power of two so shard selection is a mask over the hash.
    pub shard_count: usize,

    /// Number of background flush workers. Each owns a contiguous
    /// slice of the shard ring.
    pub flush_workers: usize,

    /// Interval between flush passes.
    pub flush_interval: Duration,

    /// Maximum number of dirty entries flushed from one shard per pass.
    pub max_batch: usize,

    /// Number of retry workers draining the retry queue.
    pub retry_workers: usize,

    /// Capacity of the retry queue. Producers drop on full.
    pub retry_capacity: usize,

    /// Attempts per retry item before it is discarded.
    pub retry_max_attempts: u32,

    /// Base of the exponential retry backoff (`base * 2^attempts`).
    pub retry_backoff_base: Duration,

    /// Deadline for a bulk upsert.
    pub bulk_timeout: Duration,

    /// Deadline for a single-row upsert on the retry path.
    pub upsert_timeout: Duration,

    /// Interval between metrics snapshots.
    pub metrics_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            shard_count: 256,
            flush_workers: 2,
            flush_interval: Duration::from_secs(1),
            max_batch: 500,
            retry_workers: 2,
            retry_capacity: 50_000,
            retry_max_attempts: 3,
            retry_backoff_base: Duration::from_secs(1),
            bulk_timeout: Duration::from_secs(5),
            upsert_timeout: Duration::from_secs(3),
            metrics_interval: Duration::from_secs(10),
        }
    }
}

impl CacheConfig {
    /// Create a configuration with production defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the shard count. Must be a power of two.
    pub fn with_shard_count(mut self, count: usize) -> Self {
        self.shard_count = count;
        self
    }

    /// Set the number of flush workers.
    pub fn with_flush_workers(mut self, workers: usize) -> Self {
        self.flush_workers = workers;
        self
    }

    /// Set the flush interval.
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Set the per-shard flush batch cap.
    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch;
        self
    }

    /// Set the number of retry workers.
    pub fn with_retry_workers(mut self, workers: usize) -> Self {
        self.retry_workers = workers;
        self
    }

    /// Set the retry queue capacity.
    pub fn with_retry_capacity(mut self, capacity: usize) -> Self {
        self.retry_capacity = capacity;
        self
    }

    /// Set the retry attempt cap.
    pub fn with_retry_max_attempts(mut self, attempts: u32) -> Self {
        self.retry_max_attempts = attempts;
        self
    }

    /// Set the retry backoff base.
    pub fn with_retry_backoff_base(mut self, base: Duration) -> Self {
        self.retry_backoff_base = base;
        self
    }

    /// Set the bulk upsert deadline.
    pub fn with_bulk_timeout(mut self, timeout: Duration) -> Self {
        self.bulk_timeout = timeout;
        self
    }

    /// Set the single-row upsert deadline.
    pub fn with_upsert_timeout(mut self, timeout: Duration) -> Self {
        self.upsert_timeout = timeout;
        self
    }

    /// Set the metrics snapshot interval.
    pub fn with_metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = interval;
        self
    }

    /// Validate the configuration and return an error message if invalid.
    ///
    /// Checks:
    /// - Shard count is a non-zero power of two
    /// - Worker counts, batch cap, and queue capacity are non-zero
    /// - There are no more flush workers than shards
    pub fn validate(&self) -> Result<(), String> {
        if self.shard_count == 0 || !self.shard_count.is_power_of_two() {
            return Err(format!(
                "shard_count must be a non-zero power of two, got {}",
                self.shard_count
            ));
        }
        if self.flush_workers == 0 {
            return Err("flush_workers must be at least 1".to_string());
        }
        if self.flush_workers > self.shard_count {
            return Err(format!(
                "flush_workers ({}) must not exceed shard_count ({})",
                self.flush_workers, self.shard_count
            ));
        }
        if self.max_batch == 0 {
            return Err("max_batch must be at least 1".to_string());
        }
        if self.retry_workers == 0 {
            return Err("retry_workers must be at least 1".to_string());
        }
        if self.retry_capacity == 0 {
            return Err("retry_capacity must be at least 1".to_string());
        }
        Ok(())
    }

    /// Create a fast configuration suitable for tests.
    /// Uses short timers and a small ring to speed up test execution.
    pub fn fast_for_tests() -> Self {
        Self {
            shard_count: 8,
            flush_interval: Duration::from_millis(50),
            retry_backoff_base: Duration::from_millis(10),
            metrics_interval: Duration::from_millis(200),
            ..Default::default()
        }
    }
}
