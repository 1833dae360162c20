//! Metrics module for monitoring and observability.
//!
//! This module provides Prometheus-style metrics for the balance cache:
//! - Counters for flush and retry activity
//! - Gauges for cache population and queue depth
//!
//! # Example
//!
//! ```rust,ignore
//! use coffer::metrics::CacheMetrics;
//!
//! let metrics = CacheMetrics::new();
//!
//! metrics.record_flush(true, 120);
//!
//! let snapshot = metrics.snapshot();
//! println!("flushes: {}", snapshot.flushes_total);
//! ```

mod counters;
mod gauges;

pub use counters::Counter;
pub use gauges::Gauge;

/// Process-wide metrics for the balance cache.
#[derive(Debug)]
pub struct CacheMetrics {
    // Flush counters
    /// Bulk flushes attempted.
    pub flushes_total: Counter,
    /// Bulk flushes that failed.
    pub flushes_failed: Counter,
    /// Accounts persisted through successful bulk flushes.
    pub accounts_flushed: Counter,

    // Retry counters
    /// Retry items enqueued after failed flushes.
    pub retries_total: Counter,
    /// Retry items dropped because the queue was full.
    pub retries_dropped: Counter,
    /// Retry items discarded after exhausting their attempts.
    pub retries_exhausted: Counter,

    // Cache state gauges, sampled by the metrics reporter
    /// Accounts resident in the cache.
    pub accounts_cached: Gauge,
    /// Accounts whose in-memory balance may differ from the store.
    pub accounts_dirty: Gauge,
    /// Current retry queue length.
    pub retry_queue_len: Gauge,
}

impl CacheMetrics {
    /// Create a new metrics instance.
    pub fn new() -> Self {
        Self {
            flushes_total: Counter::new("cache_flushes_total", "Bulk flushes attempted"),
            flushes_failed: Counter::new("cache_flushes_failed", "Bulk flushes that failed"),
            accounts_flushed: Counter::new(
                "cache_accounts_flushed",
                "Accounts persisted by successful bulk flushes",
            ),
            retries_total: Counter::new("cache_retries_total", "Retry items enqueued"),
            retries_dropped: Counter::new(
                "cache_retries_dropped",
                "Retry items dropped on a full queue",
            ),
            retries_exhausted: Counter::new(
                "cache_retries_exhausted",
                "Retry items discarded after the attempt cap",
            ),
            accounts_cached: Gauge::new("cache_accounts", "Accounts resident in the cache"),
            accounts_dirty: Gauge::new("cache_accounts_dirty", "Accounts pending persistence"),
            retry_queue_len: Gauge::new("cache_retry_queue_len", "Current retry queue length"),
        }
    }

    /// Record a bulk flush attempt.
    pub fn record_flush(&self, success: bool, batch_size: u64) {
        self.flushes_total.inc();
        if success {
            self.accounts_flushed.inc_by(batch_size);
        } else {
            self.flushes_failed.inc();
        }
    }

    /// Record a retry enqueue attempt.
    pub fn record_retry_enqueue(&self, accepted: bool) {
        if accepted {
            self.retries_total.inc();
        } else {
            self.retries_dropped.inc();
        }
    }

    /// Update the sampled cache-state gauges.
    pub fn update_cache_state(&self, accounts: u64, dirty: u64, retry_queue_len: u64) {
        self.accounts_cached.set(accounts as i64);
        self.accounts_dirty.set(dirty as i64);
        self.retry_queue_len.set(retry_queue_len as i64);
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            flushes_total: self.flushes_total.get(),
            flushes_failed: self.flushes_failed.get(),
            accounts_flushed: self.accounts_flushed.get(),
            retries_total: self.retries_total.get(),
            retries_dropped: self.retries_dropped.get(),
            retries_exhausted: self.retries_exhausted.get(),
            accounts_cached: self.accounts_cached.get(),
            accounts_dirty: self.accounts_dirty.get(),
            retry_queue_len: self.retry_queue_len.get(),
        }
    }

    /// Format metrics in Prometheus exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        macro_rules! add_counter {
            ($metric:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} counter\n{} {}\n",
                    $metric.name(),
                    $metric.help(),
                    $metric.name(),
                    $metric.name(),
                    $metric.get()
                ));
            };
        }

        macro_rules! add_gauge {
            ($metric:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} gauge\n{} {}\n",
                    $metric.name(),
                    $metric.help(),
                    $metric.name(),
                    $metric.name(),
                    $metric.get()
                ));
            };
        }

        add_counter!(self.flushes_total);
        add_counter!(self.flushes_failed);
        add_counter!(self.accounts_flushed);
        add_counter!(self.retries_total);
        add_counter!(self.retries_dropped);
        add_counter!(self.retries_exhausted);

        add_gauge!(self.accounts_cached);
        add_gauge!(self.accounts_dirty);
        add_gauge!(self.retry_queue_len);

        output
    }
}

impl Default for CacheMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A snapshot of cache metrics.
#[derive(Debug, Clone, Copy)]
pub struct MetricsSnapshot {
    pub flushes_total: u64,
    pub flushes_failed: u64,
    pub accounts_flushed: u64,
    pub retries_total: u64,
    pub retries_dropped: u64,
    pub retries_exhausted: u64,
    pub accounts_cached: i64,
    pub accounts_dirty: i64,
    pub retry_queue_len: i64,
}

impl MetricsSnapshot {
    /// Fraction of flush attempts that succeeded.
    pub fn flush_success_rate(&self) -> f64 {
        if self.flushes_total == 0 {
            return 1.0;
        }
        (self.flushes_total - self.flushes_failed) as f64 / self.flushes_total as f64
    }
}
