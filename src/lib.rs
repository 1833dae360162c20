//! Write-absorbing account balance cache with write-behind persistence.
//!
//! This crate provides an embedded balance service that absorbs a high
//! rate of deposit/withdraw operations against in-memory state and
//! persists the resulting balances asynchronously:
//!
//! - **Sharded state** - account balances live in a fixed ring of
//!   lock-light shards; per-account mutations are pure atomics
//! - **Atomic withdraw** - a CAS loop keeps balances non-negative
//!   under any interleaving without a per-account mutex
//! - **Write-behind flushing** - background workers coalesce dirty
//!   entries into bounded bulk upserts against a pluggable store
//! - **Bounded retries** - failed batches drain into a retry pipeline
//!   with capped attempts and exponential backoff
//!
//! # Example
//!
//! ```rust,no_run
//! use coffer::{BalanceCache, CacheConfig, MemoryStore, OperationKind};
//! use std::sync::Arc;
//! use uuid::Uuid;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = MemoryStore::new();
//!     let account = Uuid::new_v4();
//!     store.seed(account, 1_000);
//!
//!     let cache = BalanceCache::new(CacheConfig::default(), Arc::new(store)).await?;
//!
//!     // Mutations are absorbed into the cache and persisted behind
//!     // the scenes by the flush workers.
//!     cache.apply_operation(account, OperationKind::Deposit, 500).await?;
//!
//!     let balance = cache.get_balance(account).await?;
//!     println!("balance: {}", balance.balance);
//!
//!     cache.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │              Request Layer                  │
//! └─────────────────────────────────────────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────────┐
//! │            BalanceCache API                 │
//! │  • get_balance(id) -> Account               │
//! │  • apply_operation(id, kind, amount)        │
//! └─────────────────────────────────────────────┘
//!          │                        │
//!          ▼                        ▼
//! ┌─────────────────┐   ┌──────────────────────┐
//! │   Shard Ring    │   │  Flushers / Retries  │
//! │ (atomic state)  │──▶│  (bulk upserts)      │
//! └─────────────────┘   └──────────────────────┘
//!                                  │
//!                                  ▼
//!                       ┌──────────────────────┐
//!                       │    AccountStore      │
//!                       │  (persistence port)  │
//!                       └──────────────────────┘
//! ```
//!
//! # Consistency Model
//!
//! - **Per account**: deposits and withdrawals are linearizable via
//!   atomic add / CAS on the balance
//! - **Across accounts**: no ordering is guaranteed
//! - **Durability**: bounded by the flush interval plus the retry
//!   horizon; the cache is volatile and reloads from the store on a
//!   cold start

pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod store;
pub mod testing;
pub mod types;

// Re-export main types for convenience
pub use cache::{AccountState, BalanceCache};
pub use config::CacheConfig;
pub use error::{Error, Result, StoreError};
pub use store::{AccountStore, MemoryStore};
pub use types::{Account, AccountId, CacheStats, OperationKind, OperationRequest};

// Re-export metrics types
pub use metrics::{CacheMetrics, Counter, Gauge, MetricsSnapshot};

// Re-export testing types
pub use testing::FlakyStore;
