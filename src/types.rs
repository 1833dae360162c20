//! Core types used throughout the balance cache.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Account identifier: an opaque 128-bit id with stable equality and hash.
pub type AccountId = Uuid;

/// A durable account row as the persistence port reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Account id.
    pub id: AccountId,
    /// Current balance in minor units.
    pub balance: i64,
}

impl Account {
    /// Create a new account record.
    pub fn new(id: AccountId, balance: i64) -> Self {
        Self { id, balance }
    }
}

/// The two balance-mutating operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    /// Increase the balance.
    #[serde(rename = "DEPOSIT")]
    Deposit,
    /// Decrease the balance, never below zero.
    #[serde(rename = "WITHDRAW")]
    Withdraw,
}

/// An operation request as the HTTP layer hands it over.
///
/// The cache itself consumes only `(account_id, kind, amount)`;
/// `request_id` travels with the request for the idempotency machinery
/// the durable schema carries but the cached path does not use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRequest {
    /// Target account.
    #[serde(rename = "walletId")]
    pub account_id: AccountId,
    /// Deposit or withdraw.
    #[serde(rename = "operationType")]
    pub kind: OperationKind,
    /// Amount in minor units; must be positive.
    pub amount: i64,
    /// Client-chosen idempotency key.
    #[serde(rename = "requestId")]
    pub request_id: Uuid,
}

/// Point-in-time statistics for the cache.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    /// Accounts resident in the cache.
    pub accounts: u64,
    /// Accounts whose in-memory balance may differ from the store.
    pub dirty: u64,
    /// Bulk flushes attempted.
    pub flushes_total: u64,
    /// Bulk flushes that failed.
    pub flushes_failed: u64,
    /// Retry items enqueued after failed flushes.
    pub retries_total: u64,
    /// Current retry queue length.
    pub retry_queue_len: u64,
}
