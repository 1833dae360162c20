//! Error types for the balance cache.

use crate::types::AccountId;
use thiserror::Error;

/// Result type alias for balance cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the balance cache.
#[derive(Error, Debug)]
pub enum Error {
    /// The account does not exist in the persistent store.
    #[error("account not found: {0}")]
    AccountNotFound(AccountId),

    /// A withdraw would take the balance below zero.
    #[error("insufficient funds: balance {balance}, requested {requested}")]
    InsufficientFunds { balance: i64, requested: i64 },

    /// Operation amount was zero or negative.
    #[error("invalid amount: {0}")]
    InvalidAmount(i64),

    /// Persistent store errors.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Persistence port errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// No row for the requested id.
    #[error("row not found")]
    NotFound,

    /// Connection could not be established or was lost.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// A statement failed to execute.
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// The store did not answer within the deadline.
    #[error("store timed out")]
    Timeout,
}

impl Error {
    /// Whether this error should surface to the request layer as-is.
    ///
    /// Write-behind I/O failures are owned by the retry pipeline and are
    /// never reported to callers.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Error::AccountNotFound(_) | Error::InsufficientFunds { .. } | Error::InvalidAmount(_)
        )
    }
}
