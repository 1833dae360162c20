//! Per-account atomic state: balance plus write-behind dirty flag.

use crate::error::Error;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

/// Mutable state of one cached account.
///
/// Both fields are mutated concurrently without any lock: `balance` via
/// fetch-add / compare-and-swap, `dirty` via plain stores. A mutation
/// commits the balance change first and sets `dirty` afterwards with
/// release ordering, so any observer that sees `dirty == true` with
/// acquire ordering also observes the contributing balance change.
#[derive(Debug)]
pub struct AccountState {
    balance: AtomicI64,
    dirty: AtomicBool,
}

impl AccountState {
    /// Create a clean state holding the given persisted balance.
    pub fn new(balance: i64) -> Self {
        Self {
            balance: AtomicI64::new(balance),
            dirty: AtomicBool::new(false),
        }
    }

    /// Deposit `amount` into the balance. Total; never fails.
    ///
    /// Callers validate `amount > 0` at the operation boundary.
    pub fn add(&self, amount: i64) {
        self.balance.fetch_add(amount, Ordering::AcqRel);
        self.dirty.store(true, Ordering::Release);
    }

    /// Withdraw `amount` from the balance, never taking it below zero.
    ///
    /// A CAS loop keeps the non-negativity invariant under any
    /// interleaving without a per-account mutex. On underflow the
    /// balance and the dirty flag are left untouched.
    pub fn withdraw(&self, amount: i64) -> Result<(), Error> {
        let mut current = self.balance.load(Ordering::Acquire);
        loop {
            if current < amount {
                return Err(Error::InsufficientFunds {
                    balance: current,
                    requested: amount,
                });
            }
            match self.balance.compare_exchange(
                current,
                current - amount,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.dirty.store(true, Ordering::Release);
                    return Ok(());
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Atomic load of the current balance.
    pub fn snapshot_balance(&self) -> i64 {
        self.balance.load(Ordering::Acquire)
    }

    /// Whether the in-memory balance may differ from the store.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Clear the dirty flag, but only if the balance still equals the
    /// value that was persisted.
    ///
    /// This is the generation check the flusher relies on: clear first,
    /// then re-read the balance, and if a mutation raced in put the flag
    /// back. A mutation that lands after the re-read sets the flag
    /// itself, so an unpersisted balance is never left marked clean.
    ///
    /// Returns `true` if the flag ended up cleared.
    pub fn clear_dirty_if_equals(&self, persisted: i64) -> bool {
        self.dirty.store(false, Ordering::Release);
        if self.balance.load(Ordering::Acquire) != persisted {
            self.dirty.store(true, Ordering::Release);
            return false;
        }
        true
    }
}
