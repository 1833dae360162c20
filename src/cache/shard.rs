//! Shards and the fixed ring that maps account ids onto them.

use crate::cache::state::AccountState;
use crate::error::{Error, Result, StoreError};
use crate::store::AccountStore;
use crate::types::AccountId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::Arc;
use twox_hash::XxHash64;

/// One fragment of the cache: a map from account id to its state,
/// guarded by a readers-writer lock. Hit-path lookups take the shared
/// guard; only structural inserts take the exclusive guard. The map
/// grows monotonically for the lifetime of the process.
pub(crate) struct Shard {
    accounts: RwLock<HashMap<AccountId, Arc<AccountState>>>,
}

impl Shard {
    fn new() -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
        }
    }

    /// Return the cached state for `id`, loading it from the store on a
    /// miss.
    ///
    /// Double-checked: shared-guard probe, port call with no shard lock
    /// held, exclusive-guard re-probe. If another caller installed the
    /// entry while the store was being consulted, the freshly fetched
    /// value is discarded so concurrent callers always share one state.
    /// A `NotFound` from the store is propagated without inserting a
    /// placeholder.
    pub(crate) async fn load_or_fetch(
        &self,
        id: AccountId,
        store: &dyn AccountStore,
    ) -> Result<Arc<AccountState>> {
        if let Some(state) = self.accounts.read().get(&id) {
            return Ok(state.clone());
        }

        let account = store.get_by_id(id).await.map_err(|err| match err {
            StoreError::NotFound => Error::AccountNotFound(id),
            other => Error::Store(other),
        })?;

        let fresh = Arc::new(AccountState::new(account.balance));

        let mut accounts = self.accounts.write();
        if let Some(existing) = accounts.get(&id) {
            return Ok(existing.clone());
        }
        accounts.insert(id, fresh.clone());
        Ok(fresh)
    }

    /// Look up an already-cached state without touching the store.
    pub(crate) fn get(&self, id: &AccountId) -> Option<Arc<AccountState>> {
        self.accounts.read().get(id).cloned()
    }

    /// Number of accounts resident in this shard.
    pub(crate) fn len(&self) -> usize {
        self.accounts.read().len()
    }

    /// Count resident and dirty accounts in one pass.
    pub(crate) fn census(&self) -> (usize, usize) {
        let accounts = self.accounts.read();
        let dirty = accounts.values().filter(|s| s.is_dirty()).count();
        (accounts.len(), dirty)
    }

    /// Snapshot up to `max_batch` dirty entries under the shared guard.
    ///
    /// Counts the dirty population first so small dirty sets produce
    /// small batches, then collects `(id, balance snapshot, state)` in
    /// arbitrary map order. Returns an empty vector when nothing is
    /// dirty. Never inserts or removes entries.
    pub(crate) fn collect_dirty(
        &self,
        max_batch: usize,
    ) -> Vec<(AccountId, i64, Arc<AccountState>)> {
        let accounts = self.accounts.read();

        let dirty_count = accounts.values().filter(|s| s.is_dirty()).count();
        if dirty_count == 0 {
            return Vec::new();
        }

        let batch_size = dirty_count.min(max_batch);
        let mut batch = Vec::with_capacity(batch_size);
        for (id, state) in accounts.iter() {
            if batch.len() >= batch_size {
                break;
            }
            if state.is_dirty() {
                batch.push((*id, state.snapshot_balance(), state.clone()));
            }
        }
        batch
    }
}

/// Fixed array of shards with a stable hash from account id to shard.
///
/// The length is a power of two so selection is a mask over a 64-bit
/// hash of the raw id bytes; the mapping is a pure function of the id
/// and identical across restarts.
pub(crate) struct ShardRing {
    shards: Box<[Shard]>,
    mask: u64,
}

impl ShardRing {
    /// Create a ring of `shard_count` empty shards.
    /// `shard_count` must be a non-zero power of two.
    pub(crate) fn new(shard_count: usize) -> Self {
        debug_assert!(shard_count.is_power_of_two());
        let shards: Vec<Shard> = (0..shard_count).map(|_| Shard::new()).collect();
        Self {
            shards: shards.into_boxed_slice(),
            mask: (shard_count - 1) as u64,
        }
    }

    /// The shard owning `id`.
    pub(crate) fn shard_for(&self, id: &AccountId) -> &Shard {
        &self.shards[self.index_for(id)]
    }

    /// Ring index for `id`.
    pub(crate) fn index_for(&self, id: &AccountId) -> usize {
        (Self::hash_id(id) & self.mask) as usize
    }

    /// All shards, in ring order.
    pub(crate) fn shards(&self) -> &[Shard] {
        &self.shards
    }

    /// Number of shards in the ring.
    pub(crate) fn len(&self) -> usize {
        self.shards.len()
    }

    fn hash_id(id: &AccountId) -> u64 {
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(id.as_bytes());
        hasher.finish()
    }
}
