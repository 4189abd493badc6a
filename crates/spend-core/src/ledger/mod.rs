//! Repository interfaces for coins, drafts and transactions.
//!
//! Each trait exposes only the atomic operations the spend core relies on.
//! Implementations must make every method atomic with respect to every
//! other method on the same ledger.

mod memory;

pub use memory::InMemoryLedger;

use bitcoin::{OutPoint, Txid};
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::types::{Draft, LockHolder, TransactionRecord, UtxoLock, UtxoRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    /// Spent, or locked by someone else.
    #[error("coin {0} is not free")]
    LockConflict(OutPoint),

    #[error("draft {draft_id} is at version {found}, expected {expected}")]
    VersionMismatch {
        draft_id: Uuid,
        expected: u64,
        found: u64,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    Duplicate(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

pub trait UtxoStore: Send + Sync {
    /// Every coin of the wallet, spent ones included.
    fn list_utxos(&self, wallet_id: Uuid) -> Result<Vec<UtxoRecord>, StoreError>;

    /// The records for `outpoints`, in order; unknown outpoints are skipped.
    fn get_utxos(&self, outpoints: &[OutPoint]) -> Result<Vec<UtxoRecord>, StoreError>;

    /// Lock every coin in `outpoints` for `lock.holder`, or none of them.
    ///
    /// A coin is free when it is unspent and has no active lock, or its
    /// lock already belongs to the same holder. Expired locks count as free.
    fn lock_if_free(
        &self,
        outpoints: &[OutPoint],
        lock: &UtxoLock,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Drop every lock held by `holder`. Returns how many were released;
    /// releasing nothing is not an error.
    fn release_locks(&self, holder: LockHolder) -> Result<usize, StoreError>;

    /// Drop every lock that expired at or before `now`.
    fn release_expired_locks(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Mark `outpoints` spent by `record.txid`, clear their locks, and store
    /// `record`, as one step. Outpoints the ledger does not know are ignored.
    fn mark_spent(&self, outpoints: &[OutPoint], record: TransactionRecord) -> Result<(), StoreError>;
}

pub trait DraftStore: Send + Sync {
    /// Store a new draft and lock its `utxo_ids` for it until `expires_at`,
    /// as one step. Nothing is stored if any coin is not free.
    fn insert_draft_locked(&self, draft: Draft, now: DateTime<Utc>) -> Result<(), StoreError>;

    fn get_draft(&self, draft_id: Uuid) -> Result<Option<Draft>, StoreError>;

    fn list_drafts(&self, wallet_id: Uuid) -> Result<Vec<Draft>, StoreError>;

    /// Replace the stored draft if its version is still `expected_version`.
    /// The stored copy gets version `expected_version + 1` and is returned.
    ///
    /// When `expires_at` changed, the draft's coin locks move to the new
    /// expiry in the same step. Nothing changes if the version is stale or
    /// a coin is no longer free.
    fn update_if_version_matches(
        &self,
        draft: Draft,
        expected_version: u64,
        now: DateTime<Utc>,
    ) -> Result<Draft, StoreError>;

    /// Remove the draft and release its coin locks. Returns the removed
    /// draft, or `None` if it was already gone.
    fn delete_draft(&self, draft_id: Uuid) -> Result<Option<Draft>, StoreError>;

    fn expired_drafts(&self, now: DateTime<Utc>) -> Result<Vec<Draft>, StoreError>;
}

pub trait TransactionStore: Send + Sync {
    fn get_transaction(&self, txid: &Txid) -> Result<Option<TransactionRecord>, StoreError>;

    /// Wallet transactions, oldest first.
    fn list_transactions(&self, wallet_id: Uuid) -> Result<Vec<TransactionRecord>, StoreError>;

    /// Link `original` to the transaction that replaced it.
    fn mark_replaced(&self, original: &Txid, replacement: &Txid) -> Result<(), StoreError>;

    /// Recompute `balance_after_sat` for every transaction of the wallet.
    /// Replaced transactions do not count towards the balance.
    fn recalculate_balances(&self, wallet_id: Uuid) -> Result<(), StoreError>;
}

/// Everything the spend core needs from storage.
pub trait Ledger: UtxoStore + DraftStore + TransactionStore {}

impl<T: UtxoStore + DraftStore + TransactionStore> Ledger for T {}
