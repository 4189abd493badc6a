use std::collections::{BTreeMap, HashMap};

use bitcoin::{OutPoint, Txid};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use super::{DraftStore, StoreError, TransactionStore, UtxoStore};
use crate::types::{Draft, LockHolder, TransactionRecord, UtxoLock, UtxoRecord};

#[derive(Debug, Default)]
struct LedgerState {
    utxos: BTreeMap<OutPoint, UtxoRecord>,
    drafts: HashMap<Uuid, Draft>,
    transactions: Vec<TransactionRecord>,
}

impl LedgerState {
    fn check_free(
        &self,
        outpoints: &[OutPoint],
        holder: LockHolder,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        for outpoint in outpoints {
            let record = self
                .utxos
                .get(outpoint)
                .ok_or_else(|| StoreError::NotFound(format!("coin {outpoint}")))?;
            if record.spent {
                return Err(StoreError::LockConflict(*outpoint));
            }
            if let Some(lock) = record.active_lock(now) {
                if lock.holder != holder {
                    return Err(StoreError::LockConflict(*outpoint));
                }
            }
        }
        Ok(())
    }

    fn apply_lock(&mut self, outpoints: &[OutPoint], lock: UtxoLock) {
        for outpoint in outpoints {
            if let Some(record) = self.utxos.get_mut(outpoint) {
                record.lock = Some(lock);
            }
        }
    }

    fn release(&mut self, holder: LockHolder) -> usize {
        let mut released = 0;
        for record in self.utxos.values_mut() {
            if record.lock.is_some_and(|lock| lock.holder == holder) {
                record.lock = None;
                released += 1;
            }
        }
        released
    }
}

/// Ledger kept in process memory behind one mutex.
///
/// Also carries the ingestion hooks that chain sync would normally drive.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a coin.
    pub fn insert_utxo(&self, record: UtxoRecord) {
        self.state.lock().utxos.insert(record.outpoint(), record);
    }

    pub fn set_frozen(&self, outpoint: &OutPoint, frozen: bool) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let record = state
            .utxos
            .get_mut(outpoint)
            .ok_or_else(|| StoreError::NotFound(format!("coin {outpoint}")))?;
        record.frozen = frozen;
        Ok(())
    }

    pub fn set_confirmations(&self, outpoint: &OutPoint, confirmations: u32) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let record = state
            .utxos
            .get_mut(outpoint)
            .ok_or_else(|| StoreError::NotFound(format!("coin {outpoint}")))?;
        record.confirmations = confirmations;
        Ok(())
    }

    /// Record a transaction observed on chain, such as an incoming payment.
    pub fn insert_transaction(&self, record: TransactionRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if state.transactions.iter().any(|t| t.txid == record.txid) {
            return Err(StoreError::Duplicate(format!("transaction {}", record.txid)));
        }
        state.transactions.push(record);
        Ok(())
    }
}

impl UtxoStore for InMemoryLedger {
    fn list_utxos(&self, wallet_id: Uuid) -> Result<Vec<UtxoRecord>, StoreError> {
        Ok(self
            .state
            .lock()
            .utxos
            .values()
            .filter(|r| r.wallet_id == wallet_id)
            .cloned()
            .collect())
    }

    fn get_utxos(&self, outpoints: &[OutPoint]) -> Result<Vec<UtxoRecord>, StoreError> {
        let state = self.state.lock();
        Ok(outpoints
            .iter()
            .filter_map(|o| state.utxos.get(o).cloned())
            .collect())
    }

    fn lock_if_free(
        &self,
        outpoints: &[OutPoint],
        lock: &UtxoLock,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.check_free(outpoints, lock.holder, now)?;
        state.apply_lock(outpoints, *lock);
        Ok(())
    }

    fn release_locks(&self, holder: LockHolder) -> Result<usize, StoreError> {
        Ok(self.state.lock().release(holder))
    }

    fn release_expired_locks(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut state = self.state.lock();
        let mut released = 0;
        for record in state.utxos.values_mut() {
            if record.lock.is_some_and(|lock| !lock.is_active(now)) {
                record.lock = None;
                released += 1;
            }
        }
        Ok(released)
    }

    fn mark_spent(&self, outpoints: &[OutPoint], record: TransactionRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if state.transactions.iter().any(|t| t.txid == record.txid) {
            return Err(StoreError::Duplicate(format!("transaction {}", record.txid)));
        }
        for outpoint in outpoints {
            if let Some(utxo) = state.utxos.get_mut(outpoint) {
                utxo.spent = true;
                utxo.spent_by = Some(record.txid);
                utxo.lock = None;
            }
        }
        state.transactions.push(record);
        Ok(())
    }
}

impl DraftStore for InMemoryLedger {
    fn insert_draft_locked(&self, draft: Draft, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if state.drafts.contains_key(&draft.id) {
            return Err(StoreError::Duplicate(format!("draft {}", draft.id)));
        }
        let holder = LockHolder::Draft(draft.id);
        state.check_free(&draft.utxo_ids, holder, now)?;
        state.apply_lock(
            &draft.utxo_ids,
            UtxoLock {
                holder,
                expires_at: draft.expires_at,
            },
        );
        state.drafts.insert(draft.id, draft);
        Ok(())
    }

    fn get_draft(&self, draft_id: Uuid) -> Result<Option<Draft>, StoreError> {
        Ok(self.state.lock().drafts.get(&draft_id).cloned())
    }

    fn list_drafts(&self, wallet_id: Uuid) -> Result<Vec<Draft>, StoreError> {
        let mut drafts: Vec<Draft> = self
            .state
            .lock()
            .drafts
            .values()
            .filter(|d| d.wallet_id == wallet_id)
            .cloned()
            .collect();
        drafts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(drafts)
    }

    fn update_if_version_matches(
        &self,
        mut draft: Draft,
        expected_version: u64,
        now: DateTime<Utc>,
    ) -> Result<Draft, StoreError> {
        let mut state = self.state.lock();
        let stored = state
            .drafts
            .get(&draft.id)
            .ok_or_else(|| StoreError::NotFound(format!("draft {}", draft.id)))?;
        if stored.version != expected_version {
            return Err(StoreError::VersionMismatch {
                draft_id: draft.id,
                expected: expected_version,
                found: stored.version,
            });
        }
        if stored.expires_at != draft.expires_at {
            let holder = LockHolder::Draft(draft.id);
            state.check_free(&draft.utxo_ids, holder, now)?;
            state.apply_lock(
                &draft.utxo_ids,
                UtxoLock {
                    holder,
                    expires_at: draft.expires_at,
                },
            );
        }
        draft.version = expected_version + 1;
        state.drafts.insert(draft.id, draft.clone());
        Ok(draft)
    }

    fn delete_draft(&self, draft_id: Uuid) -> Result<Option<Draft>, StoreError> {
        let mut state = self.state.lock();
        state.release(LockHolder::Draft(draft_id));
        Ok(state.drafts.remove(&draft_id))
    }

    fn expired_drafts(&self, now: DateTime<Utc>) -> Result<Vec<Draft>, StoreError> {
        Ok(self
            .state
            .lock()
            .drafts
            .values()
            .filter(|d| d.is_expired(now))
            .cloned()
            .collect())
    }
}

impl TransactionStore for InMemoryLedger {
    fn get_transaction(&self, txid: &Txid) -> Result<Option<TransactionRecord>, StoreError> {
        Ok(self
            .state
            .lock()
            .transactions
            .iter()
            .find(|t| &t.txid == txid)
            .cloned())
    }

    fn list_transactions(&self, wallet_id: Uuid) -> Result<Vec<TransactionRecord>, StoreError> {
        let mut txs: Vec<TransactionRecord> = self
            .state
            .lock()
            .transactions
            .iter()
            .filter(|t| t.wallet_id == wallet_id)
            .cloned()
            .collect();
        txs.sort_by_key(|t| t.created_at);
        Ok(txs)
    }

    fn mark_replaced(&self, original: &Txid, replacement: &Txid) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let record = state
            .transactions
            .iter_mut()
            .find(|t| &t.txid == original)
            .ok_or_else(|| StoreError::NotFound(format!("transaction {original}")))?;
        record.replaced_by_txid = Some(*replacement);
        if let Some(record) = state.transactions.iter_mut().find(|t| &t.txid == replacement) {
            record.replaces_txid = Some(*original);
        }
        Ok(())
    }

    fn recalculate_balances(&self, wallet_id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let mut rows: Vec<&mut TransactionRecord> = state
            .transactions
            .iter_mut()
            .filter(|t| t.wallet_id == wallet_id)
            .collect();
        rows.sort_by_key(|t| t.created_at);

        let mut balance: i64 = 0;
        for row in rows {
            if row.replaced_by_txid.is_none() {
                balance += row.amount_sat;
            }
            row.balance_after_sat = balance;
        }
        Ok(())
    }
}
