use bitcoin::{OutPoint, Txid};
use chain_btc::fee::FeeRate;
use chain_btc::network::BtcNetwork;
use chain_btc::utxo::Utxo;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wallet settings consumed from the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletInfo {
    pub id: Uuid,
    pub network: BtcNetwork,
    /// Receive descriptor, or a `<0;1>` multipath descriptor covering both keychains.
    pub descriptor: String,
    pub change_descriptor: Option<String>,
    /// Confirmations a coin needs before it may be spent.
    pub confirmation_threshold: u32,
    /// Overrides the configured dust threshold when set.
    pub dust_threshold_sat: Option<u64>,
}

/// Who holds a coin lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "camelCase")]
pub enum LockHolder {
    Draft(Uuid),
    /// A payjoin proposal session.
    Payjoin(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UtxoLock {
    pub holder: LockHolder,
    pub expires_at: DateTime<Utc>,
}

impl UtxoLock {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// A coin as tracked by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UtxoRecord {
    pub wallet_id: Uuid,
    #[serde(flatten)]
    pub utxo: Utxo,
    pub spent: bool,
    /// User-set; excludes the coin from every selection.
    pub frozen: bool,
    pub confirmations: u32,
    pub lock: Option<UtxoLock>,
    /// Transaction that spent this coin, once broadcast.
    pub spent_by: Option<Txid>,
}

impl UtxoRecord {
    pub fn new(wallet_id: Uuid, utxo: Utxo, confirmations: u32) -> Self {
        Self {
            wallet_id,
            utxo,
            spent: false,
            frozen: false,
            confirmations,
            lock: None,
            spent_by: None,
        }
    }

    pub fn outpoint(&self) -> OutPoint {
        self.utxo.outpoint
    }

    pub fn amount_sat(&self) -> u64 {
        self.utxo.amount_sat
    }

    /// The lock on this coin, ignoring one that has already expired.
    pub fn active_lock(&self, now: DateTime<Utc>) -> Option<&UtxoLock> {
        self.lock.as_ref().filter(|lock| lock.is_active(now))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DraftStatus {
    Unsigned,
    Partial,
    Signed,
}

impl DraftStatus {
    /// Status implied by `signers` distinct devices out of `required`.
    pub fn for_signers(signers: usize, required: usize) -> Self {
        if signers >= required && signers > 0 {
            DraftStatus::Signed
        } else if signers > 0 {
            DraftStatus::Partial
        } else {
            DraftStatus::Unsigned
        }
    }

    fn rank(self) -> u8 {
        match self {
            DraftStatus::Unsigned => 0,
            DraftStatus::Partial => 1,
            DraftStatus::Signed => 2,
        }
    }

    /// Status only moves forward.
    pub fn advance(self, next: DraftStatus) -> DraftStatus {
        if next.rank() > self.rank() {
            next
        } else {
            self
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftOutput {
    pub address: String,
    pub amount: u64,
}

/// A spend awaiting signatures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Draft {
    pub id: Uuid,
    pub wallet_id: Uuid,
    pub created_by: Uuid,
    pub outputs: Vec<DraftOutput>,
    /// Sum of recipient outputs.
    pub amount: u64,
    pub fee_rate: FeeRate,
    pub utxo_ids: Vec<OutPoint>,
    pub fee: u64,
    pub change_amount: u64,
    pub change_address: Option<String>,
    pub total_input: u64,
    pub total_output: u64,
    pub psbt_base64: String,
    pub signed_psbt_base64: Option<String>,
    /// Devices that contributed a signature, in arrival order, without repeats.
    pub signed_device_ids: Vec<Uuid>,
    pub required_signatures: usize,
    pub status: DraftStatus,
    pub enable_rbf: bool,
    pub label: Option<String>,
    pub memo: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic-concurrency token; bumped by every stored update.
    pub version: u64,
}

impl Draft {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// The most complete PSBT held for this draft.
    pub fn latest_psbt(&self) -> &str {
        self.signed_psbt_base64.as_deref().unwrap_or(&self.psbt_base64)
    }

    /// Record `device_id` as a signer. Returns false if it had already signed.
    pub fn add_signer(&mut self, device_id: Uuid) -> bool {
        if self.signed_device_ids.contains(&device_id) {
            return false;
        }
        self.signed_device_ids.push(device_id);
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxType {
    Sent,
    Received,
    /// Every output returns to the wallet; only the fee leaves it.
    Consolidation,
}

/// A wallet transaction row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub txid: Txid,
    pub wallet_id: Uuid,
    pub tx_type: TxType,
    /// Negative for sends (fee included), positive for receives.
    pub amount_sat: i64,
    pub fee_sat: u64,
    pub balance_after_sat: i64,
    pub confirmations: u32,
    pub counterparty_address: Option<String>,
    pub memo: Option<String>,
    pub rbf_signaled: bool,
    pub replaces_txid: Option<Txid>,
    pub replaced_by_txid: Option<Txid>,
    pub created_at: DateTime<Utc>,
}
