//! Interfaces to the systems around the spend core.
//!
//! Everything here is injected into [`crate::SpendService`] at construction.

use bitcoin::psbt::Psbt;
use bitcoin::{Script, Transaction, Txid};
use chain_btc::fee::FeeRate;
use chain_btc::utxo::Keychain;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::types::WalletInfo;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("wallet {0} not found")]
    WalletNotFound(Uuid),

    #[error("receiving address {0} not found")]
    AddressNotFound(Uuid),

    #[error("registry backend error: {0}")]
    Backend(String),
}

/// A receive address handed out to a payer, as used by payjoin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivingAddress {
    pub id: Uuid,
    pub wallet_id: Uuid,
    pub address: String,
    pub derivation_index: u32,
}

/// Wallet metadata owned by the account layer.
pub trait WalletRegistry: Send + Sync {
    fn wallet(&self, wallet_id: Uuid) -> Result<WalletInfo, RegistryError>;

    /// Reserve the next unused change index.
    fn next_change_index(&self, wallet_id: Uuid) -> Result<u32, RegistryError>;

    /// Where `script` sits in the wallet, if the wallet owns it.
    fn derivation_of(
        &self,
        wallet_id: Uuid,
        script: &Script,
    ) -> Result<Option<(Keychain, u32)>, RegistryError>;

    fn receiving_address(&self, address_id: Uuid) -> Result<ReceivingAddress, RegistryError>;
}

#[derive(Debug, Error)]
pub enum ChainError {
    /// The node refused the transaction.
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("unavailable: {0}")]
    Unavailable(String),
}

/// Access to the Bitcoin network.
pub trait ChainClient: Send + Sync {
    fn block_height(&self) -> Result<u32, ChainError>;

    /// Fee rate expected to confirm within `target_blocks`.
    fn fee_estimate(&self, target_blocks: u16) -> Result<FeeRate, ChainError>;

    /// Submit a transaction once. No retries.
    fn broadcast(&self, tx: &Transaction) -> Result<Txid, ChainError>;

    fn raw_transaction(&self, txid: &Txid) -> Result<Option<Transaction>, ChainError>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Error)]
#[error("signer error: {0}")]
pub struct SignerError(pub String);

/// Signs the receiver's own input of a payjoin proposal.
///
/// Only hot receiving wallets have one; without it proposals go out with
/// the receiver input unsigned.
pub trait ProposalSigner: Send + Sync {
    /// Sign and finalize input `input_index` of `psbt` for `wallet_id`.
    fn sign_input(&self, wallet_id: Uuid, psbt: &mut Psbt, input_index: usize)
        -> Result<(), SignerError>;
}
