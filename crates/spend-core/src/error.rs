use bitcoin::OutPoint;
use chain_btc::error::BtcError;
use thiserror::Error;
use uuid::Uuid;

use crate::collaborators::RegistryError;
use crate::ledger::StoreError;
use crate::selector::Ineligibility;

pub type Result<T> = std::result::Result<T, SpendError>;

/// How a caller should react to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input; nothing was touched.
    Validation,
    /// Coins or a draft changed underneath the caller; re-read and retry.
    ResourceConflict,
    /// Not enough eligible coins.
    InsufficientResources,
    /// The network refused the transaction.
    ExternalRejection,
    /// A PSBT or transaction could not be decoded.
    ProtocolFormat,
    Internal,
}

#[derive(Debug, Error)]
pub enum SpendError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid fee rate: {0}")]
    InvalidFeeRate(String),

    #[error("fee rate {fee_rate} sat/vB is below the minimum of {minimum} sat/vB")]
    FeeTooLow { fee_rate: f64, minimum: f64 },

    #[error("fee rate {fee_rate} sat/vB is above the maximum of {maximum} sat/vB")]
    FeeTooHigh { fee_rate: f64, maximum: f64 },

    #[error("output of {value_sat} sat is below the dust threshold of {threshold_sat} sat")]
    DustOutput { value_sat: u64, threshold_sat: u64 },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(
        "insufficient funds: {available_sat} sat available in {eligible_utxos} of {total_utxos} coins, {required_sat} sat required"
    )]
    InsufficientFunds {
        available_sat: u64,
        required_sat: u64,
        eligible_utxos: usize,
        total_utxos: usize,
    },

    #[error("unknown coin {0}")]
    UtxoNotFound(OutPoint),

    #[error("coin {outpoint} cannot be spent: {reason}")]
    UtxoNotEligible {
        outpoint: OutPoint,
        reason: Ineligibility,
    },

    #[error("coin {0} is locked by another spend")]
    LockConflict(OutPoint),

    #[error("draft {draft_id} was modified concurrently; reload and retry")]
    ConflictRetry { draft_id: Uuid },

    #[error("draft {0} not found")]
    DraftNotFound(Uuid),

    #[error("draft {0} has expired")]
    DraftExpired(Uuid),

    #[error("draft {0} is not fully signed")]
    DraftNotSigned(Uuid),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("broadcast rejected: {0}")]
    BroadcastRejected(String),

    #[error("malformed transaction: {0}")]
    MalformedTransaction(String),

    #[error("wallet {0} not found")]
    WalletNotFound(Uuid),

    #[error("wallet registry error: {0}")]
    Registry(String),

    #[error("chain backend unavailable: {0}")]
    ChainUnavailable(String),

    #[error("ledger error: {0}")]
    Store(StoreError),

    #[error("transaction build failed: {0}")]
    Build(String),
}

impl SpendError {
    pub fn kind(&self) -> ErrorKind {
        use SpendError::*;
        match self {
            InvalidAddress(_)
            | InvalidFeeRate(_)
            | FeeTooLow { .. }
            | FeeTooHigh { .. }
            | DustOutput { .. }
            | InvalidRequest(_)
            | UtxoNotFound(_)
            | UtxoNotEligible { .. }
            | DraftNotFound(_)
            | DraftExpired(_)
            | DraftNotSigned(_)
            | InvalidSignature(_)
            | WalletNotFound(_) => ErrorKind::Validation,
            LockConflict(_) | ConflictRetry { .. } => ErrorKind::ResourceConflict,
            InsufficientFunds { .. } => ErrorKind::InsufficientResources,
            BroadcastRejected(_) => ErrorKind::ExternalRejection,
            MalformedTransaction(_) => ErrorKind::ProtocolFormat,
            Registry(_) | ChainUnavailable(_) | Store(_) | Build(_) => ErrorKind::Internal,
        }
    }
}

impl From<BtcError> for SpendError {
    fn from(e: BtcError) -> Self {
        match e {
            BtcError::InvalidAddress(msg) => SpendError::InvalidAddress(msg),
            BtcError::InvalidFeeRate(msg) => SpendError::InvalidFeeRate(msg),
            BtcError::DustOutput {
                value_sat,
                threshold_sat,
            } => SpendError::DustOutput {
                value_sat,
                threshold_sat,
            },
            BtcError::InsufficientFunds {
                available_sat,
                required_sat,
            } => SpendError::InsufficientFunds {
                available_sat,
                required_sat,
                eligible_utxos: 0,
                total_utxos: 0,
            },
            BtcError::InvalidSignature(msg) | BtcError::PsbtMismatch(msg) => {
                SpendError::InvalidSignature(msg)
            }
            BtcError::InvalidPsbt(msg)
            | BtcError::InvalidTransaction(msg)
            | BtcError::FinalizeError(msg) => SpendError::MalformedTransaction(msg),
            other => SpendError::Build(other.to_string()),
        }
    }
}

impl From<StoreError> for SpendError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::LockConflict(outpoint) => SpendError::LockConflict(outpoint),
            StoreError::VersionMismatch { draft_id, .. } => SpendError::ConflictRetry { draft_id },
            other => SpendError::Store(other),
        }
    }
}

impl From<RegistryError> for SpendError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::WalletNotFound(id) => SpendError::WalletNotFound(id),
            other => SpendError::Registry(other.to_string()),
        }
    }
}
