use thiserror::Error;

/// Bitcoin chain operation errors.
#[derive(Debug, Error)]
pub enum BtcError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid network: {0}")]
    InvalidNetwork(String),

    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("invalid fee rate: {0}")]
    InvalidFeeRate(String),

    #[error("insufficient funds: have {available_sat} sat, need {required_sat} sat")]
    InsufficientFunds { available_sat: u64, required_sat: u64 },

    #[error("output of {value_sat} sat is below the dust threshold of {threshold_sat} sat")]
    DustOutput { value_sat: u64, threshold_sat: u64 },

    #[error("transaction build error: {0}")]
    TransactionBuildError(String),

    #[error("invalid psbt: {0}")]
    InvalidPsbt(String),

    #[error("psbt does not match the expected transaction: {0}")]
    PsbtMismatch(String),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("finalization failed: {0}")]
    FinalizeError(String),

    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),
}
