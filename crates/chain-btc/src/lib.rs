//! Bitcoin transaction mechanics for the spend subsystem.
//!
//! Provides descriptor handling for single-sig and sorted-multisig wallets,
//! fee-rate arithmetic and virtual-size estimation, coin selection over a
//! candidate set, transaction planning (fee, change, dust, decoys), PSBT
//! construction with hardware-signer key origins, and PSBT transport,
//! merging and finalization.

pub mod address;
pub mod descriptor;
pub mod error;
pub mod fee;
pub mod network;
pub mod psbt;
pub mod transaction;
pub mod utxo;
