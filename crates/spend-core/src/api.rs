//! Request and response shapes at the service boundary.
//!
//! Requests reject unknown fields. Amounts are integer satoshis; fee rates
//! are fractional sat/vB numbers.

use bitcoin::{OutPoint, Txid};
use chain_btc::fee::FeeRate;
use chain_btc::psbt::KeyOrigin;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OutputRequest {
    pub address: String,
    /// Omitted on the one output that sends the maximum.
    #[serde(default)]
    pub amount: Option<u64>,
}

/// Create a spend from a wallet.
///
/// Either `recipient` (with `amount` unless `sendMax`) or `outputs` must be
/// given, not both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateSpendRequest {
    #[serde(default)]
    pub recipient: Option<String>,
    #[serde(default)]
    pub outputs: Option<Vec<OutputRequest>>,
    #[serde(default)]
    pub amount: Option<u64>,
    pub fee_rate: FeeRate,
    #[serde(default)]
    pub selected_utxo_ids: Option<Vec<OutPoint>>,
    #[serde(rename = "enableRBF")]
    pub enable_rbf: bool,
    pub subtract_fees: bool,
    pub send_max: bool,
    #[serde(default)]
    pub decoy_outputs: Option<usize>,
    #[serde(default)]
    pub change_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputPath {
    pub outpoint: OutPoint,
    pub key_origins: Vec<KeyOrigin>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecoyOutput {
    pub address: String,
    pub amount: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSpendResponse {
    pub psbt_base64: String,
    pub fee: u64,
    pub total_input: u64,
    pub total_output: u64,
    pub change_amount: u64,
    pub change_address: Option<String>,
    pub input_paths: Vec<InputPath>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decoy_outputs: Option<Vec<DecoyOutput>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SubmitSignatureRequest {
    pub device_id: Uuid,
    pub signed_psbt_base64: String,
    /// The draft version the device last saw.
    pub expected_version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UpdateDraftRequest {
    pub expected_version: u64,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub memo: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Publish a signed spend. Exactly one of `signedPsbtBase64` and `rawTxHex`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BroadcastRequest {
    #[serde(default)]
    pub signed_psbt_base64: Option<String>,
    #[serde(default)]
    pub raw_tx_hex: Option<String>,
    pub recipient: String,
    pub amount: u64,
    pub fee: u64,
    /// Draft being broadcast; it must be fully signed and is removed afterwards.
    #[serde(default)]
    pub draft_id: Option<Uuid>,
    /// Earlier transaction this one replaces by fee.
    #[serde(default)]
    pub replaces_txid: Option<Txid>,
    #[serde(default)]
    pub memo: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastResponse {
    pub txid: Txid,
    pub broadcasted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PayjoinStatus {
    Ready,
    NoUtxos,
    AllFrozen,
    PendingConfirmations,
    AllLocked,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayjoinEligibility {
    pub eligible: bool,
    pub status: PayjoinStatus,
    pub eligible_utxo_count: usize,
    pub total_utxo_count: usize,
    pub reason: String,
}

/// Sweep results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub drafts_deleted: usize,
    pub locks_released: usize,
}

/// Fee-rate hint from the chain backend, clamped to the configured bounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeRecommendation {
    pub target_blocks: u16,
    pub fee_rate: FeeRate,
}
