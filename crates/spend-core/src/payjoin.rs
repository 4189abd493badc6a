//! BIP78 payjoin receiver.
//!
//! A sender posts a finalized PSBT paying one of our receiving addresses.
//! We add one of the receiving wallet's coins as an extra input, raise our
//! output by that coin's value less our share of the extra fee, and return
//! the proposal for the sender to re-sign. Errors reach the sender only as
//! one of three fixed codes; the detail is logged.

use std::fmt;

use bitcoin::psbt::{Input, Psbt};
use bitcoin::{Amount, Script, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use chain_btc::address::parse_address;
use chain_btc::fee::FeeRate;
use chain_btc::psbt::{decode_psbt, encode_psbt, input_txout, summarize};
use rand::seq::SliceRandom;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::{PayjoinEligibility, PayjoinStatus};
use crate::error::Result;
use crate::selector::{CoinPool, Ineligibility};
use crate::types::{LockHolder, UtxoLock, UtxoRecord};
use crate::SpendService;

/// Weight added by the segwit marker and flag when the first witness input appears.
const SEGWIT_MARKER_WEIGHT: u64 = 2;

/// The error vocabulary a payjoin sender gets to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayjoinErrorCode {
    ReceiverError,
    OriginalPsbtRejected,
    VersionUnsupported,
}

impl PayjoinErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayjoinErrorCode::ReceiverError => "RECEIVER_ERROR",
            PayjoinErrorCode::OriginalPsbtRejected => "ORIGINAL_PSBT_REJECTED",
            PayjoinErrorCode::VersionUnsupported => "VERSION_UNSUPPORTED",
        }
    }
}

impl fmt::Display for PayjoinErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum PayjoinError {
    #[error("unsupported payjoin version {0}")]
    VersionUnsupported(String),

    #[error("original psbt rejected: {0}")]
    OriginalPsbtRejected(String),

    #[error("receiver cannot contribute: {0}")]
    Receiver(String),
}

impl PayjoinError {
    pub fn code(&self) -> PayjoinErrorCode {
        match self {
            PayjoinError::VersionUnsupported(_) => PayjoinErrorCode::VersionUnsupported,
            PayjoinError::OriginalPsbtRejected(_) => PayjoinErrorCode::OriginalPsbtRejected,
            PayjoinError::Receiver(_) => PayjoinErrorCode::ReceiverError,
        }
    }
}

fn receiver(e: impl fmt::Display) -> PayjoinError {
    PayjoinError::Receiver(e.to_string())
}

fn rejected(e: impl fmt::Display) -> PayjoinError {
    PayjoinError::OriginalPsbtRejected(e.to_string())
}

/// Query parameters of a payjoin request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayjoinParams {
    pub version: u32,
    pub min_fee_rate: Option<FeeRate>,
    pub max_additional_fee_contribution: Option<u64>,
    pub additional_fee_output_index: Option<usize>,
    /// Recorded for logging only. This receiver never substitutes outputs:
    /// its own output keeps its script and only grows in value, which the
    /// sender must accept either way.
    pub disable_output_substitution: bool,
}

impl Default for PayjoinParams {
    fn default() -> Self {
        Self {
            version: 1,
            min_fee_rate: None,
            max_additional_fee_contribution: None,
            additional_fee_output_index: None,
            disable_output_substitution: false,
        }
    }
}

impl PayjoinParams {
    /// Parse a `key=value&...` query string. Unknown keys are ignored.
    ///
    /// The version is checked before anything else, so a request from a
    /// newer sender is always answered with `VERSION_UNSUPPORTED`.
    pub fn from_query(query: &str) -> std::result::Result<Self, PayjoinError> {
        let pairs: Vec<(&str, &str)> = query
            .trim()
            .trim_start_matches('?')
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
            .collect();

        let mut params = PayjoinParams::default();
        if let Some((_, v)) = pairs.iter().find(|(key, _)| *key == "v") {
            if v.trim() != "1" {
                return Err(PayjoinError::VersionUnsupported(v.to_string()));
            }
        }

        for (key, value) in pairs {
            match key {
                "minfeerate" => {
                    let sat_per_vb: f64 = value
                        .parse()
                        .map_err(|_| rejected(format!("minfeerate {value:?} is not a number")))?;
                    params.min_fee_rate = Some(FeeRate::from_sat_per_vb_f64(sat_per_vb).map_err(rejected)?);
                }
                "maxadditionalfeecontribution" => {
                    params.max_additional_fee_contribution = Some(value.parse().map_err(|_| {
                        rejected(format!("maxadditionalfeecontribution {value:?} is not an amount"))
                    })?);
                }
                "additionalfeeoutputindex" => {
                    params.additional_fee_output_index = Some(value.parse().map_err(|_| {
                        rejected(format!("additionalfeeoutputindex {value:?} is not an index"))
                    })?);
                }
                "disableoutputsubstitution" => {
                    params.disable_output_substitution = matches!(value, "true" | "1");
                }
                _ => {}
            }
        }
        Ok(params)
    }
}

/// What goes back over the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayjoinReply {
    Proposal {
        psbt_base64: String,
        /// Owns the lock on the contributed coin.
        session_id: Uuid,
    },
    Rejected(PayjoinErrorCode),
}

impl PayjoinReply {
    /// Plain-text response body.
    pub fn body(&self) -> &str {
        match self {
            PayjoinReply::Proposal { psbt_base64, .. } => psbt_base64,
            PayjoinReply::Rejected(code) => code.as_str(),
        }
    }

    pub fn is_proposal(&self) -> bool {
        matches!(self, PayjoinReply::Proposal { .. })
    }
}

/// Broad output family, used to match the receiver's input to the sender's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputKind {
    P2pkh,
    P2sh,
    P2wpkh,
    P2wsh,
    P2tr,
}

fn output_kind(script: &Script) -> Option<OutputKind> {
    if script.is_p2wpkh() {
        Some(OutputKind::P2wpkh)
    } else if script.is_p2wsh() {
        Some(OutputKind::P2wsh)
    } else if script.is_p2tr() {
        Some(OutputKind::P2tr)
    } else if script.is_p2sh() {
        Some(OutputKind::P2sh)
    } else if script.is_p2pkh() {
        Some(OutputKind::P2pkh)
    } else {
        None
    }
}

/// A sender's PSBT that passed validation.
struct Original {
    psbt: Psbt,
    tx: Transaction,
    fee_sat: u64,
    receiver_output: usize,
    sender_kind: Option<OutputKind>,
}

/// Fee split for the receiver's extra input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FeeSplit {
    sender_output: Option<(usize, u64)>,
    receiver_value: u64,
}

impl SpendService {
    /// Answer a payjoin request for receiving address `address_id`.
    pub fn process_payjoin_request(
        &self,
        address_id: Uuid,
        query: &str,
        original_psbt_base64: &str,
    ) -> PayjoinReply {
        match self.payjoin_proposal(address_id, query, original_psbt_base64) {
            Ok((psbt_base64, session_id)) => PayjoinReply::Proposal {
                psbt_base64,
                session_id,
            },
            Err(e) => {
                warn!(%address_id, code = %e.code(), error = %e, "payjoin request rejected");
                PayjoinReply::Rejected(e.code())
            }
        }
    }

    /// Free the coin held by a payjoin proposal the sender never used.
    pub fn release_payjoin(&self, session_id: Uuid) -> Result<usize> {
        let released = self.ledger.release_locks(LockHolder::Payjoin(session_id))?;
        info!(%session_id, released, "payjoin lock released");
        Ok(released)
    }

    /// Whether the wallet has a coin to contribute to a payjoin right now.
    pub fn payjoin_eligibility(&self, wallet_id: Uuid) -> Result<PayjoinEligibility> {
        let wallet = self.wallet_context(wallet_id)?;
        let pool = CoinPool::build(
            self.ledger.list_utxos(wallet_id)?,
            wallet.info.confirmation_threshold,
            None,
            self.clock.now(),
        );
        let total = pool.total();
        let eligible = pool.eligible.len();
        let frozen = pool.count_ineligible(|r| *r == Ineligibility::Frozen);
        let unconfirmed = pool.count_ineligible(|r| matches!(r, Ineligibility::Unconfirmed { .. }));
        let locked = pool.count_ineligible(|r| *r == Ineligibility::Locked);

        let (status, reason) = if total == 0 {
            (PayjoinStatus::NoUtxos, "wallet has no unspent coins".to_string())
        } else if eligible > 0 {
            (
                PayjoinStatus::Ready,
                format!("{eligible} of {total} coins can be contributed"),
            )
        } else if frozen == total {
            (PayjoinStatus::AllFrozen, "every coin is frozen".to_string())
        } else if unconfirmed > 0 && locked == 0 {
            (
                PayjoinStatus::PendingConfirmations,
                format!("{unconfirmed} coins are waiting for confirmations"),
            )
        } else if locked > 0 && unconfirmed == 0 {
            (
                PayjoinStatus::AllLocked,
                format!("{locked} coins are held by pending spends"),
            )
        } else {
            (
                PayjoinStatus::Unavailable,
                "no coin is confirmed and unlocked".to_string(),
            )
        };

        Ok(PayjoinEligibility {
            eligible: eligible > 0,
            status,
            eligible_utxo_count: eligible,
            total_utxo_count: total,
            reason,
        })
    }

    fn payjoin_proposal(
        &self,
        address_id: Uuid,
        query: &str,
        original_psbt_base64: &str,
    ) -> std::result::Result<(String, Uuid), PayjoinError> {
        let params = PayjoinParams::from_query(query)?;
        let psbt = decode_psbt(original_psbt_base64).map_err(rejected)?;

        let receiving = self.registry.receiving_address(address_id).map_err(receiver)?;
        let wallet = self.wallet_context(receiving.wallet_id).map_err(receiver)?;
        let wallet_id = wallet.info.id;
        let receiver_script = parse_address(&receiving.address, wallet.info.network)
            .map_err(receiver)?
            .script_pubkey();
        let original = self.check_original(wallet_id, psbt, &receiver_script)?;

        let now = self.clock.now();
        let pool = CoinPool::build(
            self.ledger.list_utxos(wallet_id).map_err(receiver)?,
            wallet.info.confirmation_threshold,
            None,
            now,
        );
        let matching: Vec<&UtxoRecord> = pool
            .eligible
            .iter()
            .filter(|r| output_kind(&r.utxo.script_pubkey) == original.sender_kind)
            .collect();
        let coin = matching
            .choose(&mut rand::thread_rng())
            .map(|r| r.utxo.clone())
            .ok_or_else(|| receiver("no eligible coin matches the sender's input type"))?;

        let wallet_script = wallet.descriptor.wallet_script();
        let mut added_weight = wallet_script.input_weight();
        if wallet_script.is_segwit() && original.tx.input.iter().all(|i| i.witness.is_empty()) {
            added_weight += SEGWIT_MARKER_WEIGHT;
        }
        let split = split_fee(
            &params,
            &original,
            coin.amount_sat,
            added_weight,
            wallet.dust_threshold_sat,
        )?;
        debug!(
            %address_id,
            coin = %coin.outpoint,
            receiver_value = split.receiver_value,
            sender_output = ?split.sender_output,
            output_substitution = !params.disable_output_substitution,
            "payjoin fee split"
        );

        let mut proposal = original.psbt;
        for input in &mut proposal.inputs {
            input.final_script_sig = None;
            input.final_script_witness = None;
            input.partial_sigs.clear();
            input.tap_key_sig = None;
            input.bip32_derivation.clear();
            input.tap_key_origins.clear();
        }
        for output in &mut proposal.outputs {
            output.bip32_derivation.clear();
            output.tap_key_origins.clear();
        }
        proposal.xpub.clear();

        proposal.unsigned_tx.output[original.receiver_output].value = Amount::from_sat(split.receiver_value);
        if let Some((index, value)) = split.sender_output {
            proposal.unsigned_tx.output[index].value = Amount::from_sat(value);
        }

        let sequence = proposal
            .unsigned_tx
            .input
            .first()
            .map(|i| i.sequence)
            .unwrap_or(Sequence::ENABLE_RBF_NO_LOCKTIME);
        proposal.unsigned_tx.input.push(TxIn {
            previous_output: coin.outpoint,
            script_sig: ScriptBuf::new(),
            sequence,
            witness: Witness::new(),
        });
        let mut input = Input::default();
        if wallet_script.is_segwit() {
            input.witness_utxo = Some(TxOut {
                value: Amount::from_sat(coin.amount_sat),
                script_pubkey: coin.script_pubkey.clone(),
            });
        } else {
            input.non_witness_utxo = Some(self.previous_transaction(&coin.outpoint.txid).map_err(receiver)?);
        }
        proposal.inputs.push(input);
        let receiver_index = proposal.inputs.len() - 1;
        wallet
            .descriptor
            .update_psbt_input(&mut proposal, receiver_index, coin.keychain, coin.derivation_index)
            .map_err(receiver)?;

        if let Some(signer) = &self.signer {
            signer
                .sign_input(wallet_id, &mut proposal, receiver_index)
                .map_err(receiver)?;
        }

        let session_id = Uuid::new_v4();
        self.ledger
            .lock_if_free(
                &[coin.outpoint],
                &UtxoLock {
                    holder: LockHolder::Payjoin(session_id),
                    expires_at: now + self.config.payjoin_lock_ttl(),
                },
                now,
            )
            .map_err(receiver)?;

        info!(
            %wallet_id,
            %session_id,
            coin = %coin.outpoint,
            original_txid = %original.tx.compute_txid(),
            proposal_txid = %proposal.unsigned_tx.compute_txid(),
            "payjoin proposal created"
        );
        Ok((encode_psbt(&proposal), session_id))
    }

    fn check_original(
        &self,
        wallet_id: Uuid,
        psbt: Psbt,
        receiver_script: &Script,
    ) -> std::result::Result<Original, PayjoinError> {
        if psbt.inputs.is_empty() {
            return Err(rejected("no inputs"));
        }
        let mut sender_kind = None;
        for (index, input) in psbt.inputs.iter().enumerate() {
            if input.final_script_sig.is_none() && input.final_script_witness.is_none() {
                return Err(rejected(format!("input {index} is not finalized")));
            }
            let txout = input_txout(&psbt, index)
                .ok_or_else(|| rejected(format!("input {index} has no utxo data")))?;
            if self
                .registry
                .derivation_of(wallet_id, &txout.script_pubkey)
                .map_err(receiver)?
                .is_some()
            {
                return Err(rejected(format!("input {index} spends a receiver coin")));
            }
            if index == 0 {
                sender_kind = output_kind(&txout.script_pubkey);
            }
        }

        let outpoints: Vec<_> = psbt.unsigned_tx.input.iter().map(|i| i.previous_output).collect();
        if self
            .ledger
            .get_utxos(&outpoints)
            .map_err(receiver)?
            .iter()
            .any(|r| r.wallet_id == wallet_id)
        {
            return Err(rejected("original spends a receiver coin"));
        }

        let receiver_output = psbt
            .unsigned_tx
            .output
            .iter()
            .position(|o| o.script_pubkey.as_script() == receiver_script)
            .ok_or_else(|| rejected("original does not pay the receiving address"))?;
        let fee_sat = summarize(&psbt).map_err(rejected)?.fee;
        let tx = psbt.clone().extract_tx_unchecked_fee_rate();

        Ok(Original {
            psbt,
            tx,
            fee_sat,
            receiver_output,
            sender_kind,
        })
    }
}

/// Work out who pays the fee for the receiver's input.
///
/// The extra fee is priced at the original's effective rate or the
/// sender's `minfeerate`, whichever is higher. The sender covers up to its
/// declared maximum from its chosen output; the receiver pays the rest out
/// of its own, now larger, output.
fn split_fee(
    params: &PayjoinParams,
    original: &Original,
    coin_value: u64,
    added_weight: u64,
    dust_threshold_sat: u64,
) -> std::result::Result<FeeSplit, PayjoinError> {
    let outputs = &original.tx.output;
    let original_rate = FeeRate::from_fee_and_vsize(original.fee_sat, original.tx.vsize() as u64);
    let rate = params
        .min_fee_rate
        .map_or(original_rate, |min| original_rate.max(min));
    let required = rate.fee_for_weight(original.tx.weight().to_wu() + added_weight);
    let additional = required.saturating_sub(original.fee_sat);

    let mut sender_pays = 0;
    let mut sender_output = None;
    if let Some(index) = params.additional_fee_output_index {
        if index >= outputs.len() {
            return Err(receiver(format!(
                "additionalfeeoutputindex {index} is out of range"
            )));
        }
        if index == original.receiver_output {
            return Err(receiver(
                "additionalfeeoutputindex points at the receiver's output",
            ));
        }
        sender_pays = additional.min(params.max_additional_fee_contribution.unwrap_or(0));
        let reduced = outputs[index].value.to_sat().saturating_sub(sender_pays);
        if reduced < dust_threshold_sat {
            return Err(receiver(format!(
                "fee contribution would leave output {index} at {reduced} sat"
            )));
        }
        sender_output = Some((index, reduced));
    }

    let receiver_pays = additional - sender_pays;
    if coin_value <= receiver_pays {
        return Err(receiver(format!(
            "coin of {coin_value} sat cannot cover {receiver_pays} sat of fee"
        )));
    }
    let receiver_value = outputs[original.receiver_output].value.to_sat() + coin_value - receiver_pays;

    Ok(FeeSplit {
        sender_output,
        receiver_value,
    })
}
