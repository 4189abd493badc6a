//! PSBT transport and signature handling.
//!
//! Hardware signers return either a PSBT carrying partial signatures or an
//! already-finalized one. Everything here treats the unsigned transaction as
//! the identity of a PSBT: two PSBTs are only merged when their txids match.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bitcoin::bip32::DerivationPath;
use bitcoin::hashes::Hash;
use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::{Message, Secp256k1, XOnlyPublicKey};
use bitcoin::sighash::{Prevouts, SighashCache};
use bitcoin::{Transaction, TxOut};
use miniscript::psbt::PsbtExt;
use serde::{Deserialize, Serialize};

use crate::error::BtcError;

/// Decode a base64 PSBT. Surrounding whitespace is ignored.
pub fn decode_psbt(encoded: &str) -> Result<Psbt, BtcError> {
    let trimmed = encoded.trim();
    if trimmed.is_empty() {
        return Err(BtcError::InvalidPsbt("empty psbt".into()));
    }
    let bytes = STANDARD
        .decode(trimmed)
        .map_err(|e| BtcError::InvalidPsbt(format!("not base64: {e}")))?;
    Psbt::deserialize(&bytes).map_err(|e| BtcError::InvalidPsbt(e.to_string()))
}

pub fn encode_psbt(psbt: &Psbt) -> String {
    STANDARD.encode(psbt.serialize())
}

/// Decode a hex-encoded raw transaction.
pub fn parse_raw_transaction(raw_hex: &str) -> Result<Transaction, BtcError> {
    let bytes = hex::decode(raw_hex.trim())
        .map_err(|e| BtcError::InvalidTransaction(format!("not hex: {e}")))?;
    bitcoin::consensus::deserialize(&bytes)
        .map_err(|e| BtcError::InvalidTransaction(e.to_string()))
}

pub fn serialize_raw_transaction(tx: &Transaction) -> String {
    hex::encode(bitcoin::consensus::serialize(tx))
}

/// Merge the signatures of `fragment` into a copy of `base`.
pub fn combine_signatures(base: &Psbt, fragment: &Psbt) -> Result<Psbt, BtcError> {
    let expected = base.unsigned_tx.compute_txid();
    let got = fragment.unsigned_tx.compute_txid();
    if expected != got {
        return Err(BtcError::PsbtMismatch(format!(
            "fragment spends {got}, expected {expected}"
        )));
    }
    let mut merged = base.clone();
    merged
        .combine(fragment.clone())
        .map_err(|e| BtcError::PsbtMismatch(e.to_string()))?;
    Ok(merged)
}

/// Whether any input carries a signature or a final script.
pub fn has_signatures(psbt: &Psbt) -> bool {
    psbt.inputs.iter().any(|input| {
        !input.partial_sigs.is_empty()
            || input.tap_key_sig.is_some()
            || !input.tap_script_sigs.is_empty()
            || input.final_script_witness.is_some()
            || input.final_script_sig.is_some()
    })
}

/// Number of signatures across all inputs: partial ECDSA signatures plus
/// taproot key-path and script-path signatures.
pub fn signature_count(psbt: &Psbt) -> usize {
    psbt.inputs
        .iter()
        .map(|input| {
            input.partial_sigs.len()
                + usize::from(input.tap_key_sig.is_some())
                + input.tap_script_sigs.len()
        })
        .sum()
}

/// Check every partial signature in `psbt` against its input's sighash.
///
/// ECDSA signatures are checked for all script types; taproot key-path
/// signatures are checked against the output key. Finalized inputs are
/// skipped, they are checked when the transaction is extracted.
pub fn verify_partial_signatures(psbt: &Psbt) -> Result<(), BtcError> {
    let secp = Secp256k1::verification_only();
    let mut cache = SighashCache::new(&psbt.unsigned_tx);

    for (index, input) in psbt.inputs.iter().enumerate() {
        if !input.partial_sigs.is_empty() {
            let (msg, sighash_type) = psbt
                .sighash_ecdsa(index, &mut cache)
                .map_err(|e| BtcError::InvalidSignature(format!("input {index}: {e}")))?;
            for (pubkey, sig) in &input.partial_sigs {
                if sig.sighash_type != sighash_type {
                    return Err(BtcError::InvalidSignature(format!(
                        "input {index}: unexpected sighash type {}",
                        sig.sighash_type
                    )));
                }
                secp.verify_ecdsa(&msg, &sig.signature, &pubkey.inner)
                    .map_err(|_| {
                        BtcError::InvalidSignature(format!("input {index}: bad signature for {pubkey}"))
                    })?;
            }
        }

        if let Some(sig) = &input.tap_key_sig {
            let prevouts = spent_outputs(psbt)?;
            let output_key = input
                .witness_utxo
                .as_ref()
                .filter(|txout| txout.script_pubkey.is_p2tr())
                .and_then(|txout| XOnlyPublicKey::from_slice(&txout.script_pubkey.as_bytes()[2..]).ok())
                .ok_or_else(|| {
                    BtcError::InvalidSignature(format!("input {index}: taproot signature on non-taproot input"))
                })?;
            let sighash = cache
                .taproot_key_spend_signature_hash(index, &Prevouts::All(&prevouts), sig.sighash_type)
                .map_err(|e| BtcError::InvalidSignature(format!("input {index}: {e}")))?;
            let msg = Message::from_digest(sighash.to_byte_array());
            secp.verify_schnorr(&sig.signature, &msg, &output_key)
                .map_err(|_| BtcError::InvalidSignature(format!("input {index}: bad taproot signature")))?;
        }
    }
    Ok(())
}

/// Finalize every input that is not already final and extract the network transaction.
pub fn finalize(psbt: &Psbt) -> Result<Transaction, BtcError> {
    let secp = Secp256k1::verification_only();
    let mut psbt = psbt.clone();
    for index in 0..psbt.inputs.len() {
        let input = &psbt.inputs[index];
        if input.final_script_witness.is_some() || input.final_script_sig.is_some() {
            continue;
        }
        psbt.finalize_inp_mut(&secp, index)
            .map_err(|e| BtcError::FinalizeError(format!("input {index}: {e}")))?;
    }
    psbt.extract_tx()
        .map_err(|e| BtcError::FinalizeError(e.to_string()))
}

/// Value of the output spent by input `index`, from whichever UTXO field is present.
pub fn input_txout(psbt: &Psbt, index: usize) -> Option<TxOut> {
    let input = psbt.inputs.get(index)?;
    if let Some(txout) = &input.witness_utxo {
        return Some(txout.clone());
    }
    let prev = input.non_witness_utxo.as_ref()?;
    let vout = psbt.unsigned_tx.input.get(index)?.previous_output.vout;
    prev.output.get(vout as usize).cloned()
}

fn spent_outputs(psbt: &Psbt) -> Result<Vec<TxOut>, BtcError> {
    (0..psbt.inputs.len())
        .map(|i| {
            input_txout(psbt, i)
                .ok_or_else(|| BtcError::InvalidPsbt(format!("input {i} has no utxo data")))
        })
        .collect()
}

/// Amount totals recovered from a PSBT's UTXO data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PsbtSummary {
    pub total_input: u64,
    pub total_output: u64,
    pub fee: u64,
}

pub fn summarize(psbt: &Psbt) -> Result<PsbtSummary, BtcError> {
    let total_input: u64 = spent_outputs(psbt)?.iter().map(|o| o.value.to_sat()).sum();
    let total_output: u64 = psbt
        .unsigned_tx
        .output
        .iter()
        .map(|o| o.value.to_sat())
        .sum();
    let fee = total_input.checked_sub(total_output).ok_or_else(|| {
        BtcError::InvalidPsbt(format!(
            "outputs ({total_output} sat) exceed inputs ({total_input} sat)"
        ))
    })?;
    Ok(PsbtSummary {
        total_input,
        total_output,
        fee,
    })
}

/// A BIP32 key origin as shown to hardware signers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyOrigin {
    /// Master key fingerprint, lowercase hex.
    pub fingerprint: String,
    /// Full path from the master key, e.g. `m/84'/0'/0'/0/5`.
    pub path: String,
}

/// Key origins of every input, in input order.
pub fn input_key_origins(psbt: &Psbt) -> Vec<Vec<KeyOrigin>> {
    psbt.inputs
        .iter()
        .map(|input| {
            let ecdsa = input.bip32_derivation.values();
            let taproot = input.tap_key_origins.values().map(|(_, origin)| origin);
            ecdsa
                .chain(taproot)
                .map(|(fingerprint, path)| KeyOrigin {
                    fingerprint: fingerprint.to_string(),
                    path: format_path(path),
                })
                .collect()
        })
        .collect()
}

fn format_path(path: &DerivationPath) -> String {
    let mut out = String::from("m");
    for child in path {
        out.push('/');
        out.push_str(&child.to_string());
    }
    out
}
