use bitcoin::absolute::LockTime;
use bitcoin::psbt::Psbt;
use bitcoin::script::ScriptBuf;
use bitcoin::transaction::Version;
use bitcoin::{Amount, Sequence, Transaction, TxIn, TxOut, Witness};
use rand::Rng;

use crate::descriptor::WalletDescriptor;
use crate::error::BtcError;
use crate::fee::{estimate_vsize, FeeRate, WalletScript};
use crate::utxo::{Keychain, Utxo};

/// How much a recipient output should receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payment {
    Fixed(u64),
    /// Everything left after other outputs and the fee.
    SendMax,
}

#[derive(Debug, Clone)]
pub struct Recipient {
    pub script_pubkey: ScriptBuf,
    pub payment: Payment,
}

/// Shape of a spend whose inputs are already chosen.
#[derive(Debug, Clone)]
pub struct PlanRequest<'a> {
    pub wallet_script: WalletScript,
    pub num_inputs: usize,
    pub total_input_sat: u64,
    pub recipients: &'a [Recipient],
    /// scriptPubKey length of the change output, should one be created.
    pub change_script_len: usize,
    /// Extra change-like outputs to add when change allows it.
    pub decoy_outputs: usize,
    pub fee_rate: FeeRate,
    pub dust_threshold_sat: u64,
    /// Take the fee out of the sole recipient rather than out of change.
    pub subtract_fee_from_amount: bool,
}

impl PlanRequest<'_> {
    /// Output script lengths for recipients plus `own_outputs` change-like outputs.
    pub fn output_lens(&self, own_outputs: usize) -> Vec<usize> {
        let mut lens: Vec<usize> = self.recipients.iter().map(|r| r.script_pubkey.len()).collect();
        lens.extend(std::iter::repeat(self.change_script_len).take(own_outputs));
        lens
    }

    /// Fee for this spend with `num_inputs` inputs and `own_outputs` change-like outputs.
    pub fn fee_with(&self, num_inputs: usize, own_outputs: usize) -> u64 {
        self.fee_rate.fee_for_vsize(estimate_vsize(
            &self.wallet_script,
            num_inputs,
            &self.output_lens(own_outputs),
        ))
    }
}

/// Amounts for every output of a spend.
///
/// `recipient_values + change + decoys + fee == total_input` always holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxPlan {
    pub recipient_values: Vec<u64>,
    pub change_sat: Option<u64>,
    pub decoy_values: Vec<u64>,
    pub fee_sat: u64,
    pub vsize: u64,
    pub total_input_sat: u64,
    pub total_output_sat: u64,
}

/// Compute recipient, change, decoy and fee amounts for a spend.
///
/// Change below `dust_threshold_sat` is folded into the fee. Decoy outputs
/// are carved out of change, so they only appear when change is large enough
/// to split into pieces that are each above dust; the count shrinks
/// otherwise. The fee is always rounded up to a whole satoshi.
pub fn plan_transaction<R: Rng + ?Sized>(req: &PlanRequest<'_>, rng: &mut R) -> Result<TxPlan, BtcError> {
    if req.recipients.is_empty() {
        return Err(BtcError::TransactionBuildError("no recipients".into()));
    }
    if req.num_inputs == 0 {
        return Err(BtcError::TransactionBuildError("no inputs".into()));
    }
    let send_max_count = req
        .recipients
        .iter()
        .filter(|r| r.payment == Payment::SendMax)
        .count();
    if send_max_count > 1 {
        return Err(BtcError::TransactionBuildError(
            "at most one output may send the maximum".into(),
        ));
    }
    if req.subtract_fee_from_amount && (req.recipients.len() != 1 || send_max_count != 0) {
        return Err(BtcError::TransactionBuildError(
            "subtracting the fee requires exactly one fixed recipient".into(),
        ));
    }

    let fixed_total: u64 = req
        .recipients
        .iter()
        .filter_map(|r| match r.payment {
            Payment::Fixed(v) => Some(v),
            Payment::SendMax => None,
        })
        .sum();
    for value in req.recipients.iter().filter_map(|r| match r.payment {
        Payment::Fixed(v) => Some(v),
        Payment::SendMax => None,
    }) {
        check_dust(value, req.dust_threshold_sat)?;
    }

    let total = req.total_input_sat;

    if send_max_count == 1 {
        let fee = req.fee_with(req.num_inputs, 0);
        let required = fixed_total + fee;
        if total < required {
            return Err(BtcError::InsufficientFunds {
                available_sat: total,
                required_sat: required,
            });
        }
        let max_value = total - required;
        check_dust(max_value, req.dust_threshold_sat)?;
        let recipient_values = req
            .recipients
            .iter()
            .map(|r| match r.payment {
                Payment::Fixed(v) => v,
                Payment::SendMax => max_value,
            })
            .collect();
        return finish(req, recipient_values, None, Vec::new(), fee, 0);
    }

    if req.subtract_fee_from_amount {
        if total < fixed_total {
            return Err(BtcError::InsufficientFunds {
                available_sat: total,
                required_sat: fixed_total,
            });
        }
        let leftover = total - fixed_total;
        let (own_values, fee) = if leftover >= req.dust_threshold_sat {
            let pieces = split_change(leftover, req.decoy_outputs, req.dust_threshold_sat, rng);
            let fee = req.fee_with(req.num_inputs, pieces.len());
            (pieces, fee)
        } else {
            (Vec::new(), req.fee_with(req.num_inputs, 0) + leftover)
        };
        let leftover_in_fee = if own_values.is_empty() { leftover } else { 0 };
        let paid_by_recipient = fee - leftover_in_fee;
        let value = fixed_total.saturating_sub(paid_by_recipient);
        check_dust(value, req.dust_threshold_sat)?;
        let (change, decoys) = split_off_change(own_values);
        let own_outputs = decoys.len() + usize::from(change.is_some());
        return finish(req, vec![value], change, decoys, fee, own_outputs);
    }

    let fee_without_change = req.fee_with(req.num_inputs, 0);
    let required = fixed_total + fee_without_change;
    if total < required {
        return Err(BtcError::InsufficientFunds {
            available_sat: total,
            required_sat: required,
        });
    }

    let recipient_values: Vec<u64> = req
        .recipients
        .iter()
        .map(|r| match r.payment {
            Payment::Fixed(v) => v,
            Payment::SendMax => 0,
        })
        .collect();

    // Try the largest number of change-like outputs first and shrink until
    // every piece clears dust.
    for own_outputs in (1..=req.decoy_outputs + 1).rev() {
        let fee = req.fee_with(req.num_inputs, own_outputs);
        let Some(change_total) = total.checked_sub(fixed_total + fee) else {
            continue;
        };
        if change_total < req.dust_threshold_sat * own_outputs as u64 {
            continue;
        }
        let pieces = split_change(change_total, own_outputs - 1, req.dust_threshold_sat, rng);
        if pieces.len() != own_outputs {
            continue;
        }
        let (change, decoys) = split_off_change(pieces);
        return finish(req, recipient_values, change, decoys, fee, own_outputs);
    }

    // Change is dust: no change output, the remainder becomes fee.
    let fee = total - fixed_total;
    finish(req, recipient_values, None, Vec::new(), fee, 0)
}

fn check_dust(value: u64, threshold: u64) -> Result<(), BtcError> {
    if value < threshold {
        return Err(BtcError::DustOutput {
            value_sat: value,
            threshold_sat: threshold,
        });
    }
    Ok(())
}

/// Split `amount` into `1 + decoys` pieces, each at least `dust`.
/// Returns fewer pieces when the amount cannot support all of them.
fn split_change<R: Rng + ?Sized>(amount: u64, decoys: usize, dust: u64, rng: &mut R) -> Vec<u64> {
    let mut count = decoys + 1;
    while count > 1 && amount < dust * count as u64 {
        count -= 1;
    }
    if count == 1 {
        return vec![amount];
    }

    let spare = amount - dust * count as u64;
    let mut cuts: Vec<u64> = (0..count - 1).map(|_| rng.gen_range(0..=spare)).collect();
    cuts.sort_unstable();

    let mut pieces = Vec::with_capacity(count);
    let mut prev = 0;
    for cut in cuts {
        pieces.push(dust + (cut - prev));
        prev = cut;
    }
    pieces.push(dust + (spare - prev));
    // Real change is the largest piece.
    pieces.sort_unstable_by(|a, b| b.cmp(a));
    pieces
}

fn split_off_change(mut pieces: Vec<u64>) -> (Option<u64>, Vec<u64>) {
    if pieces.is_empty() {
        return (None, pieces);
    }
    let change = pieces.remove(0);
    (Some(change), pieces)
}

fn finish(
    req: &PlanRequest<'_>,
    recipient_values: Vec<u64>,
    change_sat: Option<u64>,
    decoy_values: Vec<u64>,
    fee_sat: u64,
    own_outputs: usize,
) -> Result<TxPlan, BtcError> {
    let total_output_sat = recipient_values.iter().sum::<u64>()
        + change_sat.unwrap_or(0)
        + decoy_values.iter().sum::<u64>();
    if total_output_sat + fee_sat != req.total_input_sat {
        return Err(BtcError::TransactionBuildError(format!(
            "plan does not balance: outputs {total_output_sat} + fee {fee_sat} != inputs {}",
            req.total_input_sat
        )));
    }
    Ok(TxPlan {
        recipient_values,
        change_sat,
        decoy_values,
        fee_sat,
        vsize: estimate_vsize(&req.wallet_script, req.num_inputs, &req.output_lens(own_outputs)),
        total_input_sat: req.total_input_sat,
        total_output_sat,
    })
}

/// One input of a PSBT under construction.
#[derive(Debug, Clone)]
pub struct PsbtInput {
    pub utxo: Utxo,
    /// Full previous transaction; required for legacy (non-segwit) inputs.
    pub prev_tx: Option<Transaction>,
}

/// One output of a PSBT under construction.
#[derive(Debug, Clone)]
pub struct PsbtOutput {
    pub script_pubkey: ScriptBuf,
    pub value_sat: u64,
    /// Set for outputs paying back into the wallet so signers can verify them.
    pub derivation: Option<(Keychain, u32)>,
}

/// Build an unsigned PSBT carrying every input's key origins.
///
/// Inputs signal replace-by-fee when `enable_rbf` is set; otherwise they use
/// `0xfffffffe`, which still allows `lock_time`.
pub fn build_psbt(
    descriptor: &WalletDescriptor,
    inputs: &[PsbtInput],
    outputs: &[PsbtOutput],
    enable_rbf: bool,
    lock_time: LockTime,
) -> Result<Psbt, BtcError> {
    if inputs.is_empty() || outputs.is_empty() {
        return Err(BtcError::TransactionBuildError(
            "a transaction needs at least one input and one output".into(),
        ));
    }

    let sequence = if enable_rbf {
        Sequence::ENABLE_RBF_NO_LOCKTIME
    } else {
        Sequence::ENABLE_LOCKTIME_NO_RBF
    };

    let tx = Transaction {
        version: Version::TWO,
        lock_time,
        input: inputs
            .iter()
            .map(|i| TxIn {
                previous_output: i.utxo.outpoint,
                script_sig: ScriptBuf::new(),
                sequence,
                witness: Witness::default(),
            })
            .collect(),
        output: outputs
            .iter()
            .map(|o| TxOut {
                value: Amount::from_sat(o.value_sat),
                script_pubkey: o.script_pubkey.clone(),
            })
            .collect(),
    };

    let mut psbt = Psbt::from_unsigned_tx(tx)
        .map_err(|e| BtcError::TransactionBuildError(format!("psbt creation failed: {e}")))?;

    let segwit = descriptor.wallet_script().is_segwit();
    for (index, input) in inputs.iter().enumerate() {
        let psbt_input = &mut psbt.inputs[index];
        if segwit {
            psbt_input.witness_utxo = Some(TxOut {
                value: Amount::from_sat(input.utxo.amount_sat),
                script_pubkey: input.utxo.script_pubkey.clone(),
            });
        }
        match &input.prev_tx {
            Some(prev) => {
                if prev.compute_txid() != input.utxo.outpoint.txid {
                    return Err(BtcError::TransactionBuildError(format!(
                        "previous transaction does not match {}",
                        input.utxo.outpoint
                    )));
                }
                psbt_input.non_witness_utxo = Some(prev.clone());
            }
            None if !segwit => {
                return Err(BtcError::TransactionBuildError(format!(
                    "legacy input {} needs its previous transaction",
                    input.utxo.outpoint
                )));
            }
            None => {}
        }
        descriptor.update_psbt_input(
            &mut psbt,
            index,
            input.utxo.keychain,
            input.utxo.derivation_index,
        )?;
    }

    for (index, output) in outputs.iter().enumerate() {
        if let Some((keychain, child)) = output.derivation {
            descriptor.update_psbt_output(&mut psbt, index, keychain, child)?;
        }
    }

    if let WalletScript::Multisig { .. } = descriptor.wallet_script() {
        psbt.xpub.extend(descriptor.account_xpubs());
    }

    Ok(psbt)
}
