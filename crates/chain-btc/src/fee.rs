//! Fee-rate arithmetic and virtual-size estimation.
//!
//! All sizes are tracked in weight units and converted to virtual bytes
//! with a ceiling division, so estimates never undercount. Fee rates are
//! kept as integer milli-satoshis per vbyte; the only floating point value
//! in this module is the sat/vB number accepted and emitted at the API edge.

use serde::{Deserialize, Serialize};

use crate::error::BtcError;

/// Weight of the non-witness part of a bare input (outpoint + empty scriptSig + sequence).
const BARE_INPUT_WEIGHT: u64 = 41 * 4;

/// Version + locktime, in bytes.
const TX_FIXED_BYTES: u64 = 8;

/// Segwit marker and flag, in weight units.
const SEGWIT_MARKER_WEIGHT: u64 = 2;

/// A DER signature with sighash byte, plus its push opcode.
const ECDSA_SIG_PUSH: u64 = 1 + 72;

/// Largest fee rate accepted, in sat/vB.
const MAX_SAT_PER_VB: f64 = 1_000_000.0;

/// Script family of a wallet's outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScriptType {
    /// P2PKH, or bare P2SH for multisig.
    Legacy,
    /// P2SH-wrapped segwit v0.
    NestedSegwit,
    /// P2WPKH, or P2WSH for multisig.
    NativeSegwit,
    /// P2TR key path.
    Taproot,
}

/// How a wallet locks its coins: one key, or an m-of-n sorted multisig.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase", tag = "kind")]
pub enum WalletScript {
    SingleSig { script_type: ScriptType },
    Multisig {
        script_type: ScriptType,
        required: usize,
        total: usize,
    },
}

impl WalletScript {
    pub fn script_type(&self) -> ScriptType {
        match self {
            WalletScript::SingleSig { script_type } | WalletScript::Multisig { script_type, .. } => {
                *script_type
            }
        }
    }

    /// Number of signatures needed to spend one input.
    pub fn required_signatures(&self) -> usize {
        match self {
            WalletScript::SingleSig { .. } => 1,
            WalletScript::Multisig { required, .. } => *required,
        }
    }

    pub fn is_segwit(&self) -> bool {
        self.script_type() != ScriptType::Legacy
    }

    /// Worst-case weight of one input spending this script, once signed.
    pub fn input_weight(&self) -> u64 {
        match *self {
            WalletScript::SingleSig { script_type } => match script_type {
                // scriptSig: <sig> <33-byte pubkey>
                ScriptType::Legacy => 148 * 4,
                // 23-byte redeem push in scriptSig; witness: count, sig, pubkey
                ScriptType::NestedSegwit => (64 * 4) + 108,
                ScriptType::NativeSegwit => BARE_INPUT_WEIGHT + 108,
                // witness: count, 64-byte schnorr signature
                ScriptType::Taproot => BARE_INPUT_WEIGHT + 66,
            },
            WalletScript::Multisig {
                script_type,
                required,
                total,
            } => {
                let script_len = multisig_script_len(total);
                let sigs = required as u64 * ECDSA_SIG_PUSH;
                let witness = 1 + 1 + sigs + varint_len(script_len) + script_len;
                match script_type {
                    ScriptType::Legacy => {
                        let script_sig = 1 + sigs + push_len(script_len) + script_len;
                        (36 + varint_len(script_sig) + script_sig + 4) * 4
                    }
                    // scriptSig pushes the 34-byte witness program
                    ScriptType::NestedSegwit => (36 + 1 + 35 + 4) * 4 + witness,
                    ScriptType::NativeSegwit | ScriptType::Taproot => BARE_INPUT_WEIGHT + witness,
                }
            }
        }
    }

    /// Length of a scriptPubKey produced by this wallet (used for change and decoys).
    pub fn output_script_len(&self) -> usize {
        match *self {
            WalletScript::SingleSig { script_type } => match script_type {
                ScriptType::Legacy => 25,
                ScriptType::NestedSegwit => 23,
                ScriptType::NativeSegwit => 22,
                ScriptType::Taproot => 34,
            },
            WalletScript::Multisig { script_type, .. } => match script_type {
                ScriptType::Legacy | ScriptType::NestedSegwit => 23,
                ScriptType::NativeSegwit | ScriptType::Taproot => 34,
            },
        }
    }
}

fn multisig_script_len(total: usize) -> u64 {
    // OP_m <33-byte pushes> OP_n OP_CHECKMULTISIG
    3 + 34 * total as u64
}

fn varint_len(n: u64) -> u64 {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

fn push_len(n: u64) -> u64 {
    match n {
        0..=75 => 1,
        76..=0xff => 2,
        _ => 3,
    }
}

/// Weight of one output with a scriptPubKey of `script_len` bytes.
pub fn output_weight(script_len: usize) -> u64 {
    let len = script_len as u64;
    (8 + varint_len(len) + len) * 4
}

/// Estimate the virtual size of a transaction spending `num_inputs` coins of
/// `script` into outputs whose scriptPubKeys have the given lengths.
pub fn estimate_vsize(script: &WalletScript, num_inputs: usize, output_script_lens: &[usize]) -> u64 {
    let mut weight = (TX_FIXED_BYTES
        + varint_len(num_inputs as u64)
        + varint_len(output_script_lens.len() as u64))
        * 4;
    if script.is_segwit() && num_inputs > 0 {
        weight += SEGWIT_MARKER_WEIGHT;
    }
    weight += num_inputs as u64 * script.input_weight();
    weight += output_script_lens.iter().map(|len| output_weight(*len)).sum::<u64>();
    weight_to_vsize(weight)
}

/// Estimate the fee for a transaction of the given shape at `fee_rate`.
pub fn estimate_fee(
    script: &WalletScript,
    num_inputs: usize,
    output_script_lens: &[usize],
    fee_rate: FeeRate,
) -> u64 {
    fee_rate.fee_for_vsize(estimate_vsize(script, num_inputs, output_script_lens))
}

pub fn weight_to_vsize(weight: u64) -> u64 {
    weight.div_ceil(4)
}

/// Fee rate in milli-satoshis per virtual byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct FeeRate {
    msat_per_vb: u64,
}

impl FeeRate {
    pub const ZERO: FeeRate = FeeRate { msat_per_vb: 0 };

    pub const fn from_msat_per_vb(msat_per_vb: u64) -> Self {
        Self { msat_per_vb }
    }

    pub const fn from_sat_per_vb(sat_per_vb: u64) -> Self {
        Self {
            msat_per_vb: sat_per_vb * 1_000,
        }
    }

    /// Convert a fractional sat/vB value, rounding to the nearest milli-satoshi.
    pub fn from_sat_per_vb_f64(sat_per_vb: f64) -> Result<Self, BtcError> {
        if !sat_per_vb.is_finite() || sat_per_vb < 0.0 {
            return Err(BtcError::InvalidFeeRate(format!(
                "{sat_per_vb} is not a non-negative number"
            )));
        }
        if sat_per_vb > MAX_SAT_PER_VB {
            return Err(BtcError::InvalidFeeRate(format!(
                "{sat_per_vb} sat/vB exceeds {MAX_SAT_PER_VB}"
            )));
        }
        Ok(Self {
            msat_per_vb: (sat_per_vb * 1_000.0).round() as u64,
        })
    }

    /// Effective rate of a transaction paying `fee_sat` for `vsize` vbytes, rounded down.
    pub fn from_fee_and_vsize(fee_sat: u64, vsize: u64) -> Self {
        if vsize == 0 {
            return Self::ZERO;
        }
        let msat = (fee_sat as u128 * 1_000) / vsize as u128;
        Self {
            msat_per_vb: u64::try_from(msat).unwrap_or(u64::MAX),
        }
    }

    pub fn msat_per_vb(&self) -> u64 {
        self.msat_per_vb
    }

    pub fn as_sat_per_vb(&self) -> f64 {
        self.msat_per_vb as f64 / 1_000.0
    }

    /// Fee in whole satoshis for `vsize` vbytes, rounded up.
    pub fn fee_for_vsize(&self, vsize: u64) -> u64 {
        let msat = vsize as u128 * self.msat_per_vb as u128;
        u64::try_from(msat.div_ceil(1_000)).unwrap_or(u64::MAX)
    }

    /// Fee in whole satoshis for `weight` weight units, rounded up.
    pub fn fee_for_weight(&self, weight: u64) -> u64 {
        self.fee_for_vsize(weight_to_vsize(weight))
    }
}

impl TryFrom<f64> for FeeRate {
    type Error = BtcError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        FeeRate::from_sat_per_vb_f64(value)
    }
}

impl From<FeeRate> for f64 {
    fn from(rate: FeeRate) -> Self {
        rate.as_sat_per_vb()
    }
}

impl std::fmt::Display for FeeRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.3} sat/vB", self.as_sat_per_vb())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WPKH: WalletScript = WalletScript::SingleSig {
        script_type: ScriptType::NativeSegwit,
    };

    #[test]
    fn native_segwit_input_is_68_vbytes() {
        assert_eq!(weight_to_vsize(WPKH.input_weight()), 68);
    }

    #[test]
    fn single_sig_input_sizes_by_script_type() {
        let vbytes = |script_type| {
            WalletScript::SingleSig { script_type }.input_weight() as f64 / 4.0
        };
        assert_eq!(vbytes(ScriptType::Legacy), 148.0);
        assert_eq!(vbytes(ScriptType::NestedSegwit), 91.0);
        assert_eq!(vbytes(ScriptType::Taproot), 57.5);
    }

    #[test]
    fn estimate_vsize_one_in_two_out() {
        // 10.5 vB overhead + 68 vB input + 2 * 31 vB outputs
        assert_eq!(estimate_vsize(&WPKH, 1, &[22, 22]), 141);
    }

    #[test]
    fn estimate_fee_scales_with_inputs() {
        let rate = FeeRate::from_sat_per_vb(10);
        let fee_1 = estimate_fee(&WPKH, 1, &[22, 22], rate);
        let fee_2 = estimate_fee(&WPKH, 2, &[22, 22], rate);
        assert_eq!(fee_2 - fee_1, 680);
    }

    #[test]
    fn estimate_fee_zero_rate() {
        assert_eq!(estimate_fee(&WPKH, 5, &[22; 5], FeeRate::ZERO), 0);
    }

    #[test]
    fn multisig_inputs_grow_with_threshold_and_keys() {
        let two_of_three = WalletScript::Multisig {
            script_type: ScriptType::NativeSegwit,
            required: 2,
            total: 3,
        };
        let three_of_five = WalletScript::Multisig {
            script_type: ScriptType::NativeSegwit,
            required: 3,
            total: 5,
        };
        assert!(two_of_three.input_weight() > WPKH.input_weight());
        assert!(three_of_five.input_weight() > two_of_three.input_weight());
        // 2-of-3 P2WSH: 41 vB base + 254 witness bytes / 4
        assert_eq!(weight_to_vsize(two_of_three.input_weight()), 105);
    }

    #[test]
    fn legacy_multisig_has_no_witness_discount() {
        let p2sh = WalletScript::Multisig {
            script_type: ScriptType::Legacy,
            required: 2,
            total: 3,
        };
        let wsh = WalletScript::Multisig {
            script_type: ScriptType::NativeSegwit,
            required: 2,
            total: 3,
        };
        assert!(p2sh.input_weight() > 2 * wsh.input_weight());
    }

    #[test]
    fn fractional_rate_rounds_fee_up() {
        let rate = FeeRate::from_sat_per_vb_f64(1.5).unwrap();
        assert_eq!(rate.msat_per_vb(), 1_500);
        // 141 * 1.5 = 211.5 -> 212
        assert_eq!(rate.fee_for_vsize(141), 212);
    }

    #[test]
    fn rejects_negative_and_non_finite_rates() {
        assert!(FeeRate::from_sat_per_vb_f64(-1.0).is_err());
        assert!(FeeRate::from_sat_per_vb_f64(f64::NAN).is_err());
        assert!(FeeRate::from_sat_per_vb_f64(f64::INFINITY).is_err());
    }

    #[test]
    fn effective_rate_rounds_down() {
        let rate = FeeRate::from_fee_and_vsize(283, 141);
        assert_eq!(rate.msat_per_vb(), 2_007);
        assert!(rate >= FeeRate::from_sat_per_vb(2));
    }

    #[test]
    fn serde_crosses_boundary_as_sat_per_vbyte() {
        let rate: FeeRate = serde_json::from_str("2.25").unwrap();
        assert_eq!(rate.msat_per_vb(), 2_250);
        assert_eq!(serde_json::to_string(&rate).unwrap(), "2.25");
        assert!(serde_json::from_str::<FeeRate>("-3").is_err());
    }
}
