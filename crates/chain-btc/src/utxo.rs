use std::str::FromStr;

use bitcoin::{OutPoint, ScriptBuf};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::error::BtcError;

/// Which descriptor branch an output was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Keychain {
    /// Receive addresses (`/0/*`).
    External,
    /// Change addresses (`/1/*`).
    Internal,
}

/// A single unspent transaction output (UTXO) owned by a wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Utxo {
    pub outpoint: OutPoint,
    /// Value in satoshis.
    pub amount_sat: u64,
    /// The locking script (scriptPubKey).
    pub script_pubkey: ScriptBuf,
    pub keychain: Keychain,
    /// Child index of the address on its keychain.
    pub derivation_index: u32,
}

/// Result of UTXO selection: the chosen UTXOs and their aggregate value.
#[derive(Debug, Clone)]
pub struct UtxoSelection {
    /// The selected UTXOs, explicit picks first.
    pub selected: Vec<Utxo>,
    /// Total value of the selected UTXOs in satoshis.
    pub total_sat: u64,
    /// Fee estimated for the final input count.
    pub fee_sat: u64,
}

/// Orders candidate coins before the greedy accumulation runs.
///
/// Strategies only decide the order; eligibility and the stopping rule
/// (`total >= target + fee`) are shared by all of them.
pub trait CoinSelectionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn order(&self, candidates: &mut Vec<Utxo>, target_sat: u64);
}

/// Spend the biggest coins first. Deterministic; ties break on outpoint.
#[derive(Debug, Default, Clone, Copy)]
pub struct LargestFirst;

impl CoinSelectionStrategy for LargestFirst {
    fn name(&self) -> &'static str {
        "largest-first"
    }

    fn order(&self, candidates: &mut Vec<Utxo>, _target_sat: u64) {
        candidates.sort_by(|a, b| {
            b.amount_sat
                .cmp(&a.amount_sat)
                .then_with(|| a.outpoint.cmp(&b.outpoint))
        });
    }
}

/// Spend the smallest coins first, consolidating dust-ish coins.
#[derive(Debug, Default, Clone, Copy)]
pub struct SmallestFirst;

impl CoinSelectionStrategy for SmallestFirst {
    fn name(&self) -> &'static str {
        "smallest-first"
    }

    fn order(&self, candidates: &mut Vec<Utxo>, _target_sat: u64) {
        candidates.sort_by(|a, b| {
            a.amount_sat
                .cmp(&b.amount_sat)
                .then_with(|| a.outpoint.cmp(&b.outpoint))
        });
    }
}

/// Prefer the smallest single coin that covers the target on its own,
/// otherwise fall back to largest-first.
#[derive(Debug, Default, Clone, Copy)]
pub struct MinimizeChange;

impl CoinSelectionStrategy for MinimizeChange {
    fn name(&self) -> &'static str {
        "minimize-change"
    }

    fn order(&self, candidates: &mut Vec<Utxo>, target_sat: u64) {
        LargestFirst.order(candidates, target_sat);
        let best = candidates
            .iter()
            .enumerate()
            .filter(|(_, u)| u.amount_sat >= target_sat)
            .min_by_key(|(_, u)| u.amount_sat)
            .map(|(i, _)| i);
        if let Some(i) = best {
            let coin = candidates.remove(i);
            candidates.insert(0, coin);
        }
    }
}

/// Random order, so the chosen set does not reveal wallet balance structure.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrivacyRandom;

impl CoinSelectionStrategy for PrivacyRandom {
    fn name(&self) -> &'static str {
        "privacy"
    }

    fn order(&self, candidates: &mut Vec<Utxo>, _target_sat: u64) {
        candidates.shuffle(&mut rand::thread_rng());
    }
}

/// Named strategy, as written in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    #[default]
    LargestFirst,
    SmallestFirst,
    MinimizeChange,
    Privacy,
}

impl StrategyKind {
    pub fn build(self) -> Box<dyn CoinSelectionStrategy> {
        match self {
            StrategyKind::LargestFirst => Box::new(LargestFirst),
            StrategyKind::SmallestFirst => Box::new(SmallestFirst),
            StrategyKind::MinimizeChange => Box::new(MinimizeChange),
            StrategyKind::Privacy => Box::new(PrivacyRandom),
        }
    }
}

impl FromStr for StrategyKind {
    type Err = BtcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "largest-first" => Ok(StrategyKind::LargestFirst),
            "smallest-first" => Ok(StrategyKind::SmallestFirst),
            "minimize-change" => Ok(StrategyKind::MinimizeChange),
            "privacy" => Ok(StrategyKind::Privacy),
            other => Err(BtcError::TransactionBuildError(format!(
                "unknown coin selection strategy: {other}"
            ))),
        }
    }
}

/// Select UTXOs to cover `target_sat` plus the fee for the chosen input count.
///
/// Every coin in `required` is taken first. If they do not cover the target,
/// `candidates` are ordered by `strategy` and accumulated until
/// `total >= target_sat + fee_for_inputs(n)`. Fails with `InsufficientFunds`
/// when even the full set falls short.
pub fn select_utxos(
    required: Vec<Utxo>,
    mut candidates: Vec<Utxo>,
    target_sat: u64,
    fee_for_inputs: impl Fn(usize) -> u64,
    strategy: &dyn CoinSelectionStrategy,
) -> Result<UtxoSelection, BtcError> {
    let mut selected: Vec<Utxo> = Vec::with_capacity(required.len() + candidates.len());
    let mut total_sat: u64 = 0;

    for utxo in required {
        total_sat += utxo.amount_sat;
        selected.push(utxo);
    }

    let covered = |selected: &[Utxo], total_sat: u64| {
        let fee = fee_for_inputs(selected.len());
        (!selected.is_empty() && total_sat >= target_sat + fee, fee)
    };

    if let (true, fee_sat) = covered(&selected, total_sat) {
        return Ok(UtxoSelection {
            selected,
            total_sat,
            fee_sat,
        });
    }

    strategy.order(&mut candidates, target_sat);

    for utxo in candidates {
        total_sat += utxo.amount_sat;
        selected.push(utxo);

        if let (true, fee_sat) = covered(&selected, total_sat) {
            return Ok(UtxoSelection {
                selected,
                total_sat,
                fee_sat,
            });
        }
    }

    let fee = fee_for_inputs(selected.len().max(1));
    Err(BtcError::InsufficientFunds {
        available_sat: total_sat,
        required_sat: target_sat + fee,
    })
}

/// Take every candidate, as "send max" does. Fails if there is nothing to spend.
pub fn select_all(
    candidates: Vec<Utxo>,
    fee_for_inputs: impl Fn(usize) -> u64,
) -> Result<UtxoSelection, BtcError> {
    if candidates.is_empty() {
        return Err(BtcError::InsufficientFunds {
            available_sat: 0,
            required_sat: fee_for_inputs(1),
        });
    }
    let total_sat = candidates.iter().map(|u| u.amount_sat).sum();
    let fee_sat = fee_for_inputs(candidates.len());
    Ok(UtxoSelection {
        selected: candidates,
        total_sat,
        fee_sat,
    })
}
