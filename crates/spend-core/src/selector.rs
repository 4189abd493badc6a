//! Which coins a spend may use.
//!
//! A coin is eligible when it is unspent, not frozen, has at least the
//! wallet's confirmation threshold, and carries no active lock belonging to
//! someone else. The same rule backs ordinary spends, explicit coin control
//! and payjoin.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::{LockHolder, UtxoRecord};

/// Why a coin cannot be spent right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "reason")]
pub enum Ineligibility {
    Spent,
    Frozen,
    Unconfirmed { confirmations: u32, required: u32 },
    Locked,
}

impl fmt::Display for Ineligibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ineligibility::Spent => write!(f, "already spent"),
            Ineligibility::Frozen => write!(f, "frozen"),
            Ineligibility::Unconfirmed {
                confirmations,
                required,
            } => write!(f, "{confirmations} of {required} confirmations"),
            Ineligibility::Locked => write!(f, "locked by another spend"),
        }
    }
}

/// Check one coin. `holder` may use coins it has locked itself.
pub fn check(
    record: &UtxoRecord,
    confirmation_threshold: u32,
    holder: Option<LockHolder>,
    now: DateTime<Utc>,
) -> Result<(), Ineligibility> {
    if record.spent {
        return Err(Ineligibility::Spent);
    }
    if record.frozen {
        return Err(Ineligibility::Frozen);
    }
    if record.confirmations < confirmation_threshold {
        return Err(Ineligibility::Unconfirmed {
            confirmations: record.confirmations,
            required: confirmation_threshold,
        });
    }
    if let Some(lock) = record.active_lock(now) {
        if Some(lock.holder) != holder {
            return Err(Ineligibility::Locked);
        }
    }
    Ok(())
}

/// A wallet's unspent coins split by eligibility.
#[derive(Debug, Clone, Default)]
pub struct CoinPool {
    pub eligible: Vec<UtxoRecord>,
    pub ineligible: Vec<(UtxoRecord, Ineligibility)>,
}

impl CoinPool {
    /// Sort `records` into eligible and ineligible. Spent coins are dropped.
    pub fn build(
        records: Vec<UtxoRecord>,
        confirmation_threshold: u32,
        holder: Option<LockHolder>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut pool = CoinPool::default();
        for record in records.into_iter().filter(|r| !r.spent) {
            match check(&record, confirmation_threshold, holder, now) {
                Ok(()) => pool.eligible.push(record),
                Err(reason) => pool.ineligible.push((record, reason)),
            }
        }
        pool
    }

    /// Unspent coins, eligible or not.
    pub fn total(&self) -> usize {
        self.eligible.len() + self.ineligible.len()
    }

    pub fn eligible_sat(&self) -> u64 {
        self.eligible.iter().map(|r| r.amount_sat()).sum()
    }

    pub fn count_ineligible(&self, pred: impl Fn(&Ineligibility) -> bool) -> usize {
        self.ineligible.iter().filter(|(_, reason)| pred(reason)).count()
    }
}
