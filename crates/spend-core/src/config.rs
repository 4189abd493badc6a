//! Runtime settings for the spend subsystem.
//!
//! Values come from an optional TOML file and are then overridden by
//! `SPEND_*` environment variables. Environment values outside their bounds
//! are clamped and logged rather than rejected.

use std::path::Path;
use std::{env, fs};

use chain_btc::fee::FeeRate;
use chain_btc::utxo::StrategyKind;
use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_MIN_FEE_RATE: f64 = 1.0;
pub const DEFAULT_MAX_FEE_RATE: f64 = 5_000.0;
pub const DEFAULT_DUST_THRESHOLD_SAT: u64 = 546;
/// One week.
pub const DEFAULT_DRAFT_TTL_SECS: u64 = 7 * 24 * 60 * 60;
pub const DEFAULT_PAYJOIN_LOCK_TTL_SECS: u64 = 60 * 60;
pub const DEFAULT_MAX_DECOY_OUTPUTS: usize = 3;
pub const DEFAULT_ADDRESS_LOOKAHEAD: u32 = 100;

/// Upper bound for any fee-rate setting, in sat/vB.
const FEE_RATE_CEILING: f64 = 100_000.0;
const MAX_TTL_SECS: u64 = 90 * 24 * 60 * 60;
const MAX_DECOY_CEILING: usize = 10;
const MAX_LOOKAHEAD: u32 = 10_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SpendConfig {
    /// Lowest fee rate a spend may use, in sat/vB.
    pub min_fee_rate: f64,
    /// Highest fee rate a spend may use, in sat/vB.
    pub max_fee_rate: f64,
    /// Used for wallets that do not set their own threshold.
    pub dust_threshold_sat: u64,
    pub draft_ttl_secs: u64,
    pub payjoin_lock_ttl_secs: u64,
    pub max_decoy_outputs: usize,
    pub coin_selection: StrategyKind,
    /// How many addresses per keychain are scanned when checking ownership.
    pub address_lookahead: u32,
}

impl Default for SpendConfig {
    fn default() -> Self {
        Self {
            min_fee_rate: DEFAULT_MIN_FEE_RATE,
            max_fee_rate: DEFAULT_MAX_FEE_RATE,
            dust_threshold_sat: DEFAULT_DUST_THRESHOLD_SAT,
            draft_ttl_secs: DEFAULT_DRAFT_TTL_SECS,
            payjoin_lock_ttl_secs: DEFAULT_PAYJOIN_LOCK_TTL_SECS,
            max_decoy_outputs: DEFAULT_MAX_DECOY_OUTPUTS,
            coin_selection: StrategyKind::default(),
            address_lookahead: DEFAULT_ADDRESS_LOOKAHEAD,
        }
    }
}

impl SpendConfig {
    /// Read `path` if given, apply environment overrides, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })?;
                toml::from_str(&text)?
            }
            None => SpendConfig::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `SPEND_*` environment variables.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = parse_var::<f64>(&lookup, "SPEND_MIN_FEE_RATE") {
            self.min_fee_rate = clamp_f64("SPEND_MIN_FEE_RATE", v, 0.0, FEE_RATE_CEILING);
        }
        if let Some(v) = parse_var::<f64>(&lookup, "SPEND_MAX_FEE_RATE") {
            self.max_fee_rate = clamp_f64("SPEND_MAX_FEE_RATE", v, 0.0, FEE_RATE_CEILING);
        }
        if let Some(v) = parse_var::<u64>(&lookup, "SPEND_DUST_THRESHOLD_SAT") {
            self.dust_threshold_sat = clamp("SPEND_DUST_THRESHOLD_SAT", v, 1, 100_000);
        }
        if let Some(v) = parse_var::<u64>(&lookup, "SPEND_DRAFT_TTL_SECS") {
            self.draft_ttl_secs = clamp("SPEND_DRAFT_TTL_SECS", v, 60, MAX_TTL_SECS);
        }
        if let Some(v) = parse_var::<u64>(&lookup, "SPEND_PAYJOIN_LOCK_TTL_SECS") {
            self.payjoin_lock_ttl_secs = clamp("SPEND_PAYJOIN_LOCK_TTL_SECS", v, 60, MAX_TTL_SECS);
        }
        if let Some(v) = parse_var::<usize>(&lookup, "SPEND_MAX_DECOY_OUTPUTS") {
            self.max_decoy_outputs = clamp("SPEND_MAX_DECOY_OUTPUTS", v, 0, MAX_DECOY_CEILING);
        }
        if let Some(v) = parse_var::<StrategyKind>(&lookup, "SPEND_COIN_SELECTION") {
            self.coin_selection = v;
        }
        if let Some(v) = parse_var::<u32>(&lookup, "SPEND_ADDRESS_LOOKAHEAD") {
            self.address_lookahead = clamp("SPEND_ADDRESS_LOOKAHEAD", v, 1, MAX_LOOKAHEAD);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.min_fee_rate.is_finite() || self.min_fee_rate < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "min_fee_rate must be a non-negative number, got {}",
                self.min_fee_rate
            )));
        }
        if !self.max_fee_rate.is_finite() || self.max_fee_rate > FEE_RATE_CEILING {
            return Err(ConfigError::Invalid(format!(
                "max_fee_rate must be at most {FEE_RATE_CEILING}, got {}",
                self.max_fee_rate
            )));
        }
        if self.min_fee_rate > self.max_fee_rate {
            return Err(ConfigError::Invalid(format!(
                "min_fee_rate ({}) exceeds max_fee_rate ({})",
                self.min_fee_rate, self.max_fee_rate
            )));
        }
        if self.draft_ttl_secs == 0 || self.payjoin_lock_ttl_secs == 0 {
            return Err(ConfigError::Invalid("lock TTLs must be non-zero".into()));
        }
        if self.dust_threshold_sat == 0 {
            return Err(ConfigError::Invalid("dust_threshold_sat must be non-zero".into()));
        }
        if self.address_lookahead == 0 {
            return Err(ConfigError::Invalid("address_lookahead must be non-zero".into()));
        }
        Ok(())
    }

    pub fn min_fee_rate(&self) -> FeeRate {
        FeeRate::from_sat_per_vb_f64(self.min_fee_rate).unwrap_or(FeeRate::ZERO)
    }

    pub fn max_fee_rate(&self) -> FeeRate {
        FeeRate::from_sat_per_vb_f64(self.max_fee_rate)
            .unwrap_or(FeeRate::from_sat_per_vb(FEE_RATE_CEILING as u64))
    }

    pub fn draft_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.draft_ttl_secs).unwrap_or(i64::MAX))
    }

    pub fn payjoin_lock_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.payjoin_lock_ttl_secs).unwrap_or(i64::MAX))
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}

fn clamp<T: PartialOrd + Copy + std::fmt::Display>(key: &str, value: T, min: T, max: T) -> T {
    if value < min {
        tracing::warn!(key, value = %value, min = %min, "override below minimum, using minimum");
        min
    } else if value > max {
        tracing::warn!(key, value = %value, max = %max, "override above maximum, using maximum");
        max
    } else {
        value
    }
}

fn clamp_f64(key: &str, value: f64, min: f64, max: f64) -> f64 {
    if value.is_nan() {
        tracing::warn!(key, "override is NaN, using minimum");
        return min;
    }
    clamp(key, value, min, max)
}
