//! Transaction construction and multi-party signing for a self-custody
//! Bitcoin wallet backend.
//!
//! [`SpendService`] ties the pieces together: coin selection over the
//! ledger, PSBT construction, draft signature collection for multisig
//! wallets, broadcast with ledger reconciliation, and a BIP78 payjoin
//! receiver. Storage, wallet metadata, the Bitcoin network and time are
//! injected through the traits in [`ledger`] and [`collaborators`].

pub mod api;
pub mod broadcast;
pub mod builder;
pub mod collaborators;
pub mod config;
pub mod draft;
pub mod error;
pub mod ledger;
pub mod payjoin;
pub mod registry;
pub mod selector;
pub mod types;

use std::sync::Arc;

use chain_btc::descriptor::WalletDescriptor;
use chain_btc::utxo::CoinSelectionStrategy;

use collaborators::{ChainClient, Clock, ProposalSigner, SystemClock, WalletRegistry};
use config::SpendConfig;
use error::{Result, SpendError};
use ledger::Ledger;
use types::WalletInfo;

pub use api::*;
pub use error::ErrorKind;

/// Entry point for every spend operation.
///
/// Cheap to share: wrap it in an `Arc` and call it from any thread.
pub struct SpendService {
    ledger: Arc<dyn Ledger>,
    registry: Arc<dyn WalletRegistry>,
    chain: Arc<dyn ChainClient>,
    clock: Arc<dyn Clock>,
    signer: Option<Arc<dyn ProposalSigner>>,
    strategy: Box<dyn CoinSelectionStrategy>,
    config: SpendConfig,
}

/// A wallet with its descriptors parsed and thresholds resolved.
pub(crate) struct WalletContext {
    pub info: WalletInfo,
    pub descriptor: WalletDescriptor,
    pub dust_threshold_sat: u64,
}

impl SpendService {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        registry: Arc<dyn WalletRegistry>,
        chain: Arc<dyn ChainClient>,
        config: SpendConfig,
    ) -> Self {
        Self {
            ledger,
            registry,
            chain,
            clock: Arc::new(SystemClock),
            signer: None,
            strategy: config.coin_selection.build(),
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sign the receiver input of payjoin proposals with `signer`.
    pub fn with_proposal_signer(mut self, signer: Arc<dyn ProposalSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn with_strategy(mut self, strategy: Box<dyn CoinSelectionStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn config(&self) -> &SpendConfig {
        &self.config
    }

    pub(crate) fn wallet_context(&self, wallet_id: uuid::Uuid) -> Result<WalletContext> {
        let info = self.registry.wallet(wallet_id)?;
        let descriptor = WalletDescriptor::parse(&info.descriptor, info.change_descriptor.as_deref())
            .map_err(|e| SpendError::Registry(format!("wallet {wallet_id}: {e}")))?;
        let dust_threshold_sat = info.dust_threshold_sat.unwrap_or(self.config.dust_threshold_sat);
        Ok(WalletContext {
            info,
            descriptor,
            dust_threshold_sat,
        })
    }
}
