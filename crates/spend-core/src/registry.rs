//! A wallet registry held in memory, for embedding and tests.

use std::collections::HashMap;

use bitcoin::{Script, ScriptBuf};
use chain_btc::descriptor::WalletDescriptor;
use chain_btc::utxo::Keychain;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::collaborators::{ReceivingAddress, RegistryError, WalletRegistry};
use crate::types::WalletInfo;

struct WalletEntry {
    info: WalletInfo,
    descriptor: WalletDescriptor,
    next_change: u32,
    /// Highest index cached per keychain, exclusive.
    scanned: [u32; 2],
    scripts: HashMap<ScriptBuf, (Keychain, u32)>,
}

impl WalletEntry {
    fn scan_to(&mut self, keychain: Keychain, end: u32) -> Result<(), RegistryError> {
        let slot = keychain_slot(keychain);
        for index in self.scanned[slot]..end {
            let script = self
                .descriptor
                .script_pubkey(keychain, index)
                .map_err(|e| RegistryError::Backend(e.to_string()))?;
            self.scripts.insert(script, (keychain, index));
        }
        self.scanned[slot] = self.scanned[slot].max(end);
        Ok(())
    }
}

fn keychain_slot(keychain: Keychain) -> usize {
    match keychain {
        Keychain::External => 0,
        Keychain::Internal => 1,
    }
}

#[derive(Default)]
struct RegistryState {
    wallets: HashMap<Uuid, WalletEntry>,
    addresses: HashMap<Uuid, ReceivingAddress>,
}

/// Wallets registered up front, with scripts cached `lookahead` indexes deep.
pub struct StaticWalletRegistry {
    lookahead: u32,
    state: RwLock<RegistryState>,
}

impl StaticWalletRegistry {
    pub fn new(lookahead: u32) -> Self {
        Self {
            lookahead: lookahead.max(1),
            state: RwLock::new(RegistryState::default()),
        }
    }

    /// Register a wallet. Its descriptors must parse.
    pub fn add_wallet(&self, info: WalletInfo) -> Result<(), RegistryError> {
        let descriptor = WalletDescriptor::parse(&info.descriptor, info.change_descriptor.as_deref())
            .map_err(|e| RegistryError::Backend(e.to_string()))?;
        let mut entry = WalletEntry {
            info,
            descriptor,
            next_change: 0,
            scanned: [0, 0],
            scripts: HashMap::new(),
        };
        entry.scan_to(Keychain::External, self.lookahead)?;
        entry.scan_to(Keychain::Internal, self.lookahead)?;
        self.state.write().wallets.insert(entry.info.id, entry);
        Ok(())
    }

    /// Hand out receive address `index` of a wallet under a fresh id.
    pub fn add_receiving_address(
        &self,
        wallet_id: Uuid,
        index: u32,
    ) -> Result<ReceivingAddress, RegistryError> {
        let mut state = self.state.write();
        let entry = state
            .wallets
            .get_mut(&wallet_id)
            .ok_or(RegistryError::WalletNotFound(wallet_id))?;
        let address = entry
            .descriptor
            .address(Keychain::External, index, entry.info.network)
            .map_err(|e| RegistryError::Backend(e.to_string()))?;
        entry.scan_to(Keychain::External, index.saturating_add(self.lookahead))?;

        let receiving = ReceivingAddress {
            id: Uuid::new_v4(),
            wallet_id,
            address: address.to_string(),
            derivation_index: index,
        };
        state.addresses.insert(receiving.id, receiving.clone());
        Ok(receiving)
    }
}

impl WalletRegistry for StaticWalletRegistry {
    fn wallet(&self, wallet_id: Uuid) -> Result<WalletInfo, RegistryError> {
        self.state
            .read()
            .wallets
            .get(&wallet_id)
            .map(|entry| entry.info.clone())
            .ok_or(RegistryError::WalletNotFound(wallet_id))
    }

    fn next_change_index(&self, wallet_id: Uuid) -> Result<u32, RegistryError> {
        let mut state = self.state.write();
        let entry = state
            .wallets
            .get_mut(&wallet_id)
            .ok_or(RegistryError::WalletNotFound(wallet_id))?;
        let index = entry.next_change;
        entry.next_change += 1;
        let horizon = entry.next_change.saturating_add(self.lookahead);
        entry.scan_to(Keychain::Internal, horizon)?;
        Ok(index)
    }

    fn derivation_of(
        &self,
        wallet_id: Uuid,
        script: &Script,
    ) -> Result<Option<(Keychain, u32)>, RegistryError> {
        let state = self.state.read();
        let entry = state
            .wallets
            .get(&wallet_id)
            .ok_or(RegistryError::WalletNotFound(wallet_id))?;
        Ok(entry.scripts.get(script).copied())
    }

    fn receiving_address(&self, address_id: Uuid) -> Result<ReceivingAddress, RegistryError> {
        self.state
            .read()
            .addresses
            .get(&address_id)
            .cloned()
            .ok_or(RegistryError::AddressNotFound(address_id))
    }
}
