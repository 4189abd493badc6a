//! Shared fixture for the spend-core integration tests: deterministic keys,
//! an in-memory ledger and registry, a scripted chain client and a clock
//! the tests move by hand.

#![allow(dead_code)]

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use bitcoin::absolute::LockTime;
use bitcoin::bip32::{DerivationPath, Xpriv, Xpub};
use bitcoin::hashes::Hash;
use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::Secp256k1;
use bitcoin::{Network, OutPoint, Transaction, Txid};
use chain_btc::address::parse_address;
use chain_btc::descriptor::WalletDescriptor;
use chain_btc::fee::FeeRate;
use chain_btc::network::BtcNetwork;
use chain_btc::psbt::{decode_psbt, encode_psbt};
use chain_btc::transaction::{build_psbt, PsbtInput, PsbtOutput};
use chain_btc::utxo::{Keychain, Utxo};
use chrono::{DateTime, Duration, TimeZone, Utc};
use miniscript::psbt::PsbtExt;
use parking_lot::Mutex;
use spend_core::collaborators::{ChainClient, ChainError, Clock, ProposalSigner, SignerError};
use spend_core::config::SpendConfig;
use spend_core::ledger::{InMemoryLedger, UtxoStore};
use spend_core::registry::StaticWalletRegistry;
use spend_core::types::{UtxoRecord, WalletInfo};
use spend_core::{BroadcastRequest, CreateSpendRequest, SpendService};
use uuid::Uuid;

pub const TEST_MNEMONIC: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

/// A testnet P2WPKH address no test wallet owns.
pub const RECIPIENT: &str = "tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx";

// ─── Keys ──────────────────────────────────────────────────────────

/// Master key for the test mnemonic; the passphrase picks a distinct key.
pub fn master(passphrase: &str) -> Xpriv {
    let seed = bip39::Mnemonic::parse(TEST_MNEMONIC)
        .unwrap()
        .to_seed(passphrase);
    Xpriv::new_master(Network::Testnet, &seed).unwrap()
}

/// `[fingerprint/origin]tpub.../<0;1>/*` for the account at `origin`.
pub fn account_key(master: &Xpriv, origin: &str) -> String {
    let secp = Secp256k1::new();
    let path = DerivationPath::from_str(&format!("m/{origin}")).unwrap();
    let xpub = Xpub::from_priv(&secp, &master.derive_priv(&secp, &path).unwrap());
    format!("[{}/{origin}]{xpub}/<0;1>/*", master.fingerprint(&secp))
}

pub fn fingerprint(master: &Xpriv) -> String {
    master.fingerprint(&Secp256k1::new()).to_string()
}

/// Sign every input `master` has a key for.
pub fn sign_psbt(psbt: &mut Psbt, master: &Xpriv) {
    psbt.sign(master, &Secp256k1::new()).unwrap();
}

/// Sign a base64 PSBT the way a hardware device would return it.
pub fn sign(psbt_base64: &str, master: &Xpriv) -> String {
    let mut psbt = decode_psbt(psbt_base64).unwrap();
    sign_psbt(&mut psbt, master);
    encode_psbt(&psbt)
}

pub fn random_txid() -> Txid {
    let mut bytes = [0u8; 32];
    bytes[..16].copy_from_slice(Uuid::new_v4().as_bytes());
    bytes[16..].copy_from_slice(Uuid::new_v4().as_bytes());
    Txid::from_byte_array(bytes)
}

// ─── Collaborators ─────────────────────────────────────────────────

pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Chain backend that accepts everything unless told to reject.
pub struct MockChain {
    height: u32,
    fee_estimate: Mutex<FeeRate>,
    reject: Mutex<Option<String>>,
    broadcasts: Mutex<Vec<Transaction>>,
    transactions: Mutex<HashMap<Txid, Transaction>>,
}

impl MockChain {
    pub fn new() -> Self {
        Self {
            height: 800_000,
            fee_estimate: Mutex::new(FeeRate::from_sat_per_vb(4)),
            reject: Mutex::new(None),
            broadcasts: Mutex::new(Vec::new()),
            transactions: Mutex::new(HashMap::new()),
        }
    }

    pub fn reject_with(&self, reason: &str) {
        *self.reject.lock() = Some(reason.to_string());
    }

    pub fn accept(&self) {
        *self.reject.lock() = None;
    }

    pub fn set_fee_estimate(&self, rate: FeeRate) {
        *self.fee_estimate.lock() = rate;
    }

    pub fn broadcasts(&self) -> Vec<Transaction> {
        self.broadcasts.lock().clone()
    }
}

impl ChainClient for MockChain {
    fn block_height(&self) -> Result<u32, ChainError> {
        Ok(self.height)
    }

    fn fee_estimate(&self, _target_blocks: u16) -> Result<FeeRate, ChainError> {
        Ok(*self.fee_estimate.lock())
    }

    fn broadcast(&self, tx: &Transaction) -> Result<Txid, ChainError> {
        if let Some(reason) = self.reject.lock().clone() {
            return Err(ChainError::Rejected(reason));
        }
        let txid = tx.compute_txid();
        self.broadcasts.lock().push(tx.clone());
        self.transactions.lock().insert(txid, tx.clone());
        Ok(txid)
    }

    fn raw_transaction(&self, txid: &Txid) -> Result<Option<Transaction>, ChainError> {
        Ok(self.transactions.lock().get(txid).cloned())
    }
}

/// Hot-wallet signer for payjoin proposals.
#[derive(Default)]
pub struct TestSigner {
    keys: Mutex<HashMap<Uuid, Xpriv>>,
}

impl TestSigner {
    pub fn add(&self, wallet_id: Uuid, master: Xpriv) {
        self.keys.lock().insert(wallet_id, master);
    }
}

impl ProposalSigner for TestSigner {
    fn sign_input(&self, wallet_id: Uuid, psbt: &mut Psbt, input_index: usize) -> Result<(), SignerError> {
        let master = self
            .keys
            .lock()
            .get(&wallet_id)
            .copied()
            .ok_or_else(|| SignerError(format!("no key for wallet {wallet_id}")))?;
        let secp = Secp256k1::new();
        psbt.sign(&master, &secp)
            .map_err(|(_, errors)| SignerError(format!("{errors:?}")))?;
        psbt.finalize_inp_mut(&secp, input_index)
            .map_err(|e| SignerError(e.to_string()))
    }
}

// ─── Fixture ───────────────────────────────────────────────────────

pub struct TestWallet {
    pub id: Uuid,
    pub masters: Vec<Xpriv>,
    pub descriptor: WalletDescriptor,
}

impl TestWallet {
    pub fn address(&self, keychain: Keychain, index: u32) -> String {
        self.descriptor
            .address(keychain, index, BtcNetwork::Testnet)
            .unwrap()
            .to_string()
    }
}

pub struct Fixture {
    pub ledger: Arc<InMemoryLedger>,
    pub registry: Arc<StaticWalletRegistry>,
    pub chain: Arc<MockChain>,
    pub clock: Arc<ManualClock>,
    pub service: Arc<SpendService>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::build(None)
    }

    pub fn with_signer(signer: Arc<TestSigner>) -> Self {
        Self::build(Some(signer))
    }

    fn build(signer: Option<Arc<TestSigner>>) -> Self {
        let config = SpendConfig::default();
        let ledger = Arc::new(InMemoryLedger::new());
        let registry = Arc::new(StaticWalletRegistry::new(config.address_lookahead));
        let chain = Arc::new(MockChain::new());
        let clock = Arc::new(ManualClock::new());

        let mut service = SpendService::new(ledger.clone(), registry.clone(), chain.clone(), config)
            .with_clock(clock.clone());
        if let Some(signer) = signer {
            service = service.with_proposal_signer(signer);
        }

        Self {
            ledger,
            registry,
            chain,
            clock,
            service: Arc::new(service),
        }
    }

    /// A BIP84 single-key wallet.
    pub fn single_sig_wallet(&self, passphrase: &str) -> TestWallet {
        let master = master(passphrase);
        let descriptor = format!("wpkh({})", account_key(&master, "84'/1'/0'"));
        self.register(descriptor, vec![master])
    }

    /// A 2-of-3 P2WSH wallet with one key per device.
    pub fn multisig_wallet(&self) -> TestWallet {
        let masters: Vec<Xpriv> = ["alice", "bob", "carol"].iter().map(|p| master(p)).collect();
        let keys: Vec<String> = masters
            .iter()
            .map(|m| account_key(m, "48'/1'/0'/2'"))
            .collect();
        let descriptor = format!("wsh(sortedmulti(2,{}))", keys.join(","));
        self.register(descriptor, masters)
    }

    fn register(&self, descriptor: String, masters: Vec<Xpriv>) -> TestWallet {
        let info = WalletInfo {
            id: Uuid::new_v4(),
            network: BtcNetwork::Testnet,
            descriptor: descriptor.clone(),
            change_descriptor: None,
            confirmation_threshold: 1,
            dust_threshold_sat: None,
        };
        self.registry.add_wallet(info.clone()).unwrap();
        TestWallet {
            id: info.id,
            masters,
            descriptor: WalletDescriptor::parse(&descriptor, None).unwrap(),
        }
    }

    /// Give `wallet` a coin at receive index `index`.
    pub fn fund(&self, wallet: &TestWallet, index: u32, amount_sat: u64, confirmations: u32) -> OutPoint {
        let outpoint = OutPoint::new(random_txid(), 0);
        let script_pubkey = wallet
            .descriptor
            .script_pubkey(Keychain::External, index)
            .unwrap();
        self.ledger.insert_utxo(UtxoRecord::new(
            wallet.id,
            Utxo {
                outpoint,
                amount_sat,
                script_pubkey,
                keychain: Keychain::External,
                derivation_index: index,
            },
            confirmations,
        ));
        outpoint
    }

    pub fn utxo(&self, outpoint: OutPoint) -> UtxoRecord {
        self.ledger.get_utxos(&[outpoint]).unwrap().remove(0)
    }
}

// ─── Requests ──────────────────────────────────────────────────────

pub fn spend_request(recipient: &str, amount: u64, sat_per_vb: u64) -> CreateSpendRequest {
    CreateSpendRequest {
        recipient: Some(recipient.to_string()),
        outputs: None,
        amount: Some(amount),
        fee_rate: FeeRate::from_sat_per_vb(sat_per_vb),
        selected_utxo_ids: None,
        enable_rbf: true,
        subtract_fees: false,
        send_max: false,
        decoy_outputs: None,
        change_address: None,
    }
}

pub fn broadcast_request(recipient: &str, amount: u64, fee: u64) -> BroadcastRequest {
    BroadcastRequest {
        signed_psbt_base64: None,
        raw_tx_hex: None,
        recipient: recipient.to_string(),
        amount,
        fee,
        draft_id: None,
        replaces_txid: None,
        memo: None,
    }
}

/// A finalized PSBT from an outside sender paying `amount` to `pay_to`.
pub fn sender_psbt(sender: &TestWallet, pay_to: &str, amount: u64, coin_value: u64, fee: u64) -> Psbt {
    let utxo = Utxo {
        outpoint: OutPoint::new(random_txid(), 1),
        amount_sat: coin_value,
        script_pubkey: sender.descriptor.script_pubkey(Keychain::External, 0).unwrap(),
        keychain: Keychain::External,
        derivation_index: 0,
    };
    let outputs = [
        PsbtOutput {
            script_pubkey: parse_address(pay_to, BtcNetwork::Testnet)
                .unwrap()
                .script_pubkey(),
            value_sat: amount,
            derivation: None,
        },
        PsbtOutput {
            script_pubkey: sender.descriptor.script_pubkey(Keychain::Internal, 0).unwrap(),
            value_sat: coin_value - amount - fee,
            derivation: Some((Keychain::Internal, 0)),
        },
    ];
    let mut psbt = build_psbt(
        &sender.descriptor,
        &[PsbtInput { utxo, prev_tx: None }],
        &outputs,
        true,
        LockTime::ZERO,
    )
    .unwrap();
    let secp = Secp256k1::new();
    sign_psbt(&mut psbt, &sender.masters[0]);
    psbt.finalize_mut(&secp).unwrap();
    psbt
}
