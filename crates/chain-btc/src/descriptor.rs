//! Output descriptors for the wallets this subsystem spends from.
//!
//! A wallet is described by a receive descriptor and a change descriptor,
//! or by a single multipath descriptor (`.../<0;1>/*`) carrying both.

use std::str::FromStr;

use bitcoin::bip32::{DerivationPath, KeySource, Xpub};
use bitcoin::psbt::Psbt;
use bitcoin::{Address, ScriptBuf};
use miniscript::descriptor::{
    DefiniteDescriptorKey, Descriptor, DescriptorPublicKey, ShInner, WshInner,
};
use miniscript::psbt::PsbtExt;
use miniscript::ForEachKey;

use crate::error::BtcError;
use crate::fee::{ScriptType, WalletScript};
use crate::network::BtcNetwork;
use crate::utxo::Keychain;

#[derive(Debug, Clone)]
pub struct WalletDescriptor {
    external: Descriptor<DescriptorPublicKey>,
    internal: Descriptor<DescriptorPublicKey>,
    script: WalletScript,
}

impl WalletDescriptor {
    /// Parse a wallet's descriptors.
    ///
    /// If `descriptor` is multipath it must expand to exactly two
    /// descriptors (receive, change) and `change_descriptor` must be absent.
    /// Without a change descriptor, change is sent to the receive branch.
    pub fn parse(descriptor: &str, change_descriptor: Option<&str>) -> Result<Self, BtcError> {
        let parsed = parse_one(descriptor)?;

        let (external, internal) = if parsed.is_multipath() {
            if change_descriptor.is_some() {
                return Err(BtcError::InvalidDescriptor(
                    "multipath descriptor cannot be combined with a change descriptor".into(),
                ));
            }
            let mut singles = parsed
                .into_single_descriptors()
                .map_err(|e| BtcError::InvalidDescriptor(e.to_string()))?;
            if singles.len() != 2 {
                return Err(BtcError::InvalidDescriptor(format!(
                    "multipath descriptor must have 2 branches, found {}",
                    singles.len()
                )));
            }
            let internal = singles.remove(1);
            let external = singles.remove(0);
            (external, internal)
        } else {
            let internal = match change_descriptor {
                Some(change) => parse_one(change)?,
                None => parsed.clone(),
            };
            (parsed, internal)
        };

        let script = classify(&external)?;
        if classify(&internal)? != script {
            return Err(BtcError::InvalidDescriptor(
                "receive and change descriptors use different scripts".into(),
            ));
        }

        Ok(Self {
            external,
            internal,
            script,
        })
    }

    pub fn wallet_script(&self) -> WalletScript {
        self.script
    }

    pub fn required_signatures(&self) -> usize {
        self.script.required_signatures()
    }

    /// Extended keys of the receive descriptor with their origins.
    ///
    /// Multisig signers use these to recognise their cosigners.
    pub fn account_xpubs(&self) -> Vec<(Xpub, KeySource)> {
        let mut xpubs = Vec::new();
        self.external.for_each_key(|key| {
            if let DescriptorPublicKey::XPub(x) = key {
                let origin = x
                    .origin
                    .clone()
                    .unwrap_or_else(|| (x.xkey.fingerprint(), DerivationPath::master()));
                xpubs.push((x.xkey, origin));
            }
            true
        });
        xpubs
    }

    /// Concrete descriptor for one child index on one keychain.
    pub fn at(
        &self,
        keychain: Keychain,
        index: u32,
    ) -> Result<Descriptor<DefiniteDescriptorKey>, BtcError> {
        let branch = match keychain {
            Keychain::External => &self.external,
            Keychain::Internal => &self.internal,
        };
        branch
            .at_derivation_index(index)
            .map_err(|e| BtcError::InvalidDescriptor(format!("cannot derive index {index}: {e}")))
    }

    pub fn address(
        &self,
        keychain: Keychain,
        index: u32,
        network: BtcNetwork,
    ) -> Result<Address, BtcError> {
        self.at(keychain, index)?
            .address(network.to_bitcoin_network())
            .map_err(|e| BtcError::InvalidDescriptor(format!("no address form: {e}")))
    }

    pub fn script_pubkey(&self, keychain: Keychain, index: u32) -> Result<ScriptBuf, BtcError> {
        Ok(self.at(keychain, index)?.script_pubkey())
    }

    /// Attach key origins and scripts for input `input_index`.
    ///
    /// The input's `witness_utxo` (segwit) or `non_witness_utxo` (legacy)
    /// must already be set; its script must match the derived one.
    pub fn update_psbt_input(
        &self,
        psbt: &mut Psbt,
        input_index: usize,
        keychain: Keychain,
        index: u32,
    ) -> Result<(), BtcError> {
        let definite = self.at(keychain, index)?;
        psbt.update_input_with_descriptor(input_index, &definite)
            .map_err(|e| {
                BtcError::TransactionBuildError(format!(
                    "input {input_index} does not match wallet descriptor: {e}"
                ))
            })
    }

    /// Attach key origins for an output paying back into this wallet.
    pub fn update_psbt_output(
        &self,
        psbt: &mut Psbt,
        output_index: usize,
        keychain: Keychain,
        index: u32,
    ) -> Result<(), BtcError> {
        let definite = self.at(keychain, index)?;
        psbt.update_output_with_descriptor(output_index, &definite)
            .map_err(|e| {
                BtcError::TransactionBuildError(format!(
                    "output {output_index} does not match wallet descriptor: {e}"
                ))
            })
    }
}

fn parse_one(descriptor: &str) -> Result<Descriptor<DescriptorPublicKey>, BtcError> {
    Descriptor::<DescriptorPublicKey>::from_str(descriptor.trim())
        .map_err(|e| BtcError::InvalidDescriptor(e.to_string()))
}

fn classify(desc: &Descriptor<DescriptorPublicKey>) -> Result<WalletScript, BtcError> {
    let single = |script_type| Ok(WalletScript::SingleSig { script_type });
    let multi = |script_type, required: usize, total: usize| {
        Ok(WalletScript::Multisig {
            script_type,
            required,
            total,
        })
    };

    match desc {
        Descriptor::Pkh(_) => single(ScriptType::Legacy),
        Descriptor::Wpkh(_) => single(ScriptType::NativeSegwit),
        Descriptor::Tr(_) => single(ScriptType::Taproot),
        Descriptor::Wsh(wsh) => match wsh.as_inner() {
            WshInner::SortedMulti(smv) => multi(ScriptType::NativeSegwit, smv.k(), smv.n()),
            WshInner::Ms(_) => Err(unsupported(desc)),
        },
        Descriptor::Sh(sh) => match sh.as_inner() {
            ShInner::Wpkh(_) => single(ScriptType::NestedSegwit),
            ShInner::SortedMulti(smv) => multi(ScriptType::Legacy, smv.k(), smv.n()),
            ShInner::Wsh(wsh) => match wsh.as_inner() {
                WshInner::SortedMulti(smv) => multi(ScriptType::NestedSegwit, smv.k(), smv.n()),
                WshInner::Ms(_) => Err(unsupported(desc)),
            },
            ShInner::Ms(_) => Err(unsupported(desc)),
        },
        Descriptor::Bare(_) => Err(unsupported(desc)),
    }
}

fn unsupported(desc: &Descriptor<DescriptorPublicKey>) -> BtcError {
    BtcError::InvalidDescriptor(format!(
        "only pkh, sh(wpkh), wpkh, tr and sortedmulti wallets are supported: {desc}"
    ))
}


#[cfg(test)]
mod tests {
    use super::test_keys::*;
    use super::*;

    #[test]
    fn multipath_wpkh_splits_into_two_keychains() {
        let desc = WalletDescriptor::parse(&wpkh(7), None).unwrap();
        assert_eq!(
            desc.wallet_script(),
            WalletScript::SingleSig {
                script_type: ScriptType::NativeSegwit
            }
        );
        let receive = desc.address(Keychain::External, 0, BtcNetwork::Testnet).unwrap();
        let change = desc.address(Keychain::Internal, 0, BtcNetwork::Testnet).unwrap();
        assert_ne!(receive, change);
        assert!(receive.to_string().starts_with("tb1q"));
    }

    #[test]
    fn sorted_multisig_reports_threshold() {
        let desc = WalletDescriptor::parse(&wsh_2_of_3(), None).unwrap();
        assert_eq!(desc.required_signatures(), 2);
        assert_eq!(
            desc.wallet_script(),
            WalletScript::Multisig {
                script_type: ScriptType::NativeSegwit,
                required: 2,
                total: 3
            }
        );
        let spk = desc.script_pubkey(Keychain::External, 4).unwrap();
        assert!(spk.is_p2wsh());
        assert_eq!(desc.account_xpubs().len(), 3);
    }

    #[test]
    fn nested_and_legacy_wrappers_are_classified() {
        let xpub = origin_xpub(3, "m/49'/1'/0'");
        let nested = WalletDescriptor::parse(&format!("sh(wpkh({xpub}/0/*))"), None).unwrap();
        assert_eq!(nested.wallet_script().script_type(), ScriptType::NestedSegwit);

        let xpub = origin_xpub(3, "m/44'/1'/0'");
        let legacy = WalletDescriptor::parse(&format!("pkh({xpub}/0/*)"), None).unwrap();
        assert_eq!(legacy.wallet_script().script_type(), ScriptType::Legacy);
    }

    #[test]
    fn separate_change_descriptor_is_used() {
        let xpub = origin_xpub(5, "m/84'/1'/0'");
        let desc = WalletDescriptor::parse(
            &format!("wpkh({xpub}/0/*)"),
            Some(&format!("wpkh({xpub}/1/*)")),
        )
        .unwrap();
        let receive = desc.script_pubkey(Keychain::External, 0).unwrap();
        let change = desc.script_pubkey(Keychain::Internal, 0).unwrap();
        assert_ne!(receive, change);
    }

    #[test]
    fn mismatched_change_script_is_rejected() {
        let xpub = origin_xpub(5, "m/84'/1'/0'");
        let err = WalletDescriptor::parse(
            &format!("wpkh({xpub}/0/*)"),
            Some(&format!("pkh({xpub}/1/*)")),
        )
        .unwrap_err();
        assert!(matches!(err, BtcError::InvalidDescriptor(_)));
    }

    #[test]
    fn garbage_descriptor_is_rejected() {
        assert!(WalletDescriptor::parse("wpkh(nonsense)", None).is_err());
    }
}
