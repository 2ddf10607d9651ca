use std::str::FromStr;

use bitcoin::bip32::{DerivationPath, Fingerprint, Xpub};
use bitcoin::{Network, ScriptBuf};
use chrono::{DateTime, Utc};
use miniscript::descriptor::{DefiniteDescriptorKey, DescriptorPublicKey};
use miniscript::Descriptor;
use serde::{Deserialize, Serialize};

use crate::error::WalletError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WalletAddressType {
    #[default]
    NativeSegwit,
    NestedSegwit,
    Legacy,
    Taproot,
}

/// Branch of the wallet's derivation tree: `/0/*` for receiving, `/1/*` for change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Keychain {
    External,
    Internal,
}

impl Keychain {
    pub fn index(&self) -> u32 {
        match self {
            Keychain::External => 0,
            Keychain::Internal => 1,
        }
    }
}

/// An extended public key participating in a wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    pub id: i64,
    pub name: String,
    pub xpub: String,
    /// Derivation path from the master key to `xpub`, e.g. `m/48'/1'/0'/2'`.
    pub path: String,
    pub master_fingerprint: String,
    pub user_id: Option<String>,
    pub internal_wallet_id: Option<i64>,
    pub is_bip39_imported: bool,
}

impl Key {
    pub fn parsed_xpub(&self) -> Result<Xpub, WalletError> {
        Xpub::from_str(&self.xpub)
            .map_err(|e| WalletError::InvalidKey(format!("{}: {}", self.name, e)))
    }

    pub fn origin(&self) -> Result<(Fingerprint, DerivationPath), WalletError> {
        let fingerprint = Fingerprint::from_str(&self.master_fingerprint)
            .map_err(|e| WalletError::InvalidKey(format!("{} fingerprint: {}", self.name, e)))?;
        let path = DerivationPath::from_str(&self.path)
            .map_err(|e| WalletError::InvalidKey(format!("{} path: {}", self.name, e)))?;
        Ok((fingerprint, path))
    }

    /// Descriptor key expression `[fingerprint/origin]xpub/<keychain>/*`.
    fn descriptor_key(&self, keychain: Keychain) -> Result<String, WalletError> {
        let (fingerprint, path) = self.origin()?;
        // validate before embedding in the descriptor string
        self.parsed_xpub()?;

        let mut origin = fingerprint.to_string();
        for child in path.as_ref() {
            origin.push('/');
            origin.push_str(&child.to_string());
        }

        Ok(format!("[{}]{}/{}/*", origin, self.xpub, keychain.index()))
    }
}

/// The system's own HD wallet, co-signing for wallets that include one of its keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalWallet {
    pub id: i64,
    /// Absent for xpub-only internal wallets, which cannot sign.
    pub mnemonic: Option<String>,
    pub xpub: String,
    pub derivation_path: String,
    pub master_fingerprint: String,
    pub created_at: DateTime<Utc>,
}

impl InternalWallet {
    pub fn as_key(&self, name: &str) -> Key {
        Key {
            id: 0,
            name: name.to_string(),
            xpub: self.xpub.clone(),
            path: self.derivation_path.clone(),
            master_fingerprint: self.master_fingerprint.clone(),
            user_id: None,
            internal_wallet_id: Some(self.id),
            is_bip39_imported: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub id: i64,
    pub name: String,
    pub mofn: u32,
    pub keys: Vec<Key>,
    pub internal_wallet_id: Option<i64>,
    pub is_hot_wallet: bool,
    pub address_type: WalletAddressType,
    pub is_unsorted_multisig: bool,
    pub is_bip39_imported: bool,
    pub is_finalised: bool,
    pub is_archived: bool,
    pub is_compromised: bool,
    pub created_at: DateTime<Utc>,
}

impl Wallet {
    pub fn is_multisig(&self) -> bool {
        self.keys.len() > 1
    }

    pub fn validate(&self) -> Result<(), WalletError> {
        if self.mofn == 0 || self.keys.len() < self.mofn as usize {
            return Err(WalletError::NotEnoughKeys {
                id: self.id,
                keys: self.keys.len(),
                mofn: self.mofn,
            });
        }
        if self.address_type == WalletAddressType::Taproot {
            return Err(WalletError::TaprootUnsupported);
        }
        Ok(())
    }

    /// Whether one of the wallet's keys belongs to the internal wallet.
    pub fn has_internal_key(&self) -> bool {
        self.keys.iter().any(|k| k.internal_wallet_id.is_some())
    }

    pub fn descriptor(&self, keychain: Keychain) -> Result<Descriptor<DescriptorPublicKey>, WalletError> {
        self.validate()?;

        let keys = self
            .keys
            .iter()
            .map(|k| k.descriptor_key(keychain))
            .collect::<Result<Vec<_>, _>>()?;

        let descriptor = if self.is_multisig() {
            let multi = if self.is_unsorted_multisig { "multi" } else { "sortedmulti" };
            let script = format!("{}({},{})", multi, self.mofn, keys.join(","));
            match self.address_type {
                WalletAddressType::NativeSegwit => format!("wsh({})", script),
                WalletAddressType::NestedSegwit => format!("sh(wsh({}))", script),
                WalletAddressType::Legacy => format!("sh({})", script),
                WalletAddressType::Taproot => return Err(WalletError::TaprootUnsupported),
            }
        } else {
            let key = &keys[0];
            match self.address_type {
                WalletAddressType::NativeSegwit => format!("wpkh({})", key),
                WalletAddressType::NestedSegwit => format!("sh(wpkh({}))", key),
                WalletAddressType::Legacy => format!("pkh({})", key),
                WalletAddressType::Taproot => return Err(WalletError::TaprootUnsupported),
            }
        };

        Ok(Descriptor::<DescriptorPublicKey>::from_str(&descriptor)?)
    }

    pub fn wallet_descriptor(&self) -> Result<WalletDescriptor, WalletError> {
        Ok(WalletDescriptor {
            wallet_id: self.id,
            external: self.descriptor(Keychain::External)?,
            internal: self.descriptor(Keychain::Internal)?,
        })
    }
}

/// Receive and change descriptors of a wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletDescriptor {
    pub wallet_id: i64,
    pub external: Descriptor<DescriptorPublicKey>,
    pub internal: Descriptor<DescriptorPublicKey>,
}

impl WalletDescriptor {
    pub fn for_keychain(&self, keychain: Keychain) -> &Descriptor<DescriptorPublicKey> {
        match keychain {
            Keychain::External => &self.external,
            Keychain::Internal => &self.internal,
        }
    }

    pub fn at(&self, keychain: Keychain, index: u32) -> Result<Descriptor<DefiniteDescriptorKey>, WalletError> {
        self.for_keychain(keychain)
            .at_derivation_index(index)
            .map_err(|e| WalletError::Derivation {
                index,
                reason: e.to_string(),
            })
    }

    pub fn script_pubkey_at(&self, keychain: Keychain, index: u32) -> Result<ScriptBuf, WalletError> {
        Ok(self.at(keychain, index)?.script_pubkey())
    }

    pub fn address_at(&self, keychain: Keychain, index: u32, network: Network) -> Result<bitcoin::Address, WalletError> {
        Ok(self.at(keychain, index)?.address(network)?)
    }
}
