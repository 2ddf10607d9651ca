use bip39::{Language, Mnemonic};
use bitcoin::bip32::{DerivationPath, Xpriv, Xpub};
use bitcoin::key::Secp256k1;
use bitcoin::Network;
use chrono::Utc;
use std::str::FromStr;

use crate::error::WalletError;
use crate::models::InternalWallet;

/// BIP48 multisig account path, script type 2 (native segwit).
pub fn default_account_path(network: Network) -> &'static str {
    match network {
        Network::Bitcoin => "m/48'/0'/0'/2'",
        _ => "m/48'/1'/0'/2'",
    }
}

// derives internal wallet keys from BIP39 mnemonics
pub struct KeyManager {
    network: Network,
}

impl KeyManager {
    pub fn new(network: Network) -> Self {
        Self { network }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    // generate a new internal wallet with a random 24 word mnemonic
    pub fn generate_internal_wallet(&self) -> Result<InternalWallet, WalletError> {
        let mut rng = bip39::rand::thread_rng();
        let mnemonic = Mnemonic::generate_in_with(&mut rng, Language::English, 24)
            .map_err(|e| WalletError::Mnemonic(e.to_string()))?;

        let wallet = self.import_internal_wallet(&mnemonic.to_string(), default_account_path(self.network))?;

        tracing::info!("Generated new internal wallet {}", wallet.master_fingerprint);
        Ok(wallet)
    }

    pub fn import_internal_wallet(&self, phrase: &str, derivation_path: &str) -> Result<InternalWallet, WalletError> {
        let secp = Secp256k1::new();
        let master = self.master_key(phrase)?;

        let path = DerivationPath::from_str(derivation_path)
            .map_err(|e| WalletError::InvalidKey(format!("Invalid derivation path: {}", e)))?;
        let account = master
            .derive_priv(&secp, &path)
            .map_err(|e| WalletError::InvalidKey(format!("Failed to derive account key: {}", e)))?;

        Ok(InternalWallet {
            id: 0,
            mnemonic: Some(phrase.to_string()),
            xpub: Xpub::from_priv(&secp, &account).to_string(),
            derivation_path: derivation_path.to_string(),
            master_fingerprint: master.fingerprint(&secp).to_string(),
            created_at: Utc::now(),
        })
    }

    /// Master private key of an internal wallet.
    ///
    /// Callers must not keep the key beyond a single signing operation.
    pub fn master_xpriv(&self, wallet: &InternalWallet) -> Result<Xpriv, WalletError> {
        let phrase = wallet.mnemonic.as_deref().ok_or_else(|| {
            WalletError::InvalidKey(format!("Internal wallet {} is watch-only", wallet.id))
        })?;

        let master = self.master_key(phrase)?;

        let secp = Secp256k1::new();
        if master.fingerprint(&secp).to_string() != wallet.master_fingerprint {
            return Err(WalletError::InvalidKey(format!(
                "Internal wallet {} mnemonic does not match fingerprint {}",
                wallet.id, wallet.master_fingerprint
            )));
        }

        Ok(master)
    }

    fn master_key(&self, phrase: &str) -> Result<Xpriv, WalletError> {
        let mnemonic = Mnemonic::parse_in(Language::English, phrase)
            .map_err(|e| WalletError::Mnemonic(e.to_string()))?;

        // empty passphrase
        let seed = mnemonic.to_seed("");

        Xpriv::new_master(self.network, &seed)
            .map_err(|e| WalletError::InvalidKey(format!("Failed to derive master key: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PHRASE: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    #[test]
    fn test_import_is_deterministic() {
        let key_manager = KeyManager::new(Network::Regtest);

        let first = key_manager.import_internal_wallet(PHRASE, "m/48'/1'/0'/2'").unwrap();
        let second = key_manager.import_internal_wallet(PHRASE, "m/48'/1'/0'/2'").unwrap();

        assert_eq!(first.xpub, second.xpub);
        assert_eq!(first.master_fingerprint, "73c5da0a");
        assert!(first.xpub.starts_with("tpub"));
    }

    #[test]
    fn test_generate_new_internal_wallet() {
        let key_manager = KeyManager::new(Network::Regtest);

        let wallet = key_manager.generate_internal_wallet().unwrap();
        let phrase = wallet.mnemonic.clone().unwrap();
        assert_eq!(phrase.split_whitespace().count(), 24);

        // the derived master key matches the stored fingerprint
        let master = key_manager.master_xpriv(&wallet).unwrap();
        assert_eq!(master.fingerprint(&Secp256k1::new()).to_string(), wallet.master_fingerprint);
    }

    #[test]
    fn test_watch_only_wallet_cannot_produce_keys() {
        let key_manager = KeyManager::new(Network::Regtest);

        let mut wallet = key_manager.import_internal_wallet(PHRASE, "m/48'/1'/0'/2'").unwrap();
        wallet.mnemonic = None;
        assert!(key_manager.master_xpriv(&wallet).is_err());
    }

    #[test]
    fn test_mismatched_fingerprint_is_rejected() {
        let key_manager = KeyManager::new(Network::Regtest);

        let mut wallet = key_manager.import_internal_wallet(PHRASE, "m/48'/1'/0'/2'").unwrap();
        wallet.master_fingerprint = "00000000".to_string();
        assert!(key_manager.master_xpriv(&wallet).is_err());
    }
}
