use bitcoin::{Amount, OutPoint, TxOut};
use serde::{Deserialize, Serialize};

use super::wallet::Keychain;

pub const IS_FROZEN_TAG: &str = "IsFrozenTag";
pub const IS_MANUALLY_FROZEN_TAG: &str = "IsManuallyFrozenTag";

/// A UTXO record persisted once it is reserved by a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FmUtxo {
    pub id: i64,
    pub outpoint: OutPoint,
    pub sats_amount: u64,
    pub address: Option<String>,
    pub wallet_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoTag {
    pub key: String,
    pub value: String,
    pub outpoint: OutPoint,
}

/// An unspent output reported by the chain index for one of the wallet's scripts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainUtxo {
    pub outpoint: OutPoint,
    pub txout: TxOut,
    pub keychain: Keychain,
    pub derivation_index: u32,
    pub confirmations: u32,
}

impl ChainUtxo {
    pub fn value(&self) -> Amount {
        self.txout.value
    }
}
