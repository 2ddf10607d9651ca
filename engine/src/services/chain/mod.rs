pub mod esplora;

pub use esplora::EsploraChainIndex;

use async_trait::async_trait;
use bitcoin::{Address, Amount, FeeRate, Transaction, Txid};

use crate::error::ChainError;
use crate::models::{ChainUtxo, Keychain, WalletDescriptor};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UtxoSet {
    pub confirmed: Vec<ChainUtxo>,
    pub unconfirmed: Vec<ChainUtxo>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Balance {
    pub confirmed: Amount,
    pub unconfirmed: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeychainAddress {
    pub address: Address,
    pub keychain: Keychain,
    pub index: u32,
}

/// Outcome of a broadcast; rejections keep the backend's code and message verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastResult {
    pub success: bool,
    pub rpc_code: Option<i32>,
    pub rpc_message: Option<String>,
}

impl BroadcastResult {
    pub fn accepted() -> Self {
        Self {
            success: true,
            rpc_code: None,
            rpc_message: None,
        }
    }

    pub fn rejected(code: i32, message: impl Into<String>) -> Self {
        Self {
            success: false,
            rpc_code: Some(code),
            rpc_message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionStatus {
    pub confirmations: u32,
    pub block_height: Option<u32>,
}

#[derive(Debug, Clone)]
pub enum TrackTarget {
    Address(Address),
    Descriptor(WalletDescriptor),
}

/// UTXO-indexing backend.
#[async_trait]
pub trait ChainIndex: Send + Sync {
    async fn is_fully_synced(&self) -> Result<bool, ChainError>;

    async fn get_utxos(&self, descriptor: &WalletDescriptor) -> Result<UtxoSet, ChainError>;

    async fn get_balance(&self, descriptor: &WalletDescriptor) -> Result<Balance, ChainError> {
        let utxos = self.get_utxos(descriptor).await?;
        Ok(Balance {
            confirmed: utxos.confirmed.iter().map(|u| u.value()).sum(),
            unconfirmed: utxos.unconfirmed.iter().map(|u| u.value()).sum(),
        })
    }

    async fn get_unused_address(
        &self,
        descriptor: &WalletDescriptor,
        keychain: Keychain,
    ) -> Result<KeychainAddress, ChainError>;

    async fn get_fee_rate(&self, target_blocks: u16) -> Result<FeeRate, ChainError>;

    async fn broadcast(&self, tx: &Transaction) -> Result<BroadcastResult, ChainError>;

    /// `None` when the index has never seen the transaction.
    async fn get_transaction(&self, txid: &Txid) -> Result<Option<TransactionStatus>, ChainError>;

    async fn get_raw_transaction(&self, txid: &Txid) -> Result<Option<Transaction>, ChainError>;

    async fn track(&self, target: TrackTarget) -> Result<(), ChainError>;
}
