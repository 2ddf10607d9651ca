use async_trait::async_trait;
use bitcoin::{Amount, FeeRate, Network, OutPoint, ScriptBuf, Transaction, TxOut, Txid};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use super::{
    BroadcastResult, ChainIndex, KeychainAddress, TrackTarget, TransactionStatus, UtxoSet,
};
use crate::error::ChainError;
use crate::models::{ChainUtxo, Keychain, WalletDescriptor};
use crate::services::onchain::fee_estimator::fee_rate_from_sat_per_vb;

// confirmed transactions per scripthash page
const ESPLORA_PAGE_SIZE: usize = 25;

/// Depth of a transaction mined at `block_height`, counting the tip as one.
fn confirmations(tip_height: u32, block_height: Option<u32>) -> u32 {
    match block_height {
        Some(height) if height <= tip_height => tip_height - height + 1,
        _ => 0,
    }
}

/// Fee rate for the nearest estimate at or below `target_blocks`, 1 sat/vB when there is none.
fn target_fee_rate(target_blocks: u16, estimates: HashMap<u16, f64>) -> FeeRate {
    let sat_per_vb = esplora_client::convert_fee_rate(target_blocks as usize, estimates)
        .map(f64::from)
        .unwrap_or(1.0);
    fee_rate_from_sat_per_vb(sat_per_vb)
}

/// Chain index backed by an Esplora HTTP API, scanning descriptors up to a gap limit.
pub struct EsploraChainIndex {
    client: esplora_client::AsyncClient,
    network: Network,
    gap_limit: u32,
    max_tip_age: Option<Duration>,
    tracked: RwLock<HashSet<ScriptBuf>>,
}

struct KeychainScan {
    utxos: Vec<ChainUtxo>,
    last_used: Option<u32>,
}

impl EsploraChainIndex {
    pub fn new(url: &str, network: Network, gap_limit: u32, max_tip_age: Option<Duration>) -> Result<Self, ChainError> {
        let client = esplora_client::Builder::new(url).build_async()?;
        Ok(Self {
            client,
            network,
            gap_limit: gap_limit.max(1),
            max_tip_age,
            tracked: RwLock::new(HashSet::new()),
        })
    }

    async fn script_txs(&self, script: &ScriptBuf) -> Result<Vec<esplora_client::Tx>, ChainError> {
        let mut txs = Vec::new();
        let mut last_seen: Option<Txid> = None;

        loop {
            let page = self.client.scripthash_txs(script, last_seen).await?;
            let confirmed_in_page = page.iter().filter(|tx| tx.status.confirmed).count();
            last_seen = page.iter().filter(|tx| tx.status.confirmed).last().map(|tx| tx.txid);
            txs.extend(page);

            if confirmed_in_page < ESPLORA_PAGE_SIZE || last_seen.is_none() {
                break;
            }
        }

        Ok(txs)
    }

    async fn scan_keychain(
        &self,
        descriptor: &WalletDescriptor,
        keychain: Keychain,
        tip_height: u32,
    ) -> Result<KeychainScan, ChainError> {
        let mut scan = KeychainScan {
            utxos: Vec::new(),
            last_used: None,
        };
        let mut gap = 0;
        let mut index = 0;

        while gap < self.gap_limit {
            let script = descriptor.script_pubkey_at(keychain, index)?;
            let txs = self.script_txs(&script).await?;

            if txs.is_empty() {
                gap += 1;
            } else {
                gap = 0;
                scan.last_used = Some(index);
            }

            for tx in txs {
                for (vout, output) in tx.vout.iter().enumerate() {
                    if output.scriptpubkey != script {
                        continue;
                    }

                    // ensure output is unspent
                    let status = self.client.get_output_status(&tx.txid, vout as u64).await?;
                    if status.map(|s| s.spent).unwrap_or(false) {
                        continue;
                    }

                    let confirmations = if tx.status.confirmed {
                        confirmations(tip_height, tx.status.block_height)
                    } else {
                        0
                    };

                    scan.utxos.push(ChainUtxo {
                        outpoint: OutPoint::new(tx.txid, vout as u32),
                        txout: TxOut {
                            value: Amount::from_sat(output.value),
                            script_pubkey: script.clone(),
                        },
                        keychain,
                        derivation_index: index,
                        confirmations,
                    });
                }
            }

            index += 1;
        }

        Ok(scan)
    }
}

#[async_trait]
impl ChainIndex for EsploraChainIndex {
    async fn is_fully_synced(&self) -> Result<bool, ChainError> {
        let height = self.client.get_height().await?;

        let Some(max_tip_age) = self.max_tip_age else {
            return Ok(height > 0);
        };

        let tip = self.client.get_tip_hash().await?;
        let header = self.client.get_header_by_hash(&tip).await?;
        let age = chrono::Utc::now().timestamp() - header.time as i64;

        if age > max_tip_age.as_secs() as i64 {
            tracing::warn!("Chain index tip {} at height {} is {}s old", tip, height, age);
            return Ok(false);
        }

        Ok(true)
    }

    async fn get_utxos(&self, descriptor: &WalletDescriptor) -> Result<UtxoSet, ChainError> {
        let tip_height = self.client.get_height().await?;

        let mut utxos = UtxoSet::default();
        for keychain in [Keychain::External, Keychain::Internal] {
            let scan = self.scan_keychain(descriptor, keychain, tip_height).await?;
            for utxo in scan.utxos {
                if utxo.confirmations > 0 {
                    utxos.confirmed.push(utxo);
                } else {
                    utxos.unconfirmed.push(utxo);
                }
            }
        }

        tracing::info!(
            "Found {} confirmed and {} unconfirmed UTXOs for wallet {}",
            utxos.confirmed.len(),
            utxos.unconfirmed.len(),
            descriptor.wallet_id
        );

        Ok(utxos)
    }

    async fn get_unused_address(
        &self,
        descriptor: &WalletDescriptor,
        keychain: Keychain,
    ) -> Result<KeychainAddress, ChainError> {
        let mut index = 0;
        loop {
            let script = descriptor.script_pubkey_at(keychain, index)?;
            if self.client.scripthash_txs(&script, None).await?.is_empty() {
                let address = descriptor.address_at(keychain, index, self.network)?;
                return Ok(KeychainAddress {
                    address,
                    keychain,
                    index,
                });
            }
            index += 1;
        }
    }

    async fn get_fee_rate(&self, target_blocks: u16) -> Result<FeeRate, ChainError> {
        let estimates = self.client.get_fee_estimates().await?;

        if estimates.is_empty() && self.network == Network::Bitcoin {
            return Err(ChainError::Other("Empty fee estimates on mainnet".to_string()));
        }

        Ok(target_fee_rate(target_blocks, estimates))
    }

    async fn broadcast(&self, tx: &Transaction) -> Result<BroadcastResult, ChainError> {
        let txid = tx.compute_txid();
        tracing::info!("Broadcasting transaction: {}", txid);

        match self.client.broadcast(tx).await {
            Ok(()) => {
                tracing::info!("Successfully broadcast transaction: {}", txid);
                Ok(BroadcastResult::accepted())
            }
            Err(esplora_client::Error::HttpResponse { status, message }) => {
                tracing::error!("Broadcast of {} rejected ({}): {}", txid, status, message);
                Ok(BroadcastResult::rejected(status as i32, message))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_transaction(&self, txid: &Txid) -> Result<Option<TransactionStatus>, ChainError> {
        let status = match self.client.get_tx_status(txid).await {
            Ok(status) => status,
            Err(esplora_client::Error::HttpResponse { status: 404, .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if !status.confirmed {
            // unknown transactions also report as unconfirmed
            if self.client.get_tx(txid).await?.is_none() {
                return Ok(None);
            }
            return Ok(Some(TransactionStatus {
                confirmations: 0,
                block_height: None,
            }));
        }

        let tip_height = self.client.get_height().await?;
        Ok(Some(TransactionStatus {
            confirmations: confirmations(tip_height, status.block_height),
            block_height: status.block_height,
        }))
    }

    async fn get_raw_transaction(&self, txid: &Txid) -> Result<Option<Transaction>, ChainError> {
        match self.client.get_tx(txid).await {
            Ok(tx) => Ok(tx),
            Err(esplora_client::Error::TransactionNotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn track(&self, target: TrackTarget) -> Result<(), ChainError> {
        // esplora indexes every script, tracking only records interest for logging
        let scripts = match target {
            TrackTarget::Address(address) => vec![address.script_pubkey()],
            TrackTarget::Descriptor(descriptor) => vec![
                descriptor.script_pubkey_at(Keychain::External, 0)?,
                descriptor.script_pubkey_at(Keychain::Internal, 0)?,
            ],
        };

        let mut tracked = self.tracked.write();
        for script in scripts {
            if tracked.insert(script.clone()) {
                tracing::debug!("Tracking script {}", script);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils;

    #[test]
    fn test_confirmations_count_the_tip() {
        assert_eq!(confirmations(100, Some(100)), 1);
        assert_eq!(confirmations(105, Some(100)), 6);
        assert_eq!(confirmations(100, None), 0);
        // a reorged index can briefly report a block above its tip
        assert_eq!(confirmations(99, Some(100)), 0);
    }

    #[test]
    fn test_target_fee_rate_uses_nearest_lower_target() {
        let estimates = HashMap::from([(1, 25.5), (3, 12.5), (6, 8.0), (144, 1.4)]);

        assert_eq!(target_fee_rate(3, estimates.clone()), FeeRate::from_sat_per_kwu(3125));
        assert_eq!(target_fee_rate(10, estimates.clone()), fee_rate_from_sat_per_vb(8.0));
        assert_eq!(target_fee_rate(6, HashMap::new()), fee_rate_from_sat_per_vb(1.0));
    }

    #[tokio::test]
    async fn test_track_records_each_script_once() {
        let index = EsploraChainIndex::new("http://localhost:3000", Network::Regtest, 0, None).unwrap();
        assert_eq!(index.gap_limit, 1);

        let descriptor = test_utils::hot_wallet().wallet_descriptor().unwrap();
        index.track(TrackTarget::Descriptor(descriptor.clone())).await.unwrap();
        index.track(TrackTarget::Descriptor(descriptor)).await.unwrap();
        index
            .track(TrackTarget::Address(test_utils::external_address(1)))
            .await
            .unwrap();

        assert_eq!(index.tracked.read().len(), 3);
    }
}
