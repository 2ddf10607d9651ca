use bitcoin::{Network, OutPoint};
use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{ChainError, StorageError};
use crate::models::{ChainUtxo, FmUtxo, RequestRef, UtxoTag, Wallet, IS_FROZEN_TAG, IS_MANUALLY_FROZEN_TAG};
use crate::services::chain::{ChainIndex, UtxoSet};
use crate::storage::DbManager;

/// Outpoints excluded from selection by tags.
///
/// A manual tag always wins over the automatic freeze classification.
pub fn frozen_outpoints(tags: &[UtxoTag]) -> HashSet<OutPoint> {
    let mut frozen: HashSet<OutPoint> = tags
        .iter()
        .filter(|t| t.key == IS_FROZEN_TAG && t.value != "false")
        .map(|t| t.outpoint)
        .collect();

    for tag in tags.iter().filter(|t| t.key == IS_MANUALLY_FROZEN_TAG) {
        if tag.value == "true" {
            frozen.insert(tag.outpoint);
        } else {
            frozen.remove(&tag.outpoint);
        }
    }

    frozen
}

/// Tracks which wallet UTXOs are spendable, locked by a request, or frozen.
pub struct UtxoManager {
    db: Arc<DbManager>,
    chain: Arc<dyn ChainIndex>,
    network: Network,
}

impl UtxoManager {
    pub fn new(db: Arc<DbManager>, chain: Arc<dyn ChainIndex>, network: Network) -> Self {
        Self { db, chain, network }
    }

    pub fn get_frozen_utxos(&self) -> Result<HashSet<OutPoint>, StorageError> {
        let tags = self.db.get_utxo_tags(&[IS_FROZEN_TAG, IS_MANUALLY_FROZEN_TAG])?;
        Ok(frozen_outpoints(&tags))
    }

    pub fn set_frozen(&self, outpoint: OutPoint, frozen: bool) -> Result<(), StorageError> {
        tracing::info!("Manually {} UTXO {}", if frozen { "freezing" } else { "unfreezing" }, outpoint);
        self.db.set_utxo_tag(&UtxoTag {
            key: IS_MANUALLY_FROZEN_TAG.to_string(),
            value: frozen.to_string(),
            outpoint,
        })
    }

    pub async fn get_wallet_utxos(&self, wallet: &Wallet) -> Result<UtxoSet, ChainError> {
        let descriptor = wallet.wallet_descriptor()?;
        self.chain.get_utxos(&descriptor).await
    }

    /// Confirmed UTXOs of `wallet` that are neither frozen nor locked by another active request.
    ///
    /// Locks held by requests in `exclude` are ignored.
    pub fn available_from(
        &self,
        confirmed: &[ChainUtxo],
        exclude: &[RequestRef],
    ) -> Result<Vec<ChainUtxo>, StorageError> {
        let locked = self.db.get_locked_utxos(exclude)?;
        let frozen = self.get_frozen_utxos()?;

        let available: Vec<ChainUtxo> = confirmed
            .iter()
            .filter(|u| !locked.contains(&u.outpoint) && !frozen.contains(&u.outpoint))
            .cloned()
            .collect();

        tracing::debug!(
            "{} of {} confirmed UTXOs available ({} locked, {} frozen)",
            available.len(),
            confirmed.len(),
            locked.len(),
            frozen.len()
        );

        Ok(available)
    }

    /// Reserves `utxos` for `request` inside one transaction.
    pub fn lock(
        &self,
        request: RequestRef,
        wallet: &Wallet,
        utxos: &[ChainUtxo],
        compatible: &[RequestRef],
    ) -> Result<(), StorageError> {
        let records: Vec<FmUtxo> = utxos
            .iter()
            .map(|u| FmUtxo {
                id: 0,
                outpoint: u.outpoint,
                sats_amount: u.value().to_sat(),
                address: bitcoin::Address::from_script(&u.txout.script_pubkey, self.network)
                    .ok()
                    .map(|a| a.to_string()),
                wallet_id: wallet.id,
            })
            .collect();

        self.db.lock_utxos(request, &records, compatible)
    }
}
