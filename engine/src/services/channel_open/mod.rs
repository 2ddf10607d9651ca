pub mod state;

pub use state::{transition, OpenState, SideEffect};

use bitcoin::psbt::{self, Psbt};
use bitcoin::{Address, Amount, FeeRate, Network, OutPoint, Transaction, TxOut};
use chrono::Utc;
use futures::StreamExt;
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{ChannelOpenError, SigningError, StorageError};
use crate::models::{
    Channel, ChannelOperationRequest, ChannelStatus, Node, RequestStatus, SpendRequest, StatusLogEntry, Wallet,
};
use crate::services::lightning::{FundingStep, LightningNode, OpenChannelParams};
use crate::services::onchain::transaction_builder::{Template, TemplateKind, DUST_THRESHOLD};
use crate::services::signing::SigningCoordinator;
use crate::storage::DbManager;

/// How far an open got.
#[derive(Debug)]
pub enum OpenResult {
    Opened(Channel),
    /// The funding transaction is broadcast but the daemon's updates stopped before the open.
    Pending(OutPoint),
}

/// Participants of one channel open.
pub struct OpenChannel<'a> {
    pub wallet: &'a Wallet,
    pub source: &'a Node,
    pub destination: &'a Node,
    pub fee_rate: FeeRate,
}

/// Drives a PSBT-funded channel open against the source node's daemon.
pub struct ChannelOpenDriver {
    db: Arc<DbManager>,
    lightning: Arc<dyn LightningNode>,
    coordinator: Arc<SigningCoordinator>,
    network: Network,
}

impl ChannelOpenDriver {
    pub fn new(
        db: Arc<DbManager>,
        lightning: Arc<dyn LightningNode>,
        coordinator: Arc<SigningCoordinator>,
        network: Network,
    ) -> Self {
        Self {
            db,
            lightning,
            coordinator,
            network,
        }
    }

    /// Opens the channel funded by the request's template.
    ///
    /// Until the daemon reports the funding transaction broadcast, any error cancels the shim and
    /// is returned. After that the open cannot be undone: a lost update stream leaves the request
    /// `OnChainConfirmationPending` and the result is [`OpenResult::Pending`].
    pub async fn open(
        &self,
        request: &mut ChannelOperationRequest,
        open: OpenChannel<'_>,
    ) -> Result<OpenResult, ChannelOpenError> {
        let pending_chan_id: [u8; 32] = rand::random();
        let mut state = OpenState::AwaitingFunding;

        let err = match self.run(request, &open, pending_chan_id, &mut state).await {
            Ok(channel) => return Ok(OpenResult::Opened(channel)),
            Err(e) => e,
        };

        if let Some(funding) = state.funding_outpoint() {
            tracing::warn!(
                "Lost open updates for request {} after funding {} was broadcast: {}",
                request.id,
                funding,
                err
            );
            request.log(StatusLogEntry::warning(format!(
                "Open updates interrupted after broadcast of {}: {}",
                funding, err
            )));
            self.db.update(request)?;
            return Ok(OpenResult::Pending(funding));
        }

        tracing::error!("Channel open for request {} failed in {}: {}", request.id, state.name(), err);
        if let Err(cancel_err) = self
            .lightning
            .funding_state_step(open.source, pending_chan_id, FundingStep::Cancel)
            .await
        {
            tracing::warn!("Failed to cancel funding shim for request {}: {}", request.id, cancel_err);
        }
        Err(err)
    }

    async fn run(
        &self,
        request: &mut ChannelOperationRequest,
        open: &OpenChannel<'_>,
        pending_chan_id: [u8; 32],
        state: &mut OpenState,
    ) -> Result<Channel, ChannelOpenError> {
        let stored = self
            .db
            .get_template_psbt(request.request_ref())?
            .ok_or_else(|| SigningError::MissingTemplate(request.request_ref().to_string()))?;
        let template_psbt = Psbt::from_str(&stored.psbt).map_err(|e| SigningError::InvalidPsbt(e.to_string()))?;

        let kind = TemplateKind::ChannelOpen {
            amount: Amount::from_sat(request.amount_sats),
        };
        let template = Template::from_psbt(template_psbt, &kind)
            .map_err(|e| ChannelOpenError::InvalidFunding(e.to_string()))?;

        let params = OpenChannelParams {
            node_pubkey: open.destination.pubkey.clone(),
            local_funding_amount: Amount::from_sat(request.amount_sats),
            private: request.is_private,
            close_address: request.close_address.clone(),
            sat_per_vbyte: open.fee_rate.to_sat_per_vb_ceil(),
            pending_chan_id,
            base_psbt: template.psbt.clone(),
        };

        tracing::info!(
            "Opening channel from {} to {} for {} sats",
            open.source.name,
            open.destination.name,
            request.amount_sats
        );
        let mut updates = self.lightning.open_channel(open.source, params).await?;

        let mut opened = None;
        while let Some(update) = updates.next().await {
            let update = update?;
            tracing::debug!("Request {} received {} in {}", request.id, update.name(), state.name());

            let (next, effects) = transition(state, update)?;
            *state = next;

            for effect in effects {
                match effect {
                    SideEffect::FundPsbt {
                        funding_address,
                        funding_amount,
                        psbt,
                    } => {
                        let funded = funded_psbt(&template, &funding_address, funding_amount, &psbt, self.network)?;
                        self.fund(request, open, pending_chan_id, funded).await?;
                    }
                    SideEffect::RecordPending { txid, output_index } => {
                        request.tx_id = Some(txid);
                        request.funding_output_index = Some(output_index);
                        request.set_status(RequestStatus::OnChainConfirmationPending);
                        request.log(StatusLogEntry::info(format!("Channel pending at {}:{}", txid, output_index)));
                        self.db.update(request)?;
                    }
                    SideEffect::PersistChannel { txid, output_index } => {
                        let channel = persist_opened_channel(&self.db, request, OutPoint::new(txid, output_index))?;
                        tracing::info!("Channel {} opened for request {}", channel.channel_point(), request.id);
                        opened = Some(channel);
                    }
                }
            }

            if let Some(channel) = opened.take() {
                return Ok(channel);
            }
        }

        Err(ChannelOpenError::StreamClosed)
    }

    /// Signs the funded transaction and hands it to the daemon: verify first, then finalize.
    async fn fund(
        &self,
        request: &ChannelOperationRequest,
        open: &OpenChannel<'_>,
        pending_chan_id: [u8; 32],
        funded: Psbt,
    ) -> Result<(), ChannelOpenError> {
        let finalized = self
            .coordinator
            .complete(open.wallet, request.request_ref(), funded.clone())
            .await?;

        self.lightning
            .funding_state_step(open.source, pending_chan_id, FundingStep::Verify { funded_psbt: funded })
            .await?;
        self.lightning
            .funding_state_step(
                open.source,
                pending_chan_id,
                FundingStep::Finalize {
                    signed_psbt: finalized.psbt,
                },
            )
            .await?;

        tracing::info!("Submitted funding transaction {} for request {}", finalized.tx.compute_txid(), request.id);
        Ok(())
    }
}

/// Records the channel funded at `funding` and confirms the open request that created it.
///
/// An existing channel at the same point is linked instead of duplicated.
pub fn persist_opened_channel(
    db: &DbManager,
    request: &mut ChannelOperationRequest,
    funding: OutPoint,
) -> Result<Channel, StorageError> {
    let channel = match db.find_channel_by_point(&funding.txid, funding.vout)? {
        Some(existing) => existing,
        None => {
            let now = Utc::now();
            let mut channel = Channel {
                id: 0,
                funding_tx: funding.txid,
                funding_tx_output_index: funding.vout,
                chan_id: None,
                sat_capacity: request.amount_sats,
                source_node_id: request.source_node_id,
                destination_node_id: request.destination_node_id,
                status: ChannelStatus::Open,
                btc_close_address: request.close_address.clone(),
                created_by_request_id: Some(request.id),
                created_at: now,
                updated_at: now,
            };
            db.add(&mut channel)?;
            channel
        }
    };

    request.tx_id = Some(funding.txid);
    request.funding_output_index = Some(funding.vout);
    request.channel_id = Some(channel.id);
    request.set_status(RequestStatus::OnChainConfirmed);
    request.log(StatusLogEntry::info(format!("Channel {} open", channel.channel_point())));
    db.update(request)?;

    Ok(channel)
}

/// Rebuilds the funding transaction from the template: its inputs and metadata, the daemon's
/// funding output and change re-derived as `total_in - funding_amount - template fee`.
pub fn funded_psbt(
    template: &Template,
    funding_address: &str,
    funding_amount: Amount,
    daemon_psbt: &Psbt,
    network: Network,
) -> Result<Psbt, ChannelOpenError> {
    let funding_script = Address::from_str(funding_address)
        .map_err(|e| ChannelOpenError::InvalidFunding(format!("funding address {}: {}", funding_address, e)))?
        .require_network(network)
        .map_err(|e| ChannelOpenError::InvalidFunding(format!("funding address {}: {}", funding_address, e)))?
        .script_pubkey();

    let funding_output = daemon_psbt
        .unsigned_tx
        .output
        .iter()
        .find(|o| o.script_pubkey == funding_script && o.value == funding_amount)
        .cloned()
        .ok_or_else(|| {
            ChannelOpenError::InvalidFunding(format!("no output of {} to {}", funding_amount, funding_address))
        })?;

    let template_inputs: HashSet<_> = template.psbt.unsigned_tx.input.iter().map(|i| i.previous_output).collect();
    let daemon_inputs: HashSet<_> = daemon_psbt.unsigned_tx.input.iter().map(|i| i.previous_output).collect();
    if template_inputs != daemon_inputs {
        return Err(ChannelOpenError::InvalidFunding(
            "daemon PSBT does not spend the template inputs".to_string(),
        ));
    }

    let change = template
        .total_in
        .checked_sub(funding_amount)
        .and_then(|rest| rest.checked_sub(template.fee))
        .ok_or_else(|| {
            ChannelOpenError::InvalidFunding(format!(
                "inputs {} cannot cover {} plus fee {}",
                template.total_in, funding_amount, template.fee
            ))
        })?;

    let change_slot = template
        .psbt
        .unsigned_tx
        .output
        .iter()
        .zip(template.psbt.outputs.iter())
        .find(|(_, meta)| !meta.bip32_derivation.is_empty());

    let mut outputs = vec![funding_output];
    let mut output_meta = vec![psbt::Output::default()];
    match change_slot {
        Some((change_out, meta)) if change >= DUST_THRESHOLD => {
            outputs.push(TxOut {
                value: change,
                script_pubkey: change_out.script_pubkey.clone(),
            });
            output_meta.push(meta.clone());
        }
        _ => {
            if change > Amount::ZERO {
                tracing::debug!("Dropping {} change into the funding fee", change);
            }
        }
    }

    let tx = Transaction {
        version: template.psbt.unsigned_tx.version,
        lock_time: template.psbt.unsigned_tx.lock_time,
        input: template.psbt.unsigned_tx.input.clone(),
        output: outputs,
    };

    let mut funded = Psbt::from_unsigned_tx(tx).map_err(|e| ChannelOpenError::InvalidFunding(e.to_string()))?;
    funded.inputs = template.psbt.inputs.clone();
    funded.outputs = output_meta;
    funded.xpub = template.psbt.xpub.clone();

    Ok(funded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NodeError;
    use crate::models::{Keychain, RequestPsbt, WalletAddressType};
    use crate::services::lightning::OpenStatusUpdate;
    use crate::services::onchain::{CoinSelectionStrategy, TemplateRequest, TransactionBuilder, UtxoManager};
    use crate::services::signing::{InternalSigner, LocalSigner};
    use crate::storage::KeyManager;
    use crate::test_utils::{self, FakeChainIndex, FakeLightningNode};
    use bitcoin::secp256k1::Secp256k1;
    use bitcoin::Txid;

    const CHANNEL_AMOUNT: u64 = 100_000;

    struct Fixture {
        db: Arc<DbManager>,
        lightning: Arc<FakeLightningNode>,
        driver: ChannelOpenDriver,
        wallet: Wallet,
        source: Node,
        destination: Node,
        request: ChannelOperationRequest,
        template: Template,
    }

    async fn fixture() -> Fixture {
        let db = Arc::new(DbManager::in_memory().unwrap());
        test_utils::store_internal_wallet(&db);
        let chain = Arc::new(FakeChainIndex::default());
        let wallet = test_utils::multisig_wallet(2, WalletAddressType::NativeSegwit);

        let descriptor = wallet.wallet_descriptor().unwrap();
        chain.set_utxos(
            wallet.id,
            vec![
                test_utils::wallet_utxo(&descriptor, Keychain::External, 0, Amount::from_sat(80_000), 6),
                test_utils::wallet_utxo(&descriptor, Keychain::External, 1, Amount::from_sat(70_000), 6),
            ],
        );

        let utxo_manager = Arc::new(UtxoManager::new(db.clone(), chain.clone(), Network::Regtest));
        let builder = TransactionBuilder::new(db.clone(), chain.clone(), utxo_manager, Network::Regtest);

        let mut request = test_utils::channel_open_request(Some(wallet.id), CHANNEL_AMOUNT);
        db.add(&mut request).unwrap();

        let outcome = builder
            .build_template(TemplateRequest {
                request: request.request_ref(),
                wallet: &wallet,
                kind: TemplateKind::ChannelOpen {
                    amount: Amount::from_sat(CHANNEL_AMOUNT),
                },
                spend_all: false,
                fee_rate: FeeRate::from_sat_per_vb_unchecked(1),
                selected_outpoints: &[],
                strategy: CoinSelectionStrategy::SmallestFirst,
                replacing: None,
            })
            .await
            .unwrap();
        let template = outcome.template().unwrap().clone();

        let key_manager = Arc::new(KeyManager::new(Network::Regtest));
        let coordinator = Arc::new(SigningCoordinator::new(
            db.clone(),
            InternalSigner::Local(LocalSigner::new(db.clone(), key_manager)),
        ));
        let lightning = Arc::new(FakeLightningNode::default());
        let driver = ChannelOpenDriver::new(db.clone(), lightning.clone(), coordinator, Network::Regtest);

        Fixture {
            db,
            lightning,
            driver,
            wallet,
            source: test_utils::node("source"),
            destination: test_utils::node("destination"),
            request,
            template,
        }
    }

    impl Fixture {
        fn sign_template(&self) {
            let mut signed = self.template.psbt.clone();
            signed.sign(&test_utils::signer_xpriv(1), &Secp256k1::new()).unwrap();
            self.db
                .add_request_psbt(&mut RequestPsbt::signed(self.request.request_ref(), signed.to_string(), "alice"))
                .unwrap();
        }

        /// The template with the funding output appended, as the daemon returns it.
        fn fund_update(&self) -> OpenStatusUpdate {
            let address = test_utils::external_address(7);
            let mut psbt = self.template.psbt.clone();
            psbt.unsigned_tx.output.insert(
                0,
                TxOut {
                    value: Amount::from_sat(CHANNEL_AMOUNT),
                    script_pubkey: address.script_pubkey(),
                },
            );
            psbt.outputs.insert(0, psbt::Output::default());

            OpenStatusUpdate::PsbtFund {
                funding_address: address.to_string(),
                funding_amount: Amount::from_sat(CHANNEL_AMOUNT),
                psbt,
            }
        }

        async fn open(&mut self) -> Result<OpenResult, ChannelOpenError> {
            self.driver
                .open(
                    &mut self.request,
                    OpenChannel {
                        wallet: &self.wallet,
                        source: &self.source,
                        destination: &self.destination,
                        fee_rate: FeeRate::from_sat_per_vb_unchecked(1),
                    },
                )
                .await
        }
    }

    fn funding_txid() -> Txid {
        test_utils::outpoint(42, 0).txid
    }

    #[tokio::test]
    async fn test_open_completes_and_persists_channel() {
        let mut f = fixture().await;
        f.sign_template();
        f.lightning.script_open(vec![
            Ok(f.fund_update()),
            Ok(OpenStatusUpdate::ChanPending {
                txid: funding_txid(),
                output_index: 0,
            }),
            Ok(OpenStatusUpdate::ChanOpen {
                txid: funding_txid(),
                output_index: 0,
            }),
        ]);

        let OpenResult::Opened(channel) = f.open().await.unwrap() else {
            panic!("expected the channel to open");
        };
        assert_eq!(channel.funding_tx, funding_txid());
        assert_eq!(channel.sat_capacity, CHANNEL_AMOUNT);
        assert_eq!(channel.status, ChannelStatus::Open);

        assert_eq!(f.request.status, RequestStatus::OnChainConfirmed);
        assert_eq!(f.request.tx_id, Some(funding_txid()));
        assert_eq!(f.request.channel_id, Some(channel.id));

        let steps = f.lightning.funding_steps();
        assert_eq!(steps.len(), 2);
        let FundingStep::Verify { funded_psbt } = &steps[0] else {
            panic!("expected verify first, got {:?}", steps[0]);
        };
        let FundingStep::Finalize { signed_psbt } = &steps[1] else {
            panic!("expected finalize second, got {:?}", steps[1]);
        };
        assert_eq!(funded_psbt.unsigned_tx, signed_psbt.unsigned_tx);
        assert_eq!(funded_psbt.unsigned_tx.output[0].value, Amount::from_sat(CHANNEL_AMOUNT));

        // change re-derived against the template fee
        let change = signed_psbt.unsigned_tx.output[1].value;
        assert_eq!(Some(change), f.template.change);
        assert_eq!(signed_psbt.fee().unwrap(), f.template.fee);

        let params = f.lightning.open_params();
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].base_psbt, f.template.psbt);
        assert_eq!(params[0].node_pubkey, f.destination.pubkey);
    }

    #[tokio::test]
    async fn test_stream_ending_early_cancels_shim() {
        let mut f = fixture().await;
        f.sign_template();
        f.lightning.script_open(vec![Ok(f.fund_update())]);

        let err = f.open().await.unwrap_err();
        assert!(matches!(err, ChannelOpenError::StreamClosed));

        let steps = f.lightning.funding_steps();
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[2], FundingStep::Cancel);

        let pending_ids = f.lightning.funding_step_ids();
        assert!(pending_ids.iter().all(|id| *id == f.lightning.open_params()[0].pending_chan_id));
    }

    #[tokio::test]
    async fn test_updates_lost_after_broadcast_leave_open_pending() {
        let mut f = fixture().await;
        f.sign_template();
        f.lightning.script_open(vec![
            Ok(f.fund_update()),
            Ok(OpenStatusUpdate::ChanPending {
                txid: funding_txid(),
                output_index: 1,
            }),
            Err(NodeError::UnexpectedResponse("stream reset".to_string())),
        ]);

        let result = f.open().await.unwrap();
        assert!(matches!(result, OpenResult::Pending(funding) if funding == OutPoint::new(funding_txid(), 1)));

        // verify and finalize only, the broadcast funding cannot be cancelled
        let steps = f.lightning.funding_steps();
        assert_eq!(steps.len(), 2);
        assert!(!steps.contains(&FundingStep::Cancel));

        let stored: ChannelOperationRequest = f.db.get(f.request.id).unwrap();
        assert_eq!(stored.status, RequestStatus::OnChainConfirmationPending);
        assert_eq!(stored.tx_id, Some(funding_txid()));
        assert_eq!(stored.funding_output_index, Some(1));
        assert!(stored.status_logs.last().unwrap().message.contains("stream reset"));

        // the template inputs stay reserved for the broadcast funding transaction
        let locked = f.db.get_locked_utxos(&[]).unwrap();
        assert!(f
            .template
            .psbt
            .unsigned_tx
            .input
            .iter()
            .all(|i| locked.contains(&i.previous_output)));
    }

    #[tokio::test]
    async fn test_stream_end_after_broadcast_is_not_an_error() {
        let mut f = fixture().await;
        f.sign_template();
        f.lightning.script_open(vec![
            Ok(f.fund_update()),
            Ok(OpenStatusUpdate::ChanPending {
                txid: funding_txid(),
                output_index: 0,
            }),
        ]);

        assert!(matches!(f.open().await.unwrap(), OpenResult::Pending(_)));
        assert_eq!(f.request.status, RequestStatus::OnChainConfirmationPending);
        assert!(f.db.list::<Channel>().unwrap().is_empty());
    }

    #[test]
    fn test_persisting_an_open_links_an_existing_channel() {
        let db = DbManager::in_memory().unwrap();
        let mut request = test_utils::channel_open_request(Some(1), CHANNEL_AMOUNT);
        db.add(&mut request).unwrap();
        let funding = OutPoint::new(funding_txid(), 0);

        let first = persist_opened_channel(&db, &mut request, funding).unwrap();
        let second = persist_opened_channel(&db, &mut request, funding).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(db.list::<Channel>().unwrap().len(), 1);

        let stored: ChannelOperationRequest = db.get(request.id).unwrap();
        assert_eq!(stored.status, RequestStatus::OnChainConfirmed);
        assert_eq!(stored.channel_id, Some(first.id));
        assert_eq!(first.created_by_request_id, Some(request.id));
    }

    #[tokio::test]
    async fn test_missing_signatures_cancel_before_verify() {
        let mut f = fixture().await;
        f.lightning.script_open(vec![Ok(f.fund_update())]);

        let err = f.open().await.unwrap_err();
        assert!(matches!(
            err,
            ChannelOpenError::Signing(SigningError::InsufficientSignatures { .. })
        ));
        assert_eq!(f.lightning.funding_steps(), vec![FundingStep::Cancel]);
        assert_eq!(f.request.status, RequestStatus::Pending);
    }

    #[tokio::test]
    async fn test_unexpected_event_and_stream_error_cancel() {
        let mut f = fixture().await;
        f.lightning.script_open(vec![Ok(OpenStatusUpdate::ChanOpen {
            txid: funding_txid(),
            output_index: 0,
        })]);
        let err = f.open().await.unwrap_err();
        assert!(matches!(err, ChannelOpenError::UnexpectedEvent { .. }));
        assert_eq!(f.lightning.funding_steps(), vec![FundingStep::Cancel]);

        let mut f = fixture().await;
        f.lightning
            .script_open(vec![Err(NodeError::UnexpectedResponse("stream reset".to_string()))]);
        let err = f.open().await.unwrap_err();
        assert!(matches!(err, ChannelOpenError::Node(_)));
        assert_eq!(f.lightning.funding_steps(), vec![FundingStep::Cancel]);
    }

    #[tokio::test]
    async fn test_funding_must_spend_template_inputs() {
        let f = fixture().await;
        let OpenStatusUpdate::PsbtFund {
            funding_address,
            funding_amount,
            mut psbt,
        } = f.fund_update()
        else {
            unreachable!()
        };

        let funded = funded_psbt(&f.template, &funding_address, funding_amount, &psbt, Network::Regtest).unwrap();
        assert_eq!(funded.inputs, f.template.psbt.inputs);
        assert_eq!(funded.unsigned_tx.input, f.template.psbt.unsigned_tx.input);

        psbt.unsigned_tx.input[0].previous_output = test_utils::outpoint(77, 0);
        let err = funded_psbt(&f.template, &funding_address, funding_amount, &psbt, Network::Regtest).unwrap_err();
        assert!(matches!(err, ChannelOpenError::InvalidFunding(_)));

        let err = funded_psbt(
            &f.template,
            &funding_address,
            Amount::from_sat(CHANNEL_AMOUNT + 1),
            &f.template.psbt,
            Network::Regtest,
        )
        .unwrap_err();
        assert!(matches!(err, ChannelOpenError::InvalidFunding(_)));
    }
}
