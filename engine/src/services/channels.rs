use bitcoin::{Amount, OutPoint, Txid};
use futures::StreamExt;
use std::sync::Arc;

use super::chain::ChainIndex;
use super::channel_open::{persist_opened_channel, ChannelOpenDriver, OpenChannel, OpenResult};
use super::lightning::{CloseChannelParams, CloseStatusUpdate, LightningNode};
use super::onchain::transaction_builder::record_template_error;
use super::onchain::{CoinSelectionStrategy, FeeEstimator, TemplateKind, TemplateOutcome, TemplateRequest, TransactionBuilder};
use super::signing::SigningCoordinator;
use super::{not_actionable, BatchReport, WorkflowOutcome};
use crate::error::{NodeError, WorkflowError};
use crate::models::{
    Channel, ChannelOperationRequest, ChannelStatus, Node, OperationRequestType, RequestStatus, SpendRequest,
    StatusLogEntry, Wallet,
};
use crate::storage::DbManager;

pub struct ChannelService {
    db: Arc<DbManager>,
    chain: Arc<dyn ChainIndex>,
    builder: Arc<TransactionBuilder>,
    fee_estimator: Arc<FeeEstimator>,
    coordinator: Arc<SigningCoordinator>,
    lightning: Arc<dyn LightningNode>,
    driver: ChannelOpenDriver,
    strategy: CoinSelectionStrategy,
    min_confirmations: u32,
}

impl ChannelService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<DbManager>,
        chain: Arc<dyn ChainIndex>,
        builder: Arc<TransactionBuilder>,
        fee_estimator: Arc<FeeEstimator>,
        coordinator: Arc<SigningCoordinator>,
        lightning: Arc<dyn LightningNode>,
        driver: ChannelOpenDriver,
        strategy: CoinSelectionStrategy,
        min_confirmations: u32,
    ) -> Self {
        Self {
            db,
            chain,
            builder,
            fee_estimator,
            coordinator,
            lightning,
            driver,
            strategy,
            min_confirmations,
        }
    }

    fn open_request(&self, request_id: i64) -> Result<(ChannelOperationRequest, Wallet), WorkflowError> {
        let request: ChannelOperationRequest = self.db.get(request_id)?;
        if request.request_type != OperationRequestType::Open {
            return Err(WorkflowError::InvalidRequest(format!(
                "Channel operation {} is not an open",
                request.id
            )));
        }

        let wallet_id = request.wallet_id.ok_or_else(|| {
            WorkflowError::InvalidRequest(format!("Channel open {} has no funding wallet", request.id))
        })?;
        let wallet = self.db.get(wallet_id)?;
        Ok((request, wallet))
    }

    /// Builds or reuses the funding template. Changeless opens commit everything selected.
    pub async fn generate_template(&self, request_id: i64) -> Result<WorkflowOutcome, WorkflowError> {
        let (mut request, wallet) = self.open_request(request_id)?;
        if let Some(outcome) = not_actionable(&request) {
            return Ok(outcome);
        }

        let fee_rate = self
            .fee_estimator
            .fee_rate(request.fees_type, request.custom_fee_rate)
            .await?;

        let outcome = self
            .builder
            .build_template(TemplateRequest {
                request: request.request_ref(),
                wallet: &wallet,
                kind: TemplateKind::ChannelOpen {
                    amount: Amount::from_sat(request.amount_sats),
                },
                spend_all: request.changeless,
                fee_rate,
                selected_outpoints: &request.selected_outpoints,
                strategy: self.strategy,
                replacing: None,
            })
            .await;

        let template = match outcome {
            Ok(TemplateOutcome::NotFullySynced) => return Ok(WorkflowOutcome::NotFullySynced),
            Ok(TemplateOutcome::Created(t)) | Ok(TemplateOutcome::Reused(t)) => t,
            Err(e) => {
                record_template_error(&mut request, &e);
                self.db.update(&request)?;
                return Err(e.into());
            }
        };

        if request.changeless {
            request.amount_sats = template.send_amount.to_sat();
        }
        if request.status != RequestStatus::PSBTSignaturesPending {
            request.set_status(RequestStatus::PSBTSignaturesPending);
            request.log(StatusLogEntry::info(format!(
                "Funding template ready for {} sats, fee {}",
                request.amount_sats, template.fee
            )));
        }
        self.db.update(&request)?;

        Ok(WorkflowOutcome::AwaitingSignatures)
    }

    pub fn submit_signed_psbt(&self, request_id: i64, user_id: &str, psbt: &str) -> Result<bool, WorkflowError> {
        let (request, wallet) = self.open_request(request_id)?;
        if request.status != RequestStatus::PSBTSignaturesPending {
            return Err(WorkflowError::InvalidRequest(format!(
                "Channel open {} is {} and does not accept signatures",
                request.id, request.status
            )));
        }

        self.coordinator.submit_signed_psbt(request.request_ref(), user_id, psbt)?;
        Ok(self.coordinator.signatures_collected(&wallet, request.request_ref())?)
    }

    pub fn signatures_collected(&self, request_id: i64) -> Result<bool, WorkflowError> {
        let (request, wallet) = self.open_request(request_id)?;
        Ok(self.coordinator.signatures_collected(&wallet, request.request_ref())?)
    }

    /// Connects the source node to the destination at its first advertised address.
    async fn connect_peer(&self, source: &Node, destination: &Node) -> Result<(), NodeError> {
        let info = self.lightning.get_node_info(source, &destination.pubkey).await?;
        let host = info
            .addresses
            .first()
            .ok_or_else(|| NodeError::PeerNotOnline(format!("{} advertises no address", destination.pubkey)))?;

        match self.lightning.connect_peer(source, &destination.pubkey, host).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_already_connected() => {
                tracing::debug!("{} already connected to {}", source.name, destination.name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Opens the channel once the funding template carries the external signatures.
    pub async fn open_channel(&self, request_id: i64) -> Result<WorkflowOutcome, WorkflowError> {
        let (mut request, wallet) = self.open_request(request_id)?;
        if let Some(outcome) = not_actionable(&request) {
            return Ok(outcome);
        }
        if !self.coordinator.signatures_collected(&wallet, request.request_ref())? {
            return Ok(WorkflowOutcome::AwaitingSignatures);
        }

        let source: Node = self.db.get(request.source_node_id)?;
        let destination: Node = self.db.get(request.destination_node_id)?;

        if let Err(e) = self.connect_peer(&source, &destination).await {
            tracing::warn!("Cannot reach {} from {}: {}", destination.name, source.name, e);
            request.log(StatusLogEntry::warning(format!("Peer connection failed: {}", e)));
            self.db.update(&request)?;
            return Err(e.into());
        }

        let fee_rate = self
            .fee_estimator
            .fee_rate(request.fees_type, request.custom_fee_rate)
            .await?;

        let result = self
            .driver
            .open(
                &mut request,
                OpenChannel {
                    wallet: &wallet,
                    source: &source,
                    destination: &destination,
                    fee_rate,
                },
            )
            .await;

        match result {
            Ok(OpenResult::Opened(channel)) => Ok(WorkflowOutcome::ChannelOpened(channel.id)),
            // confirmation monitoring records the channel once the funding transaction is buried
            Ok(OpenResult::Pending(funding)) => Ok(WorkflowOutcome::Broadcast(funding.txid)),
            Err(e) => {
                request.fail(format!("Channel open failed: {}", e));
                self.db.update(&request)?;
                Err(e.into())
            }
        }
    }

    /// Closes the request's channel, following the daemon's close updates to confirmation.
    pub async fn close_channel(&self, request_id: i64) -> Result<WorkflowOutcome, WorkflowError> {
        let mut request: ChannelOperationRequest = self.db.get(request_id)?;
        if request.request_type != OperationRequestType::Close {
            return Err(WorkflowError::InvalidRequest(format!(
                "Channel operation {} is not a close",
                request.id
            )));
        }
        if let Some(outcome) = not_actionable(&request) {
            return Ok(outcome);
        }

        let channel_id = request
            .channel_id
            .ok_or_else(|| WorkflowError::InvalidRequest(format!("Channel close {} has no channel", request.id)))?;
        let mut channel: Channel = self.db.get(channel_id)?;
        let source: Node = self.db.get(request.source_node_id)?;

        let sat_per_vbyte = if request.force_close {
            None
        } else {
            let fee_rate = self
                .fee_estimator
                .fee_rate(request.fees_type, request.custom_fee_rate)
                .await?;
            Some(fee_rate.to_sat_per_vb_ceil())
        };

        let params = CloseChannelParams {
            channel_point: OutPoint::new(channel.funding_tx, channel.funding_tx_output_index),
            force: request.force_close,
            delivery_address: request.close_address.clone(),
            sat_per_vbyte,
        };

        match self.follow_close(&mut request, &mut channel, &source, params).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                tracing::error!("Closing channel {} failed: {}", channel.channel_point(), e);
                request.fail(format!("Channel close failed: {}", e));
                self.db.update(&request)?;
                Err(e)
            }
        }
    }

    async fn follow_close(
        &self,
        request: &mut ChannelOperationRequest,
        channel: &mut Channel,
        source: &Node,
        params: CloseChannelParams,
    ) -> Result<WorkflowOutcome, WorkflowError> {
        let mut updates = self.lightning.close_channel(source, params).await?;
        let mut closing_txid: Option<Txid> = None;

        while let Some(update) = updates.next().await {
            match update? {
                CloseStatusUpdate::ClosePending { txid } => {
                    closing_txid = Some(txid);
                    request.tx_id = Some(txid);
                    request.set_status(RequestStatus::OnChainConfirmationPending);
                    request.log(StatusLogEntry::info(format!("Closing transaction {} broadcast", txid)));
                    self.db.update(request)?;
                }
                CloseStatusUpdate::ChanClose { txid, success } => {
                    if !success {
                        return Err(NodeError::UnexpectedResponse(format!("close {} reported failure", txid)).into());
                    }

                    channel.status = ChannelStatus::Closed;
                    channel.updated_at = chrono::Utc::now();
                    self.db.update(channel)?;

                    request.tx_id = Some(txid);
                    request.set_status(RequestStatus::OnChainConfirmed);
                    request.log(StatusLogEntry::info(format!("Channel closed by {}", txid)));
                    self.db.update(request)?;

                    tracing::info!("Channel {} closed in {}", channel.channel_point(), txid);
                    return Ok(WorkflowOutcome::ChannelClosed(txid));
                }
            }
        }

        // the daemon may drop the stream while the close confirms
        match closing_txid {
            Some(txid) => Ok(WorkflowOutcome::Broadcast(txid)),
            None => Err(NodeError::UnexpectedResponse("close stream ended before broadcast".to_string()).into()),
        }
    }

    async fn confirm_operation(&self, mut request: ChannelOperationRequest) -> Result<bool, WorkflowError> {
        let Some(txid) = request.tx_id else {
            tracing::warn!("Channel operation {} is awaiting confirmation without a txid", request.id);
            return Ok(false);
        };

        let Some(status) = self.chain.get_transaction(&txid).await? else {
            tracing::debug!("Transaction {} not yet seen by the chain index", txid);
            return Ok(false);
        };
        if status.confirmations < self.min_confirmations {
            return Ok(false);
        }

        match request.request_type {
            OperationRequestType::Open => {
                let vout = request.funding_output_index.ok_or_else(|| {
                    WorkflowError::InvalidRequest(format!("Channel open {} has no funding output", request.id))
                })?;
                let channel = persist_opened_channel(&self.db, &mut request, OutPoint::new(txid, vout))?;
                tracing::info!("Channel {} for request {} confirmed", channel.channel_point(), request.id);
            }
            OperationRequestType::Close => {
                if let Some(channel_id) = request.channel_id {
                    let mut channel: Channel = self.db.get(channel_id)?;
                    channel.status = ChannelStatus::Closed;
                    channel.updated_at = chrono::Utc::now();
                    self.db.update(&channel)?;
                }

                request.set_status(RequestStatus::OnChainConfirmed);
                request.log(StatusLogEntry::info(format!(
                    "Closing transaction {} confirmed with {} confirmations",
                    txid, status.confirmations
                )));
                self.db.update(&request)?;
                tracing::info!("Channel close {} confirmed", request.id);
            }
        }

        Ok(true)
    }

    /// Completes opens and closes whose transactions reached the minimum depth after the
    /// daemon stopped reporting on them.
    pub async fn monitor_confirmations(&self) -> Result<BatchReport, WorkflowError> {
        let pending: Vec<ChannelOperationRequest> = self.db.list_by_status(RequestStatus::OnChainConfirmationPending)?;
        let mut report = BatchReport::default();

        for request in pending {
            let id = request.id;
            report.record("Confirming channel operation", id, self.confirm_operation(request).await);
        }

        Ok(report)
    }

    async fn open_if_signed(&self, request_id: i64) -> Result<bool, WorkflowError> {
        let outcome = self.open_channel(request_id).await?;
        Ok(matches!(
            outcome,
            WorkflowOutcome::ChannelOpened(_) | WorkflowOutcome::Broadcast(_)
        ))
    }

    /// Opens channels whose funding templates carry every signature.
    pub async fn process_signed_opens(&self) -> Result<BatchReport, WorkflowError> {
        let waiting: Vec<ChannelOperationRequest> = self.db.list_by_status(RequestStatus::PSBTSignaturesPending)?;
        let mut report = BatchReport::default();

        for request in waiting.iter().filter(|r| r.request_type == OperationRequestType::Open) {
            report.record("Signed channel open", request.id, self.open_if_signed(request.id).await);
        }

        Ok(report)
    }

    async fn process_hot_wallet_open(&self, request: &ChannelOperationRequest) -> Result<bool, WorkflowError> {
        let Some(wallet_id) = request.wallet_id else {
            return Ok(false);
        };
        let wallet: Wallet = self.db.get(wallet_id)?;
        if !wallet.is_hot_wallet {
            return Ok(false);
        }

        if self.generate_template(request.id).await? != WorkflowOutcome::AwaitingSignatures {
            return Ok(false);
        }
        self.open_if_signed(request.id).await
    }

    /// Funds and opens pending channels of hot wallets, which need no external signatures.
    pub async fn process_hot_wallet_opens(&self) -> Result<BatchReport, WorkflowError> {
        let pending: Vec<ChannelOperationRequest> = self.db.list_by_status(RequestStatus::Pending)?;
        let mut report = BatchReport::default();

        for request in pending.iter().filter(|r| r.request_type == OperationRequestType::Open) {
            let result = self.process_hot_wallet_open(request).await;
            report.record("Hot wallet channel open", request.id, result);
        }

        Ok(report)
    }

    /// Starts every pending close.
    pub async fn process_close_requests(&self) -> Result<BatchReport, WorkflowError> {
        let pending: Vec<ChannelOperationRequest> = self.db.list_by_status(RequestStatus::Pending)?;
        let mut report = BatchReport::default();

        for request in pending.iter().filter(|r| r.request_type == OperationRequestType::Close) {
            let result = self.close_channel(request.id).await.map(|outcome| {
                matches!(
                    outcome,
                    WorkflowOutcome::ChannelClosed(_) | WorkflowOutcome::Broadcast(_)
                )
            });
            report.record("Channel close", request.id, result);
        }

        Ok(report)
    }
}
