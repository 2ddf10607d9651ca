use bitcoin::psbt::Psbt;
use bitcoin::{Address, Amount, Network, Txid};
use std::str::FromStr;
use std::sync::Arc;

use super::chain::{ChainIndex, TrackTarget};
use super::onchain::transaction_builder::record_template_error;
use super::onchain::{
    CoinSelectionStrategy, FeeEstimator, Replacement, TemplateKind, TemplateOutcome, TemplateRequest, TransactionBuilder,
};
use super::signing::SigningCoordinator;
use super::{not_actionable, BatchReport, WorkflowOutcome};
use crate::error::{SigningError, WorkflowError};
use crate::models::{RequestStatus, SpendRequest, StatusLogEntry, Wallet, WalletWithdrawalRequest};
use crate::storage::DbManager;

pub struct WithdrawalService {
    db: Arc<DbManager>,
    chain: Arc<dyn ChainIndex>,
    builder: Arc<TransactionBuilder>,
    fee_estimator: Arc<FeeEstimator>,
    coordinator: Arc<SigningCoordinator>,
    network: Network,
    strategy: CoinSelectionStrategy,
    min_confirmations: u32,
}

impl WithdrawalService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<DbManager>,
        chain: Arc<dyn ChainIndex>,
        builder: Arc<TransactionBuilder>,
        fee_estimator: Arc<FeeEstimator>,
        coordinator: Arc<SigningCoordinator>,
        network: Network,
        strategy: CoinSelectionStrategy,
        min_confirmations: u32,
    ) -> Self {
        Self {
            db,
            chain,
            builder,
            fee_estimator,
            coordinator,
            network,
            strategy,
            min_confirmations,
        }
    }

    fn parse_destinations(&self, request: &WalletWithdrawalRequest) -> Result<Vec<(Address, Amount)>, WorkflowError> {
        if request.destinations.is_empty() {
            return Err(WorkflowError::InvalidRequest(format!(
                "Withdrawal {} has no destinations",
                request.id
            )));
        }

        request
            .destinations
            .iter()
            .map(|d| {
                let address = Address::from_str(&d.address)
                    .map_err(|e| WorkflowError::InvalidRequest(format!("{}: {}", d.address, e)))?
                    .require_network(self.network)
                    .map_err(|e| WorkflowError::InvalidRequest(format!("{}: {}", d.address, e)))?;
                Ok((address, Amount::from_sat(d.amount_sats)))
            })
            .collect()
    }

    /// Builds or reuses the withdrawal's template and moves it to `PSBTSignaturesPending`.
    pub async fn generate_template(&self, request_id: i64) -> Result<WorkflowOutcome, WorkflowError> {
        let mut request: WalletWithdrawalRequest = self.db.get(request_id)?;
        if let Some(outcome) = not_actionable(&request) {
            return Ok(outcome);
        }

        let wallet: Wallet = self.db.get(request.wallet_id)?;
        let destinations = self.parse_destinations(&request)?;
        let fee_rate = self
            .fee_estimator
            .fee_rate(request.fees_type, request.custom_fee_rate)
            .await?;

        let replacing = match request.bumping_request_id {
            Some(bumped_id) => match self.replacement_for(bumped_id) {
                Ok(replacement) => Some(replacement),
                Err(e) => {
                    request.log(StatusLogEntry::error(format!("Cannot bump withdrawal {}: {}", bumped_id, e)));
                    self.db.update(&request)?;
                    return Err(e);
                }
            },
            None => None,
        };

        let outcome = self
            .builder
            .build_template(TemplateRequest {
                request: request.request_ref(),
                wallet: &wallet,
                kind: TemplateKind::Withdrawal { destinations },
                spend_all: request.withdraw_all_funds,
                fee_rate,
                selected_outpoints: &request.selected_outpoints,
                strategy: self.strategy,
                replacing,
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

        if request.withdraw_all_funds {
            for destination in request.destinations.iter_mut() {
                destination.amount_sats = template.send_amount.to_sat();
            }
        }

        if request.status != RequestStatus::PSBTSignaturesPending {
            request.set_status(RequestStatus::PSBTSignaturesPending);
            request.log(StatusLogEntry::info(format!(
                "Template PSBT ready: {} inputs, fee {}",
                template.psbt.inputs.len(),
                template.fee
            )));
        }
        self.db.update(&request)?;

        Ok(WorkflowOutcome::AwaitingSignatures)
    }

    /// The transaction of withdrawal `bumped_id`, which a fee bump must spend in full.
    ///
    /// Only a withdrawal that is signed or broadcast but unconfirmed can be replaced.
    fn replacement_for(&self, bumped_id: i64) -> Result<Replacement, WorkflowError> {
        let bumped: WalletWithdrawalRequest = self.db.get(bumped_id)?;
        if !matches!(
            bumped.status,
            RequestStatus::PSBTSignaturesPending | RequestStatus::OnChainConfirmationPending
        ) {
            return Err(WorkflowError::InvalidRequest(format!(
                "withdrawal {} is {} and cannot be replaced",
                bumped.id, bumped.status
            )));
        }

        let template = self
            .db
            .get_template_psbt(bumped.request_ref())?
            .ok_or_else(|| SigningError::MissingTemplate(bumped.request_ref().to_string()))?;
        let psbt = Psbt::from_str(&template.psbt).map_err(|e| SigningError::InvalidPsbt(e.to_string()))?;

        Ok(Replacement {
            request: bumped.request_ref(),
            psbt,
        })
    }

    /// Marks the withdrawal a broadcast fee bump replaced.
    fn mark_replaced(&self, bumped_id: i64, replacement: &WalletWithdrawalRequest, txid: Txid) -> Result<(), WorkflowError> {
        let mut bumped: WalletWithdrawalRequest = self.db.get(bumped_id)?;
        bumped.set_status(RequestStatus::Replaced);
        bumped.log(StatusLogEntry::info(format!(
            "Replaced by withdrawal {} in transaction {}",
            replacement.id, txid
        )));
        self.db.update(&bumped)?;
        tracing::info!("Withdrawal {} replaced by {} ({})", bumped_id, replacement.id, txid);
        Ok(())
    }

    pub fn submit_signed_psbt(&self, request_id: i64, user_id: &str, psbt: &str) -> Result<bool, WorkflowError> {
        let request: WalletWithdrawalRequest = self.db.get(request_id)?;
        if request.status != RequestStatus::PSBTSignaturesPending {
            return Err(WorkflowError::InvalidRequest(format!(
                "Withdrawal {} is {} and does not accept signatures",
                request.id, request.status
            )));
        }

        self.coordinator.submit_signed_psbt(request.request_ref(), user_id, psbt)?;
        self.signatures_collected(request_id)
    }

    pub fn signatures_collected(&self, request_id: i64) -> Result<bool, WorkflowError> {
        let request: WalletWithdrawalRequest = self.db.get(request_id)?;
        let wallet: Wallet = self.db.get(request.wallet_id)?;
        Ok(self.coordinator.signatures_collected(&wallet, request.request_ref())?)
    }

    /// Completes the signature set, finalizes and broadcasts.
    pub async fn perform_withdrawal(&self, request_id: i64) -> Result<WorkflowOutcome, WorkflowError> {
        let mut request: WalletWithdrawalRequest = self.db.get(request_id)?;
        if let Some(outcome) = not_actionable(&request) {
            return Ok(outcome);
        }

        let wallet: Wallet = self.db.get(request.wallet_id)?;
        let finalized = self
            .coordinator
            .sign_and_finalize(&wallet, request.request_ref())
            .await?;
        let txid = finalized.tx.compute_txid();

        let result = self.chain.broadcast(&finalized.tx).await?;
        if !result.success {
            let code = result.rpc_code.unwrap_or_default();
            let message = result.rpc_message.unwrap_or_default();
            tracing::error!("Broadcast of {} for withdrawal {} rejected: {} {}", txid, request.id, code, message);

            request.log(StatusLogEntry::error(format!("Broadcast rejected ({}): {}", code, message)));
            self.db.update(&request)?;
            return Err(SigningError::BroadcastRejected { code, message }.into());
        }

        request.tx_id = Some(txid);
        request.set_status(RequestStatus::OnChainConfirmationPending);
        request.log(StatusLogEntry::info(format!("Broadcast transaction {}", txid)));
        self.db.update(&request)?;
        tracing::info!("Withdrawal {} broadcast as {}", request.id, txid);

        if let Some(bumped_id) = request.bumping_request_id {
            if let Err(e) = self.mark_replaced(bumped_id, &request, txid) {
                tracing::error!("Failed to mark withdrawal {} replaced by {}: {}", bumped_id, request.id, e);
            }
        }

        let mut targets = vec![TrackTarget::Descriptor(wallet.wallet_descriptor()?)];
        targets.extend(self.parse_destinations(&request)?.into_iter().map(|(a, _)| TrackTarget::Address(a)));
        for target in targets {
            if let Err(e) = self.chain.track(target).await {
                tracing::warn!("Failed to track withdrawal {} output: {}", request.id, e);
            }
        }

        Ok(WorkflowOutcome::Broadcast(txid))
    }

    async fn confirm_withdrawal(&self, mut request: WalletWithdrawalRequest) -> Result<bool, WorkflowError> {
        let Some(txid) = request.tx_id else {
            tracing::warn!("Withdrawal {} is awaiting confirmation without a txid", request.id);
            return Ok(false);
        };

        let Some(status) = self.chain.get_transaction(&txid).await? else {
            tracing::debug!("Transaction {} not yet seen by the chain index", txid);
            return Ok(false);
        };

        if status.confirmations < self.min_confirmations {
            return Ok(false);
        }

        request.set_status(RequestStatus::OnChainConfirmed);
        request.log(StatusLogEntry::info(format!(
            "Transaction {} confirmed with {} confirmations",
            txid, status.confirmations
        )));
        self.db.update(&request)?;
        tracing::info!("Withdrawal {} confirmed", request.id);
        Ok(true)
    }

    /// Confirms broadcast withdrawals that reached the minimum depth.
    pub async fn monitor_confirmations(&self) -> Result<BatchReport, WorkflowError> {
        let pending: Vec<WalletWithdrawalRequest> = self.db.list_by_status(RequestStatus::OnChainConfirmationPending)?;
        let mut report = BatchReport::default();

        for request in pending {
            let id = request.id;
            report.record("Confirming withdrawal", id, self.confirm_withdrawal(request).await);
        }

        Ok(report)
    }

    async fn perform_if_signed(&self, request_id: i64) -> Result<bool, WorkflowError> {
        if !self.signatures_collected(request_id)? {
            return Ok(false);
        }
        let outcome = self.perform_withdrawal(request_id).await?;
        Ok(matches!(outcome, WorkflowOutcome::Broadcast(_)))
    }

    /// Broadcasts withdrawals whose signers have all submitted.
    pub async fn process_signed_withdrawals(&self) -> Result<BatchReport, WorkflowError> {
        let waiting: Vec<WalletWithdrawalRequest> = self.db.list_by_status(RequestStatus::PSBTSignaturesPending)?;
        let mut report = BatchReport::default();

        for request in waiting {
            report.record("Signed withdrawal", request.id, self.perform_if_signed(request.id).await);
        }

        Ok(report)
    }

    async fn process_hot_wallet_withdrawal(&self, request: &WalletWithdrawalRequest) -> Result<bool, WorkflowError> {
        let wallet: Wallet = self.db.get(request.wallet_id)?;
        if !wallet.is_hot_wallet {
            return Ok(false);
        }

        if self.generate_template(request.id).await? != WorkflowOutcome::AwaitingSignatures {
            return Ok(false);
        }

        let outcome = self.perform_withdrawal(request.id).await?;
        Ok(matches!(outcome, WorkflowOutcome::Broadcast(_)))
    }

    /// Hot wallets sign alone, so their withdrawals go straight from template to broadcast.
    pub async fn process_hot_wallet_withdrawals(&self) -> Result<BatchReport, WorkflowError> {
        let pending: Vec<WalletWithdrawalRequest> = self.db.list_by_status(RequestStatus::Pending)?;
        let mut report = BatchReport::default();

        for request in pending {
            let result = self.process_hot_wallet_withdrawal(&request).await;
            report.record("Hot wallet withdrawal", request.id, result);
        }

        Ok(report)
    }
}
