pub mod chain;
pub mod channel_open;
pub mod channels;
pub mod lightning;
pub mod onchain;
pub mod signing;
pub mod swaps;
pub mod withdrawals;

use anyhow::Result;
use bitcoin::Txid;
use std::sync::Arc;

use crate::config::Config;
use crate::models::{RequestStatus, SpendRequest};
use crate::storage::{DbManager, KeyManager};
use chain::{ChainIndex, EsploraChainIndex};
use channel_open::ChannelOpenDriver;
use channels::ChannelService;
use lightning::{LightningNode, LndClient, NodeChannelPool};
use onchain::{FeeEstimator, TransactionBuilder, UtxoManager};
use signing::{InternalSigner, LocalSigner, RemoteSigner, SigningCoordinator};
use swaps::{FortySwapClient, LoopClient, SwapProvider, SwapService};
use withdrawals::WithdrawalService;

/// Where a request workflow stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowOutcome {
    /// The request is in a status the step does not act on.
    NotActionable(RequestStatus),
    NotFullySynced,
    AwaitingSignatures,
    Broadcast(Txid),
    ChannelOpened(i64),
    ChannelClosed(Txid),
}

/// Tally of one pass over a batch of requests.
///
/// A request whose step fails is counted and skipped so the rest of the batch still runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Requests the pass moved forward.
    pub advanced: usize,
    pub failed: usize,
}

impl BatchReport {
    pub(crate) fn record<E: std::fmt::Display>(&mut self, what: &str, id: i64, result: Result<bool, E>) {
        match result {
            Ok(true) => self.advanced += 1,
            Ok(false) => {}
            Err(e) => {
                tracing::error!("{} {} failed: {}", what, id, e);
                self.failed += 1;
            }
        }
    }
}

/// Logs and returns the outcome for a request that must not be processed.
pub(crate) fn not_actionable<R: SpendRequest>(request: &R) -> Option<WorkflowOutcome> {
    let status = request.status();
    if status.is_actionable() {
        return None;
    }

    tracing::error!("{} is {}, skipping", request.request_ref(), status);
    Some(WorkflowOutcome::NotActionable(status))
}

/// Owns every long-lived service; handed to the job loop.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub db_manager: Arc<DbManager>,
    pub key_manager: Arc<KeyManager>,
    pub chain: Arc<dyn ChainIndex>,
    pub node_pool: Arc<NodeChannelPool>,
    pub lightning: Arc<dyn LightningNode>,
    pub utxo_manager: Arc<UtxoManager>,
    pub fee_estimator: Arc<FeeEstimator>,
    pub transaction_builder: Arc<TransactionBuilder>,
    pub coordinator: Arc<SigningCoordinator>,
    pub withdrawals: Arc<WithdrawalService>,
    pub channels: Arc<ChannelService>,
    pub swaps: Arc<SwapService>,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self> {
        let network = config.network;

        let db_manager = Arc::new(DbManager::new(&config.db_path())?);
        let key_manager = Arc::new(KeyManager::new(network));

        let chain: Arc<dyn ChainIndex> = Arc::new(EsploraChainIndex::new(
            &config.esplora_url,
            network,
            config.gap_limit,
            config.max_tip_age,
        )?);

        let node_pool = Arc::new(NodeChannelPool::new());
        let lightning: Arc<dyn LightningNode> = Arc::new(LndClient::new(node_pool.clone()));

        let utxo_manager = Arc::new(UtxoManager::new(db_manager.clone(), chain.clone(), network));
        let fee_estimator = Arc::new(FeeEstimator::new(chain.clone(), config.mempool_api_url.clone()));
        let transaction_builder = Arc::new(TransactionBuilder::new(
            db_manager.clone(),
            chain.clone(),
            utxo_manager.clone(),
            network,
        ));

        let signer = match &config.remote_signer {
            Some(remote) => {
                tracing::info!("Internal wallet signs through remote signer {}", remote.endpoint);
                InternalSigner::Remote(RemoteSigner::new(remote, network))
            }
            None => InternalSigner::Local(LocalSigner::new(db_manager.clone(), key_manager.clone())),
        };
        let coordinator = Arc::new(SigningCoordinator::new(db_manager.clone(), signer));

        let withdrawals = Arc::new(WithdrawalService::new(
            db_manager.clone(),
            chain.clone(),
            transaction_builder.clone(),
            fee_estimator.clone(),
            coordinator.clone(),
            network,
            config.coin_selection_strategy,
            config.minimum_withdrawal_confirmations,
        ));

        let driver = ChannelOpenDriver::new(db_manager.clone(), lightning.clone(), coordinator.clone(), network);
        let channels = Arc::new(ChannelService::new(
            db_manager.clone(),
            chain.clone(),
            transaction_builder.clone(),
            fee_estimator.clone(),
            coordinator.clone(),
            lightning.clone(),
            driver,
            config.coin_selection_strategy,
            config.minimum_channel_confirmations,
        ));

        let mut swap_providers = Vec::new();
        if let Some(endpoint) = &config.loop_endpoint {
            swap_providers.push(Arc::new(SwapProvider::Loop(LoopClient::new(
                node_pool.clone(),
                endpoint.clone(),
                config.loop_macaroon.clone(),
            ))));
        }
        if let Some(url) = &config.fortyswap_url {
            swap_providers.push(Arc::new(SwapProvider::FortySwap(FortySwapClient::new(url.clone()))));
        }
        let swaps = Arc::new(SwapService::new(db_manager.clone(), swap_providers));

        tracing::info!("Services initialized on {}", network);

        Ok(Self {
            config,
            db_manager,
            key_manager,
            chain,
            node_pool,
            lightning,
            utxo_manager,
            fee_estimator,
            transaction_builder,
            coordinator,
            withdrawals,
            channels,
            swaps,
        })
    }
}
