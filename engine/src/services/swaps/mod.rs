pub mod forty_swap;
pub mod loop_client;
pub mod service;

pub use forty_swap::FortySwapClient;
pub use loop_client::LoopClient;
pub use service::SwapService;

use bitcoin::Amount;

use crate::error::SwapError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapState {
    Initiated,
    PreimageRevealed,
    HtlcPublished,
    Succeeded,
    Failed,
    InvoiceSettled,
    Unknown,
}

impl SwapState {
    pub fn is_final(&self) -> bool {
        matches!(self, SwapState::Succeeded | SwapState::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapOutParams {
    pub amount: Amount,
    /// On-chain address receiving the swapped funds.
    pub address: String,
    pub max_routing_fee: Amount,
    pub sweep_conf_target: i32,
    /// Short channel ids the off-chain payment may leave through.
    pub outgoing_chan_set: Vec<u64>,
    pub label: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapQuote {
    pub swap_fee: Amount,
    pub prepay_amount: Amount,
    pub miner_fee: Amount,
}

impl SwapQuote {
    pub fn total(&self) -> Amount {
        self.swap_fee + self.prepay_amount + self.miner_fee
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapInfo {
    pub id: String,
    pub amount: Amount,
    pub state: SwapState,
    pub htlc_address: Option<String>,
    /// Invoice the node pays to start the swap, when the provider hands one out.
    pub invoice: Option<String>,
    /// Hex preimage generated locally, present only on creation.
    pub preimage: Option<String>,
}

/// A swap-out service.
pub enum SwapProvider {
    Loop(LoopClient),
    FortySwap(FortySwapClient),
}

impl SwapProvider {
    pub fn name(&self) -> &'static str {
        match self {
            SwapProvider::Loop(_) => "loop",
            SwapProvider::FortySwap(_) => "40swap",
        }
    }

    pub async fn get_quote(&self, amount: Amount, conf_target: i32) -> Result<SwapQuote, SwapError> {
        match self {
            SwapProvider::Loop(client) => client.get_quote(amount, conf_target).await,
            SwapProvider::FortySwap(client) => client.get_quote(amount).await,
        }
    }

    pub async fn create_swap_out(&self, params: &SwapOutParams) -> Result<SwapInfo, SwapError> {
        tracing::info!("Requesting {} swap out of {} via {}", params.amount, params.address, self.name());
        match self {
            SwapProvider::Loop(client) => client.create_swap_out(params).await,
            SwapProvider::FortySwap(client) => client.create_swap_out(params).await,
        }
    }

    pub async fn get_swap(&self, id: &str) -> Result<SwapInfo, SwapError> {
        match self {
            SwapProvider::Loop(client) => client.get_swap(id).await,
            SwapProvider::FortySwap(client) => client.get_swap(id).await,
        }
    }
}
