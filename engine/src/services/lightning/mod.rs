pub mod lnd;
pub mod lnrpc;
pub mod pool;

pub use lnd::LndClient;
pub use pool::NodeChannelPool;

use async_trait::async_trait;
use bitcoin::psbt::Psbt;
use bitcoin::{Amount, OutPoint, Txid};
use futures::stream::BoxStream;

use crate::error::NodeError;
use crate::models::Node;

pub type UpdateStream<T> = BoxStream<'static, Result<T, NodeError>>;

#[derive(Debug, Clone)]
pub struct OpenChannelParams {
    /// Hex-encoded pubkey of the remote peer.
    pub node_pubkey: String,
    pub local_funding_amount: Amount,
    pub private: bool,
    pub close_address: Option<String>,
    pub sat_per_vbyte: u64,
    pub pending_chan_id: [u8; 32],
    /// Template PSBT handed to the daemon as the funding shim.
    pub base_psbt: Psbt,
}

/// Events emitted by the daemon while a PSBT-funded channel opens.
#[derive(Debug, Clone, PartialEq)]
pub enum OpenStatusUpdate {
    PsbtFund {
        funding_address: String,
        funding_amount: Amount,
        psbt: Psbt,
    },
    ChanPending {
        txid: Txid,
        output_index: u32,
    },
    ChanOpen {
        txid: Txid,
        output_index: u32,
    },
}

impl OpenStatusUpdate {
    pub fn name(&self) -> &'static str {
        match self {
            OpenStatusUpdate::PsbtFund { .. } => "PsbtFund",
            OpenStatusUpdate::ChanPending { .. } => "ChanPending",
            OpenStatusUpdate::ChanOpen { .. } => "ChanOpen",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FundingStep {
    Verify { funded_psbt: Psbt },
    Finalize { signed_psbt: Psbt },
    Cancel,
}

#[derive(Debug, Clone)]
pub struct CloseChannelParams {
    pub channel_point: OutPoint,
    pub force: bool,
    pub delivery_address: Option<String>,
    pub sat_per_vbyte: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseStatusUpdate {
    ClosePending { txid: Txid },
    ChanClose { txid: Txid, success: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub pubkey: String,
    pub alias: String,
    pub addresses: Vec<String>,
    pub num_channels: u32,
    pub total_capacity: Amount,
}

/// A Lightning node daemon. Every call authenticates with the node's macaroon.
#[async_trait]
pub trait LightningNode: Send + Sync {
    async fn open_channel(
        &self,
        node: &Node,
        params: OpenChannelParams,
    ) -> Result<UpdateStream<OpenStatusUpdate>, NodeError>;

    async fn funding_state_step(
        &self,
        node: &Node,
        pending_chan_id: [u8; 32],
        step: FundingStep,
    ) -> Result<(), NodeError>;

    async fn close_channel(
        &self,
        node: &Node,
        params: CloseChannelParams,
    ) -> Result<UpdateStream<CloseStatusUpdate>, NodeError>;

    async fn get_node_info(&self, node: &Node, pubkey: &str) -> Result<NodeInfo, NodeError>;

    async fn connect_peer(&self, node: &Node, pubkey: &str, host: &str) -> Result<(), NodeError>;
}
