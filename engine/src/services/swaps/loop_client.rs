use bitcoin::Amount;
use std::sync::Arc;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::Channel;

use super::{SwapInfo, SwapOutParams, SwapQuote, SwapState};
use crate::error::{NodeError, SwapError};
use crate::services::lightning::lnd::{authenticated, macaroon_value};
use crate::services::lightning::NodeChannelPool;

/// `looprpc` messages used by the swap client.
pub mod looprpc {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct LoopOutRequest {
        #[prost(int64, tag = "1")]
        pub amt: i64,
        #[prost(string, tag = "2")]
        pub dest: ::prost::alloc::string::String,
        #[prost(int64, tag = "3")]
        pub max_swap_routing_fee: i64,
        #[prost(int64, tag = "4")]
        pub max_prepay_routing_fee: i64,
        #[prost(int64, tag = "5")]
        pub max_swap_fee: i64,
        #[prost(int64, tag = "6")]
        pub max_prepay_amt: i64,
        #[prost(int64, tag = "7")]
        pub max_miner_fee: i64,
        #[prost(int32, tag = "9")]
        pub sweep_conf_target: i32,
        #[prost(uint64, repeated, tag = "11")]
        pub outgoing_chan_set: ::prost::alloc::vec::Vec<u64>,
        #[prost(string, tag = "12")]
        pub label: ::prost::alloc::string::String,
        #[prost(string, tag = "14")]
        pub initiator: ::prost::alloc::string::String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct SwapResponse {
        #[prost(string, tag = "1")]
        pub id: ::prost::alloc::string::String,
        #[prost(string, tag = "2")]
        pub htlc_address: ::prost::alloc::string::String,
        #[prost(bytes = "vec", tag = "3")]
        pub id_bytes: ::prost::alloc::vec::Vec<u8>,
        #[prost(string, tag = "6")]
        pub server_message: ::prost::alloc::string::String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct QuoteRequest {
        #[prost(int64, tag = "1")]
        pub amt: i64,
        #[prost(int32, tag = "2")]
        pub conf_target: i32,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct OutQuoteResponse {
        #[prost(int64, tag = "1")]
        pub swap_fee_sat: i64,
        #[prost(int64, tag = "2")]
        pub prepay_amt_sat: i64,
        #[prost(int64, tag = "3")]
        pub htlc_sweep_fee_sat: i64,
        #[prost(bytes = "vec", tag = "4")]
        pub swap_payment_dest: ::prost::alloc::vec::Vec<u8>,
        #[prost(int32, tag = "5")]
        pub cltv_delta: i32,
        #[prost(int32, tag = "6")]
        pub conf_target: i32,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct SwapInfoRequest {
        #[prost(bytes = "vec", tag = "1")]
        pub id: ::prost::alloc::vec::Vec<u8>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct SwapStatus {
        #[prost(int64, tag = "1")]
        pub amt: i64,
        #[prost(string, tag = "2")]
        pub id: ::prost::alloc::string::String,
        #[prost(int32, tag = "3")]
        pub r#type: i32,
        #[prost(int32, tag = "4")]
        pub state: i32,
        #[prost(int64, tag = "5")]
        pub initiation_time: i64,
        #[prost(int64, tag = "6")]
        pub last_update_time: i64,
        #[prost(string, tag = "7")]
        pub htlc_address: ::prost::alloc::string::String,
        #[prost(int64, tag = "8")]
        pub cost_server: i64,
        #[prost(int64, tag = "9")]
        pub cost_onchain: i64,
        #[prost(int64, tag = "10")]
        pub cost_offchain: i64,
        #[prost(bytes = "vec", tag = "11")]
        pub id_bytes: ::prost::alloc::vec::Vec<u8>,
    }
}

pub fn swap_state(state: i32) -> SwapState {
    match state {
        0 => SwapState::Initiated,
        1 => SwapState::PreimageRevealed,
        2 => SwapState::HtlcPublished,
        3 => SwapState::Succeeded,
        4 => SwapState::Failed,
        5 => SwapState::InvoiceSettled,
        _ => SwapState::Unknown,
    }
}

fn sats(value: i64) -> Amount {
    Amount::from_sat(value.max(0) as u64)
}

/// Client for a Loop daemon, sharing the node channel pool.
pub struct LoopClient {
    pool: Arc<NodeChannelPool>,
    endpoint: String,
    macaroon: Option<String>,
}

impl LoopClient {
    pub fn new(pool: Arc<NodeChannelPool>, endpoint: String, macaroon: Option<String>) -> Self {
        Self {
            pool,
            endpoint,
            macaroon,
        }
    }

    async fn connect(&self) -> Result<(tonic::client::Grpc<Channel>, MetadataValue<Ascii>), NodeError> {
        let macaroon = macaroon_value("loop", self.macaroon.as_deref())?;
        let channel = self.pool.get_or_create(&self.endpoint, None)?;

        let mut grpc = tonic::client::Grpc::new(channel);
        grpc.ready().await?;
        Ok((grpc, macaroon))
    }

    async fn unary<Req, Resp>(&self, path: &'static str, msg: Req) -> Result<Resp, NodeError>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let (mut grpc, macaroon) = self.connect().await?;
        let codec: ProstCodec<Req, Resp> = ProstCodec::default();
        let response = grpc
            .unary(authenticated(msg, &macaroon), PathAndQuery::from_static(path), codec)
            .await?;
        Ok(response.into_inner())
    }

    pub async fn get_quote(&self, amount: Amount, conf_target: i32) -> Result<SwapQuote, SwapError> {
        let response: looprpc::OutQuoteResponse = self
            .unary(
                "/looprpc.SwapClient/LoopOutQuote",
                looprpc::QuoteRequest {
                    amt: amount.to_sat() as i64,
                    conf_target,
                },
            )
            .await?;

        Ok(SwapQuote {
            swap_fee: sats(response.swap_fee_sat),
            prepay_amount: sats(response.prepay_amt_sat),
            miner_fee: sats(response.htlc_sweep_fee_sat),
        })
    }

    pub async fn create_swap_out(&self, params: &SwapOutParams) -> Result<SwapInfo, SwapError> {
        let quote = self.get_quote(params.amount, params.sweep_conf_target).await?;
        let request = loop_out_request(params, &quote);

        let response: looprpc::SwapResponse = self.unary("/looprpc.SwapClient/LoopOut", request).await?;
        if !response.server_message.is_empty() {
            tracing::info!("Loop server message for swap {}: {}", response.id, response.server_message);
        }
        tracing::info!("Created loop out {} for {}", response.id, params.amount);

        Ok(SwapInfo {
            id: response.id,
            amount: params.amount,
            state: SwapState::Initiated,
            htlc_address: Some(response.htlc_address).filter(|a| !a.is_empty()),
            invoice: None,
            preimage: None,
        })
    }

    pub async fn get_swap(&self, id: &str) -> Result<SwapInfo, SwapError> {
        let id_bytes = hex::decode(id).map_err(|e| SwapError::InvalidResponse(format!("swap id {}: {}", id, e)))?;
        let status: looprpc::SwapStatus = self
            .unary("/looprpc.SwapClient/SwapInfo", looprpc::SwapInfoRequest { id: id_bytes })
            .await?;

        Ok(SwapInfo {
            id: status.id,
            amount: sats(status.amt),
            state: swap_state(status.state),
            htlc_address: Some(status.htlc_address).filter(|a| !a.is_empty()),
            invoice: None,
            preimage: None,
        })
    }
}

/// The loop out request, with fee limits taken from the quote.
pub fn loop_out_request(params: &SwapOutParams, quote: &SwapQuote) -> looprpc::LoopOutRequest {
    looprpc::LoopOutRequest {
        amt: params.amount.to_sat() as i64,
        dest: params.address.clone(),
        max_swap_routing_fee: params.max_routing_fee.to_sat() as i64,
        max_prepay_routing_fee: params.max_routing_fee.to_sat() as i64,
        max_swap_fee: quote.swap_fee.to_sat() as i64,
        max_prepay_amt: quote.prepay_amount.to_sat() as i64,
        max_miner_fee: quote.miner_fee.to_sat() as i64,
        sweep_conf_target: params.sweep_conf_target,
        outgoing_chan_set: params.outgoing_chan_set.clone(),
        label: params.label.clone().unwrap_or_default(),
        initiator: "treasury-engine".to_string(),
    }
}
