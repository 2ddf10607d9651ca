use async_trait::async_trait;
use bitcoin::hashes::Hash;
use bitcoin::psbt::Psbt;
use bitcoin::{Amount, Txid};
use futures::StreamExt;
use std::str::FromStr;
use std::sync::Arc;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::Channel;

use super::lnrpc;
use super::pool::NodeChannelPool;
use super::{
    CloseChannelParams, CloseStatusUpdate, FundingStep, LightningNode, NodeInfo, OpenChannelParams,
    OpenStatusUpdate, UpdateStream,
};
use crate::error::NodeError;
use crate::models::Node;

/// Wraps `msg` in a request carrying the node's macaroon.
pub(crate) fn authenticated<T>(msg: T, macaroon: &MetadataValue<Ascii>) -> tonic::Request<T> {
    let mut request = tonic::Request::new(msg);
    request.metadata_mut().insert("macaroon", macaroon.clone());
    request
}

pub(crate) fn macaroon_value(node_name: &str, macaroon: Option<&str>) -> Result<MetadataValue<Ascii>, NodeError> {
    let macaroon = macaroon.ok_or_else(|| NodeError::InvalidMacaroon(format!("{} has no macaroon", node_name)))?;
    MetadataValue::try_from(macaroon).map_err(|e| NodeError::InvalidMacaroon(e.to_string()))
}

fn txid_from_bytes(bytes: &[u8]) -> Result<Txid, NodeError> {
    Txid::from_slice(bytes).map_err(|e| NodeError::UnexpectedResponse(format!("Invalid txid bytes: {}", e)))
}

fn channel_point_txid(point: &lnrpc::ChannelPoint) -> Result<Txid, NodeError> {
    match &point.funding_txid {
        Some(lnrpc::channel_point::FundingTxid::FundingTxidBytes(bytes)) => txid_from_bytes(bytes),
        Some(lnrpc::channel_point::FundingTxid::FundingTxidStr(s)) => {
            Txid::from_str(s).map_err(|e| NodeError::UnexpectedResponse(format!("Invalid funding txid {}: {}", s, e)))
        }
        None => Err(NodeError::UnexpectedResponse("Channel point without funding txid".to_string())),
    }
}

pub(crate) fn open_update_from_proto(update: lnrpc::OpenStatusUpdate) -> Result<Option<OpenStatusUpdate>, NodeError> {
    use lnrpc::open_status_update::Update;

    let update = match update.update {
        Some(Update::PsbtFund(fund)) => OpenStatusUpdate::PsbtFund {
            funding_address: fund.funding_address,
            funding_amount: Amount::from_sat(fund.funding_amount.max(0) as u64),
            psbt: Psbt::deserialize(&fund.psbt)
                .map_err(|e| NodeError::UnexpectedResponse(format!("Invalid funding PSBT: {}", e)))?,
        },
        Some(Update::ChanPending(pending)) => OpenStatusUpdate::ChanPending {
            txid: txid_from_bytes(&pending.txid)?,
            output_index: pending.output_index,
        },
        Some(Update::ChanOpen(open)) => {
            let point = open
                .channel_point
                .ok_or_else(|| NodeError::UnexpectedResponse("ChanOpen without channel point".to_string()))?;
            OpenStatusUpdate::ChanOpen {
                txid: channel_point_txid(&point)?,
                output_index: point.output_index,
            }
        }
        None => return Ok(None),
    };

    Ok(Some(update))
}

pub(crate) fn close_update_from_proto(update: lnrpc::CloseStatusUpdate) -> Result<Option<CloseStatusUpdate>, NodeError> {
    use lnrpc::close_status_update::Update;

    Ok(match update.update {
        Some(Update::ClosePending(pending)) => Some(CloseStatusUpdate::ClosePending {
            txid: txid_from_bytes(&pending.txid)?,
        }),
        Some(Update::ChanClose(close)) => Some(CloseStatusUpdate::ChanClose {
            txid: txid_from_bytes(&close.closing_txid)?,
            success: close.success,
        }),
        None => None,
    })
}

/// `lnd` client over pooled tonic channels.
pub struct LndClient {
    pool: Arc<NodeChannelPool>,
}

impl LndClient {
    pub fn new(pool: Arc<NodeChannelPool>) -> Self {
        Self { pool }
    }

    async fn connect(&self, node: &Node) -> Result<(tonic::client::Grpc<Channel>, MetadataValue<Ascii>), NodeError> {
        let endpoint = node
            .endpoint
            .as_deref()
            .ok_or_else(|| NodeError::MissingEndpoint(node.name.clone()))?;
        let macaroon = macaroon_value(&node.name, node.macaroon.as_deref())?;

        let channel = self.pool.get_or_create(endpoint, node.tls_cert.as_deref())?;
        let mut grpc = tonic::client::Grpc::new(channel);
        grpc.ready().await?;

        Ok((grpc, macaroon))
    }
}

#[async_trait]
impl LightningNode for LndClient {
    async fn open_channel(
        &self,
        node: &Node,
        params: OpenChannelParams,
    ) -> Result<UpdateStream<OpenStatusUpdate>, NodeError> {
        let (mut grpc, macaroon) = self.connect(node).await?;

        let node_pubkey = hex::decode(&params.node_pubkey)
            .map_err(|e| NodeError::UnexpectedResponse(format!("Invalid peer pubkey {}: {}", params.node_pubkey, e)))?;

        let request = lnrpc::OpenChannelRequest {
            sat_per_vbyte: params.sat_per_vbyte,
            node_pubkey,
            local_funding_amount: params.local_funding_amount.to_sat() as i64,
            private: params.private,
            close_address: params.close_address.unwrap_or_default(),
            funding_shim: Some(lnrpc::FundingShim {
                shim: Some(lnrpc::funding_shim::Shim::PsbtShim(lnrpc::PsbtShim {
                    pending_chan_id: params.pending_chan_id.to_vec(),
                    base_psbt: params.base_psbt.serialize(),
                    no_publish: false,
                })),
            }),
        };

        tracing::info!(
            "Opening channel of {} from {} to {}",
            params.local_funding_amount,
            node.name,
            params.node_pubkey
        );

        let codec: ProstCodec<lnrpc::OpenChannelRequest, lnrpc::OpenStatusUpdate> = ProstCodec::default();
        let path = PathAndQuery::from_static("/lnrpc.Lightning/OpenChannel");
        let stream = grpc
            .server_streaming(authenticated(request, &macaroon), path, codec)
            .await?
            .into_inner();

        Ok(stream
            .filter_map(|item| async move {
                match item {
                    Ok(update) => open_update_from_proto(update).transpose(),
                    Err(status) => Some(Err(NodeError::from(status))),
                }
            })
            .boxed())
    }

    async fn funding_state_step(
        &self,
        node: &Node,
        pending_chan_id: [u8; 32],
        step: FundingStep,
    ) -> Result<(), NodeError> {
        use lnrpc::funding_transition_msg::Trigger;

        let (mut grpc, macaroon) = self.connect(node).await?;

        let trigger = match step {
            FundingStep::Verify { funded_psbt } => Trigger::PsbtVerify(lnrpc::FundingPsbtVerify {
                funded_psbt: funded_psbt.serialize(),
                pending_chan_id: pending_chan_id.to_vec(),
                skip_finalize: false,
            }),
            FundingStep::Finalize { signed_psbt } => Trigger::PsbtFinalize(lnrpc::FundingPsbtFinalize {
                signed_psbt: signed_psbt.serialize(),
                pending_chan_id: pending_chan_id.to_vec(),
                final_raw_tx: Vec::new(),
            }),
            FundingStep::Cancel => Trigger::ShimCancel(lnrpc::FundingShimCancel {
                pending_chan_id: pending_chan_id.to_vec(),
            }),
        };

        let request = lnrpc::FundingTransitionMsg { trigger: Some(trigger) };
        let codec: ProstCodec<lnrpc::FundingTransitionMsg, lnrpc::FundingStateStepResp> = ProstCodec::default();
        let path = PathAndQuery::from_static("/lnrpc.Lightning/FundingStateStep");
        grpc.unary(authenticated(request, &macaroon), path, codec).await?;

        Ok(())
    }

    async fn close_channel(
        &self,
        node: &Node,
        params: CloseChannelParams,
    ) -> Result<UpdateStream<CloseStatusUpdate>, NodeError> {
        let (mut grpc, macaroon) = self.connect(node).await?;

        let request = lnrpc::CloseChannelRequest {
            channel_point: Some(lnrpc::ChannelPoint {
                output_index: params.channel_point.vout,
                funding_txid: Some(lnrpc::channel_point::FundingTxid::FundingTxidStr(
                    params.channel_point.txid.to_string(),
                )),
            }),
            force: params.force,
            target_conf: 0,
            delivery_address: params.delivery_address.unwrap_or_default(),
            sat_per_vbyte: params.sat_per_vbyte.unwrap_or_default(),
        };

        tracing::info!("Closing channel {} on {} (force: {})", params.channel_point, node.name, params.force);

        let codec: ProstCodec<lnrpc::CloseChannelRequest, lnrpc::CloseStatusUpdate> = ProstCodec::default();
        let path = PathAndQuery::from_static("/lnrpc.Lightning/CloseChannel");
        let stream = grpc
            .server_streaming(authenticated(request, &macaroon), path, codec)
            .await?
            .into_inner();

        Ok(stream
            .filter_map(|item| async move {
                match item {
                    Ok(update) => close_update_from_proto(update).transpose(),
                    Err(status) => Some(Err(NodeError::from(status))),
                }
            })
            .boxed())
    }

    async fn get_node_info(&self, node: &Node, pubkey: &str) -> Result<NodeInfo, NodeError> {
        let (mut grpc, macaroon) = self.connect(node).await?;

        let request = lnrpc::NodeInfoRequest {
            pub_key: pubkey.to_string(),
            include_channels: false,
        };
        let codec: ProstCodec<lnrpc::NodeInfoRequest, lnrpc::NodeInfo> = ProstCodec::default();
        let path = PathAndQuery::from_static("/lnrpc.Lightning/GetNodeInfo");
        let info = grpc.unary(authenticated(request, &macaroon), path, codec).await?.into_inner();

        let graph_node = info
            .node
            .ok_or_else(|| NodeError::UnexpectedResponse(format!("No graph entry for {}", pubkey)))?;

        Ok(NodeInfo {
            pubkey: graph_node.pub_key,
            alias: graph_node.alias,
            addresses: graph_node.addresses.into_iter().map(|a| a.addr).collect(),
            num_channels: info.num_channels,
            total_capacity: Amount::from_sat(info.total_capacity.max(0) as u64),
        })
    }

    async fn connect_peer(&self, node: &Node, pubkey: &str, host: &str) -> Result<(), NodeError> {
        let (mut grpc, macaroon) = self.connect(node).await?;

        let request = lnrpc::ConnectPeerRequest {
            addr: Some(lnrpc::LightningAddress {
                pubkey: pubkey.to_string(),
                host: host.to_string(),
            }),
            perm: false,
            timeout: 30,
        };
        let codec: ProstCodec<lnrpc::ConnectPeerRequest, lnrpc::ConnectPeerResponse> = ProstCodec::default();
        let path = PathAndQuery::from_static("/lnrpc.Lightning/ConnectPeer");
        grpc.unary(authenticated(request, &macaroon), path, codec).await?;

        tracing::info!("Connected {} to peer {}@{}", node.name, pubkey, host);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils;

    #[test]
    fn test_pending_update_keeps_internal_txid_byte_order() {
        let txid = test_utils::outpoint(5, 0).txid;
        let update = lnrpc::OpenStatusUpdate {
            pending_chan_id: vec![0; 32],
            update: Some(lnrpc::open_status_update::Update::ChanPending(lnrpc::PendingUpdate {
                txid: txid.to_byte_array().to_vec(),
                output_index: 1,
            })),
        };

        assert_eq!(
            open_update_from_proto(update).unwrap(),
            Some(OpenStatusUpdate::ChanPending { txid, output_index: 1 })
        );
    }

    #[test]
    fn test_chan_open_accepts_string_txid() {
        let txid = test_utils::outpoint(6, 0).txid;
        let update = lnrpc::OpenStatusUpdate {
            pending_chan_id: vec![0; 32],
            update: Some(lnrpc::open_status_update::Update::ChanOpen(lnrpc::ChannelOpenUpdate {
                channel_point: Some(lnrpc::ChannelPoint {
                    output_index: 0,
                    funding_txid: Some(lnrpc::channel_point::FundingTxid::FundingTxidStr(txid.to_string())),
                }),
            })),
        };

        assert_eq!(
            open_update_from_proto(update).unwrap(),
            Some(OpenStatusUpdate::ChanOpen { txid, output_index: 0 })
        );
    }

    #[test]
    fn test_empty_updates_are_skipped() {
        let update = lnrpc::CloseStatusUpdate { update: None };
        assert_eq!(close_update_from_proto(update).unwrap(), None);
    }

    #[test]
    fn test_macaroon_is_required() {
        assert!(matches!(macaroon_value("alice", None), Err(NodeError::InvalidMacaroon(_))));
        assert!(macaroon_value("alice", Some("0201036c6e64")).is_ok());
    }

    #[tokio::test]
    async fn test_unmanaged_node_has_no_endpoint() {
        let client = LndClient::new(Arc::new(NodeChannelPool::new()));
        let mut node = test_utils::node("remote");
        node.endpoint = None;

        let err = client.get_node_info(&node, "02ab").await.unwrap_err();
        assert!(matches!(err, NodeError::MissingEndpoint(_)));
    }
}
