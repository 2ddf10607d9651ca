//! Subset of the `lnrpc` protocol used to drive channel opens and closes.

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OpenChannelRequest {
    #[prost(uint64, tag = "1")]
    pub sat_per_vbyte: u64,
    #[prost(bytes = "vec", tag = "2")]
    pub node_pubkey: ::prost::alloc::vec::Vec<u8>,
    #[prost(int64, tag = "4")]
    pub local_funding_amount: i64,
    #[prost(bool, tag = "8")]
    pub private: bool,
    #[prost(string, tag = "13")]
    pub close_address: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "14")]
    pub funding_shim: ::core::option::Option<FundingShim>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FundingShim {
    #[prost(oneof = "funding_shim::Shim", tags = "2")]
    pub shim: ::core::option::Option<funding_shim::Shim>,
}
/// Nested message and enum types in `FundingShim`.
pub mod funding_shim {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Shim {
        #[prost(message, tag = "2")]
        PsbtShim(super::PsbtShim),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PsbtShim {
    #[prost(bytes = "vec", tag = "1")]
    pub pending_chan_id: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub base_psbt: ::prost::alloc::vec::Vec<u8>,
    #[prost(bool, tag = "3")]
    pub no_publish: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OpenStatusUpdate {
    #[prost(bytes = "vec", tag = "4")]
    pub pending_chan_id: ::prost::alloc::vec::Vec<u8>,
    #[prost(oneof = "open_status_update::Update", tags = "1, 3, 5")]
    pub update: ::core::option::Option<open_status_update::Update>,
}
/// Nested message and enum types in `OpenStatusUpdate`.
pub mod open_status_update {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Update {
        #[prost(message, tag = "1")]
        ChanPending(super::PendingUpdate),
        #[prost(message, tag = "3")]
        ChanOpen(super::ChannelOpenUpdate),
        #[prost(message, tag = "5")]
        PsbtFund(super::ReadyForPsbtFunding),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PendingUpdate {
    /// Little-endian txid bytes.
    #[prost(bytes = "vec", tag = "1")]
    pub txid: ::prost::alloc::vec::Vec<u8>,
    #[prost(uint32, tag = "2")]
    pub output_index: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChannelOpenUpdate {
    #[prost(message, optional, tag = "1")]
    pub channel_point: ::core::option::Option<ChannelPoint>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReadyForPsbtFunding {
    #[prost(string, tag = "1")]
    pub funding_address: ::prost::alloc::string::String,
    #[prost(int64, tag = "2")]
    pub funding_amount: i64,
    #[prost(bytes = "vec", tag = "3")]
    pub psbt: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChannelPoint {
    #[prost(uint32, tag = "3")]
    pub output_index: u32,
    #[prost(oneof = "channel_point::FundingTxid", tags = "1, 2")]
    pub funding_txid: ::core::option::Option<channel_point::FundingTxid>,
}
/// Nested message and enum types in `ChannelPoint`.
pub mod channel_point {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum FundingTxid {
        #[prost(bytes, tag = "1")]
        FundingTxidBytes(::prost::alloc::vec::Vec<u8>),
        #[prost(string, tag = "2")]
        FundingTxidStr(::prost::alloc::string::String),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FundingTransitionMsg {
    #[prost(oneof = "funding_transition_msg::Trigger", tags = "2, 3, 4")]
    pub trigger: ::core::option::Option<funding_transition_msg::Trigger>,
}
/// Nested message and enum types in `FundingTransitionMsg`.
pub mod funding_transition_msg {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Trigger {
        #[prost(message, tag = "2")]
        ShimCancel(super::FundingShimCancel),
        #[prost(message, tag = "3")]
        PsbtVerify(super::FundingPsbtVerify),
        #[prost(message, tag = "4")]
        PsbtFinalize(super::FundingPsbtFinalize),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FundingShimCancel {
    #[prost(bytes = "vec", tag = "1")]
    pub pending_chan_id: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FundingPsbtVerify {
    #[prost(bytes = "vec", tag = "1")]
    pub funded_psbt: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub pending_chan_id: ::prost::alloc::vec::Vec<u8>,
    #[prost(bool, tag = "3")]
    pub skip_finalize: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FundingPsbtFinalize {
    #[prost(bytes = "vec", tag = "1")]
    pub signed_psbt: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub pending_chan_id: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub final_raw_tx: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FundingStateStepResp {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CloseChannelRequest {
    #[prost(message, optional, tag = "1")]
    pub channel_point: ::core::option::Option<ChannelPoint>,
    #[prost(bool, tag = "2")]
    pub force: bool,
    #[prost(int32, tag = "3")]
    pub target_conf: i32,
    #[prost(string, tag = "5")]
    pub delivery_address: ::prost::alloc::string::String,
    #[prost(uint64, tag = "6")]
    pub sat_per_vbyte: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CloseStatusUpdate {
    #[prost(oneof = "close_status_update::Update", tags = "1, 3")]
    pub update: ::core::option::Option<close_status_update::Update>,
}
/// Nested message and enum types in `CloseStatusUpdate`.
pub mod close_status_update {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Update {
        #[prost(message, tag = "1")]
        ClosePending(super::PendingUpdate),
        #[prost(message, tag = "3")]
        ChanClose(super::ChannelCloseUpdate),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChannelCloseUpdate {
    #[prost(bytes = "vec", tag = "1")]
    pub closing_txid: ::prost::alloc::vec::Vec<u8>,
    #[prost(bool, tag = "2")]
    pub success: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeInfoRequest {
    #[prost(string, tag = "1")]
    pub pub_key: ::prost::alloc::string::String,
    #[prost(bool, tag = "2")]
    pub include_channels: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeInfo {
    #[prost(message, optional, tag = "1")]
    pub node: ::core::option::Option<LightningNode>,
    #[prost(uint32, tag = "2")]
    pub num_channels: u32,
    #[prost(int64, tag = "3")]
    pub total_capacity: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LightningNode {
    #[prost(uint32, tag = "1")]
    pub last_update: u32,
    #[prost(string, tag = "2")]
    pub pub_key: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub alias: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "4")]
    pub addresses: ::prost::alloc::vec::Vec<NodeAddress>,
    #[prost(string, tag = "5")]
    pub color: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeAddress {
    #[prost(string, tag = "1")]
    pub network: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub addr: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConnectPeerRequest {
    #[prost(message, optional, tag = "1")]
    pub addr: ::core::option::Option<LightningAddress>,
    #[prost(bool, tag = "2")]
    pub perm: bool,
    #[prost(uint64, tag = "3")]
    pub timeout: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LightningAddress {
    #[prost(string, tag = "1")]
    pub pubkey: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub host: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConnectPeerResponse {}
