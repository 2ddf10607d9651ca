use bitcoin::Txid;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    pub funding_tx: Txid,
    pub funding_tx_output_index: u32,
    pub chan_id: Option<u64>,
    pub sat_capacity: u64,
    pub source_node_id: i64,
    pub destination_node_id: i64,
    pub status: ChannelStatus,
    pub btc_close_address: Option<String>,
    pub created_by_request_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Channel {
    /// `txid:index`, as the node daemon expects it.
    pub fn channel_point(&self) -> String {
        format!("{}:{}", self.funding_tx, self.funding_tx_output_index)
    }
}
