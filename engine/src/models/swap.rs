use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::request::{RequestStatus, StatusLogEntry};

/// A requested swap-out of off-chain balance to an on-chain address.
///
/// `Pending` until the provider accepts it, `OnChainConfirmationPending` while the provider
/// works on it, then `OnChainConfirmed` or `Failed` once the provider reports a final state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapOut {
    pub id: i64,
    /// Provider name, `loop` or `40swap`.
    pub provider: String,
    pub provider_swap_id: Option<String>,
    pub amount_sats: u64,
    pub destination_address: String,
    pub max_routing_fee_sats: u64,
    pub sweep_conf_target: i32,
    #[serde(default)]
    pub outgoing_chan_set: Vec<u64>,
    pub status: RequestStatus,
    /// Last state reported by the provider.
    #[serde(default)]
    pub provider_state: Option<String>,
    pub htlc_address: Option<String>,
    #[serde(default)]
    pub status_logs: Vec<StatusLogEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SwapOut {
    pub fn new(provider: &str, amount_sats: u64, destination_address: &str, max_routing_fee_sats: u64) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            provider: provider.to_string(),
            provider_swap_id: None,
            amount_sats,
            destination_address: destination_address.to_string(),
            max_routing_fee_sats,
            sweep_conf_target: 6,
            outgoing_chan_set: Vec::new(),
            status: RequestStatus::Pending,
            provider_state: None,
            htlc_address: None,
            status_logs: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_status(&mut self, status: RequestStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    pub fn log(&mut self, entry: StatusLogEntry) {
        self.status_logs.push(entry);
    }
}
