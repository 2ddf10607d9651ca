use std::fmt;
use std::str::FromStr;

use bitcoin::{OutPoint, Txid};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestStatus {
    Pending,
    PSBTSignaturesPending,
    OnChainConfirmationPending,
    OnChainConfirmed,
    Failed,
    Rejected,
    Cancelled,
    /// Superseded by a broadcast fee bump spending the same inputs.
    Replaced,
}

impl RequestStatus {
    pub const TERMINAL: [RequestStatus; 5] = [
        RequestStatus::OnChainConfirmed,
        RequestStatus::Failed,
        RequestStatus::Rejected,
        RequestStatus::Cancelled,
        RequestStatus::Replaced,
    ];

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }

    /// Statuses from which template generation and signing may proceed.
    pub fn is_actionable(&self) -> bool {
        matches!(self, RequestStatus::Pending | RequestStatus::PSBTSignaturesPending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "Pending",
            RequestStatus::PSBTSignaturesPending => "PSBTSignaturesPending",
            RequestStatus::OnChainConfirmationPending => "OnChainConfirmationPending",
            RequestStatus::OnChainConfirmed => "OnChainConfirmed",
            RequestStatus::Failed => "Failed",
            RequestStatus::Rejected => "Rejected",
            RequestStatus::Cancelled => "Cancelled",
            RequestStatus::Replaced => "Replaced",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(RequestStatus::Pending),
            "PSBTSignaturesPending" => Ok(RequestStatus::PSBTSignaturesPending),
            "OnChainConfirmationPending" => Ok(RequestStatus::OnChainConfirmationPending),
            "OnChainConfirmed" => Ok(RequestStatus::OnChainConfirmed),
            "Failed" => Ok(RequestStatus::Failed),
            "Rejected" => Ok(RequestStatus::Rejected),
            "Cancelled" => Ok(RequestStatus::Cancelled),
            "Replaced" => Ok(RequestStatus::Replaced),
            other => Err(format!("Unknown request status: {}", other)),
        }
    }
}

/// Identifies the request that owns PSBT rows and UTXO locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestRef {
    Withdrawal(i64),
    ChannelOperation(i64),
}

impl RequestRef {
    pub fn kind(&self) -> &'static str {
        match self {
            RequestRef::Withdrawal(_) => "withdrawal",
            RequestRef::ChannelOperation(_) => "channel_operation",
        }
    }

    pub fn id(&self) -> i64 {
        match self {
            RequestRef::Withdrawal(id) | RequestRef::ChannelOperation(id) => *id,
        }
    }

    pub fn from_parts(kind: &str, id: i64) -> Option<Self> {
        match kind {
            "withdrawal" => Some(RequestRef::Withdrawal(id)),
            "channel_operation" => Some(RequestRef::ChannelOperation(id)),
            _ => None,
        }
    }
}

impl fmt::Display for RequestRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} request {}", self.kind(), self.id())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusLogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

impl StatusLogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MempoolRecommendedFeesType {
    EconomyFee,
    FastestFee,
    #[default]
    HalfHourFee,
    HourFee,
    CustomFee,
}

/// Common lifecycle of withdrawal and channel operation requests.
pub trait SpendRequest {
    fn request_ref(&self) -> RequestRef;
    fn status(&self) -> RequestStatus;
    fn set_status(&mut self, status: RequestStatus);
    fn status_logs_mut(&mut self) -> &mut Vec<StatusLogEntry>;

    fn log(&mut self, entry: StatusLogEntry) {
        self.status_logs_mut().push(entry);
    }

    /// Moves the request to `Failed`, recording why.
    fn fail(&mut self, reason: impl Into<String>) {
        self.set_status(RequestStatus::Failed);
        self.log(StatusLogEntry::error(reason));
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalDestination {
    pub address: String,
    pub amount_sats: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletWithdrawalRequest {
    pub id: i64,
    pub wallet_id: i64,
    pub description: String,
    pub destinations: Vec<WithdrawalDestination>,
    pub withdraw_all_funds: bool,
    pub fees_type: MempoolRecommendedFeesType,
    /// sat/vB, used with `CustomFee`.
    pub custom_fee_rate: Option<f64>,
    pub status: RequestStatus,
    pub bumping_request_id: Option<i64>,
    pub tx_id: Option<Txid>,
    pub rejection_reason: Option<String>,
    pub user_requestor_id: Option<String>,
    #[serde(default)]
    pub selected_outpoints: Vec<OutPoint>,
    #[serde(default)]
    pub status_logs: Vec<StatusLogEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WalletWithdrawalRequest {
    pub fn total_amount_sats(&self) -> u64 {
        self.destinations.iter().map(|d| d.amount_sats).sum()
    }
}

impl SpendRequest for WalletWithdrawalRequest {
    fn request_ref(&self) -> RequestRef {
        RequestRef::Withdrawal(self.id)
    }

    fn status(&self) -> RequestStatus {
        self.status
    }

    fn set_status(&mut self, status: RequestStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    fn status_logs_mut(&mut self) -> &mut Vec<StatusLogEntry> {
        &mut self.status_logs
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationRequestType {
    Open,
    Close,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelOperationRequest {
    pub id: i64,
    pub request_type: OperationRequestType,
    pub amount_sats: u64,
    pub wallet_id: Option<i64>,
    pub source_node_id: i64,
    pub destination_node_id: i64,
    pub status: RequestStatus,
    pub fees_type: MempoolRecommendedFeesType,
    pub custom_fee_rate: Option<f64>,
    pub changeless: bool,
    pub is_private: bool,
    pub tx_id: Option<Txid>,
    /// Output of `tx_id` funding the channel, known once the daemon reports the open pending.
    #[serde(default)]
    pub funding_output_index: Option<u32>,
    /// Channel created by an open, or targeted by a close.
    pub channel_id: Option<i64>,
    pub close_address: Option<String>,
    pub force_close: bool,
    #[serde(default)]
    pub selected_outpoints: Vec<OutPoint>,
    #[serde(default)]
    pub status_logs: Vec<StatusLogEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SpendRequest for ChannelOperationRequest {
    fn request_ref(&self) -> RequestRef {
        RequestRef::ChannelOperation(self.id)
    }

    fn status(&self) -> RequestStatus {
        self.status
    }

    fn set_status(&mut self, status: RequestStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    fn status_logs_mut(&mut self) -> &mut Vec<StatusLogEntry> {
        &mut self.status_logs
    }
}

/// A PSBT snapshot attached to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPsbt {
    pub id: i64,
    pub request: RequestRef,
    pub psbt: String,
    pub signer_user_id: Option<String>,
    pub is_template: bool,
    pub is_internal_wallet: bool,
    pub is_finalised: bool,
    pub created_at: DateTime<Utc>,
}

impl RequestPsbt {
    pub fn template(request: RequestRef, psbt: String) -> Self {
        Self::new(request, psbt, None, true, false, false)
    }

    pub fn signed(request: RequestRef, psbt: String, signer_user_id: impl Into<String>) -> Self {
        Self::new(request, psbt, Some(signer_user_id.into()), false, false, false)
    }

    pub fn internal(request: RequestRef, psbt: String) -> Self {
        Self::new(request, psbt, None, false, true, false)
    }

    pub fn finalised(request: RequestRef, psbt: String) -> Self {
        Self::new(request, psbt, None, false, false, true)
    }

    fn new(
        request: RequestRef,
        psbt: String,
        signer_user_id: Option<String>,
        is_template: bool,
        is_internal_wallet: bool,
        is_finalised: bool,
    ) -> Self {
        Self {
            id: 0,
            request,
            psbt,
            signer_user_id,
            is_template,
            is_internal_wallet,
            is_finalised,
            created_at: Utc::now(),
        }
    }

    /// Rows submitted by external signers.
    pub fn is_signer_submission(&self) -> bool {
        !self.is_template && !self.is_finalised && !self.is_internal_wallet
    }
}
