use bitcoin::{Amount, OutPoint};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("UTXO {0} is already locked by another active request")]
    UtxoAlreadyLocked(OutPoint),

    #[error("Failed to lock connection: {0}")]
    Poisoned(String),

    #[error("Corrupt stored value: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("Wallet {id} has {keys} keys but a threshold of {mofn}")]
    NotEnoughKeys { id: i64, keys: usize, mofn: u32 },

    #[error("Taproot wallets are not supported")]
    TaprootUnsupported,

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Invalid descriptor: {0}")]
    Descriptor(#[from] miniscript::Error),

    #[error("Failed to derive descriptor at index {index}: {reason}")]
    Derivation { index: u32, reason: String },

    #[error("Wallet {0} is not finalised")]
    NotFinalised(i64),

    #[error("Invalid mnemonic: {0}")]
    Mnemonic(String),
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("Esplora error: {0}")]
    Esplora(#[from] esplora_client::Error),

    #[error(transparent)]
    Wallet(#[from] WalletError),

    #[error("Chain index error: {0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoinSelectionError {
    #[error("No UTXOs available for selection")]
    NoUtxosAvailable,

    #[error("Not enough balance in wallet: need {needed}, have {available}")]
    NotEnoughBalance { needed: Amount, available: Amount },

    #[error("Not enough room in UTXOs for fees: need {needed}, have {available}")]
    NotEnoughRoomInUtxosForFees { needed: Amount, available: Amount },

    #[error("Requested UTXO {0} is not available for selection")]
    UnavailableOutpoint(OutPoint),
}

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error(transparent)]
    Selection(#[from] CoinSelectionError),

    #[error("Template is stale: {0}")]
    StaleTemplate(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Wallet(#[from] WalletError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("PSBT construction failed: {0}")]
    Psbt(String),
}

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("Insufficient signatures: collected {collected}, required {required}")]
    InsufficientSignatures { collected: usize, required: usize },

    #[error("PSBT does not match the request template: {0}")]
    StaleTemplate(String),

    #[error("Sanity check failed: {0}")]
    SanityCheckFailed(String),

    #[error("Broadcast rejected ({code}): {message}")]
    BroadcastRejected { code: i32, message: String },

    #[error("Signature count did not increase after signing ({before} -> {after})")]
    SignatureCountNotIncreased { before: usize, after: usize },

    #[error("No template PSBT found for {0}")]
    MissingTemplate(String),

    #[error("Invalid PSBT: {0}")]
    InvalidPsbt(String),

    #[error("Internal wallet signing failed: {0}")]
    Signer(String),

    #[error("Remote signer request failed: {0}")]
    RemoteSigner(#[from] reqwest::Error),

    #[error(transparent)]
    Wallet(#[from] WalletError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Chain(#[from] ChainError),
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Peer {0} is not online")]
    PeerNotOnline(String),

    #[error("Node {0} has no gRPC endpoint configured")]
    MissingEndpoint(String),

    #[error("Invalid endpoint {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("RPC error ({code:?}): {message}")]
    Rpc { code: tonic::Code, message: String },

    #[error("Invalid macaroon: {0}")]
    InvalidMacaroon(String),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl From<tonic::Status> for NodeError {
    fn from(status: tonic::Status) -> Self {
        let message = status.message().to_string();
        if message.contains("not online") {
            NodeError::PeerNotOnline(message)
        } else {
            NodeError::Rpc {
                code: status.code(),
                message,
            }
        }
    }
}

impl NodeError {
    /// Connecting to a peer we already have a connection with is not a failure.
    pub fn is_already_connected(&self) -> bool {
        matches!(self, NodeError::Rpc { message, .. } if message.contains("already connected"))
    }
}

#[derive(Debug, Error)]
pub enum ChannelOpenError {
    #[error(transparent)]
    Node(#[from] NodeError),

    #[error(transparent)]
    Signing(#[from] SigningError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Unexpected {event} while {state}")]
    UnexpectedEvent { state: String, event: String },

    #[error("Invalid funding PSBT: {0}")]
    InvalidFunding(String),

    #[error("Open channel stream ended before the channel was opened")]
    StreamClosed,
}

/// Errors surfaced by the request workflows.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Signing(#[from] SigningError),

    #[error(transparent)]
    ChannelOpen(#[from] ChannelOpenError),

    #[error(transparent)]
    Node(#[from] NodeError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Wallet(#[from] WalletError),

    #[error(transparent)]
    Swap(#[from] SwapError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

#[derive(Debug, Error)]
pub enum SwapError {
    #[error(transparent)]
    Node(#[from] NodeError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Swap provider returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Invalid swap response: {0}")]
    InvalidResponse(String),
}
