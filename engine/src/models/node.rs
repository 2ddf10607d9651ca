use serde::{Deserialize, Serialize};

/// A Lightning node, either managed (with a gRPC endpoint) or a remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: i64,
    pub name: String,
    pub pubkey: String,
    pub endpoint: Option<String>,
    /// Hex-encoded macaroon sent with every call.
    pub macaroon: Option<String>,
    /// PEM certificate for self-signed daemon endpoints.
    pub tls_cert: Option<String>,
}

impl Node {
    pub fn is_managed(&self) -> bool {
        self.endpoint.is_some()
    }
}
