use parking_lot::Mutex;
use std::collections::HashMap;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint};

use crate::error::NodeError;

/// One lazily-connected gRPC channel per endpoint, shared by every request targeting it.
#[derive(Default)]
pub struct NodeChannelPool {
    channels: Mutex<HashMap<String, Channel>>,
}

impl NodeChannelPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the pooled channel for `endpoint`, creating it on first use.
    ///
    /// Lookup and insert happen under one lock so concurrent callers never create duplicates.
    pub fn get_or_create(&self, endpoint: &str, tls_cert: Option<&str>) -> Result<Channel, NodeError> {
        let mut channels = self.channels.lock();

        if let Some(channel) = channels.get(endpoint) {
            return Ok(channel.clone());
        }

        let mut builder = Endpoint::from_shared(endpoint.to_string()).map_err(|e| NodeError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?;

        if let Some(pem) = tls_cert {
            let tls = ClientTlsConfig::new().ca_certificate(Certificate::from_pem(pem));
            builder = builder.tls_config(tls)?;
        }

        let channel = builder.connect_lazy();
        channels.insert(endpoint.to_string(), channel.clone());

        tracing::debug!("Created gRPC channel for {}", endpoint);
        Ok(channel)
    }

    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
