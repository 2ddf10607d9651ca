use bitcoin::psbt::Psbt;
use bitcoin::{EcdsaSighashType, Network};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::config::RemoteSignerConfig;
use crate::error::SigningError;

#[derive(Debug, Serialize)]
struct SignRequest {
    psbt: String,
    enforced_sighash: String,
    network: String,
}

#[derive(Debug, Deserialize)]
struct SignResponse {
    psbt: String,
}

pub fn sighash_name(sighash: EcdsaSighashType) -> &'static str {
    match sighash {
        EcdsaSighashType::None => "SIGHASH_NONE",
        EcdsaSighashType::Single => "SIGHASH_SINGLE",
        EcdsaSighashType::AllPlusAnyoneCanPay => "SIGHASH_ALL|ANYONECANPAY",
        EcdsaSighashType::NonePlusAnyoneCanPay => "SIGHASH_NONE|ANYONECANPAY",
        EcdsaSighashType::SinglePlusAnyoneCanPay => "SIGHASH_SINGLE|ANYONECANPAY",
        _ => "SIGHASH_ALL",
    }
}

/// Delegates internal-wallet signing to an HTTPS signing service.
pub struct RemoteSigner {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    network: Network,
}

impl RemoteSigner {
    pub fn new(config: &RemoteSignerConfig, network: Network) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            network,
        }
    }

    pub async fn sign(&self, psbt: &Psbt, sighash: EcdsaSighashType) -> Result<Psbt, SigningError> {
        let body = SignRequest {
            psbt: psbt.to_string(),
            enforced_sighash: sighash_name(sighash).to_string(),
            network: self.network.to_core_arg().to_string(),
        };

        let mut request = self
            .client
            .post(&self.endpoint)
            .timeout(Duration::from_secs(30))
            .json(&body);
        if let Some(api_key) = &self.api_key {
            request = request.header("x-api-key", api_key);
        }

        tracing::info!("Requesting remote signature for {}", psbt.unsigned_tx.compute_txid());

        let response: SignResponse = request.send().await?.error_for_status()?.json().await?;

        let signed = Psbt::from_str(&response.psbt)
            .map_err(|e| SigningError::Signer(format!("Remote signer returned an invalid PSBT: {}", e)))?;

        if signed.unsigned_tx != psbt.unsigned_tx {
            return Err(SigningError::Signer(
                "Remote signer returned a PSBT for a different transaction".to_string(),
            ));
        }

        Ok(signed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_payload_shape() {
        let body = SignRequest {
            psbt: "cHNidP8=".to_string(),
            enforced_sighash: sighash_name(EcdsaSighashType::None).to_string(),
            network: Network::Regtest.to_core_arg().to_string(),
        };

        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["enforced_sighash"], "SIGHASH_NONE");
        assert_eq!(json["network"], "regtest");
        assert_eq!(json["psbt"], "cHNidP8=");
    }

    #[test]
    fn test_sighash_names() {
        assert_eq!(sighash_name(EcdsaSighashType::All), "SIGHASH_ALL");
        assert_eq!(sighash_name(EcdsaSighashType::None), "SIGHASH_NONE");
    }
}
