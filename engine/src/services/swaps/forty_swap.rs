use bitcoin::hashes::{sha256, Hash};
use bitcoin::Amount;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{SwapInfo, SwapOutParams, SwapQuote, SwapState};
use crate::error::SwapError;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SwapOutRequest {
    chain: &'static str,
    /// BTC
    input_amount: f64,
    sweep_address: String,
    pre_image_hash: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapOutResponse {
    pub swap_id: String,
    pub status: String,
    #[serde(default)]
    pub outcome: Option<String>,
    pub input_amount: f64,
    #[serde(default)]
    pub contract_address: Option<String>,
    #[serde(default)]
    pub invoice: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapConfiguration {
    pub fee_percentage: f64,
    pub minimum_amount: f64,
    pub maximum_amount: f64,
}

pub fn swap_state(status: &str, outcome: Option<&str>) -> SwapState {
    match status {
        "CREATED" => SwapState::Initiated,
        "INVOICE_PAYMENT_INTENT_RECEIVED" | "CONTRACT_FUNDED_UNCONFIRMED" | "CONTRACT_FUNDED" => {
            SwapState::HtlcPublished
        }
        "CONTRACT_CLAIMED_UNCONFIRMED" => SwapState::PreimageRevealed,
        "DONE" => match outcome {
            Some("SUCCESS") => SwapState::Succeeded,
            _ => SwapState::Failed,
        },
        _ => SwapState::Unknown,
    }
}

/// Swap fee for `amount` under the provider's configuration, rounded up.
pub fn quote(config: &SwapConfiguration, amount: Amount) -> Result<SwapQuote, SwapError> {
    let btc = amount.to_btc();
    if btc < config.minimum_amount || btc > config.maximum_amount {
        return Err(SwapError::Api {
            status: 400,
            message: format!(
                "amount {} outside {}..{} BTC",
                btc, config.minimum_amount, config.maximum_amount
            ),
        });
    }

    let fee = (amount.to_sat() as f64 * config.fee_percentage / 100.0).ceil() as u64;
    Ok(SwapQuote {
        swap_fee: Amount::from_sat(fee),
        prepay_amount: Amount::ZERO,
        miner_fee: Amount::ZERO,
    })
}

/// REST client for a 40swap server.
pub struct FortySwapClient {
    client: reqwest::Client,
    base_url: String,
}

impl FortySwapClient {
    pub fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn read<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T, SwapError> {
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(SwapError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response.json().await?)
    }

    pub async fn get_quote(&self, amount: Amount) -> Result<SwapQuote, SwapError> {
        let response = self
            .client
            .get(format!("{}/api/configuration", self.base_url))
            .timeout(Duration::from_secs(10))
            .send()
            .await?;
        let config: SwapConfiguration = Self::read(response).await?;
        quote(&config, amount)
    }

    /// Creates a swap out. The returned preimage must be kept to claim the on-chain funds.
    pub async fn create_swap_out(&self, params: &SwapOutParams) -> Result<SwapInfo, SwapError> {
        let preimage: [u8; 32] = rand::random();
        let body = SwapOutRequest {
            chain: "BITCOIN",
            input_amount: params.amount.to_btc(),
            sweep_address: params.address.clone(),
            pre_image_hash: sha256::Hash::hash(&preimage).to_string(),
        };

        let response = self
            .client
            .post(format!("{}/api/swap/out", self.base_url))
            .timeout(Duration::from_secs(30))
            .json(&body)
            .send()
            .await?;
        let created: SwapOutResponse = Self::read(response).await?;
        tracing::info!("Created 40swap swap out {} for {}", created.swap_id, params.amount);

        let mut info = swap_info(created)?;
        info.preimage = Some(hex::encode(preimage));
        Ok(info)
    }

    pub async fn get_swap(&self, id: &str) -> Result<SwapInfo, SwapError> {
        let response = self
            .client
            .get(format!("{}/api/swap/out/{}", self.base_url, id))
            .timeout(Duration::from_secs(10))
            .send()
            .await?;
        swap_info(Self::read(response).await?)
    }
}

fn swap_info(response: SwapOutResponse) -> Result<SwapInfo, SwapError> {
    let amount = Amount::from_btc(response.input_amount)
        .map_err(|e| SwapError::InvalidResponse(format!("amount {}: {}", response.input_amount, e)))?;

    Ok(SwapInfo {
        state: swap_state(&response.status, response.outcome.as_deref()),
        id: response.swap_id,
        amount,
        htlc_address: response.contract_address,
        invoice: response.invoice,
        preimage: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_uses_camel_case_btc_amounts() {
        let body = SwapOutRequest {
            chain: "BITCOIN",
            input_amount: Amount::from_sat(250_000).to_btc(),
            sweep_address: "bcrt1qsweep".to_string(),
            pre_image_hash: "00".repeat(32),
        };

        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["inputAmount"], 0.0025);
        assert_eq!(json["sweepAddress"], "bcrt1qsweep");
        assert!(json.get("preImageHash").is_some());
    }

    #[test]
    fn test_response_maps_to_swap_info() {
        let response: SwapOutResponse = serde_json::from_str(
            r#"{"swapId":"abc","status":"DONE","outcome":"SUCCESS","inputAmount":0.0025,"contractAddress":"bcrt1qcontract"}"#,
        )
        .unwrap();

        let info = swap_info(response).unwrap();
        assert_eq!(info.id, "abc");
        assert_eq!(info.amount, Amount::from_sat(250_000));
        assert_eq!(info.state, SwapState::Succeeded);
        assert_eq!(info.htlc_address.as_deref(), Some("bcrt1qcontract"));
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(swap_state("CREATED", None), SwapState::Initiated);
        assert_eq!(swap_state("CONTRACT_FUNDED", None), SwapState::HtlcPublished);
        assert_eq!(swap_state("DONE", Some("EXPIRED")), SwapState::Failed);
        assert_eq!(swap_state("SOMETHING_NEW", None), SwapState::Unknown);
    }

    #[test]
    fn test_quote_respects_limits() {
        let config = SwapConfiguration {
            fee_percentage: 0.5,
            minimum_amount: 0.002,
            maximum_amount: 0.1,
        };

        let quote = quote(&config, Amount::from_sat(1_000_001)).unwrap();
        assert_eq!(quote.swap_fee, Amount::from_sat(5_001));
        assert!(super::quote(&config, Amount::from_sat(100_000)).is_err());
        assert!(super::quote(&config, Amount::from_sat(20_000_000)).is_err());
    }
}
