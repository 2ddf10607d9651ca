use bitcoin::FeeRate;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::ChainError;
use crate::models::MempoolRecommendedFeesType;
use crate::services::chain::ChainIndex;

#[derive(Debug, Deserialize)]
struct MempoolSpaceFees {
    #[serde(rename = "fastestFee")]
    fastest_fee: u64,
    #[serde(rename = "halfHourFee")]
    half_hour_fee: u64,
    #[serde(rename = "hourFee")]
    hour_fee: u64,
    #[serde(rename = "economyFee")]
    economy_fee: u64,
    #[serde(rename = "minimumFee")]
    minimum_fee: u64,
}

/// Recommended tiers in sat/vB.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeEstimates {
    pub fastest: u64,
    pub half_hour: u64,
    pub hour: u64,
    pub economy: u64,
    pub minimum: u64,
    pub timestamp: i64,
}

impl FeeEstimates {
    pub fn for_type(&self, fees_type: MempoolRecommendedFeesType) -> Option<u64> {
        match fees_type {
            MempoolRecommendedFeesType::FastestFee => Some(self.fastest),
            MempoolRecommendedFeesType::HalfHourFee => Some(self.half_hour),
            MempoolRecommendedFeesType::HourFee => Some(self.hour),
            MempoolRecommendedFeesType::EconomyFee => Some(self.economy),
            MempoolRecommendedFeesType::CustomFee => None,
        }
    }
}

#[derive(Debug, Clone)]
struct CachedFeeEstimates {
    estimates: FeeEstimates,
    last_updated: Instant,
}

/// Confirmation target used when falling back to the chain index estimator.
pub fn target_blocks(fees_type: MempoolRecommendedFeesType) -> u16 {
    match fees_type {
        MempoolRecommendedFeesType::FastestFee => 1,
        MempoolRecommendedFeesType::HalfHourFee | MempoolRecommendedFeesType::CustomFee => 3,
        MempoolRecommendedFeesType::HourFee => 6,
        MempoolRecommendedFeesType::EconomyFee => 144,
    }
}

/// sat/vB as a `FeeRate`, rounding up to the next sat per kwu.
pub fn fee_rate_from_sat_per_vb(sat_per_vb: f64) -> FeeRate {
    FeeRate::from_sat_per_kwu((sat_per_vb.max(1.0) * 250.0).ceil() as u64)
}

pub struct FeeEstimator {
    chain: Arc<dyn ChainIndex>,
    http_client: reqwest::Client,
    mempool_api_url: Option<String>,
    cache: Arc<RwLock<Option<CachedFeeEstimates>>>,
    cache_duration: Duration,
}

impl FeeEstimator {
    pub fn new(chain: Arc<dyn ChainIndex>, mempool_api_url: Option<String>) -> Self {
        Self {
            chain,
            http_client: reqwest::Client::new(),
            mempool_api_url: mempool_api_url.map(|url| url.trim_end_matches('/').to_string()),
            cache: Arc::new(RwLock::new(None)),
            cache_duration: Duration::from_secs(300), // 5 minutes
        }
    }

    /// Fee rate for a request's fee policy.
    ///
    /// `CustomFee` uses `custom_sat_per_vb` verbatim; recommended tiers come from the
    /// mempool API and fall back to the chain index estimator.
    pub async fn fee_rate(
        &self,
        fees_type: MempoolRecommendedFeesType,
        custom_sat_per_vb: Option<f64>,
    ) -> Result<FeeRate, ChainError> {
        if fees_type == MempoolRecommendedFeesType::CustomFee {
            let rate = custom_sat_per_vb
                .filter(|r| r.is_finite() && *r > 0.0)
                .ok_or_else(|| ChainError::Other("Custom fee type without a valid fee rate".to_string()))?;
            return Ok(fee_rate_from_sat_per_vb(rate));
        }

        if let Some(estimates) = self.get_fee_estimates().await {
            if let Some(sat_per_vb) = estimates.for_type(fees_type) {
                tracing::info!("Fee rate for {:?}: {} sat/vB", fees_type, sat_per_vb);
                return Ok(fee_rate_from_sat_per_vb(sat_per_vb as f64));
            }
        }

        let target = target_blocks(fees_type);
        tracing::info!("Falling back to chain index fee estimate for {} blocks", target);
        self.chain.get_fee_rate(target).await
    }

    /// Recommended tiers, cached for five minutes. `None` when no mempool API is reachable.
    pub async fn get_fee_estimates(&self) -> Option<FeeEstimates> {
        if let Some(cached) = self.get_cached_estimates() {
            return Some(cached);
        }

        let base_url = self.mempool_api_url.as_deref()?;
        match self.fetch_mempool_space_estimates(base_url).await {
            Ok(estimates) => {
                self.cache_estimates(estimates.clone());
                Some(estimates)
            }
            Err(e) => {
                tracing::warn!("Failed to fetch recommended fees from {}: {}", base_url, e);
                None
            }
        }
    }

    async fn fetch_mempool_space_estimates(&self, base_url: &str) -> Result<FeeEstimates, reqwest::Error> {
        let url = format!("{}/api/v1/fees/recommended", base_url);
        let response: MempoolSpaceFees = self
            .http_client
            .get(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(FeeEstimates {
            fastest: response.fastest_fee,
            half_hour: response.half_hour_fee,
            hour: response.hour_fee,
            economy: response.economy_fee,
            minimum: response.minimum_fee,
            timestamp: chrono::Utc::now().timestamp(),
        })
    }

    fn get_cached_estimates(&self) -> Option<FeeEstimates> {
        let cache = self.cache.read();
        if let Some(cached) = cache.as_ref() {
            if cached.last_updated.elapsed() < self.cache_duration {
                return Some(cached.estimates.clone());
            }
        }
        None
    }

    fn cache_estimates(&self, estimates: FeeEstimates) {
        let mut cache = self.cache.write();
        *cache = Some(CachedFeeEstimates {
            estimates,
            last_updated: Instant::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeChainIndex;

    fn estimates() -> FeeEstimates {
        FeeEstimates {
            fastest: 40,
            half_hour: 20,
            hour: 10,
            economy: 4,
            minimum: 1,
            timestamp: 0,
        }
    }

    #[test]
    fn test_mempool_payload_uses_camel_case_tiers() {
        let payload = r#"{"fastestFee":12,"halfHourFee":8,"hourFee":5,"economyFee":2,"minimumFee":1}"#;
        let fees: MempoolSpaceFees = serde_json::from_str(payload).unwrap();
        assert_eq!(fees.half_hour_fee, 8);
        assert_eq!(fees.minimum_fee, 1);
    }

    #[tokio::test]
    async fn test_cached_tiers_are_used() {
        let chain = Arc::new(FakeChainIndex::default());
        let estimator = FeeEstimator::new(chain, None);
        estimator.cache_estimates(estimates());

        let rate = estimator.fee_rate(MempoolRecommendedFeesType::HourFee, None).await.unwrap();
        assert_eq!(rate, FeeRate::from_sat_per_vb_unchecked(10));

        let rate = estimator.fee_rate(MempoolRecommendedFeesType::FastestFee, None).await.unwrap();
        assert_eq!(rate, FeeRate::from_sat_per_vb_unchecked(40));
    }

    #[tokio::test]
    async fn test_falls_back_to_chain_index_without_mempool_api() {
        let chain = Arc::new(FakeChainIndex::default());
        chain.set_fee_rate(FeeRate::from_sat_per_vb_unchecked(7));
        let estimator = FeeEstimator::new(chain, None);

        let rate = estimator.fee_rate(MempoolRecommendedFeesType::EconomyFee, None).await.unwrap();
        assert_eq!(rate, FeeRate::from_sat_per_vb_unchecked(7));
    }

    #[tokio::test]
    async fn test_unreachable_mempool_api_falls_back() {
        let chain = Arc::new(FakeChainIndex::default());
        chain.set_fee_rate(FeeRate::from_sat_per_vb_unchecked(3));
        let estimator = FeeEstimator::new(chain, Some("http://127.0.0.1:9/".to_string()));

        let rate = estimator.fee_rate(MempoolRecommendedFeesType::HalfHourFee, None).await.unwrap();
        assert_eq!(rate, FeeRate::from_sat_per_vb_unchecked(3));
    }

    #[tokio::test]
    async fn test_custom_fee_requires_rate() {
        let chain = Arc::new(FakeChainIndex::default());
        let estimator = FeeEstimator::new(chain, None);

        let rate = estimator.fee_rate(MempoolRecommendedFeesType::CustomFee, Some(2.5)).await.unwrap();
        assert_eq!(rate.to_sat_per_kwu(), 625);

        assert!(estimator.fee_rate(MempoolRecommendedFeesType::CustomFee, None).await.is_err());
    }
}
