use anyhow::{anyhow, Result};
use bitcoin::Network;
use std::time::Duration;

use crate::services::onchain::coin_selection::CoinSelectionStrategy;

#[derive(Debug, Clone)]
pub struct Config {
    pub network: Network,
    pub data_dir: String,
    pub esplora_url: String,
    pub mempool_api_url: Option<String>,
    pub minimum_withdrawal_confirmations: u32,
    /// Depth at which an open or close the daemon stopped reporting on is recorded as done.
    pub minimum_channel_confirmations: u32,
    pub coin_selection_strategy: CoinSelectionStrategy,
    pub remote_signer: Option<RemoteSignerConfig>,
    pub monitor_interval: Duration,
    pub job_retry_attempts: u32,
    pub job_retry_interval: Duration,
    /// Chain index is considered out of sync when its tip is older than this.
    pub max_tip_age: Option<Duration>,
    pub gap_limit: u32,
    pub fortyswap_url: Option<String>,
    pub loop_endpoint: Option<String>,
    pub loop_macaroon: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RemoteSignerConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
}

pub fn parse_network(value: &str) -> Network {
    match value {
        "mainnet" | "bitcoin" => Network::Bitcoin,
        "testnet" => Network::Testnet,
        "signet" => Network::Signet,
        _ => Network::Regtest,
    }
}

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match var(name) {
        Some(value) => value
            .parse()
            .map_err(|e| anyhow!("Invalid value for {}: {}", name, e)),
        None => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let network = parse_network(&var("BITCOIN_NETWORK").unwrap_or_else(|| "regtest".to_string()));

        let remote_signer = var("REMOTE_SIGNER_ENDPOINT").map(|endpoint| RemoteSignerConfig {
            endpoint,
            api_key: var("REMOTE_SIGNER_API_KEY"),
        });

        // stale tips are expected on test networks
        let default_tip_age = match network {
            Network::Bitcoin => 2 * 60 * 60,
            _ => 0,
        };
        let max_tip_age_secs: u64 = parse_var("MAX_TIP_AGE_SECS", default_tip_age)?;

        Ok(Self {
            network,
            data_dir: var("DATA_DIR").unwrap_or_else(|| "./data".to_string()),
            esplora_url: var("ESPLORA_URL").unwrap_or_else(|| "http://localhost:3000".to_string()),
            mempool_api_url: var("MEMPOOL_API_URL"),
            minimum_withdrawal_confirmations: parse_var("MINIMUM_WITHDRAWAL_CONFIRMATIONS", 6)?,
            minimum_channel_confirmations: parse_var("MINIMUM_CHANNEL_CONFIRMATIONS", 3)?,
            coin_selection_strategy: parse_var("COIN_SELECTION_STRATEGY", CoinSelectionStrategy::SmallestFirst)?,
            remote_signer,
            monitor_interval: Duration::from_secs(parse_var("MONITOR_INTERVAL_SECS", 60)?),
            job_retry_attempts: parse_var("JOB_RETRY_ATTEMPTS", 10)?,
            job_retry_interval: Duration::from_secs(parse_var("JOB_RETRY_INTERVAL_SECS", 30)?),
            max_tip_age: (max_tip_age_secs > 0).then(|| Duration::from_secs(max_tip_age_secs)),
            gap_limit: parse_var("GAP_LIMIT", 20)?,
            fortyswap_url: var("FORTYSWAP_URL"),
            loop_endpoint: var("LOOP_ENDPOINT"),
            loop_macaroon: var("LOOP_MACAROON"),
        })
    }

    pub fn db_path(&self) -> String {
        format!("{}/treasury.db", self.data_dir)
    }
}
