use anyhow::Result;
use dotenv::dotenv;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use treasury_engine::config::Config;
use treasury_engine::jobs::{self, RetryPolicy};
use treasury_engine::models::InternalWallet;
use treasury_engine::services::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // load env vars
    dotenv().ok();

    // initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    std::fs::create_dir_all(&config.data_dir)?;

    let state = AppState::new(config)?;
    ensure_internal_wallet(&state)?;

    let policy = RetryPolicy::from_config(&state.config);
    let mut interval = tokio::time::interval(state.config.monitor_interval);

    tracing::info!(
        "Treasury engine running on {}, polling every {}s",
        state.config.network,
        state.config.monitor_interval.as_secs()
    );

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = interval.tick() => jobs::run_once(&state, policy).await,
            _ = &mut shutdown => break,
        }
    }

    tracing::info!("Shutting down gracefully...");
    Ok(())
}

fn ensure_internal_wallet(state: &AppState) -> Result<()> {
    if !state.db_manager.list::<InternalWallet>()?.is_empty() {
        return Ok(());
    }

    let mut wallet = state.key_manager.generate_internal_wallet()?;
    state.db_manager.add(&mut wallet)?;
    tracing::info!("Created internal wallet {} ({})", wallet.id, wallet.master_fingerprint);
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to install CTRL+C signal handler: {}", e);
        std::future::pending::<()>().await;
    }
}
