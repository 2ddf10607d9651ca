use anyhow::{anyhow, Result};
use std::future::Future;
use std::time::Duration;

use crate::config::Config;
use crate::error::WorkflowError;
use crate::services::{AppState, BatchReport};

/// Fixed-schedule retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            attempts: config.job_retry_attempts.max(1),
            interval: config.job_retry_interval,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            interval: Duration::from_secs(30),
        }
    }
}

/// Runs `op` until it succeeds or the policy's attempts are spent.
pub async fn run_with_retry<T, E, F, Fut>(name: &str, policy: RetryPolicy, mut op: F) -> Result<T>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
{
    let mut attempt = 0;

    loop {
        attempt += 1;
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!("Job {} succeeded on attempt {}", name, attempt);
                }
                return Ok(value);
            }
            Err(e) if attempt < policy.attempts => {
                tracing::warn!(
                    "Job {} failed (attempt {}/{}): {}. Retrying in {}s",
                    name,
                    attempt,
                    policy.attempts,
                    e,
                    policy.interval.as_secs()
                );
                tokio::time::sleep(policy.interval).await;
            }
            Err(e) => {
                tracing::error!("Job {} failed after {} attempts: {}", name, attempt, e);
                return Err(anyhow!("Job {} failed after {} attempts: {}", name, attempt, e));
            }
        }
    }
}

/// Runs one batch job under the retry policy and logs its tally.
async fn run_batch<F, Fut>(name: &str, policy: RetryPolicy, op: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<BatchReport, WorkflowError>>,
{
    match run_with_retry(name, policy, op).await {
        Ok(report) if report.advanced > 0 || report.failed > 0 => {
            tracing::info!("Job {}: {} advanced, {} failed", name, report.advanced, report.failed)
        }
        Ok(_) => {}
        Err(e) => tracing::error!("{}", e),
    }
}

/// One pass of the periodic jobs.
pub async fn run_once(state: &AppState, policy: RetryPolicy) {
    let withdrawals = state.withdrawals.clone();
    let channels = state.channels.clone();
    let swaps = state.swaps.clone();

    run_batch("monitor_withdrawals", policy, || withdrawals.monitor_confirmations()).await;
    run_batch("perform_withdrawals", policy, || withdrawals.process_signed_withdrawals()).await;
    run_batch("hot_wallet_withdrawals", policy, || withdrawals.process_hot_wallet_withdrawals()).await;

    run_batch("monitor_channel_operations", policy, || channels.monitor_confirmations()).await;
    run_batch("open_signed_channels", policy, || channels.process_signed_opens()).await;
    run_batch("hot_wallet_channel_opens", policy, || channels.process_hot_wallet_opens()).await;
    run_batch("close_channels", policy, || channels.process_close_requests()).await;

    run_batch("start_swaps", policy, || swaps.process_requested_swaps()).await;
    run_batch("poll_swaps", policy, || swaps.poll_swaps()).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            interval: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let result = run_with_retry("flaky", quick(5), || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(format!("attempt {} failed", n))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_attempts() {
        let calls = AtomicU32::new(0);
        let err = run_with_retry("broken", quick(4), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>("still broken") }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(err.to_string().contains("after 4 attempts"));
    }

    #[tokio::test]
    async fn test_batch_errors_are_retried_then_logged() {
        let calls = AtomicU32::new(0);
        run_batch("broken_batch", quick(3), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(WorkflowError::InvalidRequest("unreadable".to_string())) }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // a batch with failed requests still completes, so it is not retried
        let calls = AtomicU32::new(0);
        run_batch("partial_batch", quick(3), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(BatchReport { advanced: 1, failed: 1 }) }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_default_policy() {
        assert_eq!(RetryPolicy::default().attempts, 10);
    }
}
