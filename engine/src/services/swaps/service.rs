use std::sync::Arc;

use super::{SwapInfo, SwapOutParams, SwapProvider, SwapState};
use crate::error::WorkflowError;
use crate::models::{RequestStatus, StatusLogEntry, SwapOut};
use crate::services::BatchReport;
use crate::storage::DbManager;
use bitcoin::Amount;

/// Submits requested swap-outs to their provider and follows them to a final state.
pub struct SwapService {
    db: Arc<DbManager>,
    providers: Vec<Arc<SwapProvider>>,
}

/// Folds a provider report into the stored swap. Returns whether anything changed.
pub fn apply_swap_info(swap: &mut SwapOut, info: &SwapInfo) -> bool {
    let mut changed = false;

    if info.htlc_address.is_some() && swap.htlc_address != info.htlc_address {
        swap.htlc_address = info.htlc_address.clone();
        changed = true;
    }

    let state = format!("{:?}", info.state);
    if swap.provider_state.as_deref() != Some(state.as_str()) {
        swap.log(StatusLogEntry::info(format!("Provider reports swap {} {}", info.id, state)));
        swap.provider_state = Some(state);
        changed = true;
    }

    let status = match info.state {
        SwapState::Succeeded => RequestStatus::OnChainConfirmed,
        SwapState::Failed => RequestStatus::Failed,
        _ => RequestStatus::OnChainConfirmationPending,
    };
    if swap.status != status {
        swap.set_status(status);
        changed = true;
    }

    changed
}

impl SwapService {
    pub fn new(db: Arc<DbManager>, providers: Vec<Arc<SwapProvider>>) -> Self {
        Self { db, providers }
    }

    fn provider(&self, name: &str) -> Option<&SwapProvider> {
        self.providers.iter().map(Arc::as_ref).find(|p| p.name() == name)
    }

    async fn start_swap(&self, mut swap: SwapOut) -> Result<bool, WorkflowError> {
        let Some(provider) = self.provider(&swap.provider) else {
            swap.set_status(RequestStatus::Failed);
            swap.log(StatusLogEntry::error(format!("No {} provider configured", swap.provider)));
            self.db.update(&swap)?;
            return Err(WorkflowError::InvalidRequest(format!(
                "Swap {} names unknown provider {}",
                swap.id, swap.provider
            )));
        };

        let params = SwapOutParams {
            amount: Amount::from_sat(swap.amount_sats),
            address: swap.destination_address.clone(),
            max_routing_fee: Amount::from_sat(swap.max_routing_fee_sats),
            sweep_conf_target: swap.sweep_conf_target,
            outgoing_chan_set: swap.outgoing_chan_set.clone(),
            label: Some(format!("swap-out-{}", swap.id)),
        };

        let info = match provider.create_swap_out(&params).await {
            Ok(info) => info,
            Err(e) => {
                // stays pending for the next pass
                swap.log(StatusLogEntry::warning(format!("Swap request failed: {}", e)));
                self.db.update(&swap)?;
                return Err(e.into());
            }
        };

        swap.provider_swap_id = Some(info.id.clone());
        apply_swap_info(&mut swap, &info);
        self.db.update(&swap)?;
        tracing::info!("Swap {} started as {} {}", swap.id, provider.name(), info.id);
        Ok(true)
    }

    /// Submits every pending swap-out to its provider.
    pub async fn process_requested_swaps(&self) -> Result<BatchReport, WorkflowError> {
        let pending: Vec<SwapOut> = self.db.list_by_status(RequestStatus::Pending)?;
        let mut report = BatchReport::default();

        for swap in pending {
            let id = swap.id;
            report.record("Starting swap", id, self.start_swap(swap).await);
        }

        Ok(report)
    }

    async fn poll_swap(&self, mut swap: SwapOut) -> Result<bool, WorkflowError> {
        let Some(provider_swap_id) = swap.provider_swap_id.clone() else {
            tracing::warn!("Swap {} is in flight without a provider id", swap.id);
            return Ok(false);
        };
        let provider = self.provider(&swap.provider).ok_or_else(|| {
            WorkflowError::InvalidRequest(format!("Swap {} names unknown provider {}", swap.id, swap.provider))
        })?;

        let info = provider.get_swap(&provider_swap_id).await?;
        if !apply_swap_info(&mut swap, &info) {
            return Ok(false);
        }

        self.db.update(&swap)?;
        if swap.status.is_terminal() {
            tracing::info!("Swap {} finished as {}", swap.id, swap.status);
        }
        Ok(swap.status.is_terminal())
    }

    /// Refreshes in-flight swaps from their providers.
    pub async fn poll_swaps(&self) -> Result<BatchReport, WorkflowError> {
        let in_flight: Vec<SwapOut> = self.db.list_by_status(RequestStatus::OnChainConfirmationPending)?;
        let mut report = BatchReport::default();

        for swap in in_flight {
            let id = swap.id;
            report.record("Polling swap", id, self.poll_swap(swap).await);
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{NodeError, SwapError};
    use crate::models::LogLevel;
    use crate::services::lightning::NodeChannelPool;
    use crate::services::swaps::LoopClient;

    fn info(state: SwapState) -> SwapInfo {
        SwapInfo {
            id: "00ff".to_string(),
            amount: Amount::from_sat(500_000),
            state,
            htlc_address: Some("bcrt1qhtlc".to_string()),
            invoice: None,
            preimage: None,
        }
    }

    fn service() -> (Arc<DbManager>, SwapService) {
        let db = Arc::new(DbManager::in_memory().unwrap());
        // no macaroon, so every call fails before reaching the network
        let provider = SwapProvider::Loop(LoopClient::new(
            Arc::new(NodeChannelPool::new()),
            "https://localhost:11010".to_string(),
            None,
        ));
        (db.clone(), SwapService::new(db, vec![Arc::new(provider)]))
    }

    #[test]
    fn test_swap_status_follows_provider_state() {
        let mut swap = SwapOut::new("loop", 500_000, "bcrt1qdest", 1_000);

        assert!(apply_swap_info(&mut swap, &info(SwapState::Initiated)));
        assert_eq!(swap.status, RequestStatus::OnChainConfirmationPending);
        assert_eq!(swap.htlc_address.as_deref(), Some("bcrt1qhtlc"));

        // a repeated report changes nothing
        assert!(!apply_swap_info(&mut swap, &info(SwapState::Initiated)));
        assert_eq!(swap.status_logs.len(), 1);

        assert!(apply_swap_info(&mut swap, &info(SwapState::HtlcPublished)));
        assert_eq!(swap.status, RequestStatus::OnChainConfirmationPending);

        assert!(apply_swap_info(&mut swap, &info(SwapState::Succeeded)));
        assert_eq!(swap.status, RequestStatus::OnChainConfirmed);

        let mut failed = SwapOut::new("loop", 500_000, "bcrt1qdest", 1_000);
        apply_swap_info(&mut failed, &info(SwapState::Failed));
        assert_eq!(failed.status, RequestStatus::Failed);
    }

    #[tokio::test]
    async fn test_unreachable_provider_leaves_swap_pending() {
        let (db, service) = service();
        let mut swap = SwapOut::new("loop", 500_000, "bcrt1qdest", 1_000);
        db.add(&mut swap).unwrap();
        let mut orphan = SwapOut::new("boltz", 500_000, "bcrt1qdest", 1_000);
        db.add(&mut orphan).unwrap();

        let report = service.process_requested_swaps().await.unwrap();
        assert_eq!(report, BatchReport { advanced: 0, failed: 2 });

        let swap: SwapOut = db.get(swap.id).unwrap();
        assert_eq!(swap.status, RequestStatus::Pending);
        assert_eq!(swap.status_logs.last().unwrap().level, LogLevel::Warning);

        let orphan: SwapOut = db.get(orphan.id).unwrap();
        assert_eq!(orphan.status, RequestStatus::Failed);
    }

    #[tokio::test]
    async fn test_poll_counts_failures_and_skips_swaps_without_id() {
        let (db, service) = service();
        let mut tracked = SwapOut::new("loop", 500_000, "bcrt1qdest", 1_000);
        tracked.provider_swap_id = Some("00ff".to_string());
        tracked.set_status(RequestStatus::OnChainConfirmationPending);
        db.add(&mut tracked).unwrap();
        let mut unnamed = SwapOut::new("loop", 500_000, "bcrt1qdest", 1_000);
        unnamed.set_status(RequestStatus::OnChainConfirmationPending);
        db.add(&mut unnamed).unwrap();

        let report = service.poll_swaps().await.unwrap();
        assert_eq!(report, BatchReport { advanced: 0, failed: 1 });

        let tracked: SwapOut = db.get(tracked.id).unwrap();
        assert_eq!(tracked.status, RequestStatus::OnChainConfirmationPending);

        let provider = service.provider("loop").unwrap();
        let err = provider.get_swap("00ff").await.unwrap_err();
        assert!(matches!(err, SwapError::Node(NodeError::InvalidMacaroon(_))));
    }
}
