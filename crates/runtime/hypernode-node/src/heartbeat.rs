use chrono::{DateTime, Utc};
use hypernode_types::LifecycleState;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::{Backoff, MAX_TRACKED_FAILURES};
use crate::coordinator::{CoordinatorClient, Heartbeat};
use crate::metrics;
use crate::reputation::ReputationEngine;
use crate::state::NodeHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeatOutcome {
    Sent,
    Failed { consecutive: u32, retry_in: Duration },
    /// The node is not in a live state; nothing was sent.
    Skipped,
}

/// Periodic liveness signal. Owned by a single task and driven through `&mut self`,
/// so sends never overlap.
pub struct HeartbeatMonitor {
    coordinator: Arc<dyn CoordinatorClient>,
    node: NodeHandle,
    reputation: Arc<ReputationEngine>,
    wallet: String,
    interval: Duration,
    failure_threshold: u32,
    backoff: Backoff,
    consecutive_failures: u32,
    last_sent: Option<DateTime<Utc>>,
}

impl HeartbeatMonitor {
    pub fn new(
        coordinator: Arc<dyn CoordinatorClient>,
        node: NodeHandle,
        reputation: Arc<ReputationEngine>,
        wallet: String,
        interval: Duration,
        failure_threshold: u32,
        backoff: Backoff,
    ) -> Self {
        Self {
            coordinator,
            node,
            reputation,
            wallet,
            interval,
            failure_threshold,
            backoff,
            consecutive_failures: 0,
            last_sent: None,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_sent(&self) -> Option<DateTime<Utc>> {
        self.last_sent
    }

    /// Send one heartbeat and apply its effect on the lifecycle.
    pub async fn beat(&mut self) -> BeatOutcome {
        let status = self.node.snapshot();
        if !status.lifecycle.is_live() {
            return BeatOutcome::Skipped;
        }

        let now = Utc::now();
        let payload = Heartbeat {
            wallet_address: self.wallet.clone(),
            status: status.lifecycle.as_str().to_string(),
            in_flight: status.in_flight,
            capacity: status.capacity,
            timestamp: now,
        };

        match self.coordinator.heartbeat(&payload).await {
            Ok(()) => {
                self.last_sent = Some(now);
                self.consecutive_failures = 0;
                self.backoff.reset();
                self.reputation.record_heartbeat(true);
                self.node.mark_heartbeat(now);
                if self.node.lifecycle() == LifecycleState::Degraded
                    && self.node.transition(LifecycleState::Online).is_ok()
                {
                    info!("Heartbeat recovered, node back online");
                }
                debug!(in_flight = status.in_flight, "Heartbeat sent");
                BeatOutcome::Sent
            }
            Err(e) => {
                self.consecutive_failures = (self.consecutive_failures + 1).min(MAX_TRACKED_FAILURES);
                self.reputation.record_heartbeat(false);
                metrics::record_heartbeat_failure();
                let retry_in = self.backoff.next_delay();
                warn!(
                    error = %e,
                    consecutive = self.consecutive_failures,
                    retry_in_secs = retry_in.as_secs(),
                    "Heartbeat failed"
                );
                if self.consecutive_failures >= self.failure_threshold
                    && self.node.lifecycle() == LifecycleState::Online
                    && self.node.transition(LifecycleState::Degraded).is_ok()
                {
                    warn!(
                        threshold = self.failure_threshold,
                        "Heartbeat failure threshold reached, node degraded"
                    );
                }
                BeatOutcome::Failed {
                    consecutive: self.consecutive_failures,
                    retry_in,
                }
            }
        }
    }

    /// Beat on the fixed interval, or on the backoff schedule while failing.
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            let delay = match self.beat().await {
                BeatOutcome::Sent | BeatOutcome::Skipped => self.interval,
                BeatOutcome::Failed { retry_in, .. } => retry_in,
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        debug!("Heartbeat monitor stopped");
    }
}
