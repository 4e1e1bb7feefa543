//! Permissionless health probes, rate limited per requester-class.
//!
//! A requester-class is the network a probe arrives from (see
//! [`requester_class`]), so a requester cannot mint fresh classes by renaming
//! itself. Each class is either idle or in cooldown until `expires_at`. A check
//! arriving during cooldown is `Throttled` and leaves no trace beyond a metric; so is
//! one from an unseen class while the cooldown table is full. An accepted check is
//! evaluated against the cached node status only, appended to the record log, fed
//! to the reputation engine and submitted to the ledger.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use hypernode_types::{requester_class, HealthCheckRecord, HealthProbe, HealthVerdict, NodeStatus};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::ledger::{LedgerClient, NoopLedger, ReputationRecord};
use crate::metrics;
use crate::reputation::ReputationEngine;
use crate::state::NodeHandle;

/// What the prober gets back.
#[derive(Debug, Clone, Serialize)]
pub struct HealthAnswer {
    pub verdict: HealthVerdict,
    pub nonce: String,
    /// Only set for accepted checks.
    pub status: Option<StatusSummary>,
    pub detail: Option<String>,
    /// Seconds until this requester-class may check again.
    pub retry_after_secs: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSummary {
    pub lifecycle: String,
    pub gpu_model: String,
    pub gpu_count: u32,
    pub vram_mb: u64,
    pub in_flight: usize,
    pub capacity: usize,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

impl From<&NodeStatus> for StatusSummary {
    fn from(s: &NodeStatus) -> Self {
        Self {
            lifecycle: s.lifecycle.as_str().to_string(),
            gpu_model: s.capability.gpu_model.clone(),
            gpu_count: s.capability.gpu_count,
            vram_mb: s.capability.vram_mb,
            in_flight: s.in_flight,
            capacity: s.capacity,
            last_heartbeat_at: s.last_heartbeat_at,
        }
    }
}

#[derive(Default)]
struct ResponderState {
    /// Requester-class → end of its cooldown.
    cooldowns: HashMap<String, DateTime<Utc>>,
    records: VecDeque<HealthCheckRecord>,
}

pub struct HealthCheckResponder {
    node: NodeHandle,
    reputation: Arc<ReputationEngine>,
    ledger: Arc<dyn LedgerClient>,
    /// Ledger subject (the provider wallet).
    subject: String,
    cooldown: ChronoDuration,
    max_classes: usize,
    max_records: usize,
    state: Mutex<ResponderState>,
}

impl HealthCheckResponder {
    pub fn new(
        node: NodeHandle,
        reputation: Arc<ReputationEngine>,
        cooldown: Duration,
        max_classes: usize,
        max_records: usize,
    ) -> Self {
        Self {
            node,
            reputation,
            ledger: Arc::new(NoopLedger),
            subject: String::new(),
            cooldown: ChronoDuration::from_std(cooldown).unwrap_or(ChronoDuration::seconds(300)),
            max_classes: max_classes.max(1),
            max_records: max_records.max(1),
            state: Mutex::new(ResponderState::default()),
        }
    }

    /// Submit accepted checks to `ledger` under `subject`.
    pub fn with_ledger(mut self, ledger: Arc<dyn LedgerClient>, subject: impl Into<String>) -> Self {
        self.ledger = ledger;
        self.subject = subject.into();
        self
    }

    pub async fn handle_check(
        &self,
        peer: IpAddr,
        requester_id: &str,
        probe: &HealthProbe,
    ) -> HealthAnswer {
        self.handle_check_at(peer, requester_id, probe, Utc::now()).await
    }

    /// `handle_check` with an explicit clock.
    pub async fn handle_check_at(
        &self,
        peer: IpAddr,
        requester_id: &str,
        probe: &HealthProbe,
        now: DateTime<Utc>,
    ) -> HealthAnswer {
        let key = requester_class(peer);

        // Claim the cooldown slot before evaluating, so concurrent checks from the
        // same class cannot both be accepted.
        {
            let mut state = self.lock();
            state.cooldowns.retain(|_, expires| *expires > now);
            let blocked_until = match state.cooldowns.get(&key) {
                Some(expires) => Some(*expires),
                None if state.cooldowns.len() >= self.max_classes => {
                    warn!(class = %key, tracked = state.cooldowns.len(), "Health check table full");
                    state.cooldowns.values().min().copied()
                }
                None => None,
            };
            if let Some(expires) = blocked_until {
                let retry_after = (expires - now).num_seconds().max(1);
                debug!(requester = %requester_id, class = %key, retry_after, "Health check throttled");
                metrics::record_health_check(HealthVerdict::Throttled.as_str());
                return HealthAnswer {
                    verdict: HealthVerdict::Throttled,
                    nonce: probe.nonce.clone(),
                    status: None,
                    detail: None,
                    retry_after_secs: Some(retry_after),
                };
            }
            state.cooldowns.insert(key.clone(), now + self.cooldown);
        }

        let status = self.node.snapshot();
        let failure = evaluate(&status, probe).err();
        let verdict = if failure.is_none() {
            HealthVerdict::Pass
        } else {
            HealthVerdict::Fail
        };

        let record = HealthCheckRecord {
            checked_at: now,
            requester_id: requester_id.to_string(),
            passed: verdict == HealthVerdict::Pass,
            bucket_key: key,
        };
        {
            let mut state = self.lock();
            state.records.push_back(record.clone());
            while state.records.len() > self.max_records {
                state.records.pop_front();
            }
        }
        self.reputation.record_health(&record);
        self.submit(&record);
        metrics::record_health_check(verdict.as_str());
        info!(
            requester = %requester_id,
            class = %record.bucket_key,
            verdict = verdict.as_str(),
            "Health check answered"
        );

        HealthAnswer {
            verdict,
            nonce: probe.nonce.clone(),
            status: Some(StatusSummary::from(&status)),
            detail: failure,
            retry_after_secs: Some(self.cooldown.num_seconds()),
        }
    }

    /// Accepted checks, oldest first.
    pub fn records(&self) -> Vec<HealthCheckRecord> {
        self.lock().records.iter().cloned().collect()
    }

    fn submit(&self, record: &HealthCheckRecord) {
        let score = self.reputation.current_snapshot().score;
        let record = ReputationRecord::for_health(&self.subject, record, score);
        let ledger = self.ledger.clone();
        tokio::spawn(async move {
            if let Err(e) = ledger.submit_record(&record).await {
                warn!(event = ?record.event, error = %e, "Failed to submit reputation record");
            }
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ResponderState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Check the probe's claims against the cached status.
fn evaluate(status: &NodeStatus, probe: &HealthProbe) -> Result<(), String> {
    if !status.lifecycle.is_live() {
        return Err(format!("node is {}", status.lifecycle));
    }
    if let Some(expected) = &probe.expect_gpu_model {
        let advertised = status.capability.gpu_model.to_ascii_lowercase();
        if !advertised.contains(&expected.trim().to_ascii_lowercase()) {
            return Err(format!(
                "advertised GPU {:?} does not match {:?}",
                status.capability.gpu_model, expected
            ));
        }
    }
    if let Some(min_vram) = probe.expect_min_vram_mb {
        if min_vram > 0 && !status.capability.has_gpu() {
            return Err("node advertises no GPU".to_string());
        }
        if status.capability.vram_mb < min_vram {
            return Err(format!(
                "advertised VRAM {} MB below {} MB",
                status.capability.vram_mb, min_vram
            ));
        }
    }
    Ok(())
}
