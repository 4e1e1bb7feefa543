//! Local mirror of the node's reputation.
//!
//! Counters are updated under one mutex (the single writer); the derived
//! [`ReputationSnapshot`] is rebuilt after every change and swapped in whole, so
//! `current_snapshot` is a pure read that never observes a half-updated value.

use chrono::Utc;
use hypernode_types::{HealthCheckRecord, JobId, JobRun, JobState, ReputationMetrics, ReputationSnapshot};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, warn};

use crate::ledger::LedgerReputation;
use crate::metrics;

/// Job ids remembered for de-duplication.
const SEEN_JOBS_LIMIT: usize = 65_536;

/// Scores closer than this are considered equal when reconciling.
const SCORE_TOLERANCE: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Local state already matched the ledger.
    InSync,
    /// Local state diverged and was replaced by the ledger's.
    Replaced,
    /// The ledger has no profile for this node yet.
    NoProfile,
}

#[derive(Default)]
struct Counters {
    metrics: ReputationMetrics,
    seen: HashSet<JobId>,
    seen_order: VecDeque<JobId>,
}

impl Counters {
    /// Remember `id`; false if it was already known.
    fn remember(&mut self, id: &JobId) -> bool {
        if !self.seen.insert(id.clone()) {
            return false;
        }
        self.seen_order.push_back(id.clone());
        if self.seen_order.len() > SEEN_JOBS_LIMIT {
            if let Some(old) = self.seen_order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }
}

pub struct ReputationEngine {
    counters: Mutex<Counters>,
    snapshot: RwLock<Arc<ReputationSnapshot>>,
}

impl Default for ReputationEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ReputationEngine {
    pub fn new() -> Self {
        Self::with_metrics(ReputationMetrics::default())
    }

    pub fn with_metrics(metrics: ReputationMetrics) -> Self {
        let snapshot = ReputationSnapshot::from_metrics(&metrics, Utc::now());
        Self {
            counters: Mutex::new(Counters {
                metrics,
                ..Default::default()
            }),
            snapshot: RwLock::new(Arc::new(snapshot)),
        }
    }

    pub fn current_snapshot(&self) -> Arc<ReputationSnapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn metrics(&self) -> ReputationMetrics {
        self.lock().metrics.clone()
    }

    /// Count a terminal run. Returns false when the job was already counted or the
    /// run is not terminal. Cancellations are remembered but never scored.
    pub fn record_run(&self, run: &JobRun) -> bool {
        if !run.state.is_terminal() {
            return false;
        }
        let mut counters = self.lock();
        if !counters.remember(run.job_id()) {
            debug!(job_id = %run.job_id(), "Ignoring re-delivered job outcome");
            return false;
        }
        match run.state {
            JobState::Succeeded => counters.metrics.jobs_succeeded += 1,
            JobState::Failed | JobState::TimedOut => counters.metrics.jobs_failed += 1,
            _ => return false,
        }
        if let Some(ms) = run.response_time_ms() {
            counters.metrics.response_time_total_ms += ms;
            counters.metrics.response_samples += 1;
        }
        self.recompute(&counters.metrics);
        true
    }

    /// Count an accepted health check. Throttled checks never reach here.
    pub fn record_health(&self, record: &HealthCheckRecord) {
        let mut counters = self.lock();
        if record.passed {
            counters.metrics.health_checks_passed += 1;
        } else {
            counters.metrics.health_checks_failed += 1;
        }
        self.recompute(&counters.metrics);
    }

    pub fn record_heartbeat(&self, ok: bool) {
        let mut counters = self.lock();
        counters.metrics.heartbeats_total += 1;
        if ok {
            counters.metrics.heartbeats_ok += 1;
        }
        self.recompute(&counters.metrics);
    }

    /// Compare against the ledger and adopt its state on divergence.
    ///
    /// The ledger only receives job and health-check events, so only those counters
    /// and the score are compared and replaced. Heartbeat and response-time counters
    /// exist locally only and are kept.
    pub fn reconcile(&self, ledger: Option<&LedgerReputation>) -> ReconcileOutcome {
        let Some(ledger) = ledger else {
            return ReconcileOutcome::NoProfile;
        };
        let mut counters = self.lock();
        let local = self.current_snapshot();
        let diverged = ledger_counters(&counters.metrics) != ledger_counters(&ledger.metrics)
            || (local.score - ledger.score).abs() > SCORE_TOLERANCE;
        if !diverged {
            return ReconcileOutcome::InSync;
        }

        warn!(
            local_score = local.score,
            ledger_score = ledger.score,
            "Reputation diverged from ledger; adopting ledger state"
        );
        metrics::record_reconciliation_conflict();
        let adopted = &mut counters.metrics;
        adopted.jobs_succeeded = ledger.metrics.jobs_succeeded;
        adopted.jobs_failed = ledger.metrics.jobs_failed;
        adopted.health_checks_passed = ledger.metrics.health_checks_passed;
        adopted.health_checks_failed = ledger.metrics.health_checks_failed;
        let snapshot = ReputationSnapshot::with_score(&counters.metrics, ledger.score, Utc::now());
        self.replace(snapshot);
        ReconcileOutcome::Replaced
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn recompute(&self, metrics: &ReputationMetrics) {
        self.replace(ReputationSnapshot::from_metrics(metrics, Utc::now()));
    }

    fn replace(&self, snapshot: ReputationSnapshot) {
        metrics::set_reputation_score(snapshot.score);
        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(snapshot);
    }
}

fn ledger_counters(m: &ReputationMetrics) -> [u64; 4] {
    [
        m.jobs_succeeded,
        m.jobs_failed,
        m.health_checks_passed,
        m.health_checks_failed,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use hypernode_types::{
        JobOffer, PayloadRef, ResourceProfile, ResourceRequirements, Tier,
    };

    fn run(id: &str, state: JobState) -> JobRun {
        let now = Utc::now();
        let offer = JobOffer {
            job_id: JobId::new(id),
            job_type: None,
            requirements: ResourceRequirements {
                profile: ResourceProfile::CpuOnly,
                gpu_count: 0,
                vram_mb: 0,
                ram_mb: 512,
                cpu_cores: 1.0,
                capability: None,
            },
            payload: PayloadRef {
                image: "busybox".into(),
                command: vec![],
                env: Default::default(),
            },
            deadline: now + Duration::minutes(5),
        };
        let mut run = JobRun::queued(offer, now);
        run.started_at = Some(now + Duration::milliseconds(200));
        run.finished_at = Some(now + Duration::seconds(3));
        run.state = state;
        run
    }

    fn health(passed: bool) -> HealthCheckRecord {
        HealthCheckRecord {
            checked_at: Utc::now(),
            requester_id: "validator".into(),
            passed,
            bucket_key: "validator".into(),
        }
    }

    #[test]
    fn same_job_is_counted_once() {
        let engine = ReputationEngine::new();
        let done = run("job-1", JobState::Succeeded);
        assert!(engine.record_run(&done));
        assert!(!engine.record_run(&done));
        assert_eq!(engine.metrics().jobs_succeeded, 1);
        assert_eq!(engine.metrics().response_samples, 1);
    }

    #[test]
    fn cancellations_are_not_scored() {
        let engine = ReputationEngine::new();
        assert!(!engine.record_run(&run("job-c", JobState::Cancelled)));
        assert_eq!(engine.metrics(), ReputationMetrics::default());
        assert!(!engine.record_run(&run("job-r", JobState::Running)));
    }

    #[test]
    fn timeouts_count_as_failures() {
        let engine = ReputationEngine::new();
        engine.record_run(&run("a", JobState::Succeeded));
        engine.record_run(&run("b", JobState::TimedOut));
        let snap = engine.current_snapshot();
        assert!((snap.completion_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn failed_health_check_costs_ten_points() {
        let engine = ReputationEngine::new();
        for i in 0..10 {
            engine.record_run(&run(&format!("j{}", i), JobState::Succeeded));
            engine.record_heartbeat(true);
        }
        let before = engine.current_snapshot().score;
        engine.record_health(&health(false));
        let after = engine.current_snapshot();
        assert!((before - after.score - 10.0).abs() < 1e-9);
        assert_eq!(after.tier, Tier::Diamond);
        assert_eq!(after.health_pass_rate, 0.0);
        assert_eq!(after.matching_priority, 0.0);
    }

    #[test]
    fn snapshot_is_replaced_not_mutated() {
        let engine = ReputationEngine::new();
        let old = engine.current_snapshot();
        engine.record_heartbeat(true);
        let new = engine.current_snapshot();
        assert!(!Arc::ptr_eq(&old, &new));
        assert_eq!(old.uptime_ratio, 0.0);
        assert_eq!(new.uptime_ratio, 1.0);
    }

    #[test]
    fn ledger_wins_on_divergence() {
        let engine = ReputationEngine::new();
        engine.record_run(&run("a", JobState::Succeeded));
        assert_eq!(engine.reconcile(None), ReconcileOutcome::NoProfile);

        let ledger = LedgerReputation {
            score: 650.0,
            metrics: ReputationMetrics {
                jobs_succeeded: 40,
                jobs_failed: 10,
                ..Default::default()
            },
            updated_at: None,
        };
        assert_eq!(engine.reconcile(Some(&ledger)), ReconcileOutcome::Replaced);
        let snap = engine.current_snapshot();
        assert_eq!(snap.score, 650.0);
        assert_eq!(snap.tier, Tier::Gold);
        assert_eq!(engine.metrics().jobs_succeeded, 40);

        assert_eq!(engine.reconcile(Some(&ledger)), ReconcileOutcome::InSync);
        // already-seen jobs stay de-duplicated after a replace
        assert!(!engine.record_run(&run("a", JobState::Succeeded)));
    }

    #[test]
    fn local_only_counters_do_not_cause_conflicts() {
        let engine = ReputationEngine::new();
        engine.record_run(&run("a", JobState::Succeeded));
        engine.record_heartbeat(true);
        engine.record_heartbeat(false);
        engine.record_health(&health(true));

        let local = engine.metrics();
        let ledger = LedgerReputation {
            score: engine.current_snapshot().score,
            metrics: ReputationMetrics {
                jobs_succeeded: 1,
                health_checks_passed: 1,
                ..Default::default()
            },
            updated_at: None,
        };
        assert_eq!(engine.reconcile(Some(&ledger)), ReconcileOutcome::InSync);
        assert_eq!(engine.metrics(), local);
    }

    #[test]
    fn replace_keeps_heartbeat_history() {
        let engine = ReputationEngine::new();
        engine.record_heartbeat(true);
        engine.record_heartbeat(true);
        let ledger = LedgerReputation {
            score: 300.0,
            metrics: ReputationMetrics {
                jobs_succeeded: 3,
                jobs_failed: 1,
                health_checks_failed: 2,
                ..Default::default()
            },
            updated_at: None,
        };
        assert_eq!(engine.reconcile(Some(&ledger)), ReconcileOutcome::Replaced);
        let metrics = engine.metrics();
        assert_eq!(metrics.jobs_succeeded, 3);
        assert_eq!(metrics.health_checks_failed, 2);
        assert_eq!(metrics.heartbeats_total, 2);
        assert_eq!(metrics.heartbeats_ok, 2);
        assert_eq!(engine.current_snapshot().score, 300.0);
    }
}
