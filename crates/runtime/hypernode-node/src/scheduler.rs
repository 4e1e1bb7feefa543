//! Job admission, dispatch and completion reporting.
//!
//! Admission is a single check-and-increment on the in-flight counter, done while
//! holding the job registry lock so duplicate ids cannot race in. Each admitted job
//! gets one task that drives its sandbox until it completes, hits its deadline or is
//! cancelled. Terminal runs are appended to a bounded history and broadcast under
//! the same lock, so a subscriber's replay and live feed neither overlap nor leave a
//! gap.

use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use hypernode_sandbox::{Sandbox, SandboxError, SandboxHandle, SandboxPolicy, SandboxSpec};
use hypernode_types::{
    CancelAck, FailureKind, JobError, JobId, JobOffer, JobRun, JobState, OfferDecision,
    RejectReason, TerminalOutcome,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics;
use crate::state::NodeHandle;
use crate::telemetry::TelemetryCollector;

/// Finished job ids remembered for duplicate detection.
const FINISHED_IDS_LIMIT: usize = 4_096;

const EVENT_BUFFER: usize = 1_024;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub capacity: usize,
    /// Time a sandbox gets between graceful termination and a forced kill.
    pub kill_grace: Duration,
    pub history_limit: usize,
    pub policy: SandboxPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            capacity: 1,
            kill_grace: Duration::from_secs(10),
            history_limit: 256,
            policy: SandboxPolicy::default(),
        }
    }
}

#[derive(Default)]
struct Registry {
    active: HashMap<JobId, CancellationToken>,
    finished: HashSet<JobId>,
    finished_order: VecDeque<JobId>,
}

impl Registry {
    fn knows(&self, id: &JobId) -> bool {
        self.active.contains_key(id) || self.finished.contains(id)
    }

    fn retire(&mut self, id: &JobId) {
        self.active.remove(id);
        if self.finished.insert(id.clone()) {
            self.finished_order.push_back(id.clone());
            if self.finished_order.len() > FINISHED_IDS_LIMIT {
                if let Some(old) = self.finished_order.pop_front() {
                    self.finished.remove(&old);
                }
            }
        }
    }
}

struct Completions {
    history: VecDeque<Arc<JobRun>>,
    limit: usize,
}

struct Inner {
    sandbox: Arc<dyn Sandbox>,
    telemetry: Arc<TelemetryCollector>,
    node: NodeHandle,
    policy: SandboxPolicy,
    kill_grace: Duration,
    capacity: AtomicUsize,
    in_flight: AtomicUsize,
    registry: Mutex<Registry>,
    completions: Mutex<Completions>,
    events: broadcast::Sender<Arc<JobRun>>,
    idle: Notify,
}

/// One unit of the concurrency budget. Returned exactly once, on drop.
///
/// Every change to `in_flight` is published while holding the registry lock, so
/// the published counts arrive in the order the changes were made.
struct AdmissionPermit {
    inner: Arc<Inner>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        let registry = self.inner.registry.lock().unwrap_or_else(|e| e.into_inner());
        let left = self.inner.in_flight.fetch_sub(1, Ordering::AcqRel) - 1;
        self.inner.node.set_in_flight(left);
        metrics::set_in_flight(left);
        drop(registry);
        self.inner.idle.notify_waiters();
    }
}

#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<Inner>,
}

impl JobScheduler {
    pub fn new(
        config: SchedulerConfig,
        sandbox: Arc<dyn Sandbox>,
        telemetry: Arc<TelemetryCollector>,
        node: NodeHandle,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        node.set_capacity(config.capacity);
        Self {
            inner: Arc::new(Inner {
                sandbox,
                telemetry,
                node,
                policy: config.policy,
                kill_grace: config.kill_grace,
                capacity: AtomicUsize::new(config.capacity),
                in_flight: AtomicUsize::new(0),
                registry: Mutex::new(Registry::default()),
                completions: Mutex::new(Completions {
                    history: VecDeque::new(),
                    limit: config.history_limit.max(1),
                }),
                events,
                idle: Notify::new(),
            }),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity.load(Ordering::Acquire)
    }

    /// Change the budget for future admissions. Running jobs are never preempted.
    pub fn set_capacity(&self, capacity: usize) {
        self.inner.capacity.store(capacity, Ordering::Release);
        self.inner.node.set_capacity(capacity);
        info!(capacity, "Job capacity changed");
    }

    /// Admit or reject an offer. Never waits on anything but the admission lock.
    pub fn offer(&self, offer: JobOffer) -> OfferDecision {
        match self.admit(&offer) {
            Ok((permit, cancel)) => {
                metrics::record_offer_accepted();
                info!(
                    job_id = %offer.job_id,
                    job_type = offer.job_type.as_deref().unwrap_or("-"),
                    profile = offer.requirements.profile.as_str(),
                    "Job offer accepted"
                );
                let run = JobRun::queued(offer, Utc::now());
                tokio::spawn(dispatch(self.inner.clone(), run, cancel, permit));
                OfferDecision::Accepted
            }
            Err(reason) => {
                metrics::record_offer_rejected(reason.label());
                info!(job_id = %offer.job_id, reason = %reason, "Job offer rejected");
                OfferDecision::Rejected(reason)
            }
        }
    }

    fn admit(&self, offer: &JobOffer) -> Result<(AdmissionPermit, CancellationToken), RejectReason> {
        let status = self.inner.node.snapshot();
        if !status.lifecycle.accepts_jobs() {
            return Err(RejectReason::NodeNotOnline(status.lifecycle.to_string()));
        }
        offer
            .validate()
            .map_err(|e| RejectReason::InvalidOffer(e.to_string()))?;
        if let Some(unmet) = offer.requirements.unmet_by(&status.capability) {
            return Err(RejectReason::CapabilityMismatch(unmet));
        }

        let mut registry = self.lock_registry();
        if registry.knows(&offer.job_id) {
            return Err(RejectReason::DuplicateJob);
        }
        let capacity = self.capacity();
        let admitted = self
            .inner
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < capacity).then_some(n + 1)
            });
        let now_in_flight = match admitted {
            Ok(prev) => prev + 1,
            Err(_) => return Err(RejectReason::CapacityExceeded),
        };
        let cancel = CancellationToken::new();
        registry.active.insert(offer.job_id.clone(), cancel.clone());
        self.inner.node.set_in_flight(now_in_flight);
        metrics::set_in_flight(now_in_flight);
        drop(registry);

        let permit = AdmissionPermit {
            inner: self.inner.clone(),
        };
        Ok((permit, cancel))
    }

    pub fn cancel(&self, job_id: &JobId) -> CancelAck {
        match self.lock_registry().active.get(job_id) {
            Some(token) => {
                info!(job_id = %job_id, "Cancelling job");
                token.cancel();
                CancelAck::Ack
            }
            None => CancelAck::NotFound,
        }
    }

    /// Terminal runs: the retained history first, then live completions.
    pub fn subscribe(&self) -> BoxStream<'static, Arc<JobRun>> {
        let completions = self.inner.completions.lock().unwrap_or_else(|e| e.into_inner());
        let rx = self.inner.events.subscribe();
        let replay: Vec<Arc<JobRun>> = completions.history.iter().cloned().collect();
        drop(completions);

        let live = BroadcastStream::new(rx).filter_map(|item| async move {
            match item {
                Ok(run) => Some(run),
                Err(e) => {
                    warn!(error = %e, "Completion subscriber fell behind");
                    None
                }
            }
        });
        stream::iter(replay).chain(live).boxed()
    }

    /// Wait up to `grace` for in-flight jobs, then cancel whatever is left and wait
    /// for those to wind down.
    pub async fn drain(&self, grace: Duration) {
        if tokio::time::timeout(grace, self.wait_idle()).await.is_ok() {
            return;
        }
        let tokens: Vec<CancellationToken> = self.lock_registry().active.values().cloned().collect();
        warn!(remaining = tokens.len(), "Drain grace elapsed, cancelling remaining jobs");
        for token in tokens {
            token.cancel();
        }
        let hard_limit = self.inner.kill_grace * 2 + Duration::from_secs(5);
        if tokio::time::timeout(hard_limit, self.wait_idle()).await.is_err() {
            warn!(in_flight = self.in_flight(), "Jobs still in flight after forced cancellation");
        }
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn lock_registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.inner.registry.lock().unwrap_or_else(|e| e.into_inner())
    }
}

enum Interrupt {
    Deadline,
    Cancelled,
}

async fn dispatch(inner: Arc<Inner>, mut run: JobRun, cancel: CancellationToken, permit: AdmissionPermit) {
    let job_id = run.job_id().clone();

    if run.offer.deadline <= Utc::now() {
        fail(&mut run, JobState::TimedOut, FailureKind::TimedOut, "deadline passed before dispatch");
        return inner.finish(run, permit).await;
    }
    if cancel.is_cancelled() {
        run.state = JobState::Cancelled;
        return inner.finish(run, permit).await;
    }

    let spec = SandboxSpec::for_offer(&run.offer, &inner.policy);
    debug!(job_id = %job_id, backend = inner.sandbox.backend(), "Dispatching job");
    let handle = match inner.sandbox.run(spec).await {
        Ok(handle) => handle,
        Err(e) => {
            warn!(job_id = %job_id, error = %e, "Sandbox failed to start");
            fail(&mut run, JobState::Failed, FailureKind::StartupError, e.to_string());
            return inner.finish(run, permit).await;
        }
    };
    run.sandbox_id = Some(handle.sandbox_id.clone());

    let remaining = (run.offer.deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    if remaining.is_zero() {
        inner.stop_sandbox(&handle).await;
        fail(&mut run, JobState::TimedOut, FailureKind::TimedOut, "deadline passed before start");
        inner.release_into(&mut run, &handle).await;
        return inner.finish(run, permit).await;
    }

    run.state = JobState::Running;
    run.started_at = Some(Utc::now());
    debug!(job_id = %job_id, sandbox = %handle.sandbox_id, "Job running");

    let waited = tokio::select! {
        outcome = inner.sandbox.wait(&handle) => Ok(outcome),
        _ = tokio::time::sleep(remaining) => Err(Interrupt::Deadline),
        _ = cancel.cancelled() => Err(Interrupt::Cancelled),
    };

    match waited {
        Ok(outcome) => apply_outcome(&mut run, outcome),
        Err(Interrupt::Deadline) => {
            warn!(job_id = %job_id, "Job deadline elapsed, stopping sandbox");
            inner.stop_sandbox(&handle).await;
            fail(&mut run, JobState::TimedOut, FailureKind::TimedOut, "deadline elapsed");
        }
        Err(Interrupt::Cancelled) => {
            inner.stop_sandbox(&handle).await;
            run.state = JobState::Cancelled;
        }
    }

    inner.release_into(&mut run, &handle).await;
    inner.finish(run, permit).await;
}

fn fail(run: &mut JobRun, state: JobState, kind: FailureKind, message: impl Into<String>) {
    run.state = state;
    run.error = Some(JobError::new(kind, message));
}

fn apply_outcome(run: &mut JobRun, outcome: TerminalOutcome) {
    match outcome {
        TerminalOutcome::Exited { exit_code: 0 } => run.state = JobState::Succeeded,
        TerminalOutcome::Exited { exit_code } => fail(
            run,
            JobState::Failed,
            FailureKind::RuntimeError,
            format!("exited with code {}", exit_code),
        ),
        TerminalOutcome::RuntimeError { message, .. } => {
            fail(run, JobState::Failed, FailureKind::RuntimeError, message)
        }
        TerminalOutcome::ResourceExceeded { resource, detail } => fail(
            run,
            JobState::Failed,
            FailureKind::ResourceExceeded,
            format!("{} limit exceeded: {}", resource, detail),
        ),
        TerminalOutcome::Killed => fail(run, JobState::Failed, FailureKind::Killed, "sandbox was killed"),
    }
}

impl Inner {
    /// Graceful termination, escalating to a kill after the grace period.
    async fn stop_sandbox(&self, handle: &SandboxHandle) {
        if let Err(e) = self.sandbox.terminate(handle).await {
            warn!(job_id = %handle.job_id, error = %e, "Graceful termination failed");
        }
        if tokio::time::timeout(self.kill_grace, self.sandbox.wait(handle)).await.is_ok() {
            return;
        }
        warn!(job_id = %handle.job_id, "Sandbox ignored termination, killing");
        if let Err(e) = self.sandbox.kill(handle).await {
            warn!(job_id = %handle.job_id, error = %e, "Kill failed");
        }
        let _ = tokio::time::timeout(self.kill_grace, self.sandbox.wait(handle)).await;
    }

    async fn release_into(&self, run: &mut JobRun, handle: &SandboxHandle) {
        match self.sandbox.release(handle).await {
            Ok(result) => run.result = Some(result),
            Err(e @ SandboxError::ResultTooLarge { .. }) => {
                warn!(job_id = %handle.job_id, error = %e, "Job result rejected");
                if run.state == JobState::Succeeded {
                    fail(run, JobState::Failed, FailureKind::ResourceExceeded, e.to_string());
                }
            }
            Err(e) => warn!(job_id = %handle.job_id, error = %e, "Failed to release sandbox"),
        }
    }

    async fn finish(&self, mut run: JobRun, permit: AdmissionPermit) {
        run.telemetry = Some(self.telemetry.sample().await);
        run.finished_at = Some(Utc::now());

        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retire(run.job_id());

        metrics::record_job_finished(run.state.as_str());
        match &run.error {
            Some(err) => info!(job_id = %run.job_id(), state = run.state.as_str(), error = %err, "Job finished"),
            None => info!(job_id = %run.job_id(), state = run.state.as_str(), "Job finished"),
        }

        let run = Arc::new(run);
        let mut completions = self.completions.lock().unwrap_or_else(|e| e.into_inner());
        completions.history.push_back(run.clone());
        while completions.history.len() > completions.limit {
            completions.history.pop_front();
        }
        // No subscribers is fine; the history keeps the run for later ones.
        let _ = self.events.send(run);
        drop(completions);

        // Capacity comes back only after the run is visible to subscribers, so a
        // drain never finishes ahead of the last completion.
        drop(permit);
    }
}
