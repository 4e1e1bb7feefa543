#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use hypernode_node::coordinator::{
    CoordinatorClient, CoordinatorError, FailureReport, Heartbeat, Registration, RegistrationAck,
    ResultReport, TelemetryReport,
};
use hypernode_node::state::NodeHandle;
use hypernode_node::telemetry::{NoGpu, TelemetryCollector};
use hypernode_node::{JobScheduler, SchedulerConfig};
use hypernode_sandbox::{Sandbox, SandboxError, SandboxHandle, SandboxSpec};
use hypernode_types::{
    JobId, JobOffer, JobResult, LifecycleState, NodeCapability, PayloadRef, ResourceProfile,
    ResourceRequirements, TerminalOutcome,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Sandbox whose behaviour is scripted through the payload's first command word:
///
/// - `exit:<code>`: exits immediately with `code`
/// - `bigresult`: exits 0 but leaves a result too large to hand back
/// - `sleep:<ms>:<code>`: exits with `code` after `ms`
/// - `oom`: trips the memory limit after 10 ms
/// - `hang`: runs until terminated or killed
/// - `stubborn`: ignores graceful termination, only a kill stops it
/// - `fail-start`: never launches
#[derive(Default)]
pub struct FakeSandbox {
    entries: Mutex<HashMap<String, FakeEntry>>,
    pub started: AtomicUsize,
    pub released: Mutex<Vec<JobId>>,
    pub terminated: Mutex<Vec<JobId>>,
    pub killed: Mutex<Vec<JobId>>,
}

struct FakeEntry {
    outcome: watch::Sender<Option<TerminalOutcome>>,
    stubborn: bool,
    oversized: bool,
}

fn settle(tx: &watch::Sender<Option<TerminalOutcome>>, outcome: TerminalOutcome) {
    tx.send_if_modified(|current| {
        if current.is_none() {
            *current = Some(outcome);
            true
        } else {
            false
        }
    });
}

impl FakeSandbox {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> Vec<JobId> {
        self.released.lock().unwrap().clone()
    }

    pub fn killed(&self) -> Vec<JobId> {
        self.killed.lock().unwrap().clone()
    }

    pub fn terminated(&self) -> Vec<JobId> {
        self.terminated.lock().unwrap().clone()
    }

    fn sender(&self, handle: &SandboxHandle) -> Result<watch::Sender<Option<TerminalOutcome>>, SandboxError> {
        self.entries
            .lock()
            .unwrap()
            .get(&handle.sandbox_id)
            .map(|e| e.outcome.clone())
            .ok_or_else(|| SandboxError::UnknownHandle(handle.sandbox_id.clone()))
    }
}

#[async_trait]
impl Sandbox for FakeSandbox {
    fn backend(&self) -> &'static str {
        "fake"
    }

    async fn run(&self, spec: SandboxSpec) -> Result<SandboxHandle, SandboxError> {
        let script = spec.payload.command.first().cloned().unwrap_or_default();
        if script == "fail-start" {
            return Err(SandboxError::Startup {
                job_id: spec.job_id.clone(),
                reason: "image not found".into(),
            });
        }

        let (tx, _rx) = watch::channel(None);
        let parts: Vec<&str> = script.split(':').collect();
        match parts.as_slice() {
            ["exit", code] => settle(&tx, TerminalOutcome::Exited { exit_code: code.parse().unwrap() }),
            ["bigresult"] => settle(&tx, TerminalOutcome::Exited { exit_code: 0 }),
            ["sleep", ms, code] => {
                let tx = tx.clone();
                let delay = Duration::from_millis(ms.parse().unwrap());
                let exit_code = code.parse().unwrap();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    settle(&tx, TerminalOutcome::Exited { exit_code });
                });
            }
            ["oom"] => {
                let tx = tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    settle(
                        &tx,
                        TerminalOutcome::ResourceExceeded {
                            resource: "memory".into(),
                            detail: "resident set above 64 MB".into(),
                        },
                    );
                });
            }
            _ => {}
        }

        let sandbox_id = format!("fake-{}", spec.job_id);
        self.entries.lock().unwrap().insert(
            sandbox_id.clone(),
            FakeEntry {
                outcome: tx,
                stubborn: script == "stubborn",
                oversized: script == "bigresult",
            },
        );
        self.started.fetch_add(1, Ordering::SeqCst);
        Ok(SandboxHandle {
            job_id: spec.job_id,
            sandbox_id,
            data_dir: std::env::temp_dir(),
        })
    }

    async fn wait(&self, handle: &SandboxHandle) -> TerminalOutcome {
        let mut rx = match self.sender(handle) {
            Ok(tx) => tx.subscribe(),
            Err(e) => {
                return TerminalOutcome::RuntimeError {
                    exit_code: None,
                    message: e.to_string(),
                }
            }
        };
        let outcome = match rx.wait_for(|o| o.is_some()).await {
            Ok(o) => o.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or(TerminalOutcome::Killed)
    }

    async fn terminate(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        self.terminated.lock().unwrap().push(handle.job_id.clone());
        let stubborn = self
            .entries
            .lock()
            .unwrap()
            .get(&handle.sandbox_id)
            .map(|e| e.stubborn)
            .unwrap_or(false);
        if !stubborn {
            settle(&self.sender(handle)?, TerminalOutcome::Killed);
        }
        Ok(())
    }

    async fn kill(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        self.killed.lock().unwrap().push(handle.job_id.clone());
        settle(&self.sender(handle)?, TerminalOutcome::Killed);
        Ok(())
    }

    async fn release(&self, handle: &SandboxHandle) -> Result<JobResult, SandboxError> {
        let entry = self
            .entries
            .lock()
            .unwrap()
            .remove(&handle.sandbox_id)
            .ok_or_else(|| SandboxError::UnknownHandle(handle.sandbox_id.clone()))?;
        self.released.lock().unwrap().push(handle.job_id.clone());
        if entry.oversized {
            return Err(SandboxError::ResultTooLarge {
                size: 2 << 20,
                limit: 1 << 20,
            });
        }
        let exit_code = match &*entry.outcome.borrow() {
            Some(TerminalOutcome::Exited { exit_code }) => Some(*exit_code),
            _ => None,
        };
        Ok(JobResult {
            output: Some(serde_json::json!({ "job": handle.job_id.as_str() })),
            logs: vec![format!("{} done", handle.job_id)],
            exit_code,
        })
    }
}

/// Coordinator double that records every call.
#[derive(Default)]
pub struct FakeCoordinator {
    pub offers: Mutex<VecDeque<JobOffer>>,
    pub registrations: Mutex<Vec<Registration>>,
    pub heartbeats: Mutex<Vec<Heartbeat>>,
    pub results: Mutex<Vec<(JobId, ResultReport)>>,
    pub failures: Mutex<Vec<(JobId, FailureReport)>>,
    pub telemetry: Mutex<Vec<TelemetryReport>>,
    pub fail_heartbeats: AtomicBool,
    /// Registration attempts to refuse before accepting.
    pub refuse_registrations: AtomicU32,
}

impl FakeCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_offer(&self, offer: JobOffer) {
        self.offers.lock().unwrap().push_back(offer);
    }

    pub fn set_heartbeat_failing(&self, failing: bool) {
        self.fail_heartbeats.store(failing, Ordering::SeqCst);
    }

    pub fn result_ids(&self) -> Vec<JobId> {
        self.results.lock().unwrap().iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn failure_kinds(&self) -> Vec<(JobId, String)> {
        self.failures
            .lock()
            .unwrap()
            .iter()
            .map(|(id, r)| (id.clone(), r.kind.clone()))
            .collect()
    }
}

fn unavailable() -> CoordinatorError {
    CoordinatorError::Status {
        status: 503,
        body: "unavailable".into(),
    }
}

#[async_trait]
impl CoordinatorClient for FakeCoordinator {
    async fn register(&self, registration: &Registration) -> Result<RegistrationAck, CoordinatorError> {
        self.registrations.lock().unwrap().push(registration.clone());
        let refused = self
            .refuse_registrations
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(unavailable());
        }
        Ok(RegistrationAck {
            node_id: Some("node-1".into()),
        })
    }

    async fn heartbeat(&self, beat: &Heartbeat) -> Result<(), CoordinatorError> {
        if self.fail_heartbeats.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        self.heartbeats.lock().unwrap().push(beat.clone());
        Ok(())
    }

    async fn poll_offer(&self, _wallet: &str) -> Result<Option<JobOffer>, CoordinatorError> {
        Ok(self.offers.lock().unwrap().pop_front())
    }

    async fn report_result(&self, job_id: &JobId, report: &ResultReport) -> Result<(), CoordinatorError> {
        self.results.lock().unwrap().push((job_id.clone(), report.clone()));
        Ok(())
    }

    async fn report_failure(&self, job_id: &JobId, report: &FailureReport) -> Result<(), CoordinatorError> {
        self.failures.lock().unwrap().push((job_id.clone(), report.clone()));
        Ok(())
    }

    async fn post_telemetry(&self, report: &TelemetryReport) -> Result<(), CoordinatorError> {
        self.telemetry.lock().unwrap().push(report.clone());
        Ok(())
    }
}

pub fn cpu_node() -> NodeCapability {
    NodeCapability::cpu_only("Test CPU".into(), 8, 16_384, "Linux".into())
}

pub fn online_node(capacity: usize) -> NodeHandle {
    let node = NodeHandle::new(cpu_node(), capacity);
    node.transition(LifecycleState::Registering).unwrap();
    node.transition(LifecycleState::Online).unwrap();
    node
}

/// CPU job running `script` with a deadline `deadline_ms` from now.
pub fn offer(id: &str, script: &str, deadline_ms: i64) -> JobOffer {
    JobOffer {
        job_id: JobId::new(id),
        job_type: Some("test".into()),
        requirements: ResourceRequirements {
            profile: ResourceProfile::CpuOnly,
            gpu_count: 0,
            vram_mb: 0,
            ram_mb: 512,
            cpu_cores: 1.0,
            capability: None,
        },
        payload: PayloadRef {
            image: "busybox:latest".into(),
            command: vec![script.to_string()],
            env: Default::default(),
        },
        deadline: Utc::now() + ChronoDuration::milliseconds(deadline_ms),
    }
}

pub fn scheduler(node: &NodeHandle, sandbox: Arc<FakeSandbox>, capacity: usize) -> JobScheduler {
    let telemetry = Arc::new(TelemetryCollector::new(
        Arc::new(NoGpu),
        0,
        std::env::temp_dir(),
    ));
    JobScheduler::new(
        SchedulerConfig {
            capacity,
            kill_grace: Duration::from_millis(200),
            history_limit: 16,
            ..Default::default()
        },
        sandbox,
        telemetry,
        node.clone(),
    )
}
