//! Top-level node agent: wires the components together and drives the lifecycle
//! `Initializing → Registering → Online ⇄ Degraded → ShuttingDown → Stopped`.

use anyhow::Context;
use futures::StreamExt;
use hypernode_sandbox::{DockerConfig, DockerSandbox, ProcessSandbox, Sandbox, SandboxPolicy};
use hypernode_types::{
    JobRun, JobState, LifecycleState, NodeIdentity, OfferDecision, RejectReason,
};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::config::{NodeConfig, SandboxBackend};
use crate::coordinator::{
    with_retry, CoordinatorClient, FailureReport, HttpCoordinator, JobMetrics, Registration,
    ResultReport, TelemetryReport,
};
use crate::health::HealthCheckResponder;
use crate::heartbeat::HeartbeatMonitor;
use crate::ledger::{HttpLedger, LedgerClient, NoopLedger, ReputationRecord};
use crate::reputation::{ReconcileOutcome, ReputationEngine};
use crate::scheduler::{JobScheduler, SchedulerConfig};
use crate::server::{run_server, ServerState};
use crate::state::NodeHandle;
use crate::telemetry::{detect_capability, GpuProbe, NoGpu, NvidiaSmi, TelemetryCollector};

const REGISTRATION_BACKOFF_MAX: Duration = Duration::from_secs(300);
const REPORT_ATTEMPTS: u32 = 5;
const REPORT_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const REPORT_BACKOFF_MAX: Duration = Duration::from_secs(30);

pub struct NodeAgent {
    config: NodeConfig,
    coordinator: Arc<dyn CoordinatorClient>,
    sandbox: Arc<dyn Sandbox>,
    ledger: Arc<dyn LedgerClient>,
    gpu: Arc<dyn GpuProbe>,
    reputation: Arc<ReputationEngine>,
}

impl NodeAgent {
    pub fn new(
        config: NodeConfig,
        coordinator: Arc<dyn CoordinatorClient>,
        sandbox: Arc<dyn Sandbox>,
    ) -> Self {
        Self {
            config,
            coordinator,
            sandbox,
            ledger: Arc::new(NoopLedger),
            gpu: Arc::new(NoGpu),
            reputation: Arc::new(ReputationEngine::new()),
        }
    }

    pub fn with_ledger(mut self, ledger: Arc<dyn LedgerClient>) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn with_gpu_probe(mut self, gpu: Arc<dyn GpuProbe>) -> Self {
        self.gpu = gpu;
        self
    }

    pub fn with_reputation(mut self, reputation: Arc<ReputationEngine>) -> Self {
        self.reputation = reputation;
        self
    }

    /// Build the production collaborators described by `config`.
    pub async fn from_config(config: NodeConfig) -> anyhow::Result<Self> {
        let identity = config.identity();
        let coordinator = HttpCoordinator::new(&config.backend_url, &identity.node_token)
            .context("Failed to build coordinator client")?;

        let sandbox: Arc<dyn Sandbox> = match config.sandbox.backend {
            SandboxBackend::Docker => {
                let docker_config = DockerConfig {
                    data_root: config.sandbox.data_root.clone(),
                    egress_network: config.sandbox.egress_network.clone(),
                    stop_timeout_secs: config.sandbox.kill_grace_secs as i64,
                    ..Default::default()
                };
                Arc::new(
                    DockerSandbox::connect(docker_config)
                        .await
                        .context("Failed to connect to the container runtime")?,
                )
            }
            SandboxBackend::Process => {
                warn!("Process sandbox selected: jobs run without network isolation");
                Arc::new(ProcessSandbox::new(config.sandbox.data_root.clone()))
            }
        };

        let ledger: Arc<dyn LedgerClient> = match config.ledger.url.as_deref() {
            Some(url) if !url.is_empty() => {
                info!("Using reputation ledger at {}", url);
                Arc::new(HttpLedger::new(url).context("Failed to build ledger client")?)
            }
            _ => Arc::new(NoopLedger),
        };

        Ok(Self::new(config, Arc::new(coordinator), sandbox)
            .with_ledger(ledger)
            .with_gpu_probe(Arc::new(NvidiaSmi::default())))
    }

    /// Detect capability, build the node's components and start the lifecycle task.
    /// Returns once everything is spawned; registration happens in the background.
    pub async fn start(self, shutdown: CancellationToken) -> RunningAgent {
        let cfg = &self.config;
        let capability = detect_capability(self.gpu.as_ref(), cfg.gpu_index).await;
        let identity = cfg.identity();
        info!(
            wallet = %identity.wallet_short(),
            gpu = %capability.gpu_model,
            gpus = capability.gpu_count,
            vram_mb = capability.vram_mb,
            cpu_cores = capability.cpu_cores,
            ram_mb = capability.ram_mb,
            sandbox = self.sandbox.backend(),
            "Detected node capability"
        );

        let node = NodeHandle::new(capability, cfg.max_jobs_concurrent);
        let telemetry = Arc::new(TelemetryCollector::new(
            self.gpu.clone(),
            cfg.gpu_index,
            cfg.sandbox.data_root.clone(),
        ));
        let scheduler = JobScheduler::new(
            SchedulerConfig {
                capacity: cfg.max_jobs_concurrent,
                kill_grace: Duration::from_secs(cfg.sandbox.kill_grace_secs),
                history_limit: cfg.sandbox.history_limit,
                policy: SandboxPolicy {
                    gpu_base_index: cfg.gpu_index,
                    egress_allowlist: cfg.sandbox.egress_allowlist.clone(),
                },
            },
            self.sandbox.clone(),
            telemetry.clone(),
            node.clone(),
        );
        let health = Arc::new(
            HealthCheckResponder::new(
                node.clone(),
                self.reputation.clone(),
                Duration::from_secs(cfg.health.cooldown_secs),
                cfg.health.max_classes,
                cfg.health.max_records,
            )
            .with_ledger(self.ledger.clone(), identity.wallet_pubkey.clone()),
        );

        let ctx = Arc::new(AgentContext {
            config: self.config,
            coordinator: self.coordinator,
            ledger: self.ledger,
            node: node.clone(),
            scheduler: scheduler.clone(),
            reputation: self.reputation.clone(),
            telemetry,
            identity: RwLock::new(identity),
        });
        let server_state = ServerState {
            node: node.clone(),
            scheduler: scheduler.clone(),
            reputation: self.reputation.clone(),
            health: health.clone(),
        };
        let task = tokio::spawn(drive(ctx, server_state, shutdown));

        RunningAgent {
            node,
            scheduler,
            reputation: self.reputation,
            health,
            task,
        }
    }

    /// Run until `shutdown` fires and the node has drained.
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        self.start(shutdown).await.wait().await
    }
}

/// Handles onto a started agent.
pub struct RunningAgent {
    pub node: NodeHandle,
    pub scheduler: JobScheduler,
    pub reputation: Arc<ReputationEngine>,
    pub health: Arc<HealthCheckResponder>,
    task: JoinHandle<()>,
}

impl RunningAgent {
    /// Wait for the lifecycle task to reach `Stopped`.
    pub async fn wait(self) -> anyhow::Result<()> {
        self.task.await.context("Node agent task panicked")
    }
}

struct AgentContext {
    config: NodeConfig,
    coordinator: Arc<dyn CoordinatorClient>,
    ledger: Arc<dyn LedgerClient>,
    node: NodeHandle,
    scheduler: JobScheduler,
    reputation: Arc<ReputationEngine>,
    telemetry: Arc<TelemetryCollector>,
    /// `node_id` is filled in by the coordinator at registration.
    identity: RwLock<NodeIdentity>,
}

async fn drive(ctx: Arc<AgentContext>, server_state: ServerState, shutdown: CancellationToken) {
    // Periodic tasks outlive the shutdown signal until the drain is over.
    let stop = CancellationToken::new();
    let mut tasks = JoinSet::new();

    let listen_addr = ctx.config.server.listen_addr;
    let server_stop = stop.clone();
    tasks.spawn(async move {
        if let Err(e) = run_server(listen_addr, server_state, server_stop).await {
            error!("Node API server on {} failed: {}", listen_addr, e);
        }
    });

    if let Err(e) = ctx.node.transition(LifecycleState::Registering) {
        error!(error = %e, "Unexpected lifecycle state at startup");
    }

    if ctx.register(&shutdown).await && ctx.node.transition(LifecycleState::Online).is_ok() {
        let heartbeat = HeartbeatMonitor::new(
            ctx.coordinator.clone(),
            ctx.node.clone(),
            ctx.reputation.clone(),
            ctx.wallet(),
            ctx.config.heartbeat.interval(),
            ctx.config.heartbeat.failure_threshold,
            Backoff::new(
                Duration::from_secs(ctx.config.heartbeat.backoff_initial_secs),
                Duration::from_secs(ctx.config.heartbeat.backoff_max_secs),
            ),
        );
        tasks.spawn(heartbeat.run(stop.clone()));
        tasks.spawn(poll_offers(ctx.clone(), shutdown.clone()));
        tasks.spawn(report_completions(ctx.clone(), stop.clone()));
        tasks.spawn(report_telemetry(ctx.clone(), stop.clone()));
        tasks.spawn(reconcile_reputation(ctx.clone(), stop.clone()));
    }

    shutdown.cancelled().await;
    info!("Shutdown requested, draining in-flight jobs");
    if let Err(e) = ctx.node.transition(LifecycleState::ShuttingDown) {
        warn!(error = %e, "Could not enter shutting_down");
    }
    ctx.scheduler.drain(ctx.config.shutdown_grace()).await;

    stop.cancel();
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "Background task ended abnormally");
        }
    }
    if let Err(e) = ctx.node.transition(LifecycleState::Stopped) {
        warn!(error = %e, "Could not enter stopped");
    }
    info!("Node agent stopped");
}

impl AgentContext {
    fn identity(&self) -> std::sync::RwLockReadGuard<'_, NodeIdentity> {
        self.identity.read().unwrap_or_else(|e| e.into_inner())
    }

    fn wallet(&self) -> String {
        self.identity().wallet_pubkey.clone()
    }

    fn node_id(&self) -> Option<String> {
        self.identity().node_id.clone()
    }

    fn report_node_id(&self) -> String {
        let identity = self.identity();
        identity
            .node_id
            .clone()
            .unwrap_or_else(|| identity.wallet_pubkey.clone())
    }

    /// Retry until the coordinator accepts us. False if shutdown came first.
    async fn register(&self, shutdown: &CancellationToken) -> bool {
        let registration = Registration::new(&self.wallet(), &self.node.snapshot().capability);
        let mut backoff = Backoff::new(
            Duration::from_secs(self.config.registration_retry_secs),
            REGISTRATION_BACKOFF_MAX,
        );
        loop {
            match self.coordinator.register(&registration).await {
                Ok(ack) => {
                    let mut identity = self.identity.write().unwrap_or_else(|e| e.into_inner());
                    info!(
                        wallet = %identity.wallet_short(),
                        node_id = ack.node_id.as_deref().unwrap_or("-"),
                        "Registered with coordinator"
                    );
                    identity.node_id = ack.node_id;
                    return true;
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    if e.is_transient() {
                        warn!(error = %e, retry_in_secs = delay.as_secs(), "Registration failed");
                    } else {
                        error!(error = %e, retry_in_secs = delay.as_secs(), "Registration refused, check the node token");
                    }
                    tokio::select! {
                        _ = shutdown.cancelled() => return false,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn report_backoff() -> Backoff {
        Backoff::new(REPORT_BACKOFF_INITIAL, REPORT_BACKOFF_MAX)
    }

    /// Report one terminal run upstream, then hand it to the ledger.
    async fn report_run(&self, run: &JobRun) {
        let counted = self.reputation.record_run(run);
        let job_id = run.job_id();
        let logs = run.result.as_ref().map(|r| r.logs.clone()).unwrap_or_default();

        let sent = if run.state == JobState::Succeeded {
            let report = ResultReport {
                node_id: self.report_node_id(),
                result: run.result.as_ref().and_then(|r| r.output.clone()),
                logs,
                metrics: JobMetrics {
                    duration_ms: run.duration_ms(),
                    response_time_ms: run.response_time_ms(),
                    exit_code: run.result.as_ref().and_then(|r| r.exit_code),
                    telemetry: run.telemetry.clone(),
                },
            };
            with_retry("result", REPORT_ATTEMPTS, Self::report_backoff(), || {
                self.coordinator.report_result(job_id, &report)
            })
            .await
        } else {
            let (kind, error) = match &run.error {
                Some(err) => (err.kind.as_str().to_string(), err.message.clone()),
                None => (run.state.as_str().to_string(), run.state.as_str().to_string()),
            };
            let report = FailureReport {
                node_id: self.report_node_id(),
                error,
                kind,
                logs,
            };
            with_retry("failure", REPORT_ATTEMPTS, Self::report_backoff(), || {
                self.coordinator.report_failure(job_id, &report)
            })
            .await
        };
        if let Err(e) = sent {
            error!(job_id = %job_id, error = %e, "Giving up reporting job outcome");
        }

        if !counted {
            return;
        }
        let score = self.reputation.current_snapshot().score;
        if let Some(record) = ReputationRecord::for_run(&self.wallet(), run, score) {
            let ledger = self.ledger.clone();
            tokio::spawn(async move {
                if let Err(e) = ledger.submit_record(&record).await {
                    warn!(job_id = ?record.job_id, error = %e, "Failed to submit reputation record");
                }
            });
        }
    }

    /// Tell the coordinator an offer was refused so it can re-offer elsewhere.
    fn report_rejection(self: &Arc<Self>, job_id: hypernode_types::JobId, reason: RejectReason) {
        if reason == RejectReason::DuplicateJob {
            // the first delivery is still running here
            return;
        }
        let ctx = self.clone();
        tokio::spawn(async move {
            let report = FailureReport {
                node_id: ctx.report_node_id(),
                error: reason.to_string(),
                kind: reason.label().to_string(),
                logs: Vec::new(),
            };
            let sent = with_retry("failure", REPORT_ATTEMPTS, Self::report_backoff(), || {
                ctx.coordinator.report_failure(&job_id, &report)
            })
            .await;
            if let Err(e) = sent {
                warn!(job_id = %job_id, error = %e, "Failed to report rejected offer");
            }
        });
    }
}

async fn poll_offers(ctx: Arc<AgentContext>, stop: CancellationToken) {
    let mut ticker = tokio::time::interval(ctx.config.poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if !ctx.node.lifecycle().accepts_jobs()
            || ctx.scheduler.in_flight() >= ctx.scheduler.capacity()
        {
            continue;
        }
        match ctx.coordinator.poll_offer(&ctx.wallet()).await {
            Ok(Some(offer)) => {
                let job_id = offer.job_id.clone();
                if let OfferDecision::Rejected(reason) = ctx.scheduler.offer(offer) {
                    ctx.report_rejection(job_id, reason);
                }
            }
            Ok(None) => debug!("No job available"),
            Err(e) => warn!(error = %e, "Polling for jobs failed"),
        }
    }
    debug!("Offer polling stopped");
}

/// Report terminal runs one at a time, in completion order.
async fn report_completions(ctx: Arc<AgentContext>, stop: CancellationToken) {
    let mut completions = ctx.scheduler.subscribe();
    loop {
        let run = tokio::select! {
            biased;
            next = completions.next() => match next {
                Some(run) => run,
                None => break,
            },
            _ = stop.cancelled() => break,
        };
        ctx.report_run(&run).await;
    }
    debug!("Completion reporter stopped");
}

async fn report_telemetry(ctx: Arc<AgentContext>, stop: CancellationToken) {
    let mut ticker = tokio::time::interval(ctx.config.telemetry_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if !ctx.node.lifecycle().is_live() {
            continue;
        }
        let sample = ctx.telemetry.sample().await;
        let report = TelemetryReport::new(&ctx.wallet(), ctx.node_id(), &sample);
        // A lost sample is superseded by the next one.
        if let Err(e) = ctx.coordinator.post_telemetry(&report).await {
            warn!(error = %e, "Failed to post telemetry");
        }
    }
}

async fn reconcile_reputation(ctx: Arc<AgentContext>, stop: CancellationToken) {
    let period = Duration::from_secs(ctx.config.ledger.reconcile_interval_secs.max(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match ctx.ledger.fetch_reputation(&ctx.wallet()).await {
            Ok(profile) => match ctx.reputation.reconcile(profile.as_ref()) {
                ReconcileOutcome::Replaced => info!("Local reputation replaced by ledger state"),
                ReconcileOutcome::InSync | ReconcileOutcome::NoProfile => {
                    debug!("Reputation reconciled")
                }
            },
            Err(e) => warn!(error = %e, "Failed to fetch reputation from ledger"),
        }
    }
}
