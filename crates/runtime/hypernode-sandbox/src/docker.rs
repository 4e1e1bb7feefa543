//! Container runtime backend.
//!
//! Each job gets one container with a read-only root filesystem, no capabilities,
//! hard memory/CPU/pid caps, GPU device requests for the granted devices only, and
//! either no network or the egress network. The per-job data directory is the only
//! writable bind mount.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogsOptions,
    RemoveContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::{DeviceRequest, HostConfig};
use bollard::Docker;
use futures::{StreamExt, TryStreamExt};
use hypernode_types::{JobResult, TerminalOutcome};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::limits::{NetworkPolicy, SandboxLimits};
use crate::workdir::{
    clip_front, sanitize, tail, JobWorkdir, LOG_TAIL_BYTES, LOG_TAIL_LINES, RESULT_FILE,
};
use crate::{Sandbox, SandboxError, SandboxHandle, SandboxSpec, JOB_MOUNT};

/// Exit code the runtime reports for SIGKILL.
const SIGKILL_EXIT: i64 = 137;

/// Label carrying the job id on every container this backend creates.
pub const JOB_LABEL: &str = "io.hypernode.job";

#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Host directory under which per-job data directories are created.
    pub data_root: PathBuf,

    /// Network attached when a job has an egress allowlist.
    pub egress_network: String,

    /// Seconds between SIGTERM and SIGKILL on terminate.
    pub stop_timeout_secs: i64,

    pub tmpfs_size_mb: u64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            data_root: std::env::temp_dir().join("hypernode-jobs"),
            egress_network: "hn-egress".to_string(),
            stop_timeout_secs: 10,
            tmpfs_size_mb: 256,
        }
    }
}

struct ContainerEntry {
    workdir: JobWorkdir,
    /// Set when the node itself stopped the container.
    stopped_by_node: bool,
    outcome: Option<TerminalOutcome>,
}

pub struct DockerSandbox {
    config: DockerConfig,
    docker: RwLock<Option<Docker>>,
    containers: Mutex<HashMap<String, ContainerEntry>>,
}

impl DockerSandbox {
    pub fn new(config: DockerConfig) -> Self {
        Self {
            config,
            docker: RwLock::new(None),
            containers: Mutex::new(HashMap::new()),
        }
    }

    /// Connect to the local runtime, check it answers, and remove job containers
    /// left behind by an earlier run of the node.
    pub async fn connect(config: DockerConfig) -> Result<Self, SandboxError> {
        let sandbox = Self::new(config);
        let docker = sandbox.docker().await?;
        docker.ping().await.map_err(runtime_err)?;
        sandbox.sweep_leftovers(&docker).await?;
        Ok(sandbox)
    }

    /// Force-remove every container carrying [`JOB_LABEL`]. Returns how many went.
    async fn sweep_leftovers(&self, docker: &Docker) -> Result<usize, SandboxError> {
        let leftovers = docker
            .list_containers(Some(leftover_filter()))
            .await
            .map_err(runtime_err)?;

        let mut removed = 0;
        for container in leftovers {
            let Some(id) = container.id else { continue };
            let job = container
                .labels
                .as_ref()
                .and_then(|l| l.get(JOB_LABEL))
                .cloned()
                .unwrap_or_default();
            match docker
                .remove_container(
                    &id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await
            {
                Ok(()) => {
                    info!(container = %id, job_id = %job, "Removed leftover job container");
                    removed += 1;
                }
                Err(e) => {
                    warn!(container = %id, job_id = %job, error = %e, "Failed to remove leftover job container")
                }
            }
        }
        Ok(removed)
    }

    async fn docker(&self) -> Result<Docker, SandboxError> {
        {
            let guard = self.docker.read().await;
            if let Some(ref d) = *guard {
                return Ok(d.clone());
            }
        }
        let docker = Docker::connect_with_local_defaults().map_err(runtime_err)?;
        *self.docker.write().await = Some(docker.clone());
        Ok(docker)
    }

    async fn create(
        &self,
        docker: &Docker,
        name: &str,
        config: Config<String>,
    ) -> Result<String, DockerError> {
        let options = || CreateContainerOptions {
            name: name.to_string(),
            ..Default::default()
        };
        match docker.create_container(Some(options()), config.clone()).await {
            Ok(resp) => Ok(resp.id),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                let image = config.image.clone().unwrap_or_default();
                info!(image = %image, "Pulling job image");
                docker
                    .create_image(
                        Some(CreateImageOptions {
                            from_image: image,
                            ..Default::default()
                        }),
                        None,
                        None,
                    )
                    .try_collect::<Vec<_>>()
                    .await?;
                Ok(docker.create_container(Some(options()), config).await?.id)
            }
            Err(e) => Err(e),
        }
    }

    async fn mark_stopped(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        let mut containers = self.containers.lock().await;
        let entry = containers
            .get_mut(&handle.sandbox_id)
            .ok_or_else(|| SandboxError::UnknownHandle(handle.sandbox_id.clone()))?;
        entry.stopped_by_node = true;
        Ok(())
    }

    async fn container_logs(&self, docker: &Docker, name: &str) -> Vec<String> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: LOG_TAIL_LINES.to_string(),
            ..Default::default()
        };
        let chunks: Vec<_> = docker.logs(name, Some(options)).collect().await;
        let text: String = chunks
            .into_iter()
            .filter_map(|c| c.ok())
            .map(|c| c.to_string())
            .collect();
        tail(clip_front(&text, LOG_TAIL_BYTES as usize), LOG_TAIL_LINES)
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn backend(&self) -> &'static str {
        "docker"
    }

    async fn run(&self, spec: SandboxSpec) -> Result<SandboxHandle, SandboxError> {
        let startup = |reason: String| SandboxError::Startup {
            job_id: spec.job_id.clone(),
            reason,
        };
        let docker = self
            .docker()
            .await
            .map_err(|e| startup(e.to_string()))?;

        let workdir = JobWorkdir::create(&self.config.data_root, &spec.job_id)
            .map_err(|e| startup(format!("cannot create job directory: {}", e)))?;
        let name = container_name(spec.job_id.as_str());
        let config = container_config(&spec, &self.config, workdir.path());

        let id = self
            .create(&docker, &name, config)
            .await
            .map_err(|e| startup(format!("create container: {}", e)))?;
        if let Err(e) = docker.start_container::<String>(&id, None).await {
            let _ = docker
                .remove_container(
                    &id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await;
            return Err(startup(format!("start container: {}", e)));
        }

        info!(
            job_id = %spec.job_id,
            container = %name,
            memory_mb = spec.limits.memory_mb,
            gpus = %spec.limits.visible_devices(),
            "Started job container"
        );

        let handle = SandboxHandle {
            job_id: spec.job_id.clone(),
            sandbox_id: name.clone(),
            data_dir: workdir.path().to_path_buf(),
        };
        self.containers.lock().await.insert(
            name,
            ContainerEntry {
                workdir,
                stopped_by_node: false,
                outcome: None,
            },
        );
        Ok(handle)
    }

    async fn wait(&self, handle: &SandboxHandle) -> TerminalOutcome {
        {
            let containers = self.containers.lock().await;
            match containers.get(&handle.sandbox_id) {
                Some(ContainerEntry {
                    outcome: Some(outcome),
                    ..
                }) => return outcome.clone(),
                Some(_) => {}
                None => {
                    return TerminalOutcome::RuntimeError {
                        exit_code: None,
                        message: format!("unknown sandbox {}", handle.sandbox_id),
                    }
                }
            }
        }

        let docker = match self.docker().await {
            Ok(d) => d,
            Err(e) => {
                return TerminalOutcome::RuntimeError {
                    exit_code: None,
                    message: e.to_string(),
                }
            }
        };

        let options = WaitContainerOptions {
            condition: "not-running",
        };
        // Non-zero exits surface as a wait error; the inspect below is authoritative.
        let mut waiter = Box::pin(docker.wait_container(&handle.sandbox_id, Some(options)));
        let _ = waiter.next().await;

        let outcome = match docker
            .inspect_container(&handle.sandbox_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => {
                let state = info.state.unwrap_or_default();
                let stopped_by_node = self
                    .containers
                    .lock()
                    .await
                    .get(&handle.sandbox_id)
                    .map(|e| e.stopped_by_node)
                    .unwrap_or(false);
                outcome_from_state(
                    state.oom_killed.unwrap_or(false),
                    state.exit_code.unwrap_or(-1),
                    stopped_by_node,
                    state.error.filter(|e| !e.is_empty()),
                )
            }
            Err(e) => TerminalOutcome::RuntimeError {
                exit_code: None,
                message: format!("inspect container: {}", e),
            },
        };

        if let Some(entry) = self.containers.lock().await.get_mut(&handle.sandbox_id) {
            entry.outcome = Some(outcome.clone());
        }
        outcome
    }

    async fn terminate(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        self.mark_stopped(handle).await?;
        let docker = self.docker().await?;
        docker
            .stop_container(
                &handle.sandbox_id,
                Some(StopContainerOptions {
                    t: self.config.stop_timeout_secs,
                }),
            )
            .await
            .map_err(runtime_err)
    }

    async fn kill(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        self.mark_stopped(handle).await?;
        let docker = self.docker().await?;
        docker
            .kill_container::<String>(&handle.sandbox_id, None)
            .await
            .map_err(runtime_err)
    }

    async fn release(&self, handle: &SandboxHandle) -> Result<JobResult, SandboxError> {
        let entry = self
            .containers
            .lock()
            .await
            .remove(&handle.sandbox_id)
            .ok_or_else(|| SandboxError::UnknownHandle(handle.sandbox_id.clone()))?;
        let docker = self.docker().await?;

        let mut extracted = entry.workdir.extract();
        if let Ok(result) = &mut extracted {
            if result.logs.is_empty() {
                result.logs = self.container_logs(&docker, &handle.sandbox_id).await;
            }
            result.exit_code = match &entry.outcome {
                Some(TerminalOutcome::Exited { exit_code }) => Some(*exit_code),
                Some(TerminalOutcome::RuntimeError { exit_code, .. }) => *exit_code,
                _ => None,
            };
        }

        if let Err(e) = docker
            .remove_container(
                &handle.sandbox_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            warn!(container = %handle.sandbox_id, error = %e, "Failed to remove job container");
        }
        entry.workdir.discard()?;
        debug!(job_id = %handle.job_id, "Released job container");
        extracted
    }
}

fn runtime_err(e: DockerError) -> SandboxError {
    SandboxError::Runtime(e.to_string())
}

/// Lists job containers in any state.
pub fn leftover_filter() -> ListContainersOptions<String> {
    ListContainersOptions {
        all: true,
        filters: HashMap::from([("label".to_string(), vec![JOB_LABEL.to_string()])]),
        ..Default::default()
    }
}

pub fn container_name(job_id: &str) -> String {
    format!("hn-job-{}", sanitize(job_id))
}

/// Container definition for one job, bind-mounting `data_dir` at the job mount.
pub fn container_config(spec: &SandboxSpec, config: &DockerConfig, data_dir: &Path) -> Config<String> {
    let limits = &spec.limits;
    let mut env = vec![
        format!("HN_JOB_DIR={}", JOB_MOUNT),
        format!("HN_RESULT_PATH={}/{}", JOB_MOUNT, RESULT_FILE),
        format!(
            "HN_EGRESS_ALLOWLIST={}",
            limits.network.allowed_hosts().join(",")
        ),
    ];
    env.extend(spec.payload.env.iter().map(|(k, v)| format!("{}={}", k, v)));

    let labels = HashMap::from([(JOB_LABEL.to_string(), spec.job_id.to_string())]);

    Config {
        image: Some(spec.payload.image.clone()),
        cmd: if spec.payload.command.is_empty() {
            None
        } else {
            Some(spec.payload.command.clone())
        },
        env: Some(env),
        working_dir: Some(JOB_MOUNT.to_string()),
        labels: Some(labels),
        host_config: Some(host_config(limits, config, data_dir)),
        ..Default::default()
    }
}

pub fn host_config(limits: &SandboxLimits, config: &DockerConfig, data_dir: &Path) -> HostConfig {
    let memory = limits.memory_bytes() as i64;
    let network_mode = match &limits.network {
        NetworkPolicy::Isolated => "none".to_string(),
        NetworkPolicy::Allowlist(_) => config.egress_network.clone(),
    };
    let device_requests = if limits.gpu_devices.is_empty() {
        None
    } else {
        Some(vec![DeviceRequest {
            driver: Some("nvidia".to_string()),
            device_ids: Some(limits.gpu_devices.iter().map(|d| d.to_string()).collect()),
            capabilities: Some(vec![vec!["gpu".to_string()]]),
            ..Default::default()
        }])
    };

    HostConfig {
        binds: Some(vec![format!("{}:{}:rw", data_dir.display(), JOB_MOUNT)]),
        memory: Some(memory),
        // Equal to memory: no swap headroom.
        memory_swap: Some(memory),
        nano_cpus: Some((limits.cpus as f64 * 1e9) as i64),
        pids_limit: Some(limits.pids as i64),
        shm_size: limits.shm_mb.map(|mb| (mb * 1024 * 1024) as i64),
        device_requests,
        network_mode: Some(network_mode),
        readonly_rootfs: Some(true),
        cap_drop: Some(vec!["ALL".to_string()]),
        security_opt: Some(vec!["no-new-privileges:true".to_string()]),
        tmpfs: Some(HashMap::from([(
            "/tmp".to_string(),
            format!("size={}m", config.tmpfs_size_mb),
        )])),
        ..Default::default()
    }
}

/// Classify an exited container.
pub fn outcome_from_state(
    oom_killed: bool,
    exit_code: i64,
    stopped_by_node: bool,
    error: Option<String>,
) -> TerminalOutcome {
    if oom_killed {
        return TerminalOutcome::ResourceExceeded {
            resource: "memory".to_string(),
            detail: "container was OOM-killed".to_string(),
        };
    }
    if stopped_by_node {
        return TerminalOutcome::Killed;
    }
    if let Some(message) = error {
        return TerminalOutcome::RuntimeError {
            exit_code: Some(exit_code as i32),
            message,
        };
    }
    if exit_code == SIGKILL_EXIT {
        return TerminalOutcome::RuntimeError {
            exit_code: Some(exit_code as i32),
            message: "killed by SIGKILL".to_string(),
        };
    }
    TerminalOutcome::Exited {
        exit_code: exit_code as i32,
    }
}
