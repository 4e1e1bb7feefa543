//! Isolated execution of opaque job payloads.
//!
//! A [`Sandbox`] launches one execution per job, enforces the limits derived from the
//! job's declared [`ResourceProfile`](hypernode_types::ResourceProfile), reports how the
//! execution ended, and tears everything down on [`Sandbox::release`]. Two backends
//! are provided: [`DockerSandbox`] drives a container runtime and is the production
//! choice; [`ProcessSandbox`] runs the payload as a local child process with a memory
//! watchdog, for hosts without a container runtime.

use async_trait::async_trait;
use hypernode_types::{JobId, JobOffer, JobResult, PayloadRef, TerminalOutcome};
use std::path::PathBuf;
use thiserror::Error;

pub mod docker;
pub mod limits;
pub mod process;
pub mod workdir;

pub use docker::{DockerConfig, DockerSandbox};
pub use limits::{NetworkPolicy, SandboxLimits, SandboxPolicy};
pub use process::ProcessSandbox;
pub use workdir::JobWorkdir;

/// Path of the job data mount as seen from inside the sandbox.
pub const JOB_MOUNT: &str = "/job";

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Sandbox for job {job_id} failed to start: {reason}")]
    Startup { job_id: JobId, reason: String },

    #[error("Unknown sandbox: {0}")]
    UnknownHandle(String),

    #[error("Container runtime command failed: {0}")]
    Runtime(String),

    #[error("Job result is {size} bytes, over the {limit} byte limit")]
    ResultTooLarge { size: u64, limit: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything a backend needs to launch one job.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub job_id: JobId,
    pub payload: PayloadRef,
    pub limits: SandboxLimits,
}

impl SandboxSpec {
    pub fn for_offer(offer: &JobOffer, policy: &SandboxPolicy) -> Self {
        Self {
            job_id: offer.job_id.clone(),
            payload: offer.payload.clone(),
            limits: SandboxLimits::for_requirements(&offer.requirements, policy),
        }
    }
}

/// Reference to a launched sandbox. Plain data; the backend keeps the live state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxHandle {
    pub job_id: JobId,
    /// Backend identifier (container name, process id).
    pub sandbox_id: String,
    /// Host path of the job data mount.
    pub data_dir: PathBuf,
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Short backend name for logs and metrics.
    fn backend(&self) -> &'static str;

    /// Launch the payload. Errors here are startup failures.
    async fn run(&self, spec: SandboxSpec) -> Result<SandboxHandle, SandboxError>;

    /// Resolve once the execution has ended. Cancel-safe: dropping the future and
    /// calling again later observes the same outcome.
    async fn wait(&self, handle: &SandboxHandle) -> TerminalOutcome;

    /// Ask the execution to stop. Backends without a graceful path kill outright.
    async fn terminate(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        self.kill(handle).await
    }

    /// Stop the execution immediately.
    async fn kill(&self, handle: &SandboxHandle) -> Result<(), SandboxError>;

    /// Extract the declared result, then discard all job working data.
    async fn release(&self, handle: &SandboxHandle) -> Result<JobResult, SandboxError>;
}
