use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::OfferError;
use crate::node::NodeCapability;
use crate::telemetry::TelemetrySample;

/// Opaque job identifier assigned by the remote coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Closed set of declared resource profiles. The sandbox layer maps each variant to
/// concrete limits; nothing else in the node looks at what a job actually does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceProfile {
    CpuOnly,
    SingleGpu,
    MultiGpu,
    BandwidthHeavy,
}

impl ResourceProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CpuOnly => "cpu_only",
            Self::SingleGpu => "single_gpu",
            Self::MultiGpu => "multi_gpu",
            Self::BandwidthHeavy => "bandwidth_heavy",
        }
    }
}

/// Resources a job declares it needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    pub profile: ResourceProfile,

    /// GPU devices wanted. Only meaningful for `MultiGpu`; the other profiles imply 0 or 1.
    #[serde(default)]
    pub gpu_count: u32,

    /// VRAM per device in MB.
    #[serde(default)]
    pub vram_mb: u64,

    /// Hard RAM cap for the sandbox in MB.
    pub ram_mb: u64,

    /// CPU cores (fractional cores allowed).
    pub cpu_cores: f32,

    /// Capability tag the node must advertise (e.g. `inference`).
    #[serde(default)]
    pub capability: Option<String>,
}

impl ResourceRequirements {
    /// Number of GPU devices this profile consumes.
    pub fn gpu_devices(&self) -> u32 {
        match self.profile {
            ResourceProfile::CpuOnly | ResourceProfile::BandwidthHeavy => 0,
            ResourceProfile::SingleGpu => 1,
            ResourceProfile::MultiGpu => self.gpu_count.max(2),
        }
    }

    /// First requirement the node cannot satisfy, if any.
    pub fn unmet_by(&self, node: &NodeCapability) -> Option<String> {
        let gpus = self.gpu_devices();
        if gpus > node.gpu_count {
            return Some(format!("needs {} GPU(s), node has {}", gpus, node.gpu_count));
        }
        if gpus > 0 && self.vram_mb > node.vram_mb {
            return Some(format!(
                "needs {} MB VRAM per device, node has {} MB",
                self.vram_mb, node.vram_mb
            ));
        }
        if self.ram_mb > node.ram_mb {
            return Some(format!("needs {} MB RAM, node has {} MB", self.ram_mb, node.ram_mb));
        }
        if self.cpu_cores > node.cpu_cores as f32 {
            return Some(format!(
                "needs {} CPU cores, node has {}",
                self.cpu_cores, node.cpu_cores
            ));
        }
        if let Some(tag) = &self.capability {
            if !node.has_tag(tag) {
                return Some(format!("node does not advertise capability '{}'", tag));
            }
        }
        None
    }
}

/// Reference to the executable unit. The node hands it to the sandbox untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadRef {
    /// Container image (ignored by the process backend).
    pub image: String,

    /// Entrypoint and arguments.
    #[serde(default)]
    pub command: Vec<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// A unit of work proposed by the coordinator. Immutable once accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOffer {
    pub job_id: JobId,

    /// Free-form job kind, kept for logging only.
    #[serde(default)]
    pub job_type: Option<String>,

    pub requirements: ResourceRequirements,
    pub payload: PayloadRef,
    pub deadline: DateTime<Utc>,
}

impl JobOffer {
    /// Structural checks that do not depend on node state.
    pub fn validate(&self) -> Result<(), OfferError> {
        if self.job_id.0.trim().is_empty() {
            return Err(OfferError::MissingJobId);
        }
        if self.payload.image.trim().is_empty() && self.payload.command.is_empty() {
            return Err(OfferError::EmptyPayload(self.job_id.to_string()));
        }
        let req = &self.requirements;
        if req.ram_mb == 0 {
            return Err(OfferError::InvalidResources {
                job_id: self.job_id.to_string(),
                detail: "ram_mb must be positive".to_string(),
            });
        }
        if !req.cpu_cores.is_finite() || req.cpu_cores <= 0.0 {
            return Err(OfferError::InvalidResources {
                job_id: self.job_id.to_string(),
                detail: format!("cpu_cores must be positive, got {}", req.cpu_cores),
            });
        }
        Ok(())
    }
}

/// Why an offer was refused at admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum RejectReason {
    CapacityExceeded,
    CapabilityMismatch(String),
    NodeNotOnline(String),
    DuplicateJob,
    InvalidOffer(String),
}

impl RejectReason {
    /// Stable label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::CapacityExceeded => "capacity_exceeded",
            Self::CapabilityMismatch(_) => "capability_mismatch",
            Self::NodeNotOnline(_) => "node_not_online",
            Self::DuplicateJob => "duplicate_job",
            Self::InvalidOffer(_) => "invalid_offer",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CapacityExceeded => write!(f, "capacity exceeded"),
            Self::CapabilityMismatch(d) => write!(f, "capability mismatch: {}", d),
            Self::NodeNotOnline(s) => write!(f, "node is {}", s),
            Self::DuplicateJob => write!(f, "job already known"),
            Self::InvalidOffer(d) => write!(f, "invalid offer: {}", d),
        }
    }
}

/// Synchronous answer to `offer`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfferDecision {
    Accepted,
    Rejected(RejectReason),
}

impl OfferDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// Answer to `cancel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelAck {
    Ack,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Queued | Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Job-level failure taxonomy. Reported once per job and never retried here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    StartupError,
    RuntimeError,
    ResourceExceeded,
    Killed,
    TimedOut,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StartupError => "startup_error",
            Self::RuntimeError => "runtime_error",
            Self::ResourceExceeded => "resource_exceeded",
            Self::Killed => "killed",
            Self::TimedOut => "timed_out",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: FailureKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

/// Declared result payload extracted from the sandbox before teardown.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub output: Option<serde_json::Value>,
    pub logs: Vec<String>,
    pub exit_code: Option<i32>,
}

/// How a sandboxed execution ended, as seen by the sandbox layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TerminalOutcome {
    Exited { exit_code: i32 },
    RuntimeError { exit_code: Option<i32>, message: String },
    ResourceExceeded { resource: String, detail: String },
    Killed,
}

/// Mutable record of one job's life on this node. Owned by the scheduler until it
/// reaches a terminal state, then shared read-only.
#[derive(Debug, Clone, Serialize)]
pub struct JobRun {
    pub offer: JobOffer,

    /// Backend identifier of the sandbox (container name, pid, ...).
    pub sandbox_id: Option<String>,

    pub state: JobState,
    pub accepted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<JobResult>,
    pub error: Option<JobError>,

    /// Hardware sample taken when the run finished.
    pub telemetry: Option<TelemetrySample>,
}

impl JobRun {
    pub fn queued(offer: JobOffer, accepted_at: DateTime<Utc>) -> Self {
        Self {
            offer,
            sandbox_id: None,
            state: JobState::Queued,
            accepted_at,
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
            telemetry: None,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.offer.job_id
    }

    /// Latency between admission and the sandbox starting, if it ever started.
    pub fn response_time_ms(&self) -> Option<u64> {
        let started = self.started_at?;
        let ms = (started - self.accepted_at).num_milliseconds();
        Some(ms.max(0) as u64)
    }

    pub fn duration_ms(&self) -> Option<u64> {
        let start = self.started_at?;
        let end = self.finished_at?;
        Some((end - start).num_milliseconds().max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gpu_node() -> NodeCapability {
        NodeCapability {
            gpu_model: "NVIDIA GeForce RTX 4090".into(),
            gpu_count: 1,
            vram_mb: 24_564,
            driver_version: Some("550.54".into()),
            cuda_version: Some("12.4".into()),
            cpu_model: "AMD Ryzen 9 7950X".into(),
            cpu_cores: 32,
            ram_mb: 64_000,
            host_os: "Linux 6.8".into(),
            tags: crate::node::capability_tags_for_vram(24),
        }
    }

    fn reqs(profile: ResourceProfile) -> ResourceRequirements {
        ResourceRequirements {
            profile,
            gpu_count: 0,
            vram_mb: 8_000,
            ram_mb: 16_000,
            cpu_cores: 4.0,
            capability: Some("inference".into()),
        }
    }

    #[test]
    fn profile_gpu_devices() {
        assert_eq!(reqs(ResourceProfile::CpuOnly).gpu_devices(), 0);
        assert_eq!(reqs(ResourceProfile::SingleGpu).gpu_devices(), 1);
        assert_eq!(reqs(ResourceProfile::MultiGpu).gpu_devices(), 2);
        let mut multi = reqs(ResourceProfile::MultiGpu);
        multi.gpu_count = 4;
        assert_eq!(multi.gpu_devices(), 4);
    }

    #[test]
    fn requirements_against_node() {
        let node = gpu_node();
        assert!(reqs(ResourceProfile::SingleGpu).unmet_by(&node).is_none());
        assert!(reqs(ResourceProfile::MultiGpu).unmet_by(&node).is_some());

        let mut too_much_ram = reqs(ResourceProfile::CpuOnly);
        too_much_ram.ram_mb = 128_000;
        assert!(too_much_ram.unmet_by(&node).unwrap().contains("RAM"));

        let mut unknown_tag = reqs(ResourceProfile::CpuOnly);
        unknown_tag.capability = Some("quantum".into());
        assert!(unknown_tag.unmet_by(&node).is_some());

        let mut vram = reqs(ResourceProfile::SingleGpu);
        vram.vram_mb = 48_000;
        assert!(vram.unmet_by(&node).unwrap().contains("VRAM"));
    }

    #[test]
    fn validate_rejects_malformed_offers() {
        let mut offer = JobOffer {
            job_id: JobId::new("job-1"),
            job_type: None,
            requirements: reqs(ResourceProfile::CpuOnly),
            payload: PayloadRef {
                image: "busybox".into(),
                command: vec![],
                env: BTreeMap::new(),
            },
            deadline: Utc::now(),
        };
        assert!(offer.validate().is_ok());

        offer.requirements.cpu_cores = f32::NAN;
        assert!(matches!(
            offer.validate(),
            Err(OfferError::InvalidResources { .. })
        ));

        offer.requirements.cpu_cores = 1.0;
        offer.payload.image.clear();
        assert_eq!(
            offer.validate(),
            Err(OfferError::EmptyPayload("job-1".into()))
        );

        offer.job_id = JobId::new("  ");
        assert_eq!(offer.validate(), Err(OfferError::MissingJobId));
    }

    #[test]
    fn terminal_states() {
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Running.is_terminal());
        for s in [
            JobState::Succeeded,
            JobState::Failed,
            JobState::TimedOut,
            JobState::Cancelled,
        ] {
            assert!(s.is_terminal());
        }
    }

    #[test]
    fn offer_parses_from_wire_json() {
        let json = serde_json::json!({
            "job_id": "job-42",
            "job_type": "llm_inference",
            "requirements": {
                "profile": "single_gpu",
                "vram_mb": 12000,
                "ram_mb": 8000,
                "cpu_cores": 2.0,
                "capability": "inference"
            },
            "payload": { "image": "hypernode/llm:latest", "command": ["serve"] },
            "deadline": "2030-01-01T00:00:00Z"
        });
        let offer: JobOffer = serde_json::from_value(json).unwrap();
        assert_eq!(offer.job_id.as_str(), "job-42");
        assert_eq!(offer.requirements.profile, ResourceProfile::SingleGpu);
        assert_eq!(offer.requirements.gpu_count, 0);
        assert!(offer.payload.env.is_empty());
    }
}
