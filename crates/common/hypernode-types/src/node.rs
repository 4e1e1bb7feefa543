use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::LifecycleError;

/// Lifecycle of the node agent.
///
/// `Initializing → Registering → Online ⇄ Degraded → ShuttingDown → Stopped`.
/// Any non-terminal state may move to `ShuttingDown` when a shutdown signal arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Initializing,
    Registering,
    Online,
    Degraded,
    ShuttingDown,
    Stopped,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Registering => "registering",
            Self::Online => "online",
            Self::Degraded => "degraded",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        }
    }

    /// Whether `self → next` is an edge of the lifecycle graph.
    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        match (self, next) {
            (Initializing, Registering) => true,
            (Registering, Online) => true,
            (Online, Degraded) | (Degraded, Online) => true,
            (ShuttingDown, Stopped) => true,
            (Stopped, _) => false,
            (ShuttingDown, ShuttingDown) => false,
            (_, ShuttingDown) => true,
            _ => false,
        }
    }

    /// Checked transition, used by the single writer of node state.
    pub fn transition(self, next: LifecycleState) -> Result<LifecycleState, LifecycleError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(LifecycleError::InvalidTransition { from: self, to: next })
        }
    }

    /// Only an `Online` node admits new work.
    pub fn accepts_jobs(&self) -> bool {
        matches!(self, Self::Online)
    }

    /// States in which the node still answers probes as alive.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Online | Self::Degraded)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who this node is on the network.
#[derive(Clone, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Provider wallet public key (base58).
    pub wallet_pubkey: String,

    /// Bearer token issued by the coordinator. Never serialized.
    #[serde(skip)]
    pub node_token: String,

    /// Node id assigned by the coordinator at registration.
    pub node_id: Option<String>,
}

impl NodeIdentity {
    pub fn new(wallet_pubkey: impl Into<String>, node_token: impl Into<String>) -> Self {
        Self {
            wallet_pubkey: wallet_pubkey.into(),
            node_token: node_token.into(),
            node_id: None,
        }
    }

    /// Shortened wallet for log lines.
    pub fn wallet_short(&self) -> String {
        let prefix: String = self.wallet_pubkey.chars().take(8).collect();
        format!("{}...", prefix)
    }
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("wallet_pubkey", &self.wallet_pubkey)
            .field("node_token", &"<redacted>")
            .field("node_id", &self.node_id)
            .finish()
    }
}

/// Hardware capability descriptor advertised at registration and used for admission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeCapability {
    /// GPU model name, or `CPU-only` when no GPU was detected.
    pub gpu_model: String,

    /// Number of usable GPU devices.
    pub gpu_count: u32,

    /// VRAM per device in MB.
    pub vram_mb: u64,

    pub driver_version: Option<String>,
    pub cuda_version: Option<String>,

    pub cpu_model: String,

    /// Logical CPU cores.
    pub cpu_cores: u32,

    /// Total system RAM in MB.
    pub ram_mb: u64,

    pub host_os: String,

    /// Workload tags derived from VRAM (e.g. `inference`, `render`).
    pub tags: Vec<String>,
}

pub const CPU_ONLY_MODEL: &str = "CPU-only";
pub const TAG_CPU_COMPUTE: &str = "cpu_compute";

impl NodeCapability {
    /// Capability descriptor for a machine without a usable GPU.
    pub fn cpu_only(cpu_model: String, cpu_cores: u32, ram_mb: u64, host_os: String) -> Self {
        Self {
            gpu_model: CPU_ONLY_MODEL.to_string(),
            gpu_count: 0,
            vram_mb: 0,
            driver_version: None,
            cuda_version: None,
            cpu_model,
            cpu_cores,
            ram_mb,
            host_os,
            tags: vec![TAG_CPU_COMPUTE.to_string()],
        }
    }

    pub fn has_gpu(&self) -> bool {
        self.gpu_count > 0
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// Workload tags a GPU with `vram_gb` of memory can take on.
pub fn capability_tags_for_vram(vram_gb: u64) -> Vec<String> {
    let tags: &[&str] = if vram_gb >= 24 {
        &["inference", "training", "fine_tuning", "render", "vision"]
    } else if vram_gb >= 12 {
        &["inference", "fine_tuning", "render"]
    } else if vram_gb >= 8 {
        &["inference", "render"]
    } else if vram_gb >= 4 {
        &["inference"]
    } else {
        &[TAG_CPU_COMPUTE]
    };
    tags.iter().map(|t| t.to_string()).collect()
}

/// Published view of the node. Replaced wholesale on every mutation; `version`
/// increases by one per replacement so readers can detect staleness.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub version: u64,
    pub lifecycle: LifecycleState,
    pub in_flight: usize,
    pub capacity: usize,
    pub capability: NodeCapability,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl NodeStatus {
    pub fn new(capability: NodeCapability, capacity: usize) -> Self {
        Self {
            version: 0,
            lifecycle: LifecycleState::Initializing,
            in_flight: 0,
            capacity,
            capability,
            last_heartbeat_at: None,
            updated_at: Utc::now(),
        }
    }
}
