use hypernode_types::{ResourceProfile, ResourceRequirements};
use serde::{Deserialize, Serialize};

/// Network access granted to a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkPolicy {
    /// No interfaces beyond loopback.
    Isolated,
    /// Egress only to the listed hosts, enforced by the egress network's proxy.
    Allowlist(Vec<String>),
}

impl NetworkPolicy {
    fn from_allowlist(hosts: &[String]) -> Self {
        if hosts.is_empty() {
            Self::Isolated
        } else {
            Self::Allowlist(hosts.to_vec())
        }
    }

    pub fn allowed_hosts(&self) -> &[String] {
        match self {
            Self::Isolated => &[],
            Self::Allowlist(hosts) => hosts,
        }
    }
}

/// Node-level settings every sandbox inherits.
#[derive(Debug, Clone, Default)]
pub struct SandboxPolicy {
    /// First GPU device handed to jobs on this node.
    pub gpu_base_index: u32,

    /// Hosts jobs may reach. Empty means no egress at all.
    pub egress_allowlist: Vec<String>,
}

/// Concrete caps applied to one sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxLimits {
    pub memory_mb: u64,
    pub cpus: f32,
    pub gpu_devices: Vec<u32>,
    pub network: NetworkPolicy,
    pub pids: u32,
    /// Shared memory size, for multi-process GPU runtimes.
    pub shm_mb: Option<u64>,
}

const DEFAULT_PIDS: u32 = 512;
const BANDWIDTH_PIDS: u32 = 4096;

impl SandboxLimits {
    /// Translate a declared profile into limits.
    pub fn for_requirements(req: &ResourceRequirements, policy: &SandboxPolicy) -> Self {
        let network = NetworkPolicy::from_allowlist(&policy.egress_allowlist);
        let devices = |n: u32| (policy.gpu_base_index..policy.gpu_base_index + n).collect();

        match req.profile {
            ResourceProfile::CpuOnly => Self {
                memory_mb: req.ram_mb,
                cpus: req.cpu_cores,
                gpu_devices: Vec::new(),
                network,
                pids: DEFAULT_PIDS,
                shm_mb: None,
            },
            ResourceProfile::SingleGpu => Self {
                memory_mb: req.ram_mb,
                cpus: req.cpu_cores,
                gpu_devices: devices(1),
                network,
                pids: DEFAULT_PIDS,
                shm_mb: None,
            },
            ResourceProfile::MultiGpu => Self {
                memory_mb: req.ram_mb,
                cpus: req.cpu_cores,
                gpu_devices: devices(req.gpu_devices()),
                network,
                pids: DEFAULT_PIDS,
                // NCCL and torch dataloaders exchange tensors through /dev/shm
                shm_mb: Some((req.ram_mb / 2).max(64)),
            },
            ResourceProfile::BandwidthHeavy => Self {
                memory_mb: req.ram_mb,
                cpus: req.cpu_cores,
                gpu_devices: Vec::new(),
                network,
                pids: BANDWIDTH_PIDS,
                shm_mb: None,
            },
        }
    }

    pub fn memory_bytes(&self) -> u64 {
        self.memory_mb.saturating_mul(1024 * 1024)
    }

    /// Value for `CUDA_VISIBLE_DEVICES`.
    pub fn visible_devices(&self) -> String {
        self.gpu_devices
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}
