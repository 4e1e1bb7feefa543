use hypernode_types::{NodeIdentity, HEALTH_CHECK_COOLDOWN_SECS};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_BACKEND_URL: &str = "https://api.hypernode.sol";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse configuration file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid value {value:?} for environment variable {var}")]
    Env { var: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration for the node agent. Read once at startup, immutable afterwards.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct NodeConfig {
    /// Bearer token issued by the coordinator at onboarding.
    pub node_token: String,

    /// Provider wallet public key; the node's identity in the marketplace.
    pub wallet_pubkey: String,

    pub backend_url: String,

    /// Maximum number of jobs running at once.
    pub max_jobs_concurrent: usize,

    /// First GPU device index this node may hand to jobs.
    pub gpu_index: u32,

    /// Optional log level string (e.g., "info", "debug", "hypernode_node=trace").
    pub log_level: Option<String>,

    pub poll_interval_secs: u64,
    pub telemetry_interval_secs: u64,

    /// First delay before retrying a failed registration.
    pub registration_retry_secs: u64,

    /// Time in-flight jobs get to finish after a shutdown signal.
    pub shutdown_grace_secs: u64,

    pub sandbox: SandboxSection,
    pub heartbeat: HeartbeatSection,
    pub health: HealthSection,
    pub ledger: LedgerSection,
    pub server: ServerSection,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SandboxBackend {
    Docker,
    Process,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SandboxSection {
    pub backend: SandboxBackend,

    /// Host directory for per-job data mounts.
    pub data_root: PathBuf,

    /// Hosts jobs may reach. Empty means no network.
    pub egress_allowlist: Vec<String>,

    pub egress_network: String,

    /// Seconds between graceful termination and a forced kill.
    pub kill_grace_secs: u64,

    /// Terminal runs kept for replay to new subscribers.
    pub history_limit: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HeartbeatSection {
    pub interval_secs: u64,

    /// Consecutive failures before the node is marked degraded.
    pub failure_threshold: u32,

    pub backoff_initial_secs: u64,
    pub backoff_max_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HealthSection {
    /// Per requester-class window. Never shorter than the protocol's 300 s.
    pub cooldown_secs: u64,

    /// Requester-classes tracked at once; unseen classes are throttled beyond this.
    pub max_classes: usize,

    /// Accepted check records retained in memory.
    pub max_records: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LedgerSection {
    /// Base URL of the reputation ledger. Unset means the node keeps reputation locally only.
    pub url: Option<String>,
    pub reconcile_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerSection {
    /// Address for the health-probe and metrics endpoints.
    pub listen_addr: SocketAddr,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_token: String::new(),
            wallet_pubkey: String::new(),
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            max_jobs_concurrent: 1,
            gpu_index: 0,
            log_level: None,
            poll_interval_secs: 10,
            telemetry_interval_secs: 60,
            registration_retry_secs: 30,
            shutdown_grace_secs: 30,
            sandbox: SandboxSection::default(),
            heartbeat: HeartbeatSection::default(),
            health: HealthSection::default(),
            ledger: LedgerSection::default(),
            server: ServerSection::default(),
        }
    }
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            backend: SandboxBackend::Docker,
            data_root: std::env::temp_dir().join("hypernode-jobs"),
            egress_allowlist: Vec::new(),
            egress_network: "hn-egress".to_string(),
            kill_grace_secs: 10,
            history_limit: 256,
        }
    }
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            failure_threshold: 5,
            backoff_initial_secs: 5,
            backoff_max_secs: 300,
        }
    }
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            cooldown_secs: HEALTH_CHECK_COOLDOWN_SECS as u64,
            max_classes: 4_096,
            max_records: 1_024,
        }
    }
}

impl Default for LedgerSection {
    fn default() -> Self {
        Self {
            url: None,
            reconcile_interval_secs: 300,
        }
    }
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9100)),
        }
    }
}

impl NodeConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// File (when present), then process environment, then validation.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            Self::from_file(path)?
        } else {
            tracing::warn!("Configuration file {:?} not found, using defaults and environment", path);
            Self::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay the onboarding environment variables.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("HN_NODE_TOKEN") {
            self.node_token = v;
        }
        if let Some(v) = lookup("WALLET_PUBKEY") {
            self.wallet_pubkey = v;
        }
        if let Some(v) = lookup("BACKEND_URL") {
            self.backend_url = v;
        }
        if let Some(v) = lookup("LOG_LEVEL") {
            self.log_level = Some(v);
        }
        if let Some(v) = lookup("HEARTBEAT_INTERVAL") {
            self.heartbeat.interval_secs = parse_env("HEARTBEAT_INTERVAL", v)?;
        }
        if let Some(v) = lookup("MAX_JOBS_CONCURRENT") {
            self.max_jobs_concurrent = parse_env("MAX_JOBS_CONCURRENT", v)?;
        }
        if let Some(v) = lookup("GPU_INDEX") {
            self.gpu_index = parse_env("GPU_INDEX", v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_token.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "node_token is required (set HN_NODE_TOKEN)".to_string(),
            ));
        }
        if self.wallet_pubkey.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "wallet_pubkey is required (set WALLET_PUBKEY)".to_string(),
            ));
        }
        if !self.backend_url.starts_with("http://") && !self.backend_url.starts_with("https://") {
            return Err(ConfigError::Invalid(format!(
                "backend_url must be an http(s) URL, got {:?}",
                self.backend_url
            )));
        }
        if self.max_jobs_concurrent == 0 {
            return Err(ConfigError::Invalid(
                "max_jobs_concurrent must be at least 1".to_string(),
            ));
        }
        if self.heartbeat.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat interval must be positive".to_string(),
            ));
        }
        if self.heartbeat.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.poll_interval_secs == 0 || self.telemetry_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "poll and telemetry intervals must be positive".to_string(),
            ));
        }
        if self.health.cooldown_secs < HEALTH_CHECK_COOLDOWN_SECS as u64 {
            return Err(ConfigError::Invalid(format!(
                "health cooldown_secs must be at least {}",
                HEALTH_CHECK_COOLDOWN_SECS
            )));
        }
        if self.health.max_classes == 0 {
            return Err(ConfigError::Invalid(
                "health max_classes must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn identity(&self) -> NodeIdentity {
        NodeIdentity::new(self.wallet_pubkey.trim(), self.node_token.trim())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_secs(self.telemetry_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl HeartbeatSection {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Env { var, value })
}
