//! Hardware capability detection and utilization sampling.

use async_trait::async_trait;
use chrono::Utc;
use hypernode_types::{capability_tags_for_vram, GpuReading, NodeCapability, TelemetrySample};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::{Disks, System};
use tokio::process::Command;
use tracing::{debug, warn};

const NVIDIA_SMI_TIMEOUT: Duration = Duration::from_secs(5);

/// One GPU as reported at detection time.
#[derive(Debug, Clone, PartialEq)]
pub struct GpuDevice {
    pub index: u32,
    pub name: String,
    pub memory_total_mb: u64,
    pub driver_version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GpuInventory {
    pub devices: Vec<GpuDevice>,
    pub cuda_version: Option<String>,
}

/// Source of GPU facts. Absence of a GPU is an empty inventory, not an error.
#[async_trait]
pub trait GpuProbe: Send + Sync {
    async fn inventory(&self) -> GpuInventory;
    async fn readings(&self) -> Vec<GpuReading>;
}

/// Probe for hosts without GPUs, and for tests.
pub struct NoGpu;

#[async_trait]
impl GpuProbe for NoGpu {
    async fn inventory(&self) -> GpuInventory {
        GpuInventory::default()
    }

    async fn readings(&self) -> Vec<GpuReading> {
        Vec::new()
    }
}

/// Queries the NVIDIA driver through `nvidia-smi`.
pub struct NvidiaSmi {
    binary: String,
}

impl Default for NvidiaSmi {
    fn default() -> Self {
        Self {
            binary: "nvidia-smi".to_string(),
        }
    }
}

impl NvidiaSmi {
    async fn query(&self, args: &[&str]) -> Option<String> {
        let output = tokio::time::timeout(
            NVIDIA_SMI_TIMEOUT,
            Command::new(&self.binary).args(args).output(),
        )
        .await;
        match output {
            Ok(Ok(out)) if out.status.success() => Some(String::from_utf8_lossy(&out.stdout).into_owned()),
            Ok(Ok(out)) => {
                debug!(status = %out.status, "nvidia-smi returned an error");
                None
            }
            Ok(Err(e)) => {
                debug!(error = %e, "nvidia-smi not available");
                None
            }
            Err(_) => {
                warn!("nvidia-smi timed out");
                None
            }
        }
    }
}

#[async_trait]
impl GpuProbe for NvidiaSmi {
    async fn inventory(&self) -> GpuInventory {
        let Some(csv) = self
            .query(&[
                "--query-gpu=index,name,memory.total,driver_version",
                "--format=csv,noheader,nounits",
            ])
            .await
        else {
            return GpuInventory::default();
        };
        let cuda_version = self
            .query(&[])
            .await
            .and_then(|banner| parse_cuda_version(&banner));
        GpuInventory {
            devices: parse_devices(&csv),
            cuda_version,
        }
    }

    async fn readings(&self) -> Vec<GpuReading> {
        self.query(&[
            "--query-gpu=index,utilization.gpu,memory.used,memory.total,temperature.gpu,power.draw",
            "--format=csv,noheader,nounits",
        ])
        .await
        .map(|csv| parse_readings(&csv))
        .unwrap_or_default()
    }
}

fn field<T: std::str::FromStr>(raw: Option<&str>) -> Option<T> {
    let raw = raw?.trim();
    if raw.is_empty() || raw.starts_with('[') {
        // "[N/A]" and "[Not Supported]"
        return None;
    }
    raw.parse().ok()
}

pub fn parse_devices(csv: &str) -> Vec<GpuDevice> {
    csv.lines()
        .filter_map(|line| {
            let mut cols = line.split(',');
            let index = field(cols.next())?;
            let name = cols.next()?.trim().to_string();
            let memory_total_mb = field::<f64>(cols.next())? as u64;
            let driver_version = cols
                .next()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty());
            Some(GpuDevice {
                index,
                name,
                memory_total_mb,
                driver_version,
            })
        })
        .collect()
}

pub fn parse_readings(csv: &str) -> Vec<GpuReading> {
    csv.lines()
        .filter_map(|line| {
            let mut cols = line.split(',');
            Some(GpuReading {
                index: field(cols.next())?,
                utilization_percent: field(cols.next()).unwrap_or(0.0),
                memory_used_mb: field::<f64>(cols.next()).unwrap_or(0.0) as u64,
                memory_total_mb: field::<f64>(cols.next()).unwrap_or(0.0) as u64,
                temperature_c: field(cols.next()),
                power_w: field(cols.next()),
            })
        })
        .collect()
}

/// CUDA version from the `nvidia-smi` banner ("CUDA Version: 12.4").
pub fn parse_cuda_version(banner: &str) -> Option<String> {
    let rest = banner.split("CUDA Version:").nth(1)?;
    rest.split_whitespace()
        .next()
        .map(|v| v.trim_end_matches('|').to_string())
        .filter(|v| !v.is_empty())
}

/// Build the capability descriptor for this machine. GPUs below `gpu_index` are
/// reserved for the host and not advertised.
pub async fn detect_capability(probe: &dyn GpuProbe, gpu_index: u32) -> NodeCapability {
    let mut sys = System::new_all();
    sys.refresh_all();

    let cpu_model = sys
        .cpus()
        .first()
        .map(|c| c.brand().trim().to_string())
        .filter(|b| !b.is_empty())
        .unwrap_or_else(|| "unknown".to_string());
    let cpu_cores = sys.cpus().len().max(1) as u32;
    let ram_mb = sys.total_memory() / 1024 / 1024;
    let host_os = System::long_os_version().unwrap_or_else(|| std::env::consts::OS.to_string());

    let inventory = probe.inventory().await;
    let usable: Vec<&GpuDevice> = inventory
        .devices
        .iter()
        .filter(|d| d.index >= gpu_index)
        .collect();

    let Some(primary) = usable.first() else {
        return NodeCapability::cpu_only(cpu_model, cpu_cores, ram_mb, host_os);
    };

    NodeCapability {
        gpu_model: primary.name.clone(),
        gpu_count: usable.len() as u32,
        vram_mb: primary.memory_total_mb,
        driver_version: primary.driver_version.clone(),
        cuda_version: inventory.cuda_version.clone(),
        cpu_model,
        cpu_cores,
        ram_mb,
        host_os,
        tags: capability_tags_for_vram(primary.memory_total_mb / 1024),
    }
}

/// Samples host utilization on demand. Keeps one `System` across samples so CPU
/// usage is measured between consecutive calls.
pub struct TelemetryCollector {
    sys: Mutex<System>,
    gpu: Arc<dyn GpuProbe>,
    gpu_index: u32,
    disk_path: PathBuf,
}

impl TelemetryCollector {
    pub fn new(gpu: Arc<dyn GpuProbe>, gpu_index: u32, disk_path: impl Into<PathBuf>) -> Self {
        Self {
            sys: Mutex::new(System::new()),
            gpu,
            gpu_index,
            disk_path: disk_path.into(),
        }
    }

    pub async fn sample(&self) -> TelemetrySample {
        let (cpu_percent, ram_percent) = {
            let mut sys = self.sys.lock().unwrap_or_else(|e| e.into_inner());
            sys.refresh_cpu_usage();
            sys.refresh_memory();
            let total = sys.total_memory();
            let ram = if total == 0 {
                0.0
            } else {
                (sys.used_memory() as f64 / total as f64 * 100.0) as f32
            };
            (sys.global_cpu_usage(), ram)
        };

        let gpu = self
            .gpu
            .readings()
            .await
            .into_iter()
            .find(|r| r.index == self.gpu_index);

        TelemetrySample {
            taken_at: Utc::now(),
            cpu_percent,
            ram_percent,
            disk_percent: disk_usage_percent(&self.disk_path),
            gpu,
        }
    }
}

/// Usage of the filesystem holding `path` (longest matching mount point).
fn disk_usage_percent(path: &Path) -> f32 {
    let disks = Disks::new_with_refreshed_list();
    let disk = disks
        .list()
        .iter()
        .filter(|d| path.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len());
    match disk {
        Some(d) if d.total_space() > 0 => {
            let used = d.total_space().saturating_sub(d.available_space());
            (used as f64 / d.total_space() as f64 * 100.0) as f32
        }
        _ => 0.0,
    }
}
