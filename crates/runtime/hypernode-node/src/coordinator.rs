//! HTTP client for the remote coordinator.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hypernode_types::{JobId, JobOffer, NodeCapability, TelemetrySample};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::backoff::Backoff;
use crate::metrics;

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Network error talking to coordinator: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Coordinator rejected the node token")]
    Unauthorized,

    #[error("Coordinator returned {status}: {body}")]
    Status { status: u16, body: String },
}

impl CoordinatorError {
    /// Worth retrying: connection problems, server errors and rate limiting.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Unauthorized => false,
            Self::Status { status, .. } => *status >= 500 || *status == 429,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub wallet_address: String,
    pub gpu_model: String,
    pub gpu_count: u32,
    /// VRAM per device in GB.
    pub vram: u64,
    pub driver_version: Option<String>,
    pub cuda_version: Option<String>,
    #[serde(rename = "hostOS")]
    pub host_os: String,
    pub cpu_model: String,
    pub cpu_cores: u32,
    /// Total RAM in GB.
    pub ram_total: u64,
    pub location: Option<String>,
    pub capabilities: Vec<String>,
}

impl Registration {
    pub fn new(wallet: &str, cap: &NodeCapability) -> Self {
        Self {
            wallet_address: wallet.to_string(),
            gpu_model: cap.gpu_model.clone(),
            gpu_count: cap.gpu_count,
            vram: cap.vram_mb / 1024,
            driver_version: cap.driver_version.clone(),
            cuda_version: cap.cuda_version.clone(),
            host_os: cap.host_os.clone(),
            cpu_model: cap.cpu_model.clone(),
            cpu_cores: cap.cpu_cores,
            ram_total: cap.ram_mb / 1024,
            location: None,
            capabilities: cap.tags.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationAck {
    #[serde(default, alias = "id")]
    pub node_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub wallet_address: String,
    pub status: String,
    pub in_flight: usize,
    pub capacity: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMetrics {
    pub duration_ms: Option<u64>,
    pub response_time_ms: Option<u64>,
    pub exit_code: Option<i32>,
    pub telemetry: Option<TelemetrySample>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultReport {
    pub node_id: String,
    pub result: Option<serde_json::Value>,
    pub logs: Vec<String>,
    pub metrics: JobMetrics,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureReport {
    pub node_id: String,
    pub error: String,
    /// Failure taxonomy label (`startup_error`, `timed_out`, `capacity_exceeded`, ...).
    pub kind: String,
    pub logs: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryReport {
    pub wallet_address: String,
    pub node_id: Option<String>,
    pub cpu: f32,
    pub ram: f32,
    pub disk: f32,
    pub gpu: Option<f32>,
    pub gpu_memory: Option<f32>,
    pub temperature: Option<f32>,
    pub power: Option<f32>,
    pub timestamp: DateTime<Utc>,
}

impl TelemetryReport {
    pub fn new(wallet: &str, node_id: Option<String>, sample: &TelemetrySample) -> Self {
        let gpu = sample.gpu.as_ref();
        Self {
            wallet_address: wallet.to_string(),
            node_id,
            cpu: sample.cpu_percent,
            ram: sample.ram_percent,
            disk: sample.disk_percent,
            gpu: gpu.map(|g| g.utilization_percent),
            gpu_memory: gpu.map(|g| g.memory_percent()),
            temperature: gpu.and_then(|g| g.temperature_c),
            power: gpu.and_then(|g| g.power_w),
            timestamp: sample.taken_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AvailableJob {
    #[serde(default)]
    job: Option<JobOffer>,
}

/// The coordinator channel: registration, liveness, work intake and reporting.
#[async_trait]
pub trait CoordinatorClient: Send + Sync {
    async fn register(&self, registration: &Registration) -> Result<RegistrationAck, CoordinatorError>;

    async fn heartbeat(&self, beat: &Heartbeat) -> Result<(), CoordinatorError>;

    /// Next offer for this wallet, if any.
    async fn poll_offer(&self, wallet: &str) -> Result<Option<JobOffer>, CoordinatorError>;

    async fn report_result(&self, job_id: &JobId, report: &ResultReport) -> Result<(), CoordinatorError>;

    async fn report_failure(&self, job_id: &JobId, report: &FailureReport) -> Result<(), CoordinatorError>;

    async fn post_telemetry(&self, report: &TelemetryReport) -> Result<(), CoordinatorError>;
}

pub struct HttpCoordinator {
    client: Client,
    base_url: String,
    token: String,
}

impl HttpCoordinator {
    pub fn new(base_url: &str, token: &str) -> Result<Self, CoordinatorError> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response, CoordinatorError> {
        let resp = self
            .client
            .post(self.url(path))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        check(resp).await
    }
}

async fn check(resp: reqwest::Response) -> Result<reqwest::Response, CoordinatorError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(CoordinatorError::Unauthorized);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(CoordinatorError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl CoordinatorClient for HttpCoordinator {
    async fn register(&self, registration: &Registration) -> Result<RegistrationAck, CoordinatorError> {
        let resp = self.post("/api/nodes/register", registration).await?;
        // An empty or non-JSON body still counts as registered.
        let text = resp.text().await?;
        Ok(serde_json::from_str(&text).unwrap_or_default())
    }

    async fn heartbeat(&self, beat: &Heartbeat) -> Result<(), CoordinatorError> {
        self.post("/api/nodes/heartbeat", beat).await.map(|_| ())
    }

    async fn poll_offer(&self, wallet: &str) -> Result<Option<JobOffer>, CoordinatorError> {
        let resp = self
            .client
            .get(self.url("/api/jobs/available"))
            .query(&[("wallet", wallet)])
            .bearer_auth(&self.token)
            .send()
            .await?;
        if resp.status() == StatusCode::NO_CONTENT || resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = check(resp).await?;
        let text = resp.text().await?;
        match serde_json::from_str::<AvailableJob>(&text) {
            Ok(available) => Ok(available.job),
            Err(e) => {
                warn!(error = %e, "Ignoring malformed job offer from coordinator");
                Ok(None)
            }
        }
    }

    async fn report_result(&self, job_id: &JobId, report: &ResultReport) -> Result<(), CoordinatorError> {
        self.post(&format!("/api/jobs/{}/result", job_id), report)
            .await
            .map(|_| ())
    }

    async fn report_failure(&self, job_id: &JobId, report: &FailureReport) -> Result<(), CoordinatorError> {
        self.post(&format!("/api/jobs/{}/failure", job_id), report)
            .await
            .map(|_| ())
    }

    async fn post_telemetry(&self, report: &TelemetryReport) -> Result<(), CoordinatorError> {
        self.post("/api/telemetry", report).await.map(|_| ())
    }
}

/// Run `op` until it succeeds, fails permanently, or `attempts` are used up,
/// sleeping per `backoff` between transient failures.
pub async fn with_retry<T, F, Fut>(
    endpoint: &str,
    attempts: u32,
    mut backoff: Backoff,
    mut op: F,
) -> Result<T, CoordinatorError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CoordinatorError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < attempts => {
                let delay = backoff.next_delay();
                debug!(endpoint, attempt, error = %e, delay_ms = delay.as_millis() as u64, "Retrying coordinator call");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                metrics::record_report_failure(endpoint);
                return Err(e);
            }
        }
    }
}
