//! Thin client for the authoritative reputation ledger.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hypernode_types::{HealthCheckRecord, JobId, JobRun, JobState, ReputationMetrics};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Network error talking to ledger: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Ledger returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Malformed ledger response: {0}")]
    Decode(String),
}

/// The ledger's view of this node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerReputation {
    #[serde(alias = "computed_score")]
    pub score: f64,

    #[serde(default)]
    pub metrics: ReputationMetrics,

    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReputationEvent {
    JobSucceeded,
    JobFailed,
    HealthCheckPassed,
    HealthCheckFailed,
}

/// Append-only record submitted to the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReputationRecord {
    pub subject: String,
    pub event: ReputationEvent,
    pub job_id: Option<JobId>,
    pub local_score: f64,
    pub timestamp: DateTime<Utc>,
}

impl ReputationRecord {
    /// Record for a terminal run; cancelled runs produce none.
    pub fn for_run(subject: &str, run: &JobRun, local_score: f64) -> Option<Self> {
        let event = match run.state {
            JobState::Succeeded => ReputationEvent::JobSucceeded,
            JobState::Failed | JobState::TimedOut => ReputationEvent::JobFailed,
            JobState::Cancelled | JobState::Queued | JobState::Running => return None,
        };
        Some(Self {
            subject: subject.to_string(),
            event,
            job_id: Some(run.job_id().clone()),
            local_score,
            timestamp: run.finished_at.unwrap_or_else(Utc::now),
        })
    }

    pub fn for_health(subject: &str, check: &HealthCheckRecord, local_score: f64) -> Self {
        Self {
            subject: subject.to_string(),
            event: if check.passed {
                ReputationEvent::HealthCheckPassed
            } else {
                ReputationEvent::HealthCheckFailed
            },
            job_id: None,
            local_score,
            timestamp: check.checked_at,
        }
    }
}

#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// `None` when the ledger has no profile for `wallet` yet.
    async fn fetch_reputation(&self, wallet: &str) -> Result<Option<LedgerReputation>, LedgerError>;

    async fn submit_record(&self, record: &ReputationRecord) -> Result<(), LedgerError>;
}

pub struct HttpLedger {
    client: Client,
    base_url: String,
}

impl HttpLedger {
    pub fn new(base_url: &str) -> Result<Self, LedgerError> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl LedgerClient for HttpLedger {
    async fn fetch_reputation(&self, wallet: &str) -> Result<Option<LedgerReputation>, LedgerError> {
        let url = format!("{}/reputation/profiles/{}", self.base_url, wallet);
        tracing::debug!("Querying ledger reputation for {} at {}", wallet, url);

        let resp = self.client.get(&url).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(LedgerError::Status {
                status: resp.status().as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        let text = resp.text().await?;
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| LedgerError::Decode(e.to_string()))
    }

    async fn submit_record(&self, record: &ReputationRecord) -> Result<(), LedgerError> {
        let url = format!("{}/reputation/records", self.base_url);
        let resp = self.client.post(&url).json(record).send().await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(LedgerError::Status {
                status: resp.status().as_u16(),
                body: resp.text().await.unwrap_or_default(),
            })
        }
    }
}

/// Used when no ledger is configured: nothing to reconcile against, nothing to submit.
pub struct NoopLedger;

#[async_trait]
impl LedgerClient for NoopLedger {
    async fn fetch_reputation(&self, _wallet: &str) -> Result<Option<LedgerReputation>, LedgerError> {
        Ok(None)
    }

    async fn submit_record(&self, record: &ReputationRecord) -> Result<(), LedgerError> {
        tracing::debug!(event = ?record.event, "No ledger configured, dropping reputation record");
        Ok(())
    }
}
