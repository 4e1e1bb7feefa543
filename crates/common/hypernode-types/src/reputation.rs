use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Upper bound of the reputation score.
pub const MAX_SCORE: f64 = 1000.0;

pub const COMPLETION_WEIGHT: f64 = 0.6;
pub const UPTIME_WEIGHT: f64 = 0.3;
pub const RESPONSE_WEIGHT: f64 = 0.1;

/// Points removed per failed health check.
pub const HEALTH_FAIL_PENALTY: f64 = 10.0;

/// Response times at or under this earn the full response factor.
pub const RESPONSE_TARGET_MS: u64 = 1_000;

/// Response times at or over this earn nothing.
pub const RESPONSE_CEILING_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Starter,
    Bronze,
    Silver,
    Gold,
    Diamond,
}

impl Tier {
    /// Tier bracket for a score; each bracket includes its lower bound.
    pub fn from_score(score: f64) -> Self {
        if score >= 800.0 {
            Self::Diamond
        } else if score >= 600.0 {
            Self::Gold
        } else if score >= 400.0 {
            Self::Silver
        } else if score >= 200.0 {
            Self::Bronze
        } else {
            Self::Starter
        }
    }

    /// Advisory job-matching boost.
    pub fn priority_boost(&self) -> u32 {
        match self {
            Self::Diamond => 10,
            Self::Gold => 5,
            Self::Silver => 2,
            Self::Bronze => 1,
            Self::Starter => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starter => "starter",
            Self::Bronze => "bronze",
            Self::Silver => "silver",
            Self::Gold => "gold",
            Self::Diamond => "diamond",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps an average response time onto `[0, 1]`: full marks up to the target, then a
/// linear fall to zero at the ceiling.
pub fn response_time_factor(avg_response_ms: u64) -> f64 {
    if avg_response_ms <= RESPONSE_TARGET_MS {
        return 1.0;
    }
    if avg_response_ms >= RESPONSE_CEILING_MS {
        return 0.0;
    }
    let span = (RESPONSE_CEILING_MS - RESPONSE_TARGET_MS) as f64;
    1.0 - (avg_response_ms - RESPONSE_TARGET_MS) as f64 / span
}

/// Base score on the 0-1000 scale from the three weighted ratios.
pub fn compute_score(completion_rate: f64, uptime_ratio: f64, response_factor: f64) -> f64 {
    let weighted = completion_rate.clamp(0.0, 1.0) * COMPLETION_WEIGHT
        + uptime_ratio.clamp(0.0, 1.0) * UPTIME_WEIGHT
        + response_factor.clamp(0.0, 1.0) * RESPONSE_WEIGHT;
    (weighted * MAX_SCORE).clamp(0.0, MAX_SCORE)
}

/// Raw counters the snapshot is derived from. This is also the unit exchanged with
/// the ledger, so a reconcile can replace it wholesale.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReputationMetrics {
    pub jobs_succeeded: u64,

    /// Failed and timed-out runs. Cancellations are not the node's fault and are not counted.
    pub jobs_failed: u64,

    pub heartbeats_ok: u64,
    pub heartbeats_total: u64,

    pub response_time_total_ms: u64,
    pub response_samples: u64,

    pub health_checks_passed: u64,
    pub health_checks_failed: u64,
}

impl ReputationMetrics {
    /// Zero until the node has finished at least one counted job.
    pub fn completion_rate(&self) -> f64 {
        let total = self.jobs_succeeded + self.jobs_failed;
        if total == 0 {
            0.0
        } else {
            self.jobs_succeeded as f64 / total as f64
        }
    }

    pub fn uptime_ratio(&self) -> f64 {
        if self.heartbeats_total == 0 {
            0.0
        } else {
            self.heartbeats_ok as f64 / self.heartbeats_total as f64
        }
    }

    pub fn average_response_ms(&self) -> Option<u64> {
        if self.response_samples == 0 {
            None
        } else {
            Some(self.response_time_total_ms / self.response_samples)
        }
    }

    pub fn response_factor(&self) -> f64 {
        self.average_response_ms()
            .map(response_time_factor)
            .unwrap_or(0.0)
    }

    /// A node nobody has probed yet is treated as passing.
    pub fn health_pass_rate(&self) -> f64 {
        let total = self.health_checks_passed + self.health_checks_failed;
        if total == 0 {
            1.0
        } else {
            self.health_checks_passed as f64 / total as f64
        }
    }
}

/// Locally cached reputation. Never mutated in place; every change builds a new one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReputationSnapshot {
    pub completion_rate: f64,
    pub uptime_ratio: f64,
    pub average_response_ms: Option<u64>,
    pub health_pass_rate: f64,
    pub score: f64,
    pub tier: Tier,
    pub priority_boost: u32,

    /// Boost scaled by the health-check pass rate; advisory input to remote matching.
    pub matching_priority: f64,

    pub computed_at: DateTime<Utc>,
}

impl ReputationSnapshot {
    pub fn from_metrics(metrics: &ReputationMetrics, computed_at: DateTime<Utc>) -> Self {
        let base = compute_score(
            metrics.completion_rate(),
            metrics.uptime_ratio(),
            metrics.response_factor(),
        );
        let penalty = metrics.health_checks_failed as f64 * HEALTH_FAIL_PENALTY;
        let score = (base - penalty).clamp(0.0, MAX_SCORE);
        Self::with_score(metrics, score, computed_at)
    }

    /// Snapshot with an externally supplied score (e.g. the ledger's).
    pub fn with_score(metrics: &ReputationMetrics, score: f64, computed_at: DateTime<Utc>) -> Self {
        let score = score.clamp(0.0, MAX_SCORE);
        let tier = Tier::from_score(score);
        let boost = tier.priority_boost();
        let pass_rate = metrics.health_pass_rate();
        Self {
            completion_rate: metrics.completion_rate(),
            uptime_ratio: metrics.uptime_ratio(),
            average_response_ms: metrics.average_response_ms(),
            health_pass_rate: pass_rate,
            score,
            tier,
            priority_boost: boost,
            matching_priority: boost as f64 * pass_rate,
            computed_at,
        }
    }
}
