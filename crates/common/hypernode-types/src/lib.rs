//! Shared data model for the Hypernode provider agent.

pub mod error;
pub mod health;
pub mod job;
pub mod node;
pub mod reputation;
pub mod telemetry;

pub use error::{LifecycleError, OfferError};
pub use health::{
    requester_class, HealthCheckRecord, HealthProbe, HealthVerdict, HEALTH_CHECK_COOLDOWN_SECS,
};
pub use job::{
    CancelAck, FailureKind, JobError, JobId, JobOffer, JobResult, JobRun, JobState,
    OfferDecision, PayloadRef, RejectReason, ResourceProfile, ResourceRequirements,
    TerminalOutcome,
};
pub use node::{capability_tags_for_vram, LifecycleState, NodeCapability, NodeIdentity, NodeStatus};
pub use reputation::{ReputationMetrics, ReputationSnapshot, Tier};
pub use telemetry::{GpuReading, TelemetrySample};
