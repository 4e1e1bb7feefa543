//! Provider-side agent for the Hypernode GPU marketplace.
//!
//! The agent registers the host's capability with the remote coordinator, admits job
//! offers within a fixed concurrency budget, runs each job in a sandbox, keeps the
//! coordinator informed through heartbeats, answers permissionless health probes and
//! maintains a local reputation mirror reconciled against the ledger.

pub mod agent;
pub mod backoff;
pub mod config;
pub mod coordinator;
pub mod health;
pub mod heartbeat;
pub mod ledger;
pub mod metrics;
pub mod reputation;
pub mod scheduler;
pub mod server;
pub mod state;
pub mod telemetry;

pub use agent::{NodeAgent, RunningAgent};
pub use config::NodeConfig;
pub use coordinator::{CoordinatorClient, HttpCoordinator};
pub use health::HealthCheckResponder;
pub use heartbeat::HeartbeatMonitor;
pub use ledger::{HttpLedger, LedgerClient, NoopLedger};
pub use reputation::ReputationEngine;
pub use scheduler::{JobScheduler, SchedulerConfig};
pub use state::NodeHandle;
pub use telemetry::TelemetryCollector;
