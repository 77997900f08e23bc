//! Infrastructure layer: stores, admission, leases, sweeps and configuration.

pub mod admission;
pub mod config;
pub mod jobs;
pub mod lease;
pub mod orchestrator;
pub mod workers;

pub use admission::{
    AdmissionController, AdmissionError, AdmissionRejection, RejectionReason, TenantDefaults,
    TenantUsage,
};
pub use config::OrchestratorConfig;
pub use lease::{Completion, HeartbeatAck, LeaseConfig, LeaseError, LeaseManager};
pub use orchestrator::{MetricsSummary, Orchestrator, OrchestratorError, Submission, SweepReport};
pub use workers::{Sweeper, SweeperHandle, SweeperStats};

#[cfg(test)]
mod test_support;
