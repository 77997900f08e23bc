//! `orchestrator-core` — job queue domain model.
//!
//! This crate contains **pure domain** primitives: the job lifecycle state
//! machine, retry policy, worker and tenant-limit records. No locking, no IO.

pub mod clock;
pub mod error;
pub mod id;
pub mod job;
pub mod retry;
pub mod tenant;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{JobId, TenantId, TraceId, WorkerId};
pub use job::{
    error_codes, Attempt, AttemptChange, AttemptOutcome, Failure, Job, JobSnapshot, JobSpec,
    JobStatus, SubmitJob, Transition,
};
pub use retry::{BackoffStrategy, RetryDecision, RetryPolicy};
pub use tenant::TenantLimit;
pub use worker::{Worker, WorkerState};
