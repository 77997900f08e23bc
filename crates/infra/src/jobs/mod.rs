//! Job persistence: the job store and the idempotency index.
//!
//! - `JobStore`: CAS transitions, ready index per tenant, retry index
//! - `IdempotencyIndex`: per-tenant key → job binding with bounded retention

pub mod idempotency;
pub mod store;

pub use idempotency::{IdempotencyError, IdempotencyIndex, Reservation};
pub use store::{InMemoryJobStore, JobFilter, JobStats, JobStore, JobStoreError, QueuedHead};
