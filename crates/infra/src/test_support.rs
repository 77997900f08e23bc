//! Test doubles shared by the unit and scenario tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use orchestrator_core::{Attempt, Job, JobId, JobSnapshot, JobStatus, Transition, WorkerId};

use crate::jobs::{InMemoryJobStore, JobFilter, JobStats, JobStore, JobStoreError, QueuedHead};

/// Wraps the in-memory store with injected storage failures and stale reads.
#[derive(Debug, Clone)]
pub(crate) struct FlakyStore {
    pub inner: Arc<InMemoryJobStore>,
    /// `ScheduleRetry` transitions still to fail.
    pub failing_retries: Arc<AtomicUsize>,
    /// `LEASE_EXPIRED` fail transitions still to fail.
    pub failing_expiries: Arc<AtomicUsize>,
    /// Copies returned by `get` instead of the live record.
    pub pinned: Arc<Mutex<HashMap<JobId, Job>>>,
}

impl FlakyStore {
    pub fn new(inner: Arc<InMemoryJobStore>) -> Self {
        Self {
            inner,
            failing_retries: Arc::new(AtomicUsize::new(0)),
            failing_expiries: Arc::new(AtomicUsize::new(0)),
            pinned: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn fail_retries(&self, n: usize) {
        self.failing_retries.store(n, Ordering::SeqCst);
    }

    pub fn fail_expiries(&self, n: usize) {
        self.failing_expiries.store(n, Ordering::SeqCst);
    }

    /// Make `get` keep returning `job` as it is now.
    pub fn pin(&self, job: Job) {
        self.pinned.lock().unwrap().insert(job.id, job);
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl JobStore for FlakyStore {
    fn create(&self, job: Job) -> Result<Job, JobStoreError> {
        self.inner.create(job)
    }

    fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        if let Some(job) = self.pinned.lock().unwrap().get(&id) {
            return Ok(Some(job.clone()));
        }
        self.inner.get(id)
    }

    fn snapshot(&self, id: JobId) -> Result<Option<JobSnapshot>, JobStoreError> {
        self.inner.snapshot(id)
    }

    fn attempts(&self, id: JobId) -> Result<Vec<Attempt>, JobStoreError> {
        self.inner.attempts(id)
    }

    fn list(&self, filter: &JobFilter, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        self.inner.list(filter, limit)
    }

    fn transition_with_holder(
        &self,
        id: JobId,
        expected: JobStatus,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<(Job, Option<WorkerId>), JobStoreError> {
        let inject = match &transition {
            Transition::ScheduleRetry { .. } => Self::take(&self.failing_retries),
            Transition::Fail { failure, .. }
                if failure.code == orchestrator_core::error_codes::LEASE_EXPIRED =>
            {
                Self::take(&self.failing_expiries)
            }
            _ => false,
        };
        if inject {
            return Err(JobStoreError::Storage("transient".to_string()));
        }
        self.inner.transition_with_holder(id, expected, transition, now)
    }

    fn queued_heads(&self) -> Result<Vec<QueuedHead>, JobStoreError> {
        self.inner.queued_heads()
    }

    fn due_retries(&self, now: DateTime<Utc>) -> Result<Vec<JobId>, JobStoreError> {
        self.inner.due_retries(now)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        self.inner.stats()
    }
}
