//! Job storage implementations.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

use orchestrator_core::{
    Attempt, DomainError, Job, JobId, JobSnapshot, JobStatus, TenantId, Transition, WorkerId,
};
use orchestrator_events::{EventLog, NewEvent};

/// Filter for [`JobStore::list`]. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub tenant_id: Option<TenantId>,
    pub model: Option<String>,
}

impl JobFilter {
    fn matches(&self, job: &Job) -> bool {
        self.status.is_none_or(|s| job.status == s)
            && self.tenant_id.as_ref().is_none_or(|t| &job.tenant_id == t)
            && self.model.as_ref().is_none_or(|m| &job.model == m)
    }
}

/// Best queued job of one tenant, as seen by the ready index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedHead {
    pub tenant_id: TenantId,
    pub job_id: JobId,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
}

/// Job store abstraction.
///
/// Every status change goes through [`JobStore::transition`], a
/// compare-and-swap on the job's status. The matching event is appended while
/// the job is still locked.
pub trait JobStore: Send + Sync {
    /// Store a new job and emit `job.created`.
    fn create(&self, job: Job) -> Result<Job, JobStoreError>;

    fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Job plus its most recent attempt.
    fn snapshot(&self, id: JobId) -> Result<Option<JobSnapshot>, JobStoreError>;

    /// Full attempt history, oldest first.
    fn attempts(&self, id: JobId) -> Result<Vec<Attempt>, JobStoreError>;

    /// Newest first.
    fn list(&self, filter: &JobFilter, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// Apply `transition` if the job is still in `expected`.
    fn transition(
        &self,
        id: JobId,
        expected: JobStatus,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        self.transition_with_holder(id, expected, transition, now)
            .map(|(job, _)| job)
    }

    /// Like [`JobStore::transition`], also returning the lease holder the job
    /// had at the moment the change was applied.
    fn transition_with_holder(
        &self,
        id: JobId,
        expected: JobStatus,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<(Job, Option<WorkerId>), JobStoreError>;

    /// Highest-priority, oldest queued job of every tenant with queued work.
    fn queued_heads(&self) -> Result<Vec<QueuedHead>, JobStoreError>;

    /// Retry-scheduled jobs whose `next_run_at` has passed, earliest first.
    fn due_retries(&self, now: DateTime<Utc>) -> Result<Vec<JobId>, JobStoreError>;

    fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    /// The job moved on since the caller read it.
    #[error("{message}")]
    Conflict { id: JobId, message: String },
    /// The transition is not allowed from the job's current status.
    #[error("{message}")]
    InvalidTransition { id: JobId, message: String },
    #[error("storage error: {0}")]
    Storage(String),
}

impl JobStoreError {
    fn from_domain(id: JobId, err: DomainError) -> Self {
        match err {
            DomainError::Conflict(message) => Self::Conflict { id, message },
            DomainError::NotFound(_) => Self::NotFound(id),
            DomainError::InvalidState(message)
            | DomainError::Validation(message)
            | DomainError::InvalidId(message) => Self::InvalidTransition { id, message },
        }
    }

    /// Lost a race with another writer; re-reading may succeed.
    pub fn is_contention(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub queued: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub retry_scheduled: usize,
    pub dlq: usize,
    pub cancelled: usize,
    pub total: usize,
    /// Jobs that needed more than one attempt.
    pub retried: usize,
    /// 95th percentile of lease-to-outcome time over finished attempts;
    /// 0 before any attempt has finished.
    pub p95_attempt_latency_ms: u64,
}

impl JobStats {
    fn count(&mut self, job: &Job) {
        match job.status {
            JobStatus::Queued => self.queued += 1,
            JobStatus::Running => self.running += 1,
            JobStatus::Succeeded => self.succeeded += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::RetryScheduled => self.retry_scheduled += 1,
            JobStatus::Dlq => self.dlq += 1,
            JobStatus::Cancelled => self.cancelled += 1,
        }
        self.total += 1;
        if job.attempt > 1 {
            self.retried += 1;
        }
    }
}

/// Nearest-rank percentile; 0 for an empty sample.
fn percentile(samples: &mut [u64], pct: usize) -> u64 {
    if samples.is_empty() {
        return 0;
    }
    samples.sort_unstable();
    let rank = (samples.len() * pct).div_ceil(100).max(1);
    samples[rank - 1]
}

#[derive(Debug)]
struct JobRecord {
    job: Job,
    attempts: Vec<Attempt>,
}

/// Ready-index ordering: higher priority first, then oldest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct ReadyKey(Reverse<i32>, DateTime<Utc>, JobId);

impl ReadyKey {
    fn of(job: &Job) -> Self {
        Self(Reverse(job.priority), job.created_at, job.id)
    }
}

type ReadySet = Arc<Mutex<BTreeSet<ReadyKey>>>;

/// In-memory job store.
///
/// Locks: the job map is only held long enough to clone a record handle.
/// A transition locks the record, then the indexes, then the event log.
/// Index readers never take record locks.
#[derive(Debug)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Arc<Mutex<JobRecord>>>>,
    ready: RwLock<HashMap<TenantId, ReadySet>>,
    scheduled: Mutex<BTreeSet<(DateTime<Utc>, JobId)>>,
    events: Arc<EventLog>,
}

impl InMemoryJobStore {
    pub fn new(events: Arc<EventLog>) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            ready: RwLock::new(HashMap::new()),
            scheduled: Mutex::new(BTreeSet::new()),
            events,
        }
    }

    pub fn arc(events: Arc<EventLog>) -> Arc<Self> {
        Arc::new(Self::new(events))
    }

    fn record(&self, id: JobId) -> Result<Option<Arc<Mutex<JobRecord>>>, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| poisoned("job map"))?;
        Ok(jobs.get(&id).cloned())
    }

    fn all_records(&self) -> Result<Vec<Arc<Mutex<JobRecord>>>, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| poisoned("job map"))?;
        Ok(jobs.values().cloned().collect())
    }

    fn ready_set(&self, tenant_id: &TenantId) -> Result<ReadySet, JobStoreError> {
        {
            let ready = self.ready.read().map_err(|_| poisoned("ready index"))?;
            if let Some(set) = ready.get(tenant_id) {
                return Ok(set.clone());
            }
        }
        let mut ready = self.ready.write().map_err(|_| poisoned("ready index"))?;
        Ok(ready.entry(tenant_id.clone()).or_default().clone())
    }

    /// Keep the ready and retry indexes in step with a status change.
    fn reindex(
        &self,
        job: &Job,
        from: JobStatus,
        previous_next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), JobStoreError> {
        if from == job.status {
            return Ok(());
        }

        if from == JobStatus::Queued || job.status == JobStatus::Queued {
            let set = self.ready_set(&job.tenant_id)?;
            let mut set = set.lock().map_err(|_| poisoned("ready index"))?;
            if from == JobStatus::Queued {
                set.remove(&ReadyKey::of(job));
            }
            if job.status == JobStatus::Queued {
                set.insert(ReadyKey::of(job));
            }
        }

        if from == JobStatus::RetryScheduled || job.status == JobStatus::RetryScheduled {
            let mut scheduled = self.scheduled.lock().map_err(|_| poisoned("retry index"))?;
            if let (JobStatus::RetryScheduled, Some(at)) = (from, previous_next_run_at) {
                scheduled.remove(&(at, job.id));
            }
            if let (JobStatus::RetryScheduled, Some(at)) = (job.status, job.next_run_at) {
                scheduled.insert((at, job.id));
            }
        }

        Ok(())
    }
}

impl JobStore for InMemoryJobStore {
    fn create(&self, job: Job) -> Result<Job, JobStoreError> {
        let id = job.id;
        let record = Arc::new(Mutex::new(JobRecord {
            job,
            attempts: Vec::new(),
        }));
        // Held until the event is appended so no transition can be observed
        // before `job.created`.
        let guard = record.lock().map_err(|_| poisoned("job record"))?;

        {
            let mut jobs = self.jobs.write().map_err(|_| poisoned("job map"))?;
            if jobs.contains_key(&id) {
                return Err(JobStoreError::AlreadyExists(id));
            }
            jobs.insert(id, record.clone());
        }

        if guard.job.status == JobStatus::Queued {
            let set = self.ready_set(&guard.job.tenant_id)?;
            let mut set = set.lock().map_err(|_| poisoned("ready index"))?;
            set.insert(ReadyKey::of(&guard.job));
        }

        self.events
            .append(NewEvent::job_created(&guard.job))
            .map_err(|e| JobStoreError::Storage(e.to_string()))?;

        Ok(guard.job.clone())
    }

    fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let Some(record) = self.record(id)? else {
            return Ok(None);
        };
        let record = record.lock().map_err(|_| poisoned("job record"))?;
        Ok(Some(record.job.clone()))
    }

    fn snapshot(&self, id: JobId) -> Result<Option<JobSnapshot>, JobStoreError> {
        let Some(record) = self.record(id)? else {
            return Ok(None);
        };
        let record = record.lock().map_err(|_| poisoned("job record"))?;
        Ok(Some(JobSnapshot {
            job: record.job.clone(),
            latest_attempt: record.attempts.last().cloned(),
        }))
    }

    fn attempts(&self, id: JobId) -> Result<Vec<Attempt>, JobStoreError> {
        let record = self.record(id)?.ok_or(JobStoreError::NotFound(id))?;
        let record = record.lock().map_err(|_| poisoned("job record"))?;
        Ok(record.attempts.clone())
    }

    fn list(&self, filter: &JobFilter, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let mut result = Vec::new();
        for record in self.all_records()? {
            let record = record.lock().map_err(|_| poisoned("job record"))?;
            if filter.matches(&record.job) {
                result.push(record.job.clone());
            }
        }

        result.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        result.truncate(limit);
        Ok(result)
    }

    /// The record is only updated once the indexes and the event log have
    /// accepted the change. Both fail only on a poisoned lock; a failed
    /// append puts the indexes back.
    fn transition_with_holder(
        &self,
        id: JobId,
        expected: JobStatus,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<(Job, Option<WorkerId>), JobStoreError> {
        let record = self.record(id)?.ok_or(JobStoreError::NotFound(id))?;
        let mut record = record.lock().map_err(|_| poisoned("job record"))?;

        let from = record.job.status;
        let previous_next_run_at = record.job.next_run_at;
        let mut next = record.job.clone();
        let change = next
            .apply(expected, &transition, now)
            .map_err(|e| JobStoreError::from_domain(id, e))?;

        self.reindex(&next, from, previous_next_run_at)?;
        if let Err(e) = self
            .events
            .append(NewEvent::job_transition(&next, from, &transition, now))
        {
            self.reindex(&record.job, next.status, next.next_run_at)?;
            return Err(JobStoreError::Storage(e.to_string()));
        }

        let holder = std::mem::replace(&mut record.job, next).worker_id;
        if let Some(change) = change {
            change.apply_to(&mut record.attempts);
        }

        tracing::debug!(
            job_id = %id,
            tenant_id = %record.job.tenant_id,
            from = %from,
            to = %record.job.status,
            attempt = record.job.attempt,
            "job transitioned"
        );

        Ok((record.job.clone(), holder))
    }

    fn queued_heads(&self) -> Result<Vec<QueuedHead>, JobStoreError> {
        let sets: Vec<(TenantId, ReadySet)> = {
            let ready = self.ready.read().map_err(|_| poisoned("ready index"))?;
            ready.iter().map(|(t, s)| (t.clone(), s.clone())).collect()
        };

        let mut heads = Vec::with_capacity(sets.len());
        for (tenant_id, set) in sets {
            let set = set.lock().map_err(|_| poisoned("ready index"))?;
            if let Some(ReadyKey(Reverse(priority), created_at, job_id)) = set.first().copied() {
                heads.push(QueuedHead {
                    tenant_id,
                    job_id,
                    priority,
                    created_at,
                });
            }
        }
        Ok(heads)
    }

    fn due_retries(&self, now: DateTime<Utc>) -> Result<Vec<JobId>, JobStoreError> {
        let scheduled = self.scheduled.lock().map_err(|_| poisoned("retry index"))?;
        Ok(scheduled
            .iter()
            .take_while(|(at, _)| *at <= now)
            .map(|(_, id)| *id)
            .collect())
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        let mut stats = JobStats::default();
        let mut latencies = Vec::new();
        for record in self.all_records()? {
            let record = record.lock().map_err(|_| poisoned("job record"))?;
            stats.count(&record.job);
            latencies.extend(record.attempts.iter().filter_map(Attempt::latency_ms));
        }
        stats.p95_attempt_latency_ms = percentile(&mut latencies, 95);
        Ok(stats)
    }
}

impl JobStore for Arc<InMemoryJobStore> {
    fn create(&self, job: Job) -> Result<Job, JobStoreError> {
        (**self).create(job)
    }

    fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(id)
    }

    fn snapshot(&self, id: JobId) -> Result<Option<JobSnapshot>, JobStoreError> {
        (**self).snapshot(id)
    }

    fn attempts(&self, id: JobId) -> Result<Vec<Attempt>, JobStoreError> {
        (**self).attempts(id)
    }

    fn list(&self, filter: &JobFilter, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        (**self).list(filter, limit)
    }

    fn transition_with_holder(
        &self,
        id: JobId,
        expected: JobStatus,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<(Job, Option<WorkerId>), JobStoreError> {
        (**self).transition_with_holder(id, expected, transition, now)
    }

    fn queued_heads(&self) -> Result<Vec<QueuedHead>, JobStoreError> {
        (**self).queued_heads()
    }

    fn due_retries(&self, now: DateTime<Utc>) -> Result<Vec<JobId>, JobStoreError> {
        (**self).due_retries(now)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats()
    }
}

fn poisoned(what: &str) -> JobStoreError {
    JobStoreError::Storage(format!("{what} lock poisoned"))
}
