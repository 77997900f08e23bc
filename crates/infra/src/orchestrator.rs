//! Service facade: the submission pipeline, worker callbacks, operator
//! commands and periodic sweeps, wired over one store, index and event log.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use orchestrator_core::{
    Attempt, Clock, DomainError, Job, JobId, JobSnapshot, JobSpec, JobStatus, SubmitJob,
    TenantId, TenantLimit, Transition, Worker, WorkerId, WorkerState,
};
use orchestrator_events::{Event, EventLog, EventLogError, EventType, NewEvent, Subscription};

use crate::admission::{AdmissionController, AdmissionError, AdmissionRejection, TenantUsage};
use crate::config::OrchestratorConfig;
use crate::jobs::{
    IdempotencyError, IdempotencyIndex, InMemoryJobStore, JobFilter, JobStore, JobStoreError,
};
use crate::lease::{Completion, HeartbeatAck, LeaseConfig, LeaseError, LeaseManager};

/// Re-read attempts for operator commands racing with workers.
const MAX_COMMAND_ROUNDS: usize = 8;

#[derive(Debug, Clone, Error)]
pub enum OrchestratorError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    InvalidState(String),
    #[error(transparent)]
    AdmissionRejected(#[from] AdmissionRejection),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<DomainError> for OrchestratorError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(m) | DomainError::InvalidId(m) => Self::Validation(m),
            DomainError::NotFound(m) => Self::NotFound(m),
            DomainError::Conflict(m) => Self::Conflict(m),
            DomainError::InvalidState(m) => Self::InvalidState(m),
        }
    }
}

impl From<JobStoreError> for OrchestratorError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::NotFound(id) => Self::NotFound(format!("job not found: {id}")),
            JobStoreError::AlreadyExists(id) => Self::Conflict(format!("job already exists: {id}")),
            JobStoreError::Conflict { message, .. } => Self::Conflict(message),
            JobStoreError::InvalidTransition { message, .. } => Self::InvalidState(message),
            JobStoreError::Storage(m) => Self::Storage(m),
        }
    }
}

impl From<AdmissionError> for OrchestratorError {
    fn from(err: AdmissionError) -> Self {
        match err {
            AdmissionError::Rejected(r) => Self::AdmissionRejected(r),
            AdmissionError::Storage(m) => Self::Storage(m),
        }
    }
}

impl From<LeaseError> for OrchestratorError {
    fn from(err: LeaseError) -> Self {
        match err {
            LeaseError::UnknownWorker(id) => Self::NotFound(format!("unknown worker: {id}")),
            e @ LeaseError::NotHeld { .. } => Self::Conflict(e.to_string()),
            LeaseError::Store(e) => e.into(),
            LeaseError::Admission(e) => e.into(),
            LeaseError::Domain(e) => e.into(),
            LeaseError::Storage(m) => Self::Storage(m),
        }
    }
}

impl From<IdempotencyError> for OrchestratorError {
    fn from(err: IdempotencyError) -> Self {
        match err {
            IdempotencyError::AlreadyExists(id) => {
                Self::Conflict(format!("idempotency key already used by job {id}"))
            }
            e @ IdempotencyError::InFlight { .. } => Self::Conflict(e.to_string()),
            IdempotencyError::Storage(m) => Self::Storage(m),
        }
    }
}

impl From<EventLogError> for OrchestratorError {
    fn from(err: EventLogError) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Result of a submission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Submission {
    pub job: Job,
    /// `true` when the idempotency key matched an existing job.
    pub idempotent_replay: bool,
}

/// Dashboard KPIs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub queued: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub retry_scheduled: usize,
    pub dlq: usize,
    pub cancelled: usize,
    pub total: usize,
    /// Percentage (0-100) of jobs that needed more than one attempt.
    pub retry_rate: f64,
    pub dlq_size: usize,
    /// 95th percentile of lease-to-outcome time over finished attempts.
    pub p95_latency_ms: u64,
    pub paused: bool,
    pub workers_total: usize,
    pub workers_unhealthy: usize,
    pub last_event_seq: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub requeued: usize,
    pub leases_expired: usize,
    /// Jobs found in `failed` after an earlier routing error.
    pub failures_routed: usize,
    pub idempotency_pruned: usize,
}

pub struct Orchestrator<S: JobStore> {
    store: S,
    idempotency: IdempotencyIndex,
    admission: Arc<AdmissionController>,
    leases: LeaseManager<S>,
    events: Arc<EventLog>,
    clock: Arc<dyn Clock>,
    paused: AtomicBool,
    max_payload_bytes: usize,
    list_limit_default: usize,
    list_limit_max: usize,
}

impl Orchestrator<Arc<InMemoryJobStore>> {
    /// Fully in-memory wiring.
    pub fn in_memory(config: &OrchestratorConfig, clock: Arc<dyn Clock>) -> Self {
        let events = Arc::new(EventLog::new(config.event_log_capacity));
        let store = InMemoryJobStore::arc(events.clone());
        Self::new(config, store, events, clock)
    }
}

impl<S: JobStore + Clone> Orchestrator<S> {
    pub fn new(
        config: &OrchestratorConfig,
        store: S,
        events: Arc<EventLog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let admission = Arc::new(AdmissionController::with_limits(
            config.tenant_defaults,
            config.tenant_limits.iter().cloned(),
        ));
        let leases = LeaseManager::new(
            store.clone(),
            admission.clone(),
            events.clone(),
            config.retry.clone(),
            LeaseConfig {
                heartbeat_interval: config.heartbeat_interval,
                heartbeat_timeout: config.heartbeat_timeout,
                default_concurrency: config.worker_default_concurrency,
            },
        );

        Self {
            store,
            idempotency: IdempotencyIndex::new(config.idempotency_ttl),
            admission,
            leases,
            events,
            clock,
            paused: AtomicBool::new(false),
            max_payload_bytes: config.max_payload_bytes,
            list_limit_default: config.list_limit_default,
            list_limit_max: config.list_limit_max,
        }
    }
}

impl<S: JobStore> Orchestrator<S> {
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn lease_config(&self) -> LeaseConfig {
        self.leases.config()
    }

    // ─── Submission ──────────────────────────────────────────────────────

    /// Validate, dedupe, admit and store a new job.
    ///
    /// A replayed idempotency key returns the original job without touching
    /// the rate limiter.
    pub fn submit(&self, raw: SubmitJob) -> Result<Submission, OrchestratorError> {
        let now = self.now();
        let spec = JobSpec::parse(raw, self.max_payload_bytes)?;

        let reservation = match spec.idempotency_key.as_deref() {
            None => None,
            Some(key) => match self.idempotency.reserve(&spec.tenant_id, key, now) {
                Ok(reservation) => Some(reservation),
                Err(IdempotencyError::AlreadyExists(job_id)) => {
                    let job = self.store.get(job_id)?.ok_or_else(|| {
                        OrchestratorError::Storage(format!(
                            "idempotency key bound to missing job {job_id}"
                        ))
                    })?;
                    debug!(job_id = %job.id, tenant_id = %job.tenant_id, "idempotent replay");
                    return Ok(Submission {
                        job,
                        idempotent_replay: true,
                    });
                }
                Err(e) => return Err(e.into()),
            },
        };

        if let Err(e) = self.admission.admit_submission(&spec.tenant_id, now) {
            if let AdmissionError::Rejected(ref rejection) = e {
                info!(tenant_id = %rejection.tenant_id, reason = %rejection.reason, "submission rejected");
            }
            return Err(e.into());
        }

        let job = self.store.create(Job::new(spec, now))?;
        if let Some(reservation) = reservation {
            reservation.commit(job.id)?;
        }

        info!(
            job_id = %job.id,
            tenant_id = %job.tenant_id,
            model = %job.model,
            priority = job.priority,
            trace_id = %job.trace_id,
            "job submitted"
        );
        Ok(Submission {
            job,
            idempotent_replay: false,
        })
    }

    // ─── Queries ─────────────────────────────────────────────────────────

    pub fn get_job(&self, id: JobId) -> Result<JobSnapshot, OrchestratorError> {
        self.store
            .snapshot(id)?
            .ok_or_else(|| OrchestratorError::NotFound(format!("job not found: {id}")))
    }

    pub fn job_attempts(&self, id: JobId) -> Result<Vec<Attempt>, OrchestratorError> {
        Ok(self.store.attempts(id)?)
    }

    /// Newest first. `limit` defaults when absent and must be within bounds.
    pub fn list_jobs(&self, filter: &JobFilter, limit: Option<usize>) -> Result<Vec<Job>, OrchestratorError> {
        let limit = limit.unwrap_or(self.list_limit_default);
        if limit == 0 || limit > self.list_limit_max {
            return Err(OrchestratorError::Validation(format!(
                "limit must be between 1 and {}",
                self.list_limit_max
            )));
        }
        Ok(self.store.list(filter, limit)?)
    }

    // ─── Operator commands ───────────────────────────────────────────────

    /// Cancel a queued, running or retry-scheduled job.
    ///
    /// A running job's slots are released at once; the worker learns about it
    /// from `revoked_job_ids` on its next heartbeat.
    pub fn cancel(&self, id: JobId) -> Result<Job, OrchestratorError> {
        for _ in 0..MAX_COMMAND_ROUNDS {
            let now = self.now();
            let job = self
                .store
                .get(id)?
                .ok_or_else(|| OrchestratorError::NotFound(format!("job not found: {id}")))?;
            if !job.status.is_active() {
                return Err(OrchestratorError::InvalidState(format!(
                    "job {id} is {} and cannot be cancelled",
                    job.status
                )));
            }

            match self
                .store
                .transition_with_holder(id, job.status, Transition::Cancel, now)
            {
                Ok((cancelled, holder)) => {
                    // The holder at the moment of the swap, which may differ
                    // from the one read above if the job was re-leased.
                    if let Some(worker_id) = holder.as_ref() {
                        self.leases.release_cancelled(worker_id, &cancelled)?;
                    }
                    info!(job_id = %id, tenant_id = %cancelled.tenant_id, from = %job.status, "job cancelled");
                    return Ok(cancelled);
                }
                Err(e) if e.is_contention() => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(OrchestratorError::Conflict(format!(
            "job {id} kept changing; try again"
        )))
    }

    /// Put a failed, retry-scheduled, cancelled or dead-lettered job back on
    /// the queue. Dead-lettered jobs start over with a fresh attempt budget.
    pub fn admin_retry(&self, id: JobId) -> Result<Job, OrchestratorError> {
        for _ in 0..MAX_COMMAND_ROUNDS {
            let now = self.now();
            let job = self
                .store
                .get(id)?
                .ok_or_else(|| OrchestratorError::NotFound(format!("job not found: {id}")))?;

            let transition = match job.status {
                JobStatus::Dlq => Transition::ReplayDlq,
                JobStatus::Failed | JobStatus::RetryScheduled | JobStatus::Cancelled => {
                    Transition::ManualRetry
                }
                status => {
                    return Err(OrchestratorError::InvalidState(format!(
                        "job {id} is {status} and cannot be retried"
                    )));
                }
            };

            match self.store.transition(id, job.status, transition, now) {
                Ok(requeued) => {
                    info!(job_id = %id, from = %job.status, attempt = requeued.attempt, "job manually requeued");
                    return Ok(requeued);
                }
                Err(e) if e.is_contention() => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(OrchestratorError::Conflict(format!(
            "job {id} kept changing; try again"
        )))
    }

    pub fn pause(&self) -> Result<bool, OrchestratorError> {
        self.set_paused(true)
    }

    pub fn resume(&self) -> Result<bool, OrchestratorError> {
        self.set_paused(false)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Returns whether the flag changed.
    fn set_paused(&self, paused: bool) -> Result<bool, OrchestratorError> {
        let changed = self.paused.swap(paused, Ordering::SeqCst) != paused;
        if changed {
            let event_type = if paused {
                EventType::QueuePaused
            } else {
                EventType::QueueResumed
            };
            self.events.append(NewEvent::new(event_type, self.now()))?;
            info!(paused, "queue state changed");
        }
        Ok(changed)
    }

    // ─── Workers ─────────────────────────────────────────────────────────

    /// Lease the next eligible job, or `None` when there is none or the queue
    /// is paused.
    pub fn lease(&self, worker_id: &WorkerId) -> Result<Option<Job>, OrchestratorError> {
        let now = self.now();
        if self.is_paused() {
            self.leases.touch_worker(worker_id, now)?;
            return Ok(None);
        }
        Ok(self.leases.acquire_lease(worker_id, now)?)
    }

    pub fn heartbeat(&self, worker_id: &WorkerId, active_job_ids: &[JobId]) -> Result<HeartbeatAck, OrchestratorError> {
        Ok(self.leases.heartbeat(worker_id, active_job_ids, self.now())?)
    }

    pub fn complete(&self, worker_id: &WorkerId, job_id: JobId, completion: Completion) -> Result<Job, OrchestratorError> {
        Ok(self.leases.release_lease(worker_id, job_id, completion, self.now())?)
    }

    pub fn register_worker(&self, worker_id: &WorkerId, concurrency: u32) -> Result<Worker, OrchestratorError> {
        Ok(self.leases.register_worker(worker_id, concurrency, self.now())?)
    }

    pub fn workers(&self) -> Result<Vec<Worker>, OrchestratorError> {
        Ok(self.leases.workers()?)
    }

    // ─── Tenants ─────────────────────────────────────────────────────────

    pub fn tenant_limit(&self, tenant_id: &TenantId) -> Result<TenantLimit, OrchestratorError> {
        Ok(self.admission.limit(tenant_id)?)
    }

    pub fn tenant_usage(&self, tenant_id: &TenantId) -> Result<TenantUsage, OrchestratorError> {
        Ok(self.admission.usage(tenant_id, self.now())?)
    }

    pub fn tenant_limits(&self) -> Result<Vec<TenantLimit>, OrchestratorError> {
        Ok(self.admission.limits()?)
    }

    pub fn set_tenant_limit(&self, limit: TenantLimit) -> Result<TenantLimit, OrchestratorError> {
        limit.validate()?;
        let limit = self.admission.set_limit(limit)?;
        self.events.append(
            NewEvent::new(EventType::TenantLimitUpdated, self.now())
                .with_tenant(limit.tenant_id.clone())
                .with_details(json!({
                    "concurrency": limit.concurrency,
                    "rps": limit.rps,
                    "token_budget_per_min": limit.token_budget_per_min,
                })),
        )?;
        info!(
            tenant_id = %limit.tenant_id,
            concurrency = limit.concurrency,
            rps = limit.rps,
            token_budget_per_min = limit.token_budget_per_min,
            "tenant limit updated"
        );
        Ok(limit)
    }

    // ─── Metrics & events ────────────────────────────────────────────────

    pub fn metrics(&self) -> Result<MetricsSummary, OrchestratorError> {
        let stats = self.store.stats()?;
        let workers = self.leases.workers()?;
        let retry_rate = if stats.total == 0 {
            0.0
        } else {
            stats.retried as f64 * 100.0 / stats.total as f64
        };

        Ok(MetricsSummary {
            queued: stats.queued,
            running: stats.running,
            succeeded: stats.succeeded,
            failed: stats.failed,
            retry_scheduled: stats.retry_scheduled,
            dlq: stats.dlq,
            cancelled: stats.cancelled,
            total: stats.total,
            retry_rate,
            dlq_size: stats.dlq,
            p95_latency_ms: stats.p95_attempt_latency_ms,
            paused: self.is_paused(),
            workers_total: workers.len(),
            workers_unhealthy: workers
                .iter()
                .filter(|w| w.state == WorkerState::Unhealthy)
                .count(),
            last_event_seq: self.events.last_seq()?,
        })
    }

    pub fn recent_events(&self, limit: usize) -> Result<Vec<Event>, OrchestratorError> {
        Ok(self.events.recent(limit)?)
    }

    pub fn events_since(&self, after: u64, limit: usize) -> Result<Vec<Event>, OrchestratorError> {
        Ok(self.events.since(after, limit)?)
    }

    pub fn last_event_seq(&self) -> Result<u64, OrchestratorError> {
        Ok(self.events.last_seq()?)
    }

    pub fn subscribe(&self) -> Subscription<Event> {
        self.events.subscribe()
    }

    // ─── Sweeps ──────────────────────────────────────────────────────────

    /// Requeue retry-scheduled jobs whose time has come.
    pub fn sweep_retries(&self) -> Result<usize, OrchestratorError> {
        let now = self.now();
        let mut requeued = 0;
        for id in self.store.due_retries(now)? {
            match self
                .store
                .transition(id, JobStatus::RetryScheduled, Transition::Requeue, now)
            {
                Ok(_) => requeued += 1,
                Err(
                    e @ (JobStoreError::Conflict { .. }
                    | JobStoreError::InvalidTransition { .. }
                    | JobStoreError::NotFound(_)),
                ) => debug!(job_id = %id, error = %e, "retry no longer due"),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(requeued)
    }

    pub fn expire_leases(&self) -> Result<usize, OrchestratorError> {
        Ok(self.leases.expire_stale_workers(self.now())?)
    }

    pub fn route_failed(&self) -> Result<usize, OrchestratorError> {
        Ok(self.leases.route_failed_jobs(self.now())?)
    }

    pub fn prune_idempotency(&self) -> Result<usize, OrchestratorError> {
        Ok(self.idempotency.prune(self.now())?)
    }

    /// One pass of every periodic task. Errors are logged per task so one
    /// failing sweep does not starve the others.
    pub fn run_sweeps(&self) -> SweepReport {
        let mut report = SweepReport::default();

        match self.expire_leases() {
            Ok(n) => report.leases_expired = n,
            Err(e) => warn!(error = %e, "lease expiry sweep failed"),
        }
        match self.route_failed() {
            Ok(n) => report.failures_routed = n,
            Err(e) => warn!(error = %e, "failed-job sweep failed"),
        }
        match self.sweep_retries() {
            Ok(n) => report.requeued = n,
            Err(e) => warn!(error = %e, "retry sweep failed"),
        }
        match self.prune_idempotency() {
            Ok(n) => report.idempotency_pruned = n,
            Err(e) => warn!(error = %e, "idempotency prune failed"),
        }

        if report != SweepReport::default() {
            debug!(
                requeued = report.requeued,
                leases_expired = report.leases_expired,
                failures_routed = report.failures_routed,
                idempotency_pruned = report.idempotency_pruned,
                "sweep completed"
            );
        }
        report
    }
}
