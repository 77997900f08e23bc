//! Lease management: worker registry, lease hand-out, heartbeats, expiry.
//!
//! Locks are taken worker → tenant → job. A worker's lock is held for the
//! whole of a lease, completion or expiry so its slot count always matches
//! the jobs it holds.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use orchestrator_core::{
    DomainError, Failure, Job, JobId, JobStatus, RetryDecision, RetryPolicy, Transition, Worker,
    WorkerId, WorkerState,
};
use orchestrator_events::{EventLog, EventType, NewEvent};

use crate::admission::{AdmissionController, AdmissionError};
use crate::jobs::{JobFilter, JobStore, JobStoreError, QueuedHead};

/// Rounds of re-reading the ready index after losing a race for a job.
const MAX_LEASE_ROUNDS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseConfig {
    /// How often workers are expected to heartbeat.
    pub heartbeat_interval: Duration,
    /// Silence after which a worker is declared unhealthy.
    pub heartbeat_timeout: Duration,
    /// Slots given to a worker that never registered explicitly.
    pub default_concurrency: u32,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(10),
            default_concurrency: 4,
        }
    }
}

/// What a worker reports when it finishes a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Completion {
    Succeeded {
        #[serde(default)]
        tokens: u64,
        #[serde(default)]
        cost_usd: f64,
    },
    Failed {
        error_code: String,
        #[serde(default)]
        error_message: String,
        #[serde(default)]
        tokens: u64,
        #[serde(default)]
        cost_usd: f64,
    },
}

impl Completion {
    pub fn tokens(&self) -> u64 {
        match self {
            Completion::Succeeded { tokens, .. } | Completion::Failed { tokens, .. } => *tokens,
        }
    }

    fn into_transition(self, worker_id: WorkerId) -> Transition {
        match self {
            Completion::Succeeded { tokens, cost_usd } => Transition::Succeed {
                worker_id,
                tokens,
                cost_usd,
            },
            Completion::Failed {
                error_code,
                error_message,
                tokens,
                cost_usd,
            } => Transition::Fail {
                worker_id,
                failure: Failure::new(error_code, error_message),
                tokens,
                cost_usd,
            },
        }
    }
}

/// Reply to a heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeartbeatAck {
    pub worker: Worker,
    /// Jobs the worker reported that it no longer holds; it should stop them.
    pub revoked_job_ids: Vec<JobId>,
}

#[derive(Debug, Clone, Error)]
pub enum LeaseError {
    #[error("unknown worker: {0}")]
    UnknownWorker(WorkerId),
    #[error("worker {worker_id} does not hold job {job_id}")]
    NotHeld { worker_id: WorkerId, job_id: JobId },
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("lease state unavailable: {0}")]
    Storage(String),
}

type WorkerSlot = Arc<Mutex<Worker>>;

/// Hands out leases and keeps worker liveness.
#[derive(Debug)]
pub struct LeaseManager<S: JobStore> {
    store: S,
    admission: Arc<AdmissionController>,
    events: Arc<EventLog>,
    retry: RetryPolicy,
    config: LeaseConfig,
    workers: RwLock<HashMap<WorkerId, WorkerSlot>>,
}

impl<S: JobStore> LeaseManager<S> {
    pub fn new(
        store: S,
        admission: Arc<AdmissionController>,
        events: Arc<EventLog>,
        retry: RetryPolicy,
        config: LeaseConfig,
    ) -> Self {
        Self {
            store,
            admission,
            events,
            retry,
            config,
            workers: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> LeaseConfig {
        self.config
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    fn emit(&self, event: NewEvent) {
        if let Err(e) = self.events.append(event) {
            warn!(error = %e, "failed to append worker event");
        }
    }

    fn lookup(&self, worker_id: &WorkerId) -> Result<Option<WorkerSlot>, LeaseError> {
        let workers = self.workers.read().map_err(|_| poisoned())?;
        Ok(workers.get(worker_id).cloned())
    }

    /// Registry entry for `worker_id`, auto-registering on first contact.
    fn entry(&self, worker_id: &WorkerId, now: DateTime<Utc>) -> Result<WorkerSlot, LeaseError> {
        if let Some(slot) = self.lookup(worker_id)? {
            return Ok(slot);
        }

        let (slot, inserted) = {
            let mut workers = self.workers.write().map_err(|_| poisoned())?;
            match workers.get(worker_id) {
                Some(slot) => (slot.clone(), false),
                None => {
                    let slot = Arc::new(Mutex::new(Worker::new(
                        worker_id.clone(),
                        self.config.default_concurrency,
                        now,
                    )));
                    workers.insert(worker_id.clone(), slot.clone());
                    (slot, true)
                }
            }
        };

        if inserted {
            info!(worker_id = %worker_id, concurrency = self.config.default_concurrency, "worker registered");
            self.emit(
                NewEvent::new(EventType::WorkerRegistered, now)
                    .with_worker(worker_id.clone())
                    .with_details(json!({ "concurrency": self.config.default_concurrency })),
            );
        }
        Ok(slot)
    }

    /// Record contact; emits `worker.recovered` when this revives the worker.
    fn touch(&self, worker: &mut Worker, now: DateTime<Utc>) {
        if worker.touch(now) {
            info!(worker_id = %worker.worker_id, restart_count = worker.restart_count, "worker recovered");
            self.emit(
                NewEvent::new(EventType::WorkerRecovered, now)
                    .with_worker(worker.worker_id.clone())
                    .with_details(json!({ "restart_count": worker.restart_count })),
            );
        }
    }

    /// Register a worker or change its slot count.
    pub fn register_worker(
        &self,
        worker_id: &WorkerId,
        concurrency: u32,
        now: DateTime<Utc>,
    ) -> Result<Worker, LeaseError> {
        let slot = self.entry(worker_id, now)?;
        let mut worker = slot.lock().map_err(|_| poisoned())?;
        worker.set_concurrency(concurrency)?;
        self.touch(&mut worker, now);
        Ok(worker.clone())
    }

    /// Record liveness without asking for work.
    pub fn touch_worker(&self, worker_id: &WorkerId, now: DateTime<Utc>) -> Result<Worker, LeaseError> {
        let slot = self.entry(worker_id, now)?;
        let mut worker = slot.lock().map_err(|_| poisoned())?;
        self.touch(&mut worker, now);
        Ok(worker.clone())
    }

    pub fn worker(&self, worker_id: &WorkerId) -> Result<Option<Worker>, LeaseError> {
        let Some(slot) = self.lookup(worker_id)? else {
            return Ok(None);
        };
        let worker = slot.lock().map_err(|_| poisoned())?;
        Ok(Some(worker.clone()))
    }

    /// All registered workers, ordered by id.
    pub fn workers(&self) -> Result<Vec<Worker>, LeaseError> {
        let slots: Vec<WorkerSlot> = {
            let workers = self.workers.read().map_err(|_| poisoned())?;
            workers.values().cloned().collect()
        };
        let mut workers = slots
            .iter()
            .map(|slot| slot.lock().map(|w| w.clone()).map_err(|_| poisoned()))
            .collect::<Result<Vec<_>, _>>()?;
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        Ok(workers)
    }

    /// Hand the best eligible queued job to `worker_id`, or `None`.
    ///
    /// Never waits for work. Candidates are ordered by priority (desc) then
    /// age; a tenant that fails `admit_lease` is skipped for this call.
    pub fn acquire_lease(&self, worker_id: &WorkerId, now: DateTime<Utc>) -> Result<Option<Job>, LeaseError> {
        let slot = self.entry(worker_id, now)?;
        let mut worker = slot.lock().map_err(|_| poisoned())?;
        self.touch(&mut worker, now);

        if !worker.has_free_slot() {
            debug!(worker_id = %worker_id, active_slots = worker.active_slots, "worker has no free slot");
            return Ok(None);
        }

        for _ in 0..MAX_LEASE_ROUNDS {
            let mut heads = self.store.queued_heads()?;
            if heads.is_empty() {
                return Ok(None);
            }
            heads.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.created_at.cmp(&b.created_at))
                    .then(a.job_id.cmp(&b.job_id))
            });

            let mut contended = false;
            for QueuedHead { tenant_id, job_id, .. } in heads {
                match self.admission.admit_lease(&tenant_id, now) {
                    Ok(()) => {}
                    Err(AdmissionError::Rejected(rejection)) => {
                        debug!(tenant_id = %tenant_id, reason = %rejection.reason, "tenant skipped for lease");
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                }

                let lease = Transition::Lease {
                    worker_id: worker_id.clone(),
                };
                match self.store.transition(job_id, JobStatus::Queued, lease, now) {
                    Ok(job) => {
                        worker.reserve(job.id)?;
                        info!(
                            job_id = %job.id,
                            tenant_id = %job.tenant_id,
                            worker_id = %worker_id,
                            attempt = job.attempt,
                            trace_id = %job.trace_id,
                            "job leased"
                        );
                        return Ok(Some(job));
                    }
                    Err(
                        JobStoreError::Conflict { .. }
                        | JobStoreError::InvalidTransition { .. }
                        | JobStoreError::NotFound(_),
                    ) => {
                        self.admission.release_lease(&tenant_id)?;
                        contended = true;
                    }
                    Err(e) => {
                        self.admission.release_lease(&tenant_id)?;
                        return Err(e.into());
                    }
                }
            }

            if !contended {
                return Ok(None);
            }
        }

        Ok(None)
    }

    /// Refresh liveness and report which of `active_job_ids` were revoked.
    pub fn heartbeat(
        &self,
        worker_id: &WorkerId,
        active_job_ids: &[JobId],
        now: DateTime<Utc>,
    ) -> Result<HeartbeatAck, LeaseError> {
        let slot = self.entry(worker_id, now)?;
        let mut worker = slot.lock().map_err(|_| poisoned())?;
        self.touch(&mut worker, now);

        let revoked_job_ids: Vec<JobId> = active_job_ids
            .iter()
            .filter(|id| !worker.holds(id))
            .copied()
            .collect();
        if !revoked_job_ids.is_empty() {
            debug!(worker_id = %worker_id, revoked = revoked_job_ids.len(), "heartbeat reported revoked jobs");
        }

        Ok(HeartbeatAck {
            worker: worker.clone(),
            revoked_job_ids,
        })
    }

    /// The normal exit from `running`: record the worker's outcome, free the
    /// slots, and route failures through the retry policy.
    pub fn release_lease(
        &self,
        worker_id: &WorkerId,
        job_id: JobId,
        completion: Completion,
        now: DateTime<Utc>,
    ) -> Result<Job, LeaseError> {
        let slot = self
            .lookup(worker_id)?
            .ok_or_else(|| LeaseError::UnknownWorker(worker_id.clone()))?;
        let mut worker = slot.lock().map_err(|_| poisoned())?;
        self.touch(&mut worker, now);

        if !worker.holds(&job_id) {
            if self.store.get(job_id)?.is_none() {
                return Err(JobStoreError::NotFound(job_id).into());
            }
            return Err(LeaseError::NotHeld {
                worker_id: worker_id.clone(),
                job_id,
            });
        }

        let tokens = completion.tokens();
        let transition = completion.into_transition(worker_id.clone());
        let job = self
            .store
            .transition(job_id, JobStatus::Running, transition, now)?;

        worker.release(&job_id);
        self.admission.release_lease(&job.tenant_id)?;
        self.admission.record_tokens(&job.tenant_id, tokens, now)?;

        if job.status == JobStatus::Failed {
            warn!(
                job_id = %job.id,
                tenant_id = %job.tenant_id,
                worker_id = %worker_id,
                attempt = job.attempt,
                error_code = job.error_code.as_deref().unwrap_or_default(),
                "job attempt failed"
            );
            // On error the job stays `failed` and the next sweep routes it.
            return self.route_failure(job, now);
        }

        info!(job_id = %job.id, tenant_id = %job.tenant_id, worker_id = %worker_id, tokens, "job succeeded");
        Ok(job)
    }

    /// Give back the slots of a running job that was cancelled.
    pub fn release_cancelled(&self, worker_id: &WorkerId, job: &Job) -> Result<(), LeaseError> {
        if let Some(slot) = self.lookup(worker_id)? {
            let mut worker = slot.lock().map_err(|_| poisoned())?;
            worker.release(&job.id);
        }
        self.admission.release_lease(&job.tenant_id)?;
        Ok(())
    }

    /// Move a `failed` job to `retry_scheduled` or `dlq`.
    ///
    /// When another caller routed the job first, returns it as it is now.
    fn route_failure(&self, job: Job, now: DateTime<Utc>) -> Result<Job, LeaseError> {
        let reason = job.error_code.clone().unwrap_or_default();
        let decision = self.retry.decide(job.attempt, job.max_attempts, &reason, now);
        let transition = match &decision {
            RetryDecision::Retry { next_run_at, .. } => Transition::ScheduleRetry {
                next_run_at: *next_run_at,
            },
            RetryDecision::DeadLetter { .. } => Transition::DeadLetter,
        };

        let routed = match self.store.transition(job.id, JobStatus::Failed, transition, now) {
            Ok(routed) => routed,
            Err(e) if e.is_contention() => {
                debug!(job_id = %job.id, error = %e, "failure already routed");
                return self
                    .store
                    .get(job.id)?
                    .ok_or_else(|| JobStoreError::NotFound(job.id).into());
            }
            Err(e) => return Err(e.into()),
        };

        match decision {
            RetryDecision::Retry { delay, .. } => info!(
                job_id = %routed.id,
                attempt = routed.attempt,
                delay_ms = delay.as_millis() as u64,
                "job retry scheduled"
            ),
            RetryDecision::DeadLetter { reason } => {
                warn!(job_id = %routed.id, tenant_id = %routed.tenant_id, reason = %reason, "job moved to dlq")
            }
        }
        Ok(routed)
    }

    /// Route jobs an earlier error left in `failed`. Returns how many moved.
    pub fn route_failed_jobs(&self, now: DateTime<Utc>) -> Result<usize, LeaseError> {
        let filter = JobFilter {
            status: Some(JobStatus::Failed),
            ..JobFilter::default()
        };

        let mut routed = 0;
        for job in self.store.list(&filter, usize::MAX)? {
            let id = job.id;
            match self.route_failure(job, now) {
                Ok(job) => {
                    debug!(job_id = %id, status = %job.status, "stranded failure routed");
                    routed += 1;
                }
                Err(e) => warn!(job_id = %id, error = %e, "failed to route failed job"),
            }
        }
        Ok(routed)
    }

    /// Declare workers silent past the heartbeat timeout unhealthy and fail
    /// their jobs with `LEASE_EXPIRED`. Returns how many leases expired.
    ///
    /// A job stays held by its worker until its expiry is recorded, so one
    /// that hits an error is picked up again by the next call.
    pub fn expire_stale_workers(&self, now: DateTime<Utc>) -> Result<usize, LeaseError> {
        let timeout = chrono::Duration::from_std(self.config.heartbeat_timeout)
            .unwrap_or(chrono::Duration::MAX);
        let slots: Vec<WorkerSlot> = {
            let workers = self.workers.read().map_err(|_| poisoned())?;
            workers.values().cloned().collect()
        };

        let mut expired = 0;
        for slot in slots {
            let Ok(mut worker) = slot.lock() else {
                warn!("worker lock poisoned; skipping");
                continue;
            };

            if worker.is_stale(now, timeout) {
                worker.mark_unhealthy();
                warn!(
                    worker_id = %worker.worker_id,
                    last_heartbeat_at = %worker.last_heartbeat_at,
                    held_jobs = worker.active_job_ids.len(),
                    "worker missed heartbeats; marking unhealthy"
                );
                self.emit(
                    NewEvent::new(EventType::WorkerUnhealthy, now)
                        .with_worker(worker.worker_id.clone())
                        .with_details(json!({
                            "last_heartbeat_at": worker.last_heartbeat_at,
                            "held_jobs": worker.active_job_ids.len(),
                        })),
                );
            } else if worker.state != WorkerState::Unhealthy || worker.active_job_ids.is_empty() {
                continue;
            }

            let held: Vec<JobId> = worker.active_job_ids.iter().copied().collect();
            for job_id in held {
                match self.expire_lease(&mut worker, job_id, now) {
                    Ok(true) => expired += 1,
                    Ok(false) => {}
                    Err(e) => warn!(
                        worker_id = %worker.worker_id,
                        job_id = %job_id,
                        error = %e,
                        "lease expiry failed; retrying next sweep"
                    ),
                }
            }
        }

        Ok(expired)
    }

    /// Fail one job of a dead worker. Returns whether this call expired it.
    fn expire_lease(&self, worker: &mut Worker, job_id: JobId, now: DateTime<Utc>) -> Result<bool, LeaseError> {
        let fail = Transition::Fail {
            worker_id: worker.worker_id.clone(),
            failure: Failure::lease_expired(&worker.worker_id),
            tokens: 0,
            cost_usd: 0.0,
        };
        match self.store.transition(job_id, JobStatus::Running, fail, now) {
            Ok(job) => {
                worker.release(&job_id);
                if let Err(e) = self.admission.release_lease(&job.tenant_id) {
                    warn!(job_id = %job_id, tenant_id = %job.tenant_id, error = %e, "failed to release tenant slot");
                }
                if let Err(e) = self.route_failure(job, now) {
                    warn!(job_id = %job_id, error = %e, "failure routing deferred to the next sweep");
                }
                Ok(true)
            }
            // Already finished or cancelled; whoever moved it released the tenant slot.
            Err(e @ (JobStoreError::Conflict { .. }
            | JobStoreError::InvalidTransition { .. }
            | JobStoreError::NotFound(_))) => {
                worker.release(&job_id);
                debug!(job_id = %job_id, error = %e, "lease already gone");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn poisoned() -> LeaseError {
    LeaseError::Storage("worker registry lock poisoned".to_string())
}
