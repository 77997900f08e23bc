//! Job lifecycle model.
//!
//! A [`Job`] only changes state through [`Job::apply`], which checks the
//! caller's expected status (compare-and-swap), the transition table and the
//! attempt ceiling before mutating anything.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DomainError, DomainResult};
use crate::id::{JobId, TenantId, TraceId, WorkerId};

/// Well-known error codes written onto a job's error fields.
pub mod error_codes {
    /// The holding worker stopped heartbeating.
    pub const LEASE_EXPIRED: &str = "LEASE_EXPIRED";
    /// Fallback when a worker reports a failure without a code.
    pub const UPSTREAM_EXECUTION_ERROR: &str = "UPSTREAM_EXECUTION_ERROR";
}

pub const DEFAULT_PRIORITY: i32 = 3;
pub const MIN_PRIORITY: i32 = 1;
pub const MAX_PRIORITY: i32 = 10;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const MAX_MAX_ATTEMPTS: u32 = 25;
const MAX_MODEL_LEN: usize = 128;
const MAX_IDEMPOTENCY_KEY_LEN: usize = 256;

/// Lifecycle status. Exactly one at a time.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    RetryScheduled,
    Dlq,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::RetryScheduled,
        JobStatus::Dlq,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::RetryScheduled => "retry_scheduled",
            JobStatus::Dlq => "dlq",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// No automatic transition leaves these statuses.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Dlq | JobStatus::Cancelled
        )
    }

    /// Statuses from which a job can still be cancelled.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobStatus::Queued | JobStatus::Running | JobStatus::RetryScheduled
        )
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s.trim())
            .ok_or_else(|| DomainError::validation(format!("unknown job status: {s}")))
    }
}

/// Raw submission as received from a caller. Validated by [`JobSpec::parse`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitJob {
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default, alias = "payload_json")]
    pub payload: Option<Value>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub max_attempts: Option<i64>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// Validated, defaulted submission.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    pub tenant_id: TenantId,
    pub model: String,
    pub payload: Value,
    pub priority: i32,
    pub max_attempts: u32,
    pub idempotency_key: Option<String>,
}

impl JobSpec {
    /// Validate a raw submission and fill in defaults.
    ///
    /// `priority` and `max_attempts` default when absent or zero; an absent
    /// payload becomes `{}`; an empty idempotency key means no key.
    pub fn parse(raw: SubmitJob, max_payload_bytes: usize) -> DomainResult<Self> {
        let tenant_id = TenantId::parse(raw.tenant_id.trim())?;

        let model = raw.model.trim().to_string();
        if model.is_empty() {
            return Err(DomainError::validation("model must not be empty"));
        }
        if model.len() > MAX_MODEL_LEN {
            return Err(DomainError::validation(format!(
                "model must be at most {MAX_MODEL_LEN} characters"
            )));
        }

        let payload = match raw.payload {
            None | Some(Value::Null) => Value::Object(Default::default()),
            Some(value @ Value::Object(_)) => value,
            Some(_) => return Err(DomainError::validation("payload must be a JSON object")),
        };
        let size = serde_json::to_vec(&payload)
            .map_err(|e| DomainError::validation(format!("payload is not serializable: {e}")))?
            .len();
        if size > max_payload_bytes {
            return Err(DomainError::validation(format!(
                "payload is {size} bytes, limit is {max_payload_bytes}"
            )));
        }

        let priority = match raw.priority {
            None | Some(0) => DEFAULT_PRIORITY,
            Some(p) if (MIN_PRIORITY as i64..=MAX_PRIORITY as i64).contains(&p) => p as i32,
            Some(p) => {
                return Err(DomainError::validation(format!(
                    "priority must be between {MIN_PRIORITY} and {MAX_PRIORITY}, got {p}"
                )));
            }
        };

        let max_attempts = match raw.max_attempts {
            None | Some(0) => DEFAULT_MAX_ATTEMPTS,
            Some(n) if (1..=MAX_MAX_ATTEMPTS as i64).contains(&n) => n as u32,
            Some(n) => {
                return Err(DomainError::validation(format!(
                    "max_attempts must be between 1 and {MAX_MAX_ATTEMPTS}, got {n}"
                )));
            }
        };

        let idempotency_key = match raw.idempotency_key.map(|k| k.trim().to_string()) {
            Some(key) if key.is_empty() => None,
            Some(key) if key.len() > MAX_IDEMPOTENCY_KEY_LEN => {
                return Err(DomainError::validation(format!(
                    "idempotency_key must be at most {MAX_IDEMPOTENCY_KEY_LEN} characters"
                )));
            }
            other => other,
        };

        Ok(Self {
            tenant_id,
            model,
            payload,
            priority,
            max_attempts,
            idempotency_key,
        })
    }
}

/// A worker-reported or lease-derived failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub code: String,
    pub message: String,
}

impl Failure {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        Self {
            code: if code.trim().is_empty() {
                error_codes::UPSTREAM_EXECUTION_ERROR.to_string()
            } else {
                code
            },
            message: message.into(),
        }
    }

    pub fn lease_expired(worker_id: &WorkerId) -> Self {
        Self {
            code: error_codes::LEASE_EXPIRED.to_string(),
            message: format!("worker {worker_id} stopped heartbeating"),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Failed,
    LeaseExpired,
    Cancelled,
}

/// One execution try of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub attempt: u32,
    pub worker_id: WorkerId,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<AttemptOutcome>,
    #[serde(default)]
    pub tokens: u64,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Attempt {
    /// Wall time from lease to outcome, once the attempt has ended.
    pub fn latency_ms(&self) -> Option<u64> {
        self.ended_at
            .map(|ended| (ended - self.started_at).num_milliseconds().max(0) as u64)
    }
}

/// Effect of a transition on the attempt history.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptChange {
    Start(Attempt),
    Finish {
        attempt: u32,
        ended_at: DateTime<Utc>,
        outcome: AttemptOutcome,
        tokens: u64,
        cost_usd: f64,
        failure: Option<Failure>,
    },
}

impl AttemptChange {
    pub fn apply_to(self, attempts: &mut Vec<Attempt>) {
        match self {
            AttemptChange::Start(attempt) => attempts.push(attempt),
            AttemptChange::Finish {
                attempt,
                ended_at,
                outcome,
                tokens,
                cost_usd,
                failure,
            } => {
                let Some(open) = attempts
                    .iter_mut()
                    .rev()
                    .find(|a| a.attempt == attempt && a.ended_at.is_none())
                else {
                    return;
                };
                open.ended_at = Some(ended_at);
                open.outcome = Some(outcome);
                open.tokens = tokens;
                open.cost_usd = cost_usd;
                if let Some(failure) = failure {
                    open.error_code = Some(failure.code);
                    open.error_message = Some(failure.message);
                }
            }
        }
    }
}

/// Every allowed state change.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// `queued → running`
    Lease { worker_id: WorkerId },
    /// `running → succeeded`
    Succeed {
        worker_id: WorkerId,
        tokens: u64,
        cost_usd: f64,
    },
    /// `running → failed`
    Fail {
        worker_id: WorkerId,
        failure: Failure,
        tokens: u64,
        cost_usd: f64,
    },
    /// `failed → retry_scheduled`
    ScheduleRetry { next_run_at: DateTime<Utc> },
    /// `failed → dlq`
    DeadLetter,
    /// `retry_scheduled → queued` once `next_run_at` has passed
    Requeue,
    /// `queued | running | retry_scheduled → cancelled`
    Cancel,
    /// `failed | retry_scheduled | cancelled → queued`
    ManualRetry,
    /// `dlq → queued`, attempt counter reset
    ReplayDlq,
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Transition::Lease { .. } => "lease",
            Transition::Succeed { .. } => "succeed",
            Transition::Fail { .. } => "fail",
            Transition::ScheduleRetry { .. } => "schedule_retry",
            Transition::DeadLetter => "dead_letter",
            Transition::Requeue => "requeue",
            Transition::Cancel => "cancel",
            Transition::ManualRetry => "manual_retry",
            Transition::ReplayDlq => "replay_dlq",
        }
    }

    pub fn target(&self) -> JobStatus {
        match self {
            Transition::Lease { .. } => JobStatus::Running,
            Transition::Succeed { .. } => JobStatus::Succeeded,
            Transition::Fail { .. } => JobStatus::Failed,
            Transition::ScheduleRetry { .. } => JobStatus::RetryScheduled,
            Transition::DeadLetter => JobStatus::Dlq,
            Transition::Requeue | Transition::ManualRetry | Transition::ReplayDlq => {
                JobStatus::Queued
            }
            Transition::Cancel => JobStatus::Cancelled,
        }
    }

    pub fn allowed_from(&self, status: JobStatus) -> bool {
        use JobStatus::*;
        match self {
            Transition::Lease { .. } => status == Queued,
            Transition::Succeed { .. } | Transition::Fail { .. } => status == Running,
            Transition::ScheduleRetry { .. } | Transition::DeadLetter => status == Failed,
            Transition::Requeue => status == RetryScheduled,
            Transition::Cancel => status.is_active(),
            Transition::ManualRetry => matches!(status, Failed | RetryScheduled | Cancelled),
            Transition::ReplayDlq => status == Dlq,
        }
    }
}

/// A unit of work submitted by a tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub tenant_id: TenantId,
    pub model: String,
    #[serde(rename = "payload_json")]
    pub payload: Value,
    pub priority: i32,
    pub status: JobStatus,
    pub attempt: u32,
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub trace_id: TraceId,
    /// Lease holder; set only while `running`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<WorkerId>,
}

impl Job {
    pub fn new(spec: JobSpec, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            tenant_id: spec.tenant_id,
            model: spec.model,
            payload: spec.payload,
            priority: spec.priority,
            status: JobStatus::Queued,
            attempt: 0,
            max_attempts: spec.max_attempts,
            idempotency_key: spec.idempotency_key,
            created_at: now,
            started_at: None,
            finished_at: None,
            next_run_at: None,
            error_code: None,
            error_message: None,
            trace_id: TraceId::new(),
            worker_id: None,
        }
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Apply `transition` if the job is still in `expected`.
    ///
    /// Nothing is mutated when an error is returned.
    pub fn apply(
        &mut self,
        expected: JobStatus,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> DomainResult<Option<AttemptChange>> {
        if self.status != expected {
            return Err(DomainError::conflict(format!(
                "job {} is {}, expected {}",
                self.id, self.status, expected
            )));
        }
        if !transition.allowed_from(self.status) {
            return Err(DomainError::invalid_state(format!(
                "cannot {} job {} in status {}",
                transition.name(),
                self.id,
                self.status
            )));
        }

        let change = match transition {
            Transition::Lease { worker_id } => {
                if self.attempts_exhausted() {
                    return Err(DomainError::invalid_state(format!(
                        "job {} has used all {} attempts",
                        self.id, self.max_attempts
                    )));
                }
                self.attempt += 1;
                self.started_at = Some(now);
                self.finished_at = None;
                self.next_run_at = None;
                self.clear_error();
                self.worker_id = Some(worker_id.clone());
                Some(AttemptChange::Start(Attempt {
                    attempt: self.attempt,
                    worker_id: worker_id.clone(),
                    started_at: now,
                    ended_at: None,
                    outcome: None,
                    tokens: 0,
                    cost_usd: 0.0,
                    error_code: None,
                    error_message: None,
                }))
            }
            Transition::Succeed {
                worker_id,
                tokens,
                cost_usd,
            } => {
                self.ensure_lease_holder(worker_id)?;
                self.finished_at = Some(now);
                self.worker_id = None;
                Some(AttemptChange::Finish {
                    attempt: self.attempt,
                    ended_at: now,
                    outcome: AttemptOutcome::Succeeded,
                    tokens: *tokens,
                    cost_usd: *cost_usd,
                    failure: None,
                })
            }
            Transition::Fail {
                worker_id,
                failure,
                tokens,
                cost_usd,
            } => {
                self.ensure_lease_holder(worker_id)?;
                self.error_code = Some(failure.code.clone());
                self.error_message = Some(failure.message.clone());
                self.worker_id = None;
                let outcome = if failure.code == error_codes::LEASE_EXPIRED {
                    AttemptOutcome::LeaseExpired
                } else {
                    AttemptOutcome::Failed
                };
                Some(AttemptChange::Finish {
                    attempt: self.attempt,
                    ended_at: now,
                    outcome,
                    tokens: *tokens,
                    cost_usd: *cost_usd,
                    failure: Some(failure.clone()),
                })
            }
            Transition::ScheduleRetry { next_run_at } => {
                if self.attempts_exhausted() {
                    return Err(DomainError::invalid_state(format!(
                        "job {} has no attempts left; it must be dead-lettered",
                        self.id
                    )));
                }
                self.next_run_at = Some(*next_run_at);
                None
            }
            Transition::DeadLetter => {
                if !self.attempts_exhausted() {
                    return Err(DomainError::invalid_state(format!(
                        "job {} still has attempts left ({}/{})",
                        self.id, self.attempt, self.max_attempts
                    )));
                }
                self.finished_at = Some(now);
                None
            }
            Transition::Requeue => {
                match self.next_run_at {
                    Some(at) if at <= now => {}
                    _ => {
                        return Err(DomainError::invalid_state(format!(
                            "job {} is not due for retry yet",
                            self.id
                        )));
                    }
                }
                self.next_run_at = None;
                None
            }
            Transition::Cancel => {
                let change = match (&self.status, &self.worker_id) {
                    (JobStatus::Running, Some(_)) => Some(AttemptChange::Finish {
                        attempt: self.attempt,
                        ended_at: now,
                        outcome: AttemptOutcome::Cancelled,
                        tokens: 0,
                        cost_usd: 0.0,
                        failure: None,
                    }),
                    _ => None,
                };
                self.finished_at = Some(now);
                self.next_run_at = None;
                self.worker_id = None;
                change
            }
            Transition::ManualRetry => {
                if self.attempts_exhausted() {
                    self.attempt = 0;
                }
                self.reset_for_requeue();
                None
            }
            Transition::ReplayDlq => {
                self.attempt = 0;
                self.reset_for_requeue();
                None
            }
        };

        self.status = transition.target();
        Ok(change)
    }

    fn ensure_lease_holder(&self, worker_id: &WorkerId) -> DomainResult<()> {
        match &self.worker_id {
            Some(holder) if holder == worker_id => Ok(()),
            Some(holder) => Err(DomainError::conflict(format!(
                "job {} is leased by {holder}, not {worker_id}",
                self.id
            ))),
            None => Err(DomainError::conflict(format!(
                "job {} has no lease holder",
                self.id
            ))),
        }
    }

    fn clear_error(&mut self) {
        self.error_code = None;
        self.error_message = None;
    }

    fn reset_for_requeue(&mut self) {
        self.clear_error();
        self.next_run_at = None;
        self.finished_at = None;
        self.started_at = None;
        self.worker_id = None;
    }
}

/// A job together with its most recent attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job: Job,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_attempt: Option<Attempt>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;
    use serde_json::json;

    fn spec(max_attempts: u32) -> JobSpec {
        JobSpec::parse(
            SubmitJob {
                tenant_id: "acme".into(),
                model: "gpt-4o-mini".into(),
                max_attempts: Some(max_attempts as i64),
                ..Default::default()
            },
            1024,
        )
        .unwrap()
    }

    fn worker(name: &str) -> WorkerId {
        WorkerId::parse(name).unwrap()
    }

    #[test]
    fn parse_applies_defaults() {
        let spec = JobSpec::parse(
            SubmitJob {
                tenant_id: "acme".into(),
                model: "m".into(),
                priority: Some(0),
                idempotency_key: Some("  ".into()),
                ..Default::default()
            },
            1024,
        )
        .unwrap();

        assert_eq!(spec.priority, DEFAULT_PRIORITY);
        assert_eq!(spec.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(spec.payload, json!({}));
        assert_eq!(spec.idempotency_key, None);
    }

    #[test]
    fn parse_rejects_bad_input() {
        let base = SubmitJob {
            tenant_id: "acme".into(),
            model: "m".into(),
            ..Default::default()
        };

        let cases = [
            SubmitJob {
                tenant_id: "".into(),
                ..base.clone()
            },
            SubmitJob {
                model: " ".into(),
                ..base.clone()
            },
            SubmitJob {
                priority: Some(11),
                ..base.clone()
            },
            SubmitJob {
                priority: Some(-1),
                ..base.clone()
            },
            SubmitJob {
                max_attempts: Some(26),
                ..base.clone()
            },
            SubmitJob {
                payload: Some(json!([1, 2, 3])),
                ..base.clone()
            },
            SubmitJob {
                payload: Some(json!({ "prompt": "x".repeat(2048) })),
                ..base.clone()
            },
        ];

        for raw in cases {
            assert!(
                matches!(JobSpec::parse(raw.clone(), 1024), Err(DomainError::Validation(_))),
                "expected validation error for {raw:?}"
            );
        }
    }

    #[test]
    fn job_serializes_payload_as_payload_json() {
        let job = Job::new(spec(3), Utc::now());
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["payload_json"], json!({}));
        assert_eq!(value["status"], json!("queued"));
        assert!(value.get("next_run_at").is_none());
    }

    #[test]
    fn lease_increments_attempt_and_records_holder() {
        let now = Utc::now();
        let mut job = Job::new(spec(3), now);
        let change = job
            .apply(
                JobStatus::Queued,
                &Transition::Lease {
                    worker_id: worker("w1"),
                },
                now,
            )
            .unwrap();

        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.attempt, 1);
        assert_eq!(job.started_at, Some(now));
        assert_eq!(job.worker_id, Some(worker("w1")));
        assert!(matches!(change, Some(AttemptChange::Start(ref a)) if a.attempt == 1));
    }

    #[test]
    fn stale_expected_status_is_a_conflict() {
        let now = Utc::now();
        let mut job = Job::new(spec(3), now);
        let err = job
            .apply(JobStatus::Running, &Transition::Cancel, now)
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
        assert_eq!(job.status, JobStatus::Queued);
    }

    #[test]
    fn report_from_non_holder_is_rejected() {
        let now = Utc::now();
        let mut job = Job::new(spec(3), now);
        job.apply(
            JobStatus::Queued,
            &Transition::Lease {
                worker_id: worker("w1"),
            },
            now,
        )
        .unwrap();

        let err = job
            .apply(
                JobStatus::Running,
                &Transition::Succeed {
                    worker_id: worker("w2"),
                    tokens: 10,
                    cost_usd: 0.01,
                },
                now,
            )
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
        assert_eq!(job.status, JobStatus::Running);
    }

    #[test]
    fn failure_at_ceiling_cannot_be_retried() {
        let now = Utc::now();
        let mut job = Job::new(spec(1), now);
        let w = worker("w1");
        job.apply(JobStatus::Queued, &Transition::Lease { worker_id: w.clone() }, now)
            .unwrap();
        job.apply(
            JobStatus::Running,
            &Transition::Fail {
                worker_id: w,
                failure: Failure::new("PROVIDER_TIMEOUT", "timed out"),
                tokens: 0,
                cost_usd: 0.0,
            },
            now,
        )
        .unwrap();

        let retry = Transition::ScheduleRetry {
            next_run_at: now + Duration::seconds(5),
        };
        assert!(matches!(
            job.apply(JobStatus::Failed, &retry, now),
            Err(DomainError::InvalidState(_))
        ));
        job.apply(JobStatus::Failed, &Transition::DeadLetter, now)
            .unwrap();
        assert_eq!(job.status, JobStatus::Dlq);
        assert_eq!(job.error_code.as_deref(), Some("PROVIDER_TIMEOUT"));
        assert_eq!(job.finished_at, Some(now));
    }

    #[test]
    fn requeue_waits_for_next_run_at() {
        let now = Utc::now();
        let mut job = Job::new(spec(3), now);
        let w = worker("w1");
        job.apply(JobStatus::Queued, &Transition::Lease { worker_id: w.clone() }, now)
            .unwrap();
        job.apply(
            JobStatus::Running,
            &Transition::Fail {
                worker_id: w,
                failure: Failure::lease_expired(&worker("w1")),
                tokens: 0,
                cost_usd: 0.0,
            },
            now,
        )
        .unwrap();
        job.apply(
            JobStatus::Failed,
            &Transition::ScheduleRetry {
                next_run_at: now + Duration::seconds(5),
            },
            now,
        )
        .unwrap();

        assert!(job
            .apply(JobStatus::RetryScheduled, &Transition::Requeue, now)
            .is_err());
        job.apply(
            JobStatus::RetryScheduled,
            &Transition::Requeue,
            now + Duration::seconds(5),
        )
        .unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.next_run_at, None);
        assert_eq!(job.error_code.as_deref(), Some(error_codes::LEASE_EXPIRED));
    }

    #[test]
    fn cancel_running_job_closes_attempt() {
        let now = Utc::now();
        let mut job = Job::new(spec(3), now);
        let mut attempts = Vec::new();
        let w = worker("w1");
        job.apply(JobStatus::Queued, &Transition::Lease { worker_id: w }, now)
            .unwrap()
            .unwrap()
            .apply_to(&mut attempts);
        job.apply(JobStatus::Running, &Transition::Cancel, now)
            .unwrap()
            .unwrap()
            .apply_to(&mut attempts);

        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.worker_id, None);
        assert_eq!(attempts[0].outcome, Some(AttemptOutcome::Cancelled));
        assert!(job
            .apply(JobStatus::Cancelled, &Transition::Cancel, now)
            .is_err());
    }

    #[test]
    fn replay_dlq_resets_attempt() {
        let now = Utc::now();
        let mut job = Job::new(spec(1), now);
        job.status = JobStatus::Dlq;
        job.attempt = 1;
        job.error_code = Some("X".into());

        job.apply(JobStatus::Dlq, &Transition::ReplayDlq, now).unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempt, 0);
        assert_eq!(job.error_code, None);
    }

    #[test]
    fn manual_retry_preserves_attempt_with_budget_left() {
        let now = Utc::now();
        let mut job = Job::new(spec(3), now);
        job.status = JobStatus::RetryScheduled;
        job.attempt = 1;
        job.next_run_at = Some(now + Duration::seconds(60));

        job.apply(JobStatus::RetryScheduled, &Transition::ManualRetry, now)
            .unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempt, 1);
        assert_eq!(job.next_run_at, None);

        let mut exhausted = Job::new(spec(2), now);
        exhausted.status = JobStatus::Cancelled;
        exhausted.attempt = 2;
        exhausted
            .apply(JobStatus::Cancelled, &Transition::ManualRetry, now)
            .unwrap();
        assert_eq!(exhausted.attempt, 0);
    }

    #[test]
    fn attempt_latency_counts_only_finished_attempts() {
        let now = Utc::now();
        let mut job = Job::new(spec(3), now);
        let w = WorkerId::parse("w1").unwrap();
        let mut attempts = Vec::new();

        if let Some(change) = job
            .apply(JobStatus::Queued, &Transition::Lease { worker_id: w.clone() }, now)
            .unwrap()
        {
            change.apply_to(&mut attempts);
        }
        assert_eq!(attempts[0].latency_ms(), None);

        let done = now + Duration::milliseconds(1_250);
        if let Some(change) = job
            .apply(
                JobStatus::Running,
                &Transition::Succeed {
                    worker_id: w,
                    tokens: 1,
                    cost_usd: 0.0,
                },
                done,
            )
            .unwrap()
        {
            change.apply_to(&mut attempts);
        }
        assert_eq!(attempts[0].latency_ms(), Some(1_250));
    }

    #[test]
    fn status_parses_from_wire_name() {
        assert_eq!(
            "retry_scheduled".parse::<JobStatus>().unwrap(),
            JobStatus::RetryScheduled
        );
        assert!("done".parse::<JobStatus>().is_err());
    }

    fn transition_for(op: u8, now: DateTime<Utc>) -> Transition {
        let w = WorkerId::parse("w1").unwrap();
        match op % 9 {
            0 => Transition::Lease { worker_id: w },
            1 => Transition::Succeed {
                worker_id: w,
                tokens: 1,
                cost_usd: 0.0,
            },
            2 => Transition::Fail {
                worker_id: w,
                failure: Failure::new("E", "boom"),
                tokens: 1,
                cost_usd: 0.0,
            },
            3 => Transition::ScheduleRetry {
                next_run_at: now + Duration::seconds(1),
            },
            4 => Transition::DeadLetter,
            5 => Transition::Requeue,
            6 => Transition::Cancel,
            7 => Transition::ManualRetry,
            _ => Transition::ReplayDlq,
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: whatever sequence is attempted, the attempt counter stays
        /// within budget and lease/timer fields match the status.
        #[test]
        fn attempt_stays_within_budget(
            max_attempts in 1u32..6,
            ops in proptest::collection::vec(0u8..9, 1..80),
        ) {
            let mut now = Utc::now();
            let mut job = Job::new(spec(max_attempts), now);
            let mut attempts = Vec::new();

            for op in ops {
                now += Duration::seconds(2);
                let transition = transition_for(op, now);
                let before = job.clone();
                match job.apply(job.status, &transition, now) {
                    Ok(change) => {
                        if let Some(change) = change {
                            change.apply_to(&mut attempts);
                        }
                    }
                    Err(_) => prop_assert_eq!(&job, &before),
                }

                prop_assert!(job.attempt <= job.max_attempts);
                prop_assert_eq!(job.status == JobStatus::Running, job.worker_id.is_some());
                prop_assert_eq!(
                    job.status == JobStatus::RetryScheduled,
                    job.next_run_at.is_some()
                );
                if job.status == JobStatus::Dlq {
                    prop_assert_eq!(job.attempt, job.max_attempts);
                }
            }
        }
    }
}
