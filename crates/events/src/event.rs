use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use orchestrator_core::{Job, JobId, JobStatus, TenantId, TraceId, Transition, WorkerId};

/// Stable event name, serialized as e.g. `"job.created"`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "job.created")]
    JobCreated,
    #[serde(rename = "job.started")]
    JobStarted,
    #[serde(rename = "job.succeeded")]
    JobSucceeded,
    #[serde(rename = "job.failed")]
    JobFailed,
    #[serde(rename = "job.retry_scheduled")]
    JobRetryScheduled,
    #[serde(rename = "job.requeued")]
    JobRequeued,
    #[serde(rename = "job.moved_dlq")]
    JobMovedDlq,
    #[serde(rename = "job.cancelled")]
    JobCancelled,
    #[serde(rename = "job.manual_retry")]
    JobManualRetry,
    #[serde(rename = "job.dlq_replayed")]
    JobDlqReplayed,
    #[serde(rename = "worker.registered")]
    WorkerRegistered,
    #[serde(rename = "worker.recovered")]
    WorkerRecovered,
    #[serde(rename = "worker.unhealthy")]
    WorkerUnhealthy,
    #[serde(rename = "queue.paused")]
    QueuePaused,
    #[serde(rename = "queue.resumed")]
    QueueResumed,
    #[serde(rename = "tenant.limit_updated")]
    TenantLimitUpdated,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::JobCreated => "job.created",
            EventType::JobStarted => "job.started",
            EventType::JobSucceeded => "job.succeeded",
            EventType::JobFailed => "job.failed",
            EventType::JobRetryScheduled => "job.retry_scheduled",
            EventType::JobRequeued => "job.requeued",
            EventType::JobMovedDlq => "job.moved_dlq",
            EventType::JobCancelled => "job.cancelled",
            EventType::JobManualRetry => "job.manual_retry",
            EventType::JobDlqReplayed => "job.dlq_replayed",
            EventType::WorkerRegistered => "worker.registered",
            EventType::WorkerRecovered => "worker.recovered",
            EventType::WorkerUnhealthy => "worker.unhealthy",
            EventType::QueuePaused => "queue.paused",
            EventType::QueueResumed => "queue.resumed",
            EventType::TenantLimitUpdated => "tenant.limit_updated",
        }
    }

    pub fn for_transition(transition: &Transition) -> Self {
        match transition {
            Transition::Lease { .. } => EventType::JobStarted,
            Transition::Succeed { .. } => EventType::JobSucceeded,
            Transition::Fail { .. } => EventType::JobFailed,
            Transition::ScheduleRetry { .. } => EventType::JobRetryScheduled,
            Transition::DeadLetter => EventType::JobMovedDlq,
            Transition::Requeue => EventType::JobRequeued,
            Transition::Cancel => EventType::JobCancelled,
            Transition::ManualRetry => EventType::JobManualRetry,
            Transition::ReplayDlq => EventType::JobDlqReplayed,
        }
    }
}

impl core::fmt::Display for EventType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An appended event. Immutable once it has a `seq`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<TenantId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<WorkerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<TraceId>,
    #[serde(default)]
    pub details: Value,
}

/// An event before the log assigns its sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub event_type: EventType,
    pub at: DateTime<Utc>,
    pub tenant_id: Option<TenantId>,
    pub job_id: Option<JobId>,
    pub worker_id: Option<WorkerId>,
    pub trace_id: Option<TraceId>,
    pub details: Value,
}

impl NewEvent {
    pub fn new(event_type: EventType, at: DateTime<Utc>) -> Self {
        Self {
            event_type,
            at,
            tenant_id: None,
            job_id: None,
            worker_id: None,
            trace_id: None,
            details: Value::Object(Map::new()),
        }
    }

    pub fn with_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn with_worker(mut self, worker_id: WorkerId) -> Self {
        self.worker_id = Some(worker_id);
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    /// `job.created` for a freshly stored job.
    pub fn job_created(job: &Job) -> Self {
        Self::for_job(EventType::JobCreated, job, job.created_at).with_details(json!({
            "model": job.model,
            "priority": job.priority,
            "max_attempts": job.max_attempts,
        }))
    }

    /// Event describing `transition` after it was applied to `job`.
    pub fn job_transition(
        job: &Job,
        from: JobStatus,
        transition: &Transition,
        at: DateTime<Utc>,
    ) -> Self {
        let mut details = Map::new();
        details.insert("from".into(), json!(from));
        details.insert("to".into(), json!(job.status));
        details.insert("attempt".into(), json!(job.attempt));
        details.insert("max_attempts".into(), json!(job.max_attempts));

        let mut worker_id = None;
        match transition {
            Transition::Lease { worker_id: w } => worker_id = Some(w.clone()),
            Transition::Succeed {
                worker_id: w,
                tokens,
                cost_usd,
            } => {
                worker_id = Some(w.clone());
                details.insert("tokens".into(), json!(tokens));
                details.insert("cost_usd".into(), json!(cost_usd));
            }
            Transition::Fail {
                worker_id: w,
                failure,
                tokens,
                ..
            } => {
                worker_id = Some(w.clone());
                details.insert("error_code".into(), json!(failure.code));
                details.insert("error_message".into(), json!(failure.message));
                details.insert("tokens".into(), json!(tokens));
            }
            Transition::ScheduleRetry { next_run_at } => {
                details.insert("next_run_at".into(), json!(next_run_at));
            }
            Transition::DeadLetter => {
                details.insert("error_code".into(), json!(job.error_code));
            }
            Transition::Requeue
            | Transition::Cancel
            | Transition::ManualRetry
            | Transition::ReplayDlq => {}
        }

        let mut event = Self::for_job(EventType::for_transition(transition), job, at)
            .with_details(Value::Object(details));
        event.worker_id = worker_id;
        event
    }

    fn for_job(event_type: EventType, job: &Job, at: DateTime<Utc>) -> Self {
        let mut event = Self::new(event_type, at).with_tenant(job.tenant_id.clone());
        event.job_id = Some(job.id);
        event.trace_id = Some(job.trace_id);
        event
    }

    pub(crate) fn into_event(self, seq: u64) -> Event {
        Event {
            seq,
            event_type: self.event_type,
            at: self.at,
            tenant_id: self.tenant_id,
            job_id: self.job_id,
            worker_id: self.worker_id,
            trace_id: self.trace_id,
            details: self.details,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_core::{Failure, JobSpec, SubmitJob};

    fn job() -> Job {
        let spec = JobSpec::parse(
            SubmitJob {
                tenant_id: "acme".into(),
                model: "gpt-4o-mini".into(),
                ..Default::default()
            },
            1024,
        )
        .unwrap();
        Job::new(spec, Utc::now())
    }

    #[test]
    fn event_type_serializes_dotted_name() {
        assert_eq!(
            serde_json::to_value(EventType::JobMovedDlq).unwrap(),
            json!("job.moved_dlq")
        );
        assert_eq!(EventType::JobMovedDlq.to_string(), "job.moved_dlq");
    }

    #[test]
    fn failure_event_carries_error_and_worker() {
        let mut job = job();
        let worker = WorkerId::parse("w1").unwrap();
        let now = Utc::now();
        job.apply(
            JobStatus::Queued,
            &Transition::Lease {
                worker_id: worker.clone(),
            },
            now,
        )
        .unwrap();
        let transition = Transition::Fail {
            worker_id: worker.clone(),
            failure: Failure::new("PROVIDER_TIMEOUT", "timed out"),
            tokens: 12,
            cost_usd: 0.0,
        };
        job.apply(JobStatus::Running, &transition, now).unwrap();

        let event = NewEvent::job_transition(&job, JobStatus::Running, &transition, now);
        assert_eq!(event.event_type, EventType::JobFailed);
        assert_eq!(event.worker_id, Some(worker));
        assert_eq!(event.job_id, Some(job.id));
        assert_eq!(event.details["error_code"], json!("PROVIDER_TIMEOUT"));
        assert_eq!(event.details["from"], json!("running"));
        assert_eq!(event.details["to"], json!("failed"));
    }
}
