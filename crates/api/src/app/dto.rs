//! Request/response DTOs that have no direct domain counterpart.

use serde::Deserialize;

use orchestrator_core::{JobId, JobStatus, TenantId, TenantLimit};
use orchestrator_infra::jobs::JobFilter;
use orchestrator_infra::lease::Completion;
use orchestrator_infra::orchestrator::OrchestratorError;

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    #[serde(alias = "tenant_id")]
    pub tenant: Option<String>,
    pub model: Option<String>,
    pub limit: Option<usize>,
}

impl ListJobsQuery {
    pub fn filter(&self) -> Result<JobFilter, OrchestratorError> {
        let status = match non_empty(&self.status) {
            Some(s) => Some(s.parse::<JobStatus>()?),
            None => None,
        };
        let tenant_id = match non_empty(&self.tenant) {
            Some(t) => Some(t.parse::<TenantId>()?),
            None => None,
        };
        Ok(JobFilter {
            status,
            tenant_id,
            model: non_empty(&self.model).map(str::to_string),
        })
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

#[derive(Debug, Default, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub active_job_ids: Vec<JobId>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterWorkerRequest {
    pub concurrency: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionOutcome {
    Succeeded,
    Failed,
}

/// Body of `POST /v1/workers/:worker_id/complete`.
#[derive(Debug, Deserialize)]
pub struct CompleteJobRequest {
    pub job_id: JobId,
    pub outcome: CompletionOutcome,
    #[serde(default)]
    pub tokens: u64,
    #[serde(default)]
    pub cost_usd: f64,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl CompleteJobRequest {
    pub fn into_completion(self) -> Result<(JobId, Completion), OrchestratorError> {
        if !self.cost_usd.is_finite() || self.cost_usd < 0.0 {
            return Err(OrchestratorError::Validation(
                "cost_usd must be a non-negative number".to_string(),
            ));
        }
        let completion = match self.outcome {
            CompletionOutcome::Succeeded => Completion::Succeeded {
                tokens: self.tokens,
                cost_usd: self.cost_usd,
            },
            CompletionOutcome::Failed => Completion::Failed {
                error_code: self.error_code.unwrap_or_default(),
                error_message: self.error_message.unwrap_or_default(),
                tokens: self.tokens,
                cost_usd: self.cost_usd,
            },
        };
        Ok((self.job_id, completion))
    }
}

#[derive(Debug, Deserialize)]
pub struct TenantLimitRequest {
    pub concurrency: u32,
    pub rps: u32,
    pub token_budget_per_min: u64,
}

impl TenantLimitRequest {
    pub fn into_limit(self, tenant_id: TenantId) -> TenantLimit {
        TenantLimit::new(tenant_id, self.concurrency, self.rps, self.token_budget_per_min)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    pub after: Option<u64>,
    pub limit: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_query_builds_filter() {
        let q = ListJobsQuery {
            status: Some("dlq".to_string()),
            tenant: Some("acme".to_string()),
            model: Some(" ".to_string()),
            limit: None,
        };
        let filter = q.filter().unwrap();
        assert_eq!(filter.status, Some(JobStatus::Dlq));
        assert_eq!(filter.tenant_id.unwrap().as_str(), "acme");
        assert_eq!(filter.model, None);
    }

    #[test]
    fn unknown_status_is_a_validation_error() {
        let q = ListJobsQuery {
            status: Some("exploded".to_string()),
            ..ListJobsQuery::default()
        };
        assert!(matches!(q.filter(), Err(OrchestratorError::Validation(_))));
    }

    #[test]
    fn failed_completion_without_code_is_accepted() {
        let req: CompleteJobRequest = serde_json::from_value(serde_json::json!({
            "job_id": JobId::new(),
            "outcome": "failed",
        }))
        .unwrap();
        let (_, completion) = req.into_completion().unwrap();
        assert!(matches!(completion, Completion::Failed { ref error_code, .. } if error_code.is_empty()));
    }

    #[test]
    fn negative_cost_is_rejected() {
        let req: CompleteJobRequest = serde_json::from_value(serde_json::json!({
            "job_id": JobId::new(),
            "outcome": "succeeded",
            "cost_usd": -1.0,
        }))
        .unwrap();
        assert!(req.into_completion().is_err());
    }
}
