//! Per-tenant admission and rate limiting.
//!
//! Each tenant has its own mutex-guarded state holding its limit and usage
//! counters. Checks and reservations happen under that lock, so two leases
//! for the same tenant can never both take its last running slot.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use orchestrator_core::{TenantId, TenantLimit};

fn submission_window() -> Duration {
    Duration::seconds(1)
}

fn token_window() -> Duration {
    Duration::seconds(60)
}

/// Limits given to a tenant the first time it is seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantDefaults {
    pub concurrency: u32,
    pub rps: u32,
    pub token_budget_per_min: u64,
}

impl Default for TenantDefaults {
    fn default() -> Self {
        Self {
            concurrency: 4,
            rps: 10,
            token_budget_per_min: 35_000,
        }
    }
}

impl TenantDefaults {
    fn limit_for(&self, tenant_id: TenantId) -> TenantLimit {
        TenantLimit::new(tenant_id, self.concurrency, self.rps, self.token_budget_per_min)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    /// Too many submissions in the last second.
    RateLimited,
    /// All running slots are taken.
    ConcurrencyLimit,
    /// Token budget for the rolling minute is spent.
    TokenBudgetExhausted,
}

impl core::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            RejectionReason::RateLimited => "submission rate limit reached",
            RejectionReason::ConcurrencyLimit => "concurrency limit reached",
            RejectionReason::TokenBudgetExhausted => "token budget exhausted",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("tenant {tenant_id}: {reason}")]
pub struct AdmissionRejection {
    pub tenant_id: TenantId,
    pub reason: RejectionReason,
}

#[derive(Debug, Clone, Error)]
pub enum AdmissionError {
    #[error(transparent)]
    Rejected(#[from] AdmissionRejection),
    #[error("admission state unavailable: {0}")]
    Storage(String),
}

/// Point-in-time usage for one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TenantUsage {
    pub limit: TenantLimit,
    pub running: u32,
    pub submissions_last_second: usize,
    pub tokens_last_minute: u64,
}

#[derive(Debug)]
struct TenantState {
    limit: TenantLimit,
    running: u32,
    submissions: VecDeque<DateTime<Utc>>,
    tokens: VecDeque<(DateTime<Utc>, u64)>,
    tokens_in_window: u64,
}

impl TenantState {
    fn new(limit: TenantLimit) -> Self {
        Self {
            limit,
            running: 0,
            submissions: VecDeque::new(),
            tokens: VecDeque::new(),
            tokens_in_window: 0,
        }
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        while self
            .submissions
            .front()
            .is_some_and(|at| *at <= now - submission_window())
        {
            self.submissions.pop_front();
        }
        while let Some((at, n)) = self.tokens.front().copied() {
            if at > now - token_window() {
                break;
            }
            self.tokens.pop_front();
            self.tokens_in_window = self.tokens_in_window.saturating_sub(n);
        }
    }

    fn reject(&self, reason: RejectionReason) -> AdmissionRejection {
        AdmissionRejection {
            tenant_id: self.limit.tenant_id.clone(),
            reason,
        }
    }
}

#[derive(Debug)]
pub struct AdmissionController {
    tenants: RwLock<HashMap<TenantId, Arc<Mutex<TenantState>>>>,
    defaults: TenantDefaults,
}

impl AdmissionController {
    pub fn new(defaults: TenantDefaults) -> Self {
        Self {
            tenants: RwLock::new(HashMap::new()),
            defaults,
        }
    }

    /// Build with some tenants already configured.
    pub fn with_limits(defaults: TenantDefaults, limits: impl IntoIterator<Item = TenantLimit>) -> Self {
        let tenants = limits
            .into_iter()
            .map(|limit| (limit.tenant_id.clone(), Arc::new(Mutex::new(TenantState::new(limit)))))
            .collect();
        Self {
            tenants: RwLock::new(tenants),
            defaults,
        }
    }

    pub fn defaults(&self) -> TenantDefaults {
        self.defaults
    }

    fn state(&self, tenant_id: &TenantId) -> Result<Arc<Mutex<TenantState>>, AdmissionError> {
        {
            let tenants = self.tenants.read().map_err(|_| poisoned())?;
            if let Some(state) = tenants.get(tenant_id) {
                return Ok(state.clone());
            }
        }

        let mut tenants = self.tenants.write().map_err(|_| poisoned())?;
        Ok(tenants
            .entry(tenant_id.clone())
            .or_insert_with(|| {
                tracing::debug!(tenant_id = %tenant_id, "tenant seen for the first time; applying default limits");
                Arc::new(Mutex::new(TenantState::new(self.defaults.limit_for(tenant_id.clone()))))
            })
            .clone())
    }

    fn with_state<T>(
        &self,
        tenant_id: &TenantId,
        f: impl FnOnce(&mut TenantState) -> T,
    ) -> Result<T, AdmissionError> {
        let state = self.state(tenant_id)?;
        let mut guard = state.lock().map_err(|_| poisoned())?;
        Ok(f(&mut guard))
    }

    /// Count a submission against the tenant's `rps` window.
    pub fn admit_submission(&self, tenant_id: &TenantId, now: DateTime<Utc>) -> Result<(), AdmissionError> {
        self.with_state(tenant_id, |state| {
            state.prune(now);
            if state.submissions.len() >= state.limit.rps as usize {
                return Err(state.reject(RejectionReason::RateLimited));
            }
            state.submissions.push_back(now);
            Ok(())
        })?
        .map_err(AdmissionError::from)
    }

    /// Check concurrency and token budget, and reserve a running slot.
    pub fn admit_lease(&self, tenant_id: &TenantId, now: DateTime<Utc>) -> Result<(), AdmissionError> {
        self.with_state(tenant_id, |state| {
            state.prune(now);
            if state.running >= state.limit.concurrency {
                return Err(state.reject(RejectionReason::ConcurrencyLimit));
            }
            if state.tokens_in_window >= state.limit.token_budget_per_min {
                return Err(state.reject(RejectionReason::TokenBudgetExhausted));
            }
            state.running += 1;
            Ok(())
        })?
        .map_err(AdmissionError::from)
    }

    /// Return a running slot taken by [`Self::admit_lease`].
    pub fn release_lease(&self, tenant_id: &TenantId) -> Result<(), AdmissionError> {
        self.with_state(tenant_id, |state| {
            state.running = state.running.saturating_sub(1);
        })
    }

    /// Feed reported token usage into the rolling window.
    pub fn record_tokens(&self, tenant_id: &TenantId, tokens: u64, now: DateTime<Utc>) -> Result<(), AdmissionError> {
        if tokens == 0 {
            return Ok(());
        }
        self.with_state(tenant_id, |state| {
            state.prune(now);
            state.tokens.push_back((now, tokens));
            state.tokens_in_window = state.tokens_in_window.saturating_add(tokens);
        })
    }

    pub fn limit(&self, tenant_id: &TenantId) -> Result<TenantLimit, AdmissionError> {
        self.with_state(tenant_id, |state| state.limit.clone())
    }

    /// Replace a tenant's limit. Current usage is kept; a lowered concurrency
    /// only blocks new leases.
    pub fn set_limit(&self, limit: TenantLimit) -> Result<TenantLimit, AdmissionError> {
        let tenant_id = limit.tenant_id.clone();
        self.with_state(&tenant_id, move |state| {
            state.limit = limit;
            state.limit.clone()
        })
    }

    pub fn usage(&self, tenant_id: &TenantId, now: DateTime<Utc>) -> Result<TenantUsage, AdmissionError> {
        self.with_state(tenant_id, |state| {
            state.prune(now);
            TenantUsage {
                limit: state.limit.clone(),
                running: state.running,
                submissions_last_second: state.submissions.len(),
                tokens_last_minute: state.tokens_in_window,
            }
        })
    }

    /// All known tenants' limits, ordered by tenant id.
    pub fn limits(&self) -> Result<Vec<TenantLimit>, AdmissionError> {
        let states: Vec<Arc<Mutex<TenantState>>> = {
            let tenants = self.tenants.read().map_err(|_| poisoned())?;
            tenants.values().cloned().collect()
        };

        let mut limits = states
            .iter()
            .map(|state| state.lock().map(|s| s.limit.clone()).map_err(|_| poisoned()))
            .collect::<Result<Vec<_>, _>>()?;
        limits.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        Ok(limits)
    }
}

impl Default for AdmissionController {
    fn default() -> Self {
        Self::new(TenantDefaults::default())
    }
}

fn poisoned() -> AdmissionError {
    AdmissionError::Storage("tenant state lock poisoned".to_string())
}
