use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::TenantId;

/// Per-tenant admission limits. Operator-mutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantLimit {
    pub tenant_id: TenantId,
    /// Maximum jobs running at once.
    pub concurrency: u32,
    /// Maximum submissions per second.
    pub rps: u32,
    /// Maximum tokens reported per rolling minute.
    pub token_budget_per_min: u64,
}

impl TenantLimit {
    pub fn new(tenant_id: TenantId, concurrency: u32, rps: u32, token_budget_per_min: u64) -> Self {
        Self {
            tenant_id,
            concurrency,
            rps,
            token_budget_per_min,
        }
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.concurrency == 0 {
            return Err(DomainError::validation("concurrency must be at least 1"));
        }
        if self.rps == 0 {
            return Err(DomainError::validation("rps must be at least 1"));
        }
        if self.token_budget_per_min == 0 {
            return Err(DomainError::validation(
                "token_budget_per_min must be at least 1",
            ));
        }
        Ok(())
    }
}
