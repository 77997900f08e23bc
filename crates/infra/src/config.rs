//! Configuration loading and representation.
//!
//! Every setting comes from an environment variable with a default. A value
//! that is present but does not parse is logged and replaced by the default,
//! so a typo never prevents the service from starting.

use std::str::FromStr;
use std::time::Duration;

use orchestrator_core::{BackoffStrategy, RetryPolicy, TenantId, TenantLimit};

use crate::admission::TenantDefaults;

/// Longest retry delay accepted from the environment.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// Address the HTTP transport binds to.
    pub http_addr: String,
    /// `json` or `pretty`.
    pub log_format: String,
    pub heartbeat_interval: Duration,
    /// Silence after which a worker is declared unhealthy.
    pub heartbeat_timeout: Duration,
    pub worker_default_concurrency: u32,
    pub retry: RetryPolicy,
    pub tenant_defaults: TenantDefaults,
    /// Tenants configured up front (`TENANT_LIMITS=acme=8/20/80000,globex=4/10/35000`).
    pub tenant_limits: Vec<TenantLimit>,
    pub idempotency_ttl: Duration,
    pub event_log_capacity: usize,
    pub sweep_interval: Duration,
    pub max_payload_bytes: usize,
    pub list_limit_default: usize,
    pub list_limit_max: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let heartbeat_interval = Duration::from_millis(5_000);
        Self {
            http_addr: "0.0.0.0:8080".to_string(),
            log_format: "json".to_string(),
            heartbeat_interval,
            heartbeat_timeout: heartbeat_interval * 2,
            worker_default_concurrency: 4,
            retry: RetryPolicy::default(),
            tenant_defaults: TenantDefaults::default(),
            tenant_limits: Vec::new(),
            idempotency_ttl: Duration::from_secs(86_400),
            event_log_capacity: 1_000,
            sweep_interval: Duration::from_millis(1_000),
            max_payload_bytes: 256 * 1024,
            list_limit_default: 100,
            list_limit_max: 500,
        }
    }
}

impl OrchestratorConfig {
    /// Load from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let heartbeat_interval = millis(&lookup, "HEARTBEAT_INTERVAL_MS", defaults.heartbeat_interval);
        let heartbeat_timeout = millis(&lookup, "HEARTBEAT_TIMEOUT_MS", heartbeat_interval * 2);

        let retry = RetryPolicy {
            base_delay: capped(
                "RETRY_BASE_DELAY_MS",
                millis(&lookup, "RETRY_BASE_DELAY_MS", defaults.retry.base_delay),
                MAX_RETRY_DELAY,
            ),
            max_delay: capped(
                "RETRY_MAX_DELAY_MS",
                millis(&lookup, "RETRY_MAX_DELAY_MS", defaults.retry.max_delay),
                MAX_RETRY_DELAY,
            ),
            strategy: parsed::<BackoffStrategy, _>(&lookup, "RETRY_BACKOFF", defaults.retry.strategy),
        };

        let tenant_defaults = TenantDefaults {
            concurrency: positive(
                &lookup,
                "TENANT_DEFAULT_CONCURRENCY",
                defaults.tenant_defaults.concurrency,
            ),
            rps: positive(&lookup, "TENANT_DEFAULT_RPS", defaults.tenant_defaults.rps),
            token_budget_per_min: positive(
                &lookup,
                "TENANT_DEFAULT_TOKEN_BUDGET_PER_MIN",
                defaults.tenant_defaults.token_budget_per_min,
            ),
        };

        let tenant_limits = lookup("TENANT_LIMITS")
            .map(|raw| parse_tenant_limits(&raw))
            .unwrap_or_default();

        let list_limit_max = positive(&lookup, "LIST_LIMIT_MAX", defaults.list_limit_max);

        Self {
            http_addr: lookup("HTTP_ADDR")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.http_addr),
            log_format: lookup("LOG_FORMAT")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.log_format),
            heartbeat_interval,
            heartbeat_timeout,
            worker_default_concurrency: positive(
                &lookup,
                "WORKER_DEFAULT_CONCURRENCY",
                defaults.worker_default_concurrency,
            ),
            retry,
            tenant_defaults,
            tenant_limits,
            idempotency_ttl: Duration::from_secs(positive(
                &lookup,
                "IDEMPOTENCY_TTL_SECS",
                defaults.idempotency_ttl.as_secs(),
            )),
            event_log_capacity: positive(&lookup, "EVENT_LOG_CAPACITY", defaults.event_log_capacity),
            sweep_interval: millis(&lookup, "SWEEP_INTERVAL_MS", defaults.sweep_interval),
            max_payload_bytes: positive(&lookup, "MAX_PAYLOAD_BYTES", defaults.max_payload_bytes),
            list_limit_default: defaults.list_limit_default.min(list_limit_max),
            list_limit_max,
        }
    }
}

fn parsed<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: FromStr + core::fmt::Debug,
    T::Err: core::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => default,
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(key, value = %raw, error = %e, default = ?default, "invalid config value; using default");
                default
            }
        },
    }
}

fn positive<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: FromStr + core::fmt::Debug + PartialOrd + Default + Copy,
    T::Err: core::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let value = parsed(lookup, key, default);
    if value <= T::default() {
        tracing::warn!(key, default = ?default, "config value must be positive; using default");
        return default;
    }
    value
}

fn millis<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    Duration::from_millis(positive(lookup, key, default.as_millis() as u64))
}

fn capped(key: &str, value: Duration, max: Duration) -> Duration {
    if value > max {
        tracing::warn!(
            key,
            value_ms = value.as_millis() as u64,
            max_ms = max.as_millis() as u64,
            "config value too large; using maximum"
        );
        return max;
    }
    value
}

/// `tenant=concurrency/rps/budget` entries separated by commas.
fn parse_tenant_limits(raw: &str) -> Vec<TenantLimit> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| match parse_tenant_limit(entry) {
            Ok(limit) => Some(limit),
            Err(e) => {
                tracing::warn!(entry, error = %e, "ignoring invalid TENANT_LIMITS entry");
                None
            }
        })
        .collect()
}

fn parse_tenant_limit(entry: &str) -> Result<TenantLimit, String> {
    let (tenant, limits) = entry
        .split_once('=')
        .ok_or_else(|| "expected tenant=concurrency/rps/budget".to_string())?;
    let tenant_id = TenantId::parse(tenant.trim()).map_err(|e| e.to_string())?;

    let parts: Vec<&str> = limits.split('/').map(str::trim).collect();
    let [concurrency, rps, budget] = parts.as_slice() else {
        return Err("expected three limits: concurrency/rps/budget".to_string());
    };

    let limit = TenantLimit::new(
        tenant_id,
        concurrency.parse().map_err(|e| format!("concurrency: {e}"))?,
        rps.parse().map_err(|e| format!("rps: {e}"))?,
        budget.parse().map_err(|e| format!("budget: {e}"))?,
    );
    limit.validate().map_err(|e| e.to_string())?;
    Ok(limit)
}
