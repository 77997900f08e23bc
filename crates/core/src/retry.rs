//! Retry & dead-letter policy.
//!
//! A pure decision function: given how many attempts a job has used and its
//! ceiling, either schedule another attempt after a backoff delay or give up.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

impl core::str::FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "exponential" => Ok(Self::Exponential),
            "linear" => Ok(Self::Linear),
            other => Err(format!("unknown backoff strategy: {other}")),
        }
    }
}

/// Backoff configuration. The attempt ceiling lives on each job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

/// Outcome of [`RetryPolicy::decide`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Move to `retry_scheduled`, eligible again at `next_run_at`.
    Retry {
        next_run_at: DateTime<Utc>,
        delay: Duration,
    },
    /// Move to `dlq`.
    DeadLetter { reason: String },
}

impl RetryPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    ///
    /// Non-decreasing in `attempt` and never above `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                // powi saturates to +inf for large exponents; min() brings it back to the cap.
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(1023) as i32);
                base_ms * exp
            }
            BackoffStrategy::Linear => base_ms * (attempt as f64),
        };

        Duration::from_millis(delay_ms.min(max_ms).max(0.0) as u64)
    }

    /// Check if another attempt is allowed.
    pub fn should_retry(&self, attempt: u32, max_attempts: u32) -> bool {
        attempt < max_attempts
    }

    /// Decide what happens to a job that just failed its `attempt`-th try.
    ///
    /// The ceiling is absolute: a failure with `attempt >= max_attempts` always
    /// dead-letters, whatever the `failure_reason`.
    pub fn decide(
        &self,
        attempt: u32,
        max_attempts: u32,
        failure_reason: &str,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        if !self.should_retry(attempt, max_attempts) {
            return RetryDecision::DeadLetter {
                reason: format!(
                    "max attempts exhausted ({attempt}/{max_attempts}); last failure: {failure_reason}"
                ),
            };
        }

        let delay = self.delay_for_attempt(attempt);
        // Saturates at the end of representable time instead of overflowing.
        let next_run_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        RetryDecision::Retry { next_run_at, delay }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy::exponential(Duration::from_millis(100), Duration::from_secs(10));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = RetryPolicy::exponential(Duration::from_secs(1), Duration::from_secs(30));

        assert_eq!(policy.delay_for_attempt(6), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Linear,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn huge_delays_saturate_next_run_at() {
        let huge = Duration::from_millis(10_u64.pow(16));
        let policy = RetryPolicy::exponential(huge, huge);
        let now = Utc::now();

        match policy.decide(1, 3, "PROVIDER_TIMEOUT", now) {
            RetryDecision::Retry { next_run_at, delay } => {
                assert_eq!(delay, huge);
                assert_eq!(next_run_at, DateTime::<Utc>::MAX_UTC);
            }
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn decide_schedules_retry_below_ceiling() {
        let policy = RetryPolicy::fixed(Duration::from_secs(15));
        let now = Utc::now();

        match policy.decide(1, 3, "PROVIDER_TIMEOUT", now) {
            RetryDecision::Retry { next_run_at, delay } => {
                assert_eq!(delay, Duration::from_secs(15));
                assert_eq!(next_run_at, now + chrono::Duration::seconds(15));
            }
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn decide_dead_letters_at_ceiling() {
        let policy = RetryPolicy::default();
        let now = Utc::now();

        let decision = policy.decide(3, 3, "LEASE_EXPIRED", now);
        match decision {
            RetryDecision::DeadLetter { reason } => assert!(reason.contains("LEASE_EXPIRED")),
            other => panic!("expected dead letter, got {other:?}"),
        }
        assert!(matches!(
            policy.decide(4, 3, "X", now),
            RetryDecision::DeadLetter { .. }
        ));
    }

    #[test]
    fn backoff_strategy_parses() {
        assert_eq!("Linear".parse::<BackoffStrategy>(), Ok(BackoffStrategy::Linear));
        assert!("random".parse::<BackoffStrategy>().is_err());
    }

    fn strategy() -> impl Strategy<Value = BackoffStrategy> {
        prop_oneof![
            Just(BackoffStrategy::Fixed),
            Just(BackoffStrategy::Exponential),
            Just(BackoffStrategy::Linear),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: backoff never decreases as attempts grow, and never exceeds the cap.
        #[test]
        fn backoff_is_monotonic_and_capped(
            base_ms in 1u64..10_000,
            cap_factor in 1u64..1_000,
            attempt in 1u32..200,
            strategy in strategy(),
        ) {
            let policy = RetryPolicy {
                base_delay: Duration::from_millis(base_ms),
                max_delay: Duration::from_millis(base_ms * cap_factor),
                strategy,
            };

            let current = policy.delay_for_attempt(attempt);
            let next = policy.delay_for_attempt(attempt + 1);
            prop_assert!(next >= current);
            prop_assert!(next <= policy.max_delay);
        }

        /// Property: the decision is retry exactly when attempts remain.
        #[test]
        fn decide_respects_ceiling(attempt in 0u32..50, max_attempts in 1u32..25) {
            let decision = RetryPolicy::default().decide(attempt, max_attempts, "ERR", Utc::now());
            let retried = matches!(decision, RetryDecision::Retry { .. });
            prop_assert_eq!(retried, attempt < max_attempts);
        }
    }
}
