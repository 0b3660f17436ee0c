//! Retry policy
//!
//! Exponential backoff with jitter to avoid thundering herds. Retry
//! eligibility is decided by error category, not error type strings.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ErrorCategory;

/// Backoff configuration for retries.
///
/// # Example
///
/// ```
/// use relay_core::retry::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_attempts(5)
///     .with_initial_interval(Duration::from_secs(1));
///
/// // First retry after ~1 s, then ~2 s, ~4 s, ...
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the initial one.
    pub max_attempts: u32,

    /// Delay before the first retry.
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Cap on the delay between retries.
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Multiplier applied per retry (2.0 = exponential doubling).
    pub backoff_coefficient: f64,

    /// Jitter factor in `[0, 1]`; 0.1 means ±10% randomness.
    pub jitter: f64,

    /// Error categories eligible for retry.
    #[serde(default = "default_retryable")]
    pub retryable_categories: Vec<ErrorCategory>,
}

fn default_retryable() -> Vec<ErrorCategory> {
    vec![ErrorCategory::Transient, ErrorCategory::Timeout]
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Exponential backoff with sensible defaults: 3 attempts, 1 s initial,
    /// 60 s cap, 2x coefficient, 10% jitter.
    pub fn exponential() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            backoff_coefficient: 2.0,
            jitter: 0.1,
            retryable_categories: default_retryable(),
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            jitter: 0.0,
            retryable_categories: Vec::new(),
        }
    }

    /// Fixed-interval retries (no backoff, no jitter).
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            jitter: 0.0,
            retryable_categories: default_retryable(),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn with_retryable_categories(mut self, categories: Vec<ErrorCategory>) -> Self {
        self.retryable_categories = categories;
        self
    }

    /// Delay to wait before the given attempt number (1-based; attempt 1 is
    /// the initial execution and has no delay).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        // Retries start at attempt 2; the first retry waits the initial
        // interval, each one after grows by the coefficient.
        let Some(retries_before) = attempt.checked_sub(2) else {
            return Duration::ZERO;
        };

        let growth = self.backoff_coefficient.powi(retries_before as i32);
        let delay = Duration::try_from_secs_f64(self.initial_interval.as_secs_f64() * growth)
            .map(|grown| grown.min(self.max_interval))
            .unwrap_or(self.max_interval);

        self.apply_jitter(delay)
    }

    /// Scale a delay by a random factor in `[1 - jitter, 1 + jitter]`.
    fn apply_jitter(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = self.jitter.clamp(0.0, 1.0);
        let factor = rand::thread_rng().gen_range(1.0 - spread..1.0 + spread);
        delay.mul_f64(factor)
    }

    /// Whether a failure in this category should be retried at all.
    pub fn should_retry(&self, category: ErrorCategory) -> bool {
        self.retryable_categories.contains(&category)
    }

    /// Whether the budget allows another attempt after `current_attempt`.
    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.max_attempts
    }
}

/// Serde support for `Duration` as integer milliseconds.
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_curve() {
        let policy = RetryPolicy::exponential().with_jitter(0.0);

        assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(4));
    }

    #[test]
    fn test_growth_saturates_at_cap() {
        let policy = RetryPolicy::exponential()
            .with_max_interval(Duration::from_secs(10))
            .with_jitter(0.0);

        // Below the cap the curve still doubles.
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(4));

        // 2^4 = 16 s would exceed the cap; so would anything later.
        assert_eq!(policy.delay_for_attempt(6), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(20), Duration::from_secs(10));
    }

    #[test]
    fn test_fixed_policy_is_flat() {
        let policy = RetryPolicy::fixed(Duration::from_secs(45), 4);

        assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
        for attempt in 2..=4 {
            assert_eq!(policy.delay_for_attempt(attempt), Duration::from_secs(45));
        }
    }

    #[test]
    fn test_none_policy() {
        let policy = RetryPolicy::none();
        assert!(!policy.has_attempts_remaining(1));
        assert!(!policy.should_retry(ErrorCategory::Transient));
    }

    #[test]
    fn test_category_eligibility() {
        let policy = RetryPolicy::exponential();

        assert!(policy.should_retry(ErrorCategory::Transient));
        assert!(policy.should_retry(ErrorCategory::Timeout));
        assert!(!policy.should_retry(ErrorCategory::Validation));
        assert!(!policy.should_retry(ErrorCategory::Internal));
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = RetryPolicy::exponential().with_jitter(0.5);

        // 10 samples of the second retry (base 2 s) all land in [1 s, 3 s].
        for _ in 0..10 {
            let delay = policy.delay_for_attempt(3);
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_secs(3));
        }
    }

    #[test]
    fn test_serde_round_trip() {
        let policy = RetryPolicy::exponential()
            .with_max_attempts(7)
            .with_retryable_categories(vec![ErrorCategory::Transient]);

        let json = serde_json::to_string(&policy).unwrap();
        let parsed: RetryPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(policy, parsed);
    }
}
