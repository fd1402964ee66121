//! Retry classification and delay calculation.
//!
//! [`BackoffPolicy`] decides whether a failed upstream attempt may be
//! retried and how long to wait before the next one. Delays grow
//! exponentially from `base_delay`, are capped at `max_delay`, and are
//! jittered into `[0.5x, 1.0x]` of the computed value so that concurrent
//! callers failing together do not retry together.

use std::time::Duration;

use rand::Rng;
use serde::Deserialize;

use crate::error::FailureKind;

/// Configuration for retry behaviour on transient upstream errors.
///
/// ```rust
/// # use huginn::BackoffPolicy;
/// # use std::time::Duration;
/// let policy = BackoffPolicy::new()
///     .max_attempts(5)
///     .base_delay(Duration::from_millis(200))
///     .jitter(true);
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Maximum number of attempts (including the initial request).
    /// 1 = no retry. Default: 3.
    pub max_attempts: u32,
    /// Delay before the first retry. Default: 1s.
    #[serde(with = "crate::config::millis", rename = "base_delay_ms")]
    pub base_delay: Duration,
    /// Cap on exponential growth. Default: 60s.
    #[serde(with = "crate::config::millis", rename = "max_delay_ms")]
    pub max_delay: Duration,
    /// Whether to randomize delays. Default: true.
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that never retries.
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n.max(1);
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// Whether another attempt is allowed after `attempts_made` attempts,
    /// the last of which failed with `kind`.
    ///
    /// Fatal kinds never retry. Retryable kinds retry until the attempt
    /// budget is spent, after which the failure is final for this call.
    pub fn should_retry(&self, attempts_made: u32, kind: FailureKind) -> bool {
        kind.is_retryable() && attempts_made < self.max_attempts
    }

    /// Upper bound of the delay after the `attempt`-th retry (0-indexed):
    /// `base_delay * 2^attempt`, capped at `max_delay`. No jitter.
    pub fn delay_ceiling(&self, attempt: u32) -> Duration {
        let delay = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt));
        delay.min(self.max_delay)
    }

    /// Delay to sleep before the `attempt`-th retry (0-indexed).
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let ceiling = self.delay_ceiling(attempt);
        if !self.jitter || ceiling.is_zero() {
            return ceiling;
        }
        let factor: f64 = rand::thread_rng().gen_range(0.5..=1.0);
        ceiling.mul_f64(factor)
    }

    /// Delay honouring an upstream `retry_after` hint, which takes
    /// precedence over the computed backoff.
    pub fn effective_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        retry_after.unwrap_or_else(|| self.next_delay(attempt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_service_settings() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(60));
        assert!(policy.jitter);
    }

    #[test]
    fn zero_attempts_is_clamped_to_one() {
        assert_eq!(BackoffPolicy::new().max_attempts(0).max_attempts, 1);
    }

    #[test]
    fn zero_base_delay_stays_zero_with_jitter() {
        let policy = BackoffPolicy::new().base_delay(Duration::ZERO);
        assert_eq!(policy.next_delay(4), Duration::ZERO);
    }
}
