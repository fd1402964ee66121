//! Per-client admission control.
//!
//! Each [`ClientIdentity`] owns a [`RateBudget`] holding two token buckets:
//! one sized and refilled per minute, one per hour. A request is admitted
//! only when both buckets hold enough tokens, and then consumes from both.
//!
//! Refill is computed lazily from the time elapsed since the last access;
//! there is no background timer. Budgets live in memory only, so a restart
//! resets every client to a full burst allowance.
//!
//! Budgets are stored in a sharded [`DashMap`]; the read-modify-write of a
//! budget happens while holding that entry's shard lock, so concurrent
//! requests from one identity can neither over-admit nor lose a decrement.

use std::time::Duration;

use dashmap::DashMap;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::debug;

use crate::types::ClientIdentity;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

/// Tolerance for float drift in refill arithmetic.
const EPSILON: f64 = 1e-9;

/// Configuration for the per-client rate limiter.
///
/// ```rust
/// # use huginn::RateLimitConfig;
/// let config = RateLimitConfig::new().per_minute(30).per_hour(500);
/// assert!(config.enabled);
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// When false every request is admitted. Default: true.
    pub enabled: bool,
    /// Burst capacity and refill per minute. Default: 60.
    pub per_minute: u32,
    /// Burst capacity and refill per hour. Default: 1000.
    pub per_hour: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            per_minute: 60,
            per_hour: 1000,
        }
    }
}

impl RateLimitConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn per_minute(mut self, n: u32) -> Self {
        self.per_minute = n;
        self
    }

    pub fn per_hour(mut self, n: u32) -> Self {
        self.per_hour = n;
        self
    }

    fn windows(&self) -> [Window; 2] {
        [
            Window::new(self.per_minute, MINUTE),
            Window::new(self.per_hour, HOUR),
        ]
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    capacity: f64,
    period: Duration,
}

impl Window {
    fn new(capacity: u32, period: Duration) -> Self {
        Self {
            capacity: f64::from(capacity),
            period,
        }
    }

    fn refill_per_sec(&self) -> f64 {
        self.capacity / self.period.as_secs_f64()
    }

    /// Time until `tokens` grows to `cost`; `None` if it never can.
    fn wait_for(&self, tokens: f64, cost: f64) -> Option<Duration> {
        if tokens + EPSILON >= cost {
            return Some(Duration::ZERO);
        }
        if cost > self.capacity + EPSILON || self.capacity <= 0.0 {
            return None;
        }
        let secs = (cost - tokens) / self.refill_per_sec();
        Some(round_up_to_millis(Duration::from_secs_f64(secs)))
    }
}

fn round_up_to_millis(d: Duration) -> Duration {
    let millis = d.as_nanos().div_ceil(1_000_000);
    Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
}

/// Token state for one client.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateBudget {
    minute_tokens: f64,
    hour_tokens: f64,
    last_refill: Instant,
}

impl RateBudget {
    fn full(config: &RateLimitConfig, now: Instant) -> Self {
        Self {
            minute_tokens: f64::from(config.per_minute),
            hour_tokens: f64::from(config.per_hour),
            last_refill: now,
        }
    }

    /// Tokens left in the per-minute bucket.
    pub fn minute_tokens(&self) -> f64 {
        self.minute_tokens
    }

    /// Tokens left in the per-hour bucket.
    pub fn hour_tokens(&self) -> f64 {
        self.hour_tokens
    }

    pub fn last_refill(&self) -> Instant {
        self.last_refill
    }

    fn refill(&mut self, windows: &[Window; 2], now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            let [minute, hour] = windows;
            self.minute_tokens =
                (self.minute_tokens + elapsed * minute.refill_per_sec()).min(minute.capacity);
            self.hour_tokens = (self.hour_tokens + elapsed * hour.refill_per_sec()).min(hour.capacity);
            self.last_refill = now;
        }
    }
}

/// Result of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub allowed: bool,
    /// How long until the same request would be admitted. Zero when allowed.
    pub retry_after: Duration,
}

impl Admission {
    fn allowed() -> Self {
        Self {
            allowed: true,
            retry_after: Duration::ZERO,
        }
    }

    fn denied(retry_after: Duration) -> Self {
        Self {
            allowed: false,
            retry_after,
        }
    }
}

/// Token-bucket rate limiter keyed by client identity.
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: [Window; 2],
    budgets: DashMap<ClientIdentity, RateBudget>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            windows: config.windows(),
            config,
            budgets: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Check whether `identity` may spend `cost` tokens now, consuming them
    /// from both windows if so.
    ///
    /// When denied, `retry_after` is the shortest wait after which both
    /// windows would hold `cost` tokens. A cost larger than a window's
    /// capacity can never be admitted; the wait reported is then that
    /// window's full period.
    pub fn allow(&self, identity: &ClientIdentity, cost: u32) -> Admission {
        if !self.config.enabled {
            return Admission::allowed();
        }

        let now = Instant::now();
        match self.budgets.get_mut(identity) {
            Some(mut budget) => self.admit(identity, budget.value_mut(), cost, now),
            None => {
                let mut budget = self
                    .budgets
                    .entry(identity.clone())
                    .or_insert_with(|| RateBudget::full(&self.config, now));
                self.admit(identity, budget.value_mut(), cost, now)
            }
        }
    }

    fn admit(
        &self,
        identity: &ClientIdentity,
        budget: &mut RateBudget,
        cost: u32,
        now: Instant,
    ) -> Admission {
        budget.refill(&self.windows, now);
        let cost = f64::from(cost);
        let [minute, hour] = &self.windows;

        let waits = [
            (minute.wait_for(budget.minute_tokens, cost), minute.period),
            (hour.wait_for(budget.hour_tokens, cost), hour.period),
        ];
        let retry_after = waits
            .iter()
            .map(|(wait, period)| wait.unwrap_or(*period))
            .max()
            .unwrap_or_default();

        if retry_after.is_zero() {
            budget.minute_tokens = (budget.minute_tokens - cost).max(0.0);
            budget.hour_tokens = (budget.hour_tokens - cost).max(0.0);
            Admission::allowed()
        } else {
            debug!(
                identity = identity.as_str(),
                cost,
                retry_after_ms = retry_after.as_millis() as u64,
                "rate limit exceeded"
            );
            Admission::denied(retry_after)
        }
    }

    /// Current budget for `identity`, refilled to now. `None` if the
    /// identity has not been seen (or was evicted), which is equivalent to
    /// a full budget.
    pub fn budget(&self, identity: &ClientIdentity) -> Option<RateBudget> {
        let mut budget = *self.budgets.get(identity)?;
        budget.refill(&self.windows, Instant::now());
        Some(budget)
    }

    /// Number of identities currently tracked.
    pub fn tracked(&self) -> usize {
        self.budgets.len()
    }

    /// Drop budgets untouched for at least `idle_for`, returning how many
    /// were removed.
    ///
    /// `idle_for` is raised to the longest window period so that only
    /// budgets which have refilled completely are dropped; forgetting them
    /// changes no admission decision.
    pub fn evict_idle(&self, idle_for: Duration) -> usize {
        let idle_for = idle_for.max(HOUR);
        let now = Instant::now();
        let before = self.budgets.len();
        self.budgets
            .retain(|_, budget| now.saturating_duration_since(budget.last_refill) < idle_for);
        before.saturating_sub(self.budgets.len())
    }
}
