//! Telemetry metric name constants and in-process counters.
//!
//! Centralised metric names for huginn operations. Consumers install
//! their own `metrics` recorder (e.g. prometheus, statsd); without a
//! recorder installed, all metric calls are no-ops.
//!
//! Independently of any recorder, the orchestrator keeps a small set of
//! atomic counters readable through
//! [`Orchestrator::metrics()`](crate::Orchestrator::metrics) as a
//! [`MetricsSnapshot`].
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `huginn_`. Counters end in `_total`,
//! histograms use meaningful units (e.g. `_seconds`).
//!
//! # Common labels
//!
//! - `operation`: operation kind (e.g. "text", "image")
//! - `transport`: upstream transport name (e.g. "gemini")
//! - `outcome`: terminal state or attempt outcome
//! - `tier`: "local" or "shared" cache tier

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Total orchestrated requests, unary and streamed.
///
/// Labels: `operation`, `outcome` (terminal state, lowercase).
pub const REQUESTS_TOTAL: &str = "huginn_requests_total";

/// End-to-end request duration in seconds.
///
/// Labels: `operation`.
pub const REQUEST_DURATION_SECONDS: &str = "huginn_request_duration_seconds";

/// Requests rejected by the rate limiter.
///
/// Labels: `operation`.
pub const RATE_LIMITED_TOTAL: &str = "huginn_rate_limited_total";

/// Total cache hits.
///
/// Labels: `operation`, `tier`.
pub const CACHE_HITS_TOTAL: &str = "huginn_cache_hits_total";

/// Total cache misses.
///
/// Labels: `operation`.
pub const CACHE_MISSES_TOTAL: &str = "huginn_cache_misses_total";

/// Shared cache tier operations that failed or timed out.
///
/// Labels: `op` ("get" | "put" | "delete").
pub const SHARED_CACHE_ERRORS_TOTAL: &str = "huginn_shared_cache_errors_total";

/// Every call made to the upstream transport.
///
/// Labels: `transport`, `operation`, `outcome`.
pub const UPSTREAM_ATTEMPTS_TOTAL: &str = "huginn_upstream_attempts_total";

/// Duration of single upstream attempts in seconds.
///
/// Labels: `transport`, `operation`.
pub const UPSTREAM_DURATION_SECONDS: &str = "huginn_upstream_duration_seconds";

/// Total retry attempts (not counting the initial request).
///
/// Labels: `transport`, `operation`.
pub const RETRIES_TOTAL: &str = "huginn_retries_total";

/// Stream sessions by how they ended.
///
/// Labels: `outcome` ("completed" | "failed" | "cancelled").
pub const STREAMS_TOTAL: &str = "huginn_streams_total";

/// Total tokens reported by the backend.
///
/// Labels: `direction` ("prompt" | "completion").
pub const TOKENS_TOTAL: &str = "huginn_tokens_total";

/// Point-in-time copy of the orchestrator's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub rate_limited: u64,
    pub upstream_attempts: u64,
    pub upstream_retries: u64,
    pub upstream_failures: u64,
    pub streams_started: u64,
    pub streams_completed: u64,
    pub streams_failed: u64,
    pub streams_cancelled: u64,
    /// Failed shared cache tier operations.
    pub shared_cache_errors: u64,
}

impl MetricsSnapshot {
    /// Fraction of cache lookups that hit, or `None` before any lookup.
    pub fn cache_hit_ratio(&self) -> Option<f64> {
        let lookups = self.cache_hits + self.cache_misses;
        (lookups > 0).then(|| self.cache_hits as f64 / lookups as f64)
    }
}

#[derive(Debug, Default)]
pub(crate) struct Stats {
    pub requests: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub rate_limited: AtomicU64,
    pub upstream_attempts: AtomicU64,
    pub upstream_retries: AtomicU64,
    pub upstream_failures: AtomicU64,
    pub streams_started: AtomicU64,
    pub streams_completed: AtomicU64,
    pub streams_failed: AtomicU64,
    pub streams_cancelled: AtomicU64,
}

impl Stats {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            requests: load(&self.requests),
            cache_hits: load(&self.cache_hits),
            cache_misses: load(&self.cache_misses),
            rate_limited: load(&self.rate_limited),
            upstream_attempts: load(&self.upstream_attempts),
            upstream_retries: load(&self.upstream_retries),
            upstream_failures: load(&self.upstream_failures),
            streams_started: load(&self.streams_started),
            streams_completed: load(&self.streams_completed),
            streams_failed: load(&self.streams_failed),
            streams_cancelled: load(&self.streams_cancelled),
            shared_cache_errors: 0,
        }
    }
}
