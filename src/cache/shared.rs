//! Shared (cross-instance) cache tier.
//!
//! The shared tier is an optimization, never a dependency: every failure
//! is absorbed and reported as [`SharedLookup::Unavailable`] or an `Err`
//! that the [`CacheStore`](super::CacheStore) logs and drops.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::CacheKey;
use crate::error::Result;

/// Outcome of a shared-tier read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SharedLookup {
    Hit(Vec<u8>),
    Miss,
    /// The tier could not be reached; callers treat this as a miss.
    Unavailable(String),
}

/// A cache reachable by every orchestrator instance.
///
/// Values are opaque bytes; the store handles (de)serialization.
#[async_trait]
pub trait SharedCache: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &str;

    async fn get(&self, key: &CacheKey) -> SharedLookup;

    /// Store `value`, expiring after `ttl`.
    async fn put(&self, key: &CacheKey, value: Vec<u8>, ttl: Duration) -> Result<()>;

    async fn delete(&self, key: &CacheKey) -> Result<()>;
}

/// Tracks whether the shared tier is degraded and when to probe it again.
pub(crate) struct SharedHealth {
    degraded: AtomicBool,
    last_failure: Mutex<Option<Instant>>,
    probe_interval: Duration,
    errors: AtomicU64,
}

impl SharedHealth {
    pub fn new(probe_interval: Duration) -> Self {
        Self {
            degraded: AtomicBool::new(false),
            last_failure: Mutex::new(None),
            probe_interval,
            errors: AtomicU64::new(0),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Whether an operation should be attempted now. While degraded, only
    /// one probe per `probe_interval` goes through.
    pub fn should_attempt(&self) -> bool {
        if !self.is_degraded() {
            return true;
        }
        let Ok(mut last) = self.last_failure.lock() else {
            return true;
        };
        let now = Instant::now();
        match *last {
            Some(at) if now.saturating_duration_since(at) < self.probe_interval => false,
            _ => {
                // Claim the probe slot so concurrent callers keep skipping.
                *last = Some(now);
                true
            }
        }
    }

    pub fn record_failure(&self, backend: &str, op: &'static str, error: &str) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(crate::telemetry::SHARED_CACHE_ERRORS_TOTAL, "op" => op).increment(1);
        if let Ok(mut last) = self.last_failure.lock() {
            *last = Some(Instant::now());
        }
        if self.degraded.swap(true, Ordering::AcqRel) {
            debug!(backend, op, error, "shared cache still unavailable");
        } else {
            warn!(
                backend,
                op,
                error,
                "shared cache unavailable, serving from local tier only"
            );
        }
    }

    pub fn record_success(&self, backend: &str) {
        if self.degraded.swap(false, Ordering::AcqRel) {
            info!(backend, "shared cache recovered");
        }
    }
}
