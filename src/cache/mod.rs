//! Two-tier response cache.
//!
//! [`CacheStore`] holds complete unary responses keyed by [`CacheKey`]:
//!
//! - a local tier, always present: a bounded moka LRU in this process,
//!   with a TTL per entry;
//! - an optional shared tier ([`SharedCache`]), consulted on local miss
//!   and written through asynchronously on `put`.
//!
//! A shared-tier hit populates the local tier before it is returned.
//! Shared-tier failures never reach the caller. While the shared tier is
//! unreachable the store serves from the local tier alone, logging once
//! per failure burst, and probes the shared tier again after
//! [`CacheConfig::shared_probe_interval`].
//!
//! Two concurrent misses for the same key each go upstream; there is no
//! single-flight de-duplication.

pub mod key;
mod local;
#[cfg(feature = "redis")]
pub mod redis;
pub mod shared;

pub use key::CacheKey;
pub use local::CacheEntry;
#[cfg(feature = "redis")]
pub use redis::RedisCache;
pub use shared::{SharedCache, SharedLookup};

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::types::UpstreamResponse;
use local::LocalTier;
use shared::SharedHealth;

/// Configuration for the response cache.
///
/// ```rust
/// # use huginn::CacheConfig;
/// # use std::time::Duration;
/// let config = CacheConfig::new()
///     .max_entries(10_000)
///     .ttl(Duration::from_secs(600));
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// When false every lookup misses and nothing is stored. Default: true.
    pub enabled: bool,
    /// Maximum local entries. Default: 1,000.
    pub max_entries: u64,
    /// Byte budget for the local tier. When set it replaces `max_entries`
    /// as the bound, weighing each entry by its serialized size.
    pub max_bytes: Option<u64>,
    /// TTL used by [`CacheStore::put_default`]. Default: 1 hour.
    #[serde(with = "crate::config::secs", rename = "ttl_secs")]
    pub ttl: Duration,
    /// Shared tier location, e.g. `redis://cache:6379`. Used by
    /// [`OrchestratorBuilder::from_config`](crate::OrchestratorBuilder::from_config)
    /// when the `redis` feature is enabled.
    pub shared_url: Option<String>,
    /// Limit on every shared-tier operation. Default: 250ms.
    #[serde(with = "crate::config::millis", rename = "shared_timeout_ms")]
    pub shared_timeout: Duration,
    /// Wait between probes of a degraded shared tier. Default: 5s.
    #[serde(with = "crate::config::millis", rename = "shared_probe_interval_ms")]
    pub shared_probe_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 1_000,
            max_bytes: None,
            ttl: Duration::from_secs(3600),
            shared_url: None,
            shared_timeout: Duration::from_millis(250),
            shared_probe_interval: Duration::from_secs(5),
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn max_entries(mut self, n: u64) -> Self {
        self.max_entries = n;
        self
    }

    pub fn max_bytes(mut self, bytes: u64) -> Self {
        self.max_bytes = Some(bytes);
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn shared_url(mut self, url: impl Into<String>) -> Self {
        self.shared_url = Some(url.into());
        self
    }

    pub fn shared_timeout(mut self, timeout: Duration) -> Self {
        self.shared_timeout = timeout;
        self
    }

    pub fn shared_probe_interval(mut self, interval: Duration) -> Self {
        self.shared_probe_interval = interval;
        self
    }
}

/// Which tier served a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    Local,
    Shared,
}

impl CacheTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Shared => "shared",
        }
    }
}

/// A successful lookup.
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub value: Arc<UpstreamResponse>,
    pub tier: CacheTier,
}

struct SharedTier {
    backend: Arc<dyn SharedCache>,
    health: Arc<SharedHealth>,
    timeout: Duration,
}

/// Local LRU plus optional shared tier.
pub struct CacheStore {
    enabled: bool,
    default_ttl: Duration,
    shared_timeout: Duration,
    shared_probe_interval: Duration,
    local: LocalTier,
    shared: Option<SharedTier>,
}

impl CacheStore {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            enabled: config.enabled,
            default_ttl: config.ttl,
            shared_timeout: config.shared_timeout,
            shared_probe_interval: config.shared_probe_interval,
            local: LocalTier::new(config.max_entries, config.max_bytes),
            shared: None,
        }
    }

    /// Attach a shared tier.
    pub fn with_shared(mut self, backend: Arc<dyn SharedCache>) -> Self {
        self.shared = Some(SharedTier {
            backend,
            health: Arc::new(SharedHealth::new(self.shared_probe_interval)),
            timeout: self.shared_timeout,
        });
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Look `key` up locally, then in the shared tier.
    pub async fn get(&self, key: &CacheKey) -> Option<CacheHit> {
        if !self.enabled {
            return None;
        }

        if let Some(entry) = self.local.get(key).await {
            return Some(CacheHit {
                value: entry.value,
                tier: CacheTier::Local,
            });
        }

        let shared = self.shared.as_ref()?;
        if !shared.health.should_attempt() {
            return None;
        }

        let lookup = match tokio::time::timeout(shared.timeout, shared.backend.get(key)).await {
            Ok(lookup) => lookup,
            Err(_) => SharedLookup::Unavailable(format!("get timed out after {:?}", shared.timeout)),
        };

        let bytes = match lookup {
            SharedLookup::Hit(bytes) => {
                shared.health.record_success(shared.backend.name());
                bytes
            }
            SharedLookup::Miss => {
                shared.health.record_success(shared.backend.name());
                return None;
            }
            SharedLookup::Unavailable(reason) => {
                shared
                    .health
                    .record_failure(shared.backend.name(), "get", &reason);
                return None;
            }
        };

        let value = match serde_json::from_slice::<UpstreamResponse>(&bytes) {
            Ok(value) => Arc::new(value),
            Err(e) => {
                debug!(key = %key, error = %e, "discarding undecodable shared cache entry");
                return None;
            }
        };

        // The remaining shared TTL is unknown, so the local copy gets the default.
        self.local
            .insert(
                key.clone(),
                CacheEntry::new(Arc::clone(&value), self.default_ttl, bytes.len()),
            )
            .await;

        Some(CacheHit {
            value,
            tier: CacheTier::Shared,
        })
    }

    /// Store `value` locally now and in the shared tier in the background.
    pub async fn put(&self, key: &CacheKey, value: UpstreamResponse, ttl: Duration) {
        if !self.enabled || ttl.is_zero() {
            return;
        }

        let bytes = match serde_json::to_vec(&value) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(key = %key, error = %e, "response not serializable, skipping cache");
                return;
            }
        };

        self.local
            .insert(
                key.clone(),
                CacheEntry::new(Arc::new(value), ttl, bytes.len()),
            )
            .await;

        if let Some(shared) = &self.shared {
            if !shared.health.should_attempt() {
                return;
            }
            let backend = Arc::clone(&shared.backend);
            let health = Arc::clone(&shared.health);
            let timeout = shared.timeout;
            let key = key.clone();
            tokio::spawn(async move {
                let result = match tokio::time::timeout(timeout, backend.put(&key, bytes, ttl)).await {
                    Ok(result) => result.map_err(|e| e.to_string()),
                    Err(_) => Err(format!("put timed out after {timeout:?}")),
                };
                match result {
                    Ok(()) => health.record_success(backend.name()),
                    Err(reason) => health.record_failure(backend.name(), "put", &reason),
                }
            });
        }
    }

    /// [`put`](Self::put) with the configured TTL.
    pub async fn put_default(&self, key: &CacheKey, value: UpstreamResponse) {
        self.put(key, value, self.default_ttl).await;
    }

    /// Remove `key` from both tiers.
    pub async fn invalidate(&self, key: &CacheKey) {
        self.local.invalidate(key).await;

        if let Some(shared) = &self.shared {
            if !shared.health.should_attempt() {
                return;
            }
            match tokio::time::timeout(shared.timeout, shared.backend.delete(key)).await {
                Ok(Ok(())) => shared.health.record_success(shared.backend.name()),
                Ok(Err(e)) => {
                    shared
                        .health
                        .record_failure(shared.backend.name(), "delete", &e.to_string())
                }
                Err(_) => shared.health.record_failure(
                    shared.backend.name(),
                    "delete",
                    "delete timed out",
                ),
            }
        }
    }

    /// Drop every local entry. The shared tier is left alone.
    pub async fn clear(&self) {
        self.local.clear().await;
    }

    /// Local entry count.
    pub fn len(&self) -> u64 {
        self.local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a configured shared tier is currently considered unreachable.
    pub fn shared_degraded(&self) -> bool {
        self.shared
            .as_ref()
            .is_some_and(|shared| shared.health.is_degraded())
    }

    /// Shared-tier operations that failed since startup.
    pub fn shared_errors(&self) -> u64 {
        self.shared
            .as_ref()
            .map_or(0, |shared| shared.health.errors())
    }
}
