//! In-process cache tier.

use std::sync::Arc;
use std::time::{Duration, Instant};

use moka::Expiry;
use moka::future::Cache;
use moka::policy::EvictionPolicy;

use super::CacheKey;
use crate::types::UpstreamResponse;

/// A cached response with its freshness metadata.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: Arc<UpstreamResponse>,
    pub created_at: Instant,
    pub ttl: Duration,
    /// Serialized size of `value`, used as the entry's weight when the
    /// tier is byte-budgeted.
    pub size_bytes: u32,
}

impl CacheEntry {
    pub fn new(value: Arc<UpstreamResponse>, ttl: Duration, size_bytes: usize) -> Self {
        Self {
            value,
            created_at: Instant::now(),
            ttl,
            size_bytes: u32::try_from(size_bytes).unwrap_or(u32::MAX),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.created_at.elapsed() >= self.ttl
    }
}

/// Each entry expires `ttl` after it was last written.
struct PerEntryTtl;

impl Expiry<CacheKey, CacheEntry> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &CacheKey,
        value: &CacheEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &CacheKey,
        value: &CacheEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Bounded LRU with per-entry TTL, backed by moka.
pub(crate) struct LocalTier {
    entries: Cache<CacheKey, CacheEntry>,
}

impl LocalTier {
    /// `max_bytes` switches the bound from entry count to total
    /// `size_bytes`.
    pub fn new(max_entries: u64, max_bytes: Option<u64>) -> Self {
        let builder = Cache::builder()
            .eviction_policy(EvictionPolicy::lru())
            .expire_after(PerEntryTtl);
        let builder = match max_bytes {
            Some(bytes) => builder
                .weigher(|_key: &CacheKey, entry: &CacheEntry| entry.size_bytes.max(1))
                .max_capacity(bytes),
            None => builder.max_capacity(max_entries),
        };
        Self {
            entries: builder.build(),
        }
    }

    /// A lookup that finds nothing live also removes any expired entry
    /// under `key`, so it stops counting against capacity.
    pub async fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        match self.entries.get(key).await {
            Some(entry) if !entry.is_expired() => Some(entry),
            _ => {
                self.entries.invalidate(key).await;
                self.entries.run_pending_tasks().await;
                None
            }
        }
    }

    /// Insert and apply any eviction it caused before returning.
    pub async fn insert(&self, key: CacheKey, entry: CacheEntry) {
        self.entries.insert(key, entry).await;
        self.entries.run_pending_tasks().await;
    }

    pub async fn invalidate(&self, key: &CacheKey) {
        self.entries.invalidate(key).await;
        self.entries.run_pending_tasks().await;
    }

    pub async fn clear(&self) {
        self.entries.invalidate_all();
        self.entries.run_pending_tasks().await;
    }

    pub fn len(&self) -> u64 {
        self.entries.entry_count()
    }
}
