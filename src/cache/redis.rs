//! Redis-backed shared tier.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::OnceCell;

use super::{CacheKey, SharedCache, SharedLookup};
use crate::error::{HuginnError, Result};

/// Default prefix for every key written by this backend.
pub const DEFAULT_KEY_PREFIX: &str = "huginn:";

/// [`SharedCache`] over a Redis server.
///
/// The connection is opened lazily on first use, so constructing the
/// backend never blocks or fails on an unreachable server.
pub struct RedisCache {
    client: redis::Client,
    conn: OnceCell<ConnectionManager>,
    prefix: String,
}

impl RedisCache {
    /// Validate `url` (e.g. `redis://127.0.0.1:6379/0`) without connecting.
    pub fn open(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| HuginnError::Configuration(format!("invalid redis url: {e}")))?;
        Ok(Self {
            client,
            conn: OnceCell::new(),
            prefix: DEFAULT_KEY_PREFIX.to_owned(),
        })
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    async fn connection(&self) -> redis::RedisResult<ConnectionManager> {
        self.conn
            .get_or_try_init(|| ConnectionManager::new(self.client.clone()))
            .await
            .cloned()
    }

    fn redis_key(&self, key: &CacheKey) -> String {
        format!("{}{}", self.prefix, key)
    }
}

fn unavailable(e: redis::RedisError) -> HuginnError {
    HuginnError::CacheUnavailable(e.to_string())
}

#[async_trait]
impl SharedCache for RedisCache {
    fn name(&self) -> &str {
        "redis"
    }

    async fn get(&self, key: &CacheKey) -> SharedLookup {
        let mut conn = match self.connection().await {
            Ok(conn) => conn,
            Err(e) => return SharedLookup::Unavailable(e.to_string()),
        };
        match conn.get::<_, Option<Vec<u8>>>(self.redis_key(key)).await {
            Ok(Some(bytes)) => SharedLookup::Hit(bytes),
            Ok(None) => SharedLookup::Miss,
            Err(e) => SharedLookup::Unavailable(e.to_string()),
        }
    }

    async fn put(&self, key: &CacheKey, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let mut conn = self.connection().await.map_err(unavailable)?;
        // SETEX rejects a zero expiry.
        let secs = ttl.as_secs().max(1);
        conn.set_ex::<_, _, ()>(self.redis_key(key), value, secs)
            .await
            .map_err(unavailable)
    }

    async fn delete(&self, key: &CacheKey) -> Result<()> {
        let mut conn = self.connection().await.map_err(unavailable)?;
        conn.del::<_, ()>(self.redis_key(key))
            .await
            .map_err(unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_url() {
        assert!(matches!(
            RedisCache::open("not a url"),
            Err(HuginnError::Configuration(_))
        ));
    }

    #[test]
    fn keys_are_prefixed() {
        let cache = RedisCache::open("redis://127.0.0.1:6379").unwrap().prefix("app:");
        let key = CacheKey::compute(crate::types::OperationKind::Text, &serde_json::json!({}), "m");
        assert_eq!(cache.redis_key(&key), format!("app:{key}"));
    }
}
