//! Builder for configuring orchestrator instances

use std::sync::Arc;

use super::Orchestrator;
use crate::cache::{CacheConfig, CacheStore, SharedCache};
use crate::config::{Config, ModelDefaults};
use crate::rate_limit::{RateLimitConfig, RateLimiter};
use crate::stream::{StreamConfig, StreamRelay};
use crate::types::OperationKind;
use crate::upstream::{BackoffPolicy, TimeoutConfig, UpstreamClient, UpstreamTransport};
use crate::{HuginnError, Result};

/// Main entry point for creating orchestrator instances.
pub struct Huginn;

impl Huginn {
    /// Create a new builder for configuring the orchestrator.
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }
}

/// Builder for configuring orchestrator instances.
pub struct OrchestratorBuilder {
    transport: Option<Arc<dyn UpstreamTransport>>,
    #[cfg(feature = "gemini")]
    gemini_key: Option<String>,
    base_url: Option<String>,
    rate_limit: RateLimitConfig,
    cache: CacheConfig,
    shared_cache: Option<Arc<dyn SharedCache>>,
    retry: BackoffPolicy,
    timeouts: TimeoutConfig,
    stream: StreamConfig,
    models: ModelDefaults,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            transport: None,
            #[cfg(feature = "gemini")]
            gemini_key: None,
            base_url: None,
            rate_limit: RateLimitConfig::default(),
            cache: CacheConfig::default(),
            shared_cache: None,
            retry: BackoffPolicy::default(),
            timeouts: TimeoutConfig::default(),
            stream: StreamConfig::default(),
            models: ModelDefaults::default(),
        }
    }

    /// Start from a loaded [`Config`]. A transport (or API key) must still
    /// be supplied.
    pub fn from_config(config: Config) -> Self {
        Self {
            base_url: config.upstream.base_url,
            rate_limit: config.rate_limit,
            cache: config.cache,
            retry: config.retry,
            timeouts: config.timeouts,
            stream: config.stream,
            models: config.upstream.models,
            ..Self::new()
        }
    }

    /// Use a custom upstream transport.
    pub fn transport(mut self, transport: impl UpstreamTransport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Use a shared upstream transport.
    pub fn transport_arc(mut self, transport: Arc<dyn UpstreamTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Call the Gemini API with this key. Ignored if a transport is set.
    #[cfg(feature = "gemini")]
    pub fn gemini(mut self, api_key: impl Into<String>) -> Self {
        self.gemini_key = Some(api_key.into());
        self
    }

    /// Override the backend base URL (proxies, tests).
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = config;
        self
    }

    pub fn cache(mut self, config: CacheConfig) -> Self {
        self.cache = config;
        self
    }

    /// Attach a shared cache tier. Takes precedence over `cache.shared_url`.
    pub fn shared_cache(mut self, shared: Arc<dyn SharedCache>) -> Self {
        self.shared_cache = Some(shared);
        self
    }

    pub fn retry(mut self, policy: BackoffPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn stream(mut self, config: StreamConfig) -> Self {
        self.stream = config;
        self
    }

    pub fn models(mut self, models: ModelDefaults) -> Self {
        self.models = models;
        self
    }

    /// Set the default model for one operation kind's family.
    pub fn default_model(mut self, operation: OperationKind, model: impl Into<String>) -> Self {
        let model = model.into();
        match operation {
            OperationKind::Text | OperationKind::Chat => self.models.text = model,
            OperationKind::Image | OperationKind::Video | OperationKind::Multimodal => {
                self.models.vision = model
            }
            OperationKind::Audio => self.models.audio = model,
        }
        self
    }

    /// Build the orchestrator.
    ///
    /// # Errors
    ///
    /// Returns [`HuginnError::Configuration`] when no transport is
    /// configured, or a shared cache URL is invalid.
    pub fn build(self) -> Result<Orchestrator> {
        let transport = self.resolve_transport()?;

        let mut cache = CacheStore::new(&self.cache);
        if let Some(shared) = self.resolve_shared_cache()? {
            cache = cache.with_shared(shared);
        }

        let mut relay = StreamRelay::new();
        if let Some(idle) = self.stream.idle_timeout {
            relay = relay.idle_timeout(idle);
        }

        Ok(Orchestrator::new(
            RateLimiter::new(self.rate_limit),
            cache,
            UpstreamClient::new(transport, self.retry, self.timeouts),
            relay,
            self.models,
            self.stream.buffer.max(1),
        ))
    }

    fn resolve_transport(&self) -> Result<Arc<dyn UpstreamTransport>> {
        if let Some(transport) = &self.transport {
            return Ok(Arc::clone(transport));
        }

        #[cfg(feature = "gemini")]
        if let Some(key) = &self.gemini_key {
            let transport = match &self.base_url {
                Some(url) => crate::upstream::GeminiTransport::with_base_url(key.clone(), url.clone()),
                None => crate::upstream::GeminiTransport::new(key.clone()),
            };
            return Ok(Arc::new(transport));
        }

        Err(HuginnError::Configuration(
            "no upstream transport configured".into(),
        ))
    }

    fn resolve_shared_cache(&self) -> Result<Option<Arc<dyn SharedCache>>> {
        if let Some(shared) = &self.shared_cache {
            return Ok(Some(Arc::clone(shared)));
        }
        let Some(url) = &self.cache.shared_url else {
            return Ok(None);
        };

        #[cfg(feature = "redis")]
        {
            let redis = crate::cache::RedisCache::open(url)?;
            Ok(Some(Arc::new(redis)))
        }

        #[cfg(not(feature = "redis"))]
        {
            tracing::warn!(
                url = %url,
                "cache.shared_url set but the redis feature is disabled, using local tier only"
            );
            Ok(None)
        }
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
