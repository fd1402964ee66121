//! TOML configuration model.
//!
//! ```toml
//! [rate_limit]
//! per_minute = 60
//! per_hour = 1000
//!
//! [cache]
//! ttl_secs = 3600
//! max_entries = 1000
//!
//! [retry]
//! max_attempts = 3
//! base_delay_ms = 1000
//!
//! [timeouts]
//! deadline_ms = 120000
//!
//! [upstream.models]
//! text = "gemini-2.0-flash-exp"
//! ```
//!
//! Every section and field is optional. Secrets are never read from this
//! file; pass the API key to the transport constructor instead.

use std::path::Path;

use serde::Deserialize;

use crate::cache::CacheConfig;
use crate::error::{HuginnError, Result};
use crate::rate_limit::RateLimitConfig;
use crate::stream::StreamConfig;
use crate::types::OperationKind;
use crate::upstream::{BackoffPolicy, TimeoutConfig};

/// Default model for every operation kind.
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash-exp";

/// Root of the configuration tree.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub rate_limit: RateLimitConfig,
    pub cache: CacheConfig,
    pub retry: BackoffPolicy,
    pub timeouts: TimeoutConfig,
    pub stream: StreamConfig,
    pub upstream: UpstreamConfig,
}

impl Config {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)
            .map_err(|e| HuginnError::Configuration(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            HuginnError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Reject values no component can run with.
    pub fn validate(&self) -> Result<()> {
        if self.stream.buffer == 0 {
            return Err(HuginnError::Configuration(
                "stream.buffer must be at least 1".into(),
            ));
        }
        if self.timeouts.attempt_timeout.is_zero() || self.timeouts.deadline.is_zero() {
            return Err(HuginnError::Configuration(
                "timeouts must be non-zero".into(),
            ));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(HuginnError::Configuration(
                "retry.base_delay_ms exceeds retry.max_delay_ms".into(),
            ));
        }
        if self.cache.enabled && self.cache.max_entries == 0 && self.cache.max_bytes.is_none() {
            return Err(HuginnError::Configuration(
                "cache.max_entries must be at least 1 while the cache is enabled".into(),
            ));
        }
        Ok(())
    }
}

/// Backend location and per-kind default models.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Override for the backend's base URL (proxies, tests).
    pub base_url: Option<String>,
    pub models: ModelDefaults,
}

/// Models used when a request names none.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ModelDefaults {
    /// Text and chat.
    pub text: String,
    /// Image, video and multimodal.
    pub vision: String,
    pub audio: String,
}

impl Default for ModelDefaults {
    fn default() -> Self {
        Self {
            text: DEFAULT_MODEL.to_owned(),
            vision: DEFAULT_MODEL.to_owned(),
            audio: DEFAULT_MODEL.to_owned(),
        }
    }
}

impl ModelDefaults {
    pub fn for_operation(&self, operation: OperationKind) -> &str {
        match operation {
            OperationKind::Text | OperationKind::Chat => &self.text,
            OperationKind::Image | OperationKind::Video | OperationKind::Multimodal => &self.vision,
            OperationKind::Audio => &self.audio,
        }
    }
}

/// `Duration` as integer milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// `Option<Duration>` as integer milliseconds.
pub(crate) mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
    }
}

/// `Duration` as integer seconds.
pub(crate) mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
