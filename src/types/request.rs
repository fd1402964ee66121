//! Normalized request representation handed over by the routing layer.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Key distinguishing rate-limit scope per caller.
///
/// Derived from the request origin: an API key when the caller presented
/// one, the peer network address otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientIdentity(String);

impl ClientIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identity for a caller that presented an API key.
    pub fn from_api_key(key: &str) -> Self {
        Self(format!("api_key:{key}"))
    }

    /// Identity for an anonymous caller, keyed on its address.
    pub fn from_addr(addr: IpAddr) -> Self {
        Self(addr.to_string())
    }

    /// Prefer the API key when present and non-empty, fall back to the address.
    pub fn resolve(api_key: Option<&str>, addr: IpAddr) -> Self {
        match api_key.map(str::trim) {
            Some(key) if !key.is_empty() => Self::from_api_key(key),
            _ => Self::from_addr(addr),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of operation a request performs against the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Text,
    Chat,
    Image,
    Audio,
    Video,
    Multimodal,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Chat => "chat",
            Self::Image => "image",
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Multimodal => "multimodal",
        }
    }

    /// Whether responses for this kind are cacheable unless the request
    /// says otherwise. Chat turns depend on conversation state.
    pub fn cacheable_by_default(self) -> bool {
        !matches!(self, Self::Chat)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated request ready for orchestration.
///
/// ```rust
/// # use huginn::{ClientIdentity, InvokeRequest, OperationKind};
/// let request = InvokeRequest::new(OperationKind::Text, ClientIdentity::new("10.0.0.1"))
///     .model("gemini-2.0-flash-exp")
///     .params(serde_json::json!({ "prompt": "Write a haiku", "temperature": 0.2 }));
/// assert_eq!(request.cost, 1);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeRequest {
    pub operation: OperationKind,
    /// Model to use; `None` resolves to the configured default for `operation`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Operation parameters (prompt, media, generation settings).
    #[serde(default)]
    pub params: serde_json::Value,
    pub identity: ClientIdentity,
    /// Rate-limit tokens this request consumes.
    #[serde(default = "default_cost")]
    pub cost: u32,
    /// Per-request override of the kind's cacheability.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cacheable: Option<bool>,
}

fn default_cost() -> u32 {
    1
}

impl InvokeRequest {
    pub fn new(operation: OperationKind, identity: ClientIdentity) -> Self {
        Self {
            operation,
            model: None,
            params: serde_json::Value::Object(Default::default()),
            identity,
            cost: default_cost(),
            cacheable: None,
        }
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    pub fn cost(mut self, cost: u32) -> Self {
        self.cost = cost;
        self
    }

    pub fn cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = Some(cacheable);
        self
    }

    pub fn is_cacheable(&self) -> bool {
        self.cacheable
            .unwrap_or_else(|| self.operation.cacheable_by_default())
    }
}
