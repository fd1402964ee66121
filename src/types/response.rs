//! Response types

use serde::{Deserialize, Serialize};

use crate::cache::CacheKey;

/// Complete, non-streamed result of an upstream call.
///
/// This is the value stored in the cache, so it must round-trip through
/// JSON for the shared tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamResponse {
    /// Generated text (or analysis/description for media operations).
    pub text: String,
    /// Model that produced the response.
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub finish_reason: FinishReason,
}

impl UpstreamResponse {
    pub fn new(text: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            model: model.into(),
            usage: None,
            finish_reason: FinishReason::Stop,
        }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn with_finish_reason(mut self, reason: FinishReason) -> Self {
        self.finish_reason = reason;
        self
    }
}

/// Token usage statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Reason the model stopped generating
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    #[default]
    Stop,
    Length,
    ContentFilter,
    Other(String),
}

/// Where an [`Invocation`]'s response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Upstream,
    Cache,
}

/// Terminal states of the request pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminalState {
    ReturnedOk,
    ReturnedCached,
    RejectedRateLimit,
    FailedUpstream,
}

impl TerminalState {
    /// Lowercase label used in metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReturnedOk => "returned_ok",
            Self::ReturnedCached => "returned_cached",
            Self::RejectedRateLimit => "rejected_rate_limit",
            Self::FailedUpstream => "failed_upstream",
        }
    }
}

/// Successful result of [`Orchestrator::invoke`](crate::Orchestrator::invoke).
#[derive(Debug, Clone)]
pub struct Invocation {
    pub response: UpstreamResponse,
    pub source: ResponseSource,
    /// Cache key the request resolved to.
    pub key: CacheKey,
    /// Upstream attempts made (0 for cache hits).
    pub attempts: u32,
}

impl Invocation {
    pub fn is_cached(&self) -> bool {
        self.source == ResponseSource::Cache
    }

    pub fn terminal_state(&self) -> TerminalState {
        match self.source {
            ResponseSource::Upstream => TerminalState::ReturnedOk,
            ResponseSource::Cache => TerminalState::ReturnedCached,
        }
    }
}
