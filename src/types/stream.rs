//! Streaming event types

use serde::{Deserialize, Serialize};

use crate::error::UpstreamFailure;

/// One incremental piece of a streamed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub text: String,
}

impl StreamChunk {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// Events delivered to a stream consumer.
///
/// A session always ends with exactly one of `Done` or `Error`, unless the
/// consumer went away first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Text content chunk
    Chunk(StreamChunk),
    /// Upstream completed normally
    Done,
    /// Upstream failed mid-stream; output so far is partial
    Error(UpstreamFailure),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Chunk(_))
    }

    /// JSON encoding used for SSE `data:` lines.
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Lifecycle of a stream session, as reported by
/// [`RelayOutcome::state`](crate::stream::RelayOutcome::state).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Open,
    Completed,
    Failed,
    Cancelled,
}
