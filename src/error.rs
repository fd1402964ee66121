//! Huginn error types

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::TerminalState;

/// Whether an upstream failure is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Retryable,
    Fatal,
}

/// Closed set of upstream failure kinds.
///
/// Transports classify backend-specific errors into one of these at the
/// boundary; nothing past [`UpstreamClient`](crate::upstream::UpstreamClient)
/// ever sees a backend error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A single attempt ran out of time.
    Timeout,
    /// Backend asked us to slow down (429-style).
    Throttled,
    /// Backend temporarily unavailable (5xx).
    Unavailable,
    /// Transient connection failure.
    Network,
    MalformedRequest,
    Authentication,
    /// Content-policy rejection.
    PolicyRejection,
    NotFound,
    Internal,
}

impl FailureKind {
    pub fn class(self) -> FailureClass {
        match self {
            Self::Timeout | Self::Throttled | Self::Unavailable | Self::Network => {
                FailureClass::Retryable
            }
            Self::MalformedRequest
            | Self::Authentication
            | Self::PolicyRejection
            | Self::NotFound
            | Self::Internal => FailureClass::Fatal,
        }
    }

    pub fn is_retryable(self) -> bool {
        self.class() == FailureClass::Retryable
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Throttled => "throttled",
            Self::Unavailable => "unavailable",
            Self::Network => "network",
            Self::MalformedRequest => "malformed_request",
            Self::Authentication => "authentication",
            Self::PolicyRejection => "policy_rejection",
            Self::NotFound => "not_found",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure reported by an upstream transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct UpstreamFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Backend-provided hint for when to try again (throttling only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<Duration>,
}

impl UpstreamFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn throttled(retry_after: Option<Duration>) -> Self {
        Self {
            kind: FailureKind::Throttled,
            message: "upstream throttled the request".to_string(),
            retry_after,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    pub fn class(&self) -> FailureClass {
        self.kind.class()
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Huginn error types
#[derive(Debug, thiserror::Error)]
pub enum HuginnError {
    // Admission
    #[error("rate limit exceeded, retry after {retry_after:?}")]
    RateLimitExceeded { retry_after: Duration },

    // Cache (absorbed by the store, never surfaced by the orchestrator)
    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),

    // Upstream
    /// Transient failure that survived every permitted attempt.
    #[error("upstream failed after {attempts} attempt(s): {failure}")]
    UpstreamRetryable {
        failure: UpstreamFailure,
        attempts: u32,
    },

    #[error("upstream rejected the request: {failure}")]
    UpstreamFatal {
        failure: UpstreamFailure,
        attempts: u32,
    },

    #[error("operation deadline of {deadline:?} exceeded after {attempts} attempt(s)")]
    DeadlineExceeded { deadline: Duration, attempts: u32 },

    // Streaming
    #[error("stream error: {0}")]
    Stream(String),

    // Data errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl HuginnError {
    /// Whether the caller may reasonably try the same request again later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimitExceeded { .. }
                | Self::CacheUnavailable(_)
                | Self::UpstreamRetryable { .. }
        )
    }

    /// Suggested wait before retrying, when one is known.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimitExceeded { retry_after } => Some(*retry_after),
            Self::UpstreamRetryable { failure, .. } => failure.retry_after,
            _ => None,
        }
    }

    /// The upstream failure behind this error, if any.
    pub fn upstream_failure(&self) -> Option<&UpstreamFailure> {
        match self {
            Self::UpstreamRetryable { failure, .. } | Self::UpstreamFatal { failure, .. } => {
                Some(failure)
            }
            _ => None,
        }
    }

    /// Number of upstream attempts made before this error was produced.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::UpstreamRetryable { attempts, .. }
            | Self::UpstreamFatal { attempts, .. }
            | Self::DeadlineExceeded { attempts, .. } => *attempts,
            _ => 0,
        }
    }

    /// Pipeline terminal state this error corresponds to.
    pub fn terminal_state(&self) -> TerminalState {
        match self {
            Self::RateLimitExceeded { .. } => TerminalState::RejectedRateLimit,
            _ => TerminalState::FailedUpstream,
        }
    }
}

/// Result type alias for Huginn operations
pub type Result<T> = std::result::Result<T, HuginnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_kinds_partition_into_classes() {
        for kind in [
            FailureKind::Timeout,
            FailureKind::Throttled,
            FailureKind::Unavailable,
            FailureKind::Network,
        ] {
            assert_eq!(kind.class(), FailureClass::Retryable, "{kind}");
        }
        for kind in [
            FailureKind::MalformedRequest,
            FailureKind::Authentication,
            FailureKind::PolicyRejection,
            FailureKind::NotFound,
            FailureKind::Internal,
        ] {
            assert_eq!(kind.class(), FailureClass::Fatal, "{kind}");
        }
    }

    #[test]
    fn rate_limit_error_carries_retry_after() {
        let err = HuginnError::RateLimitExceeded {
            retry_after: Duration::from_secs(7),
        };
        assert!(err.is_transient());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(err.terminal_state(), TerminalState::RejectedRateLimit);
    }

    #[test]
    fn upstream_errors_map_to_failed_upstream() {
        let err = HuginnError::UpstreamFatal {
            failure: UpstreamFailure::new(FailureKind::Authentication, "bad key"),
            attempts: 1,
        };
        assert!(!err.is_transient());
        assert_eq!(err.attempts(), 1);
        assert_eq!(err.terminal_state(), TerminalState::FailedUpstream);

        let err = HuginnError::DeadlineExceeded {
            deadline: Duration::from_secs(1),
            attempts: 2,
        };
        assert_eq!(err.terminal_state(), TerminalState::FailedUpstream);
        assert!(err.upstream_failure().is_none());
    }

    #[test]
    fn throttled_failure_exposes_hint() {
        let err = HuginnError::UpstreamRetryable {
            failure: UpstreamFailure::throttled(Some(Duration::from_secs(3))),
            attempts: 3,
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
        assert!(err.to_string().contains("3 attempt"));
    }
}
