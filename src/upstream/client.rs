//! Upstream client: retries, per-attempt timeouts and the overall deadline.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::backoff::BackoffPolicy;
use super::transport::{ChunkStream, TransportResult, UpstreamTransport};
use crate::error::{FailureKind, HuginnError, Result, UpstreamFailure};
use crate::telemetry;
use crate::types::{InvokeRequest, UpstreamResponse};

/// Time limits applied to every upstream call.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Limit for a single attempt. Default: 30s.
    #[serde(with = "crate::config::millis", rename = "attempt_timeout_ms")]
    pub attempt_timeout: Duration,
    /// Limit for the whole operation, retries and backoff included. Default: 120s.
    #[serde(with = "crate::config::millis", rename = "deadline_ms")]
    pub deadline: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(30),
            deadline: Duration::from_secs(120),
        }
    }
}

impl TimeoutConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }
}

/// Outcome of one upstream attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    RetryableFailure(FailureKind),
    FatalFailure(FailureKind),
}

impl AttemptOutcome {
    fn label(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::RetryableFailure(_) => "retryable_failure",
            Self::FatalFailure(_) => "fatal_failure",
        }
    }
}

/// Record of a single call to the backend. Lives only as long as the
/// operation that made it.
#[derive(Debug, Clone)]
pub struct UpstreamAttempt {
    /// 1-indexed.
    pub attempt_number: u32,
    pub started_at: Instant,
    pub latency: Duration,
    pub outcome: AttemptOutcome,
}

/// Final result of an operation plus every attempt made for it.
pub struct CallRecord<T> {
    pub result: Result<T>,
    pub attempts: Vec<UpstreamAttempt>,
}

impl<T> CallRecord<T> {
    /// Retries performed (attempts beyond the first).
    pub fn retries(&self) -> u32 {
        (self.attempts.len() as u32).saturating_sub(1)
    }
}

/// Uniform entry point to the backend.
///
/// Wraps an [`UpstreamTransport`] with [`BackoffPolicy`]-governed retries.
/// Backoff sleeps are plain `tokio::time::sleep` calls local to the calling
/// task, so a retrying call never holds up other requests.
pub struct UpstreamClient {
    transport: Arc<dyn UpstreamTransport>,
    policy: BackoffPolicy,
    timeouts: TimeoutConfig,
}

impl UpstreamClient {
    pub fn new(
        transport: Arc<dyn UpstreamTransport>,
        policy: BackoffPolicy,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            transport,
            policy,
            timeouts,
        }
    }

    pub fn transport_name(&self) -> &str {
        self.transport.name()
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn timeouts(&self) -> &TimeoutConfig {
        &self.timeouts
    }

    /// Unary call with retries.
    pub async fn invoke(&self, request: &InvokeRequest, model: &str) -> Result<UpstreamResponse> {
        self.invoke_recorded(request, model).await.result
    }

    /// Unary call with retries, returning the attempt log alongside the result.
    pub async fn invoke_recorded(
        &self,
        request: &InvokeRequest,
        model: &str,
    ) -> CallRecord<UpstreamResponse> {
        self.with_retry("invoke", || self.transport.call(request, model))
            .await
    }

    /// Open a stream. Only establishing the stream is retried; once chunks
    /// flow, failures belong to the relay.
    pub async fn invoke_stream(
        &self,
        request: &InvokeRequest,
        model: &str,
    ) -> CallRecord<ChunkStream> {
        self.with_retry("invoke_stream", || {
            self.transport.call_stream(request, model)
        })
        .await
    }

    async fn with_retry<F, Fut, T>(&self, operation: &'static str, f: F) -> CallRecord<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = TransportResult<T>>,
    {
        let transport = self.transport.name();
        let deadline = Instant::now() + self.timeouts.deadline;
        let mut attempts: Vec<UpstreamAttempt> = Vec::new();
        let mut number = 0u32;

        loop {
            number += 1;
            let started_at = Instant::now();
            let remaining = deadline.saturating_duration_since(started_at);
            if remaining.is_zero() {
                return self.deadline_exceeded(attempts, number - 1);
            }
            let budget = remaining.min(self.timeouts.attempt_timeout);

            let failure = match tokio::time::timeout(budget, f()).await {
                Ok(Ok(value)) => {
                    let latency = started_at.elapsed();
                    record_attempt(transport, operation, AttemptOutcome::Success, latency);
                    attempts.push(UpstreamAttempt {
                        attempt_number: number,
                        started_at,
                        latency,
                        outcome: AttemptOutcome::Success,
                    });
                    return CallRecord {
                        result: Ok(value),
                        attempts,
                    };
                }
                Ok(Err(failure)) => failure,
                Err(_) if Instant::now() >= deadline => {
                    let latency = started_at.elapsed();
                    let outcome = AttemptOutcome::RetryableFailure(FailureKind::Timeout);
                    record_attempt(transport, operation, outcome, latency);
                    attempts.push(UpstreamAttempt {
                        attempt_number: number,
                        started_at,
                        latency,
                        outcome,
                    });
                    return self.deadline_exceeded(attempts, number);
                }
                Err(_) => UpstreamFailure::timeout(format!(
                    "attempt {number} timed out after {budget:?}"
                )),
            };

            let latency = started_at.elapsed();
            let outcome = if failure.is_retryable() {
                AttemptOutcome::RetryableFailure(failure.kind)
            } else {
                AttemptOutcome::FatalFailure(failure.kind)
            };
            record_attempt(transport, operation, outcome, latency);
            attempts.push(UpstreamAttempt {
                attempt_number: number,
                started_at,
                latency,
                outcome,
            });

            if !failure.is_retryable() {
                debug!(transport, operation, attempt = number, error = %failure, "fatal upstream error");
                return CallRecord {
                    result: Err(HuginnError::UpstreamFatal {
                        failure,
                        attempts: number,
                    }),
                    attempts,
                };
            }

            if !self.policy.should_retry(number, failure.kind) {
                warn!(
                    transport,
                    operation,
                    attempts = number,
                    error = %failure,
                    "upstream retries exhausted"
                );
                return CallRecord {
                    result: Err(HuginnError::UpstreamRetryable {
                        failure,
                        attempts: number,
                    }),
                    attempts,
                };
            }

            let delay = self.policy.effective_delay(number - 1, failure.retry_after);
            if delay >= deadline.saturating_duration_since(Instant::now()) {
                return self.deadline_exceeded(attempts, number);
            }

            metrics::counter!(telemetry::RETRIES_TOTAL,
                "transport" => transport.to_owned(),
                "operation" => operation,
            )
            .increment(1);
            warn!(
                transport,
                operation,
                attempt = number,
                max_attempts = self.policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "retrying after transient error"
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn deadline_exceeded<T>(&self, attempts: Vec<UpstreamAttempt>, made: u32) -> CallRecord<T> {
        warn!(
            transport = self.transport.name(),
            deadline_ms = self.timeouts.deadline.as_millis() as u64,
            attempts = made,
            "upstream operation deadline exceeded"
        );
        CallRecord {
            result: Err(HuginnError::DeadlineExceeded {
                deadline: self.timeouts.deadline,
                attempts: made,
            }),
            attempts,
        }
    }
}

fn record_attempt(transport: &str, operation: &'static str, outcome: AttemptOutcome, latency: Duration) {
    metrics::counter!(telemetry::UPSTREAM_ATTEMPTS_TOTAL,
        "transport" => transport.to_owned(),
        "operation" => operation,
        "outcome" => outcome.label(),
    )
    .increment(1);
    metrics::histogram!(telemetry::UPSTREAM_DURATION_SECONDS,
        "transport" => transport.to_owned(),
        "operation" => operation,
    )
    .record(latency.as_secs_f64());
}
