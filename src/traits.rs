//! Core Gateway trait

use async_trait::async_trait;

use crate::stream::EventStream;
use crate::telemetry::MetricsSnapshot;
use crate::types::{InvokeRequest, Invocation};
use crate::Result;

/// What the routing layer calls.
///
/// Implemented by [`Orchestrator`](crate::Orchestrator); route handlers
/// depend on this trait so they can be tested against a fake.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Run a unary request through admission, cache and upstream.
    ///
    /// Errors are typed so the caller can map them to status codes:
    /// [`RateLimitExceeded`](crate::HuginnError::RateLimitExceeded) carries
    /// its retry-after, upstream failures carry their classification.
    async fn invoke(&self, request: &InvokeRequest) -> Result<Invocation>;

    /// Admit a request and open a relayed stream. Never cached.
    async fn invoke_stream(&self, request: &InvokeRequest) -> Result<EventStream>;

    /// Counters for health and observability endpoints.
    fn metrics(&self) -> MetricsSnapshot;
}
