//! Upstream transport abstraction.
//!
//! A transport performs exactly one call against the generative-AI backend
//! and reports either a response or an [`UpstreamFailure`] already
//! classified into the closed [`FailureKind`](crate::error::FailureKind)
//! set. Retry, timeout and deadline handling live in
//! [`UpstreamClient`](super::UpstreamClient), never in transports.
//!
//! # Cancellation
//!
//! Dropping the future returned by [`call`](UpstreamTransport::call), or
//! the stream returned by [`call_stream`](UpstreamTransport::call_stream),
//! must abandon the in-flight backend work.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;

use crate::error::UpstreamFailure;
use crate::types::{InvokeRequest, StreamChunk, UpstreamResponse};

/// Boxed stream of chunks produced by a streamed upstream call.
pub type ChunkStream =
    Pin<Box<dyn Stream<Item = std::result::Result<StreamChunk, UpstreamFailure>> + Send>>;

/// Result of a single transport call.
pub type TransportResult<T> = std::result::Result<T, UpstreamFailure>;

/// Unary and streamed calls to the external backend.
///
/// `model` is already resolved; transports must not substitute their own.
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    /// Transport name for logging/metrics.
    fn name(&self) -> &str;

    /// Perform a single unary call.
    async fn call(&self, request: &InvokeRequest, model: &str)
    -> TransportResult<UpstreamResponse>;

    /// Open a streamed call. Failures before the first chunk are reported
    /// here; later ones arrive as `Err` items on the stream.
    async fn call_stream(&self, request: &InvokeRequest, model: &str)
    -> TransportResult<ChunkStream>;
}
