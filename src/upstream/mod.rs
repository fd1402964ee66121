//! Calls to the external generative-AI backend.
//!
//! - [`transport`]: the [`UpstreamTransport`] seam. One unary or streamed
//!   call, returning a response or a classified [`UpstreamFailure`](crate::error::UpstreamFailure).
//! - [`backoff`]: [`BackoffPolicy`], which failures retry and how long to wait.
//! - [`client`]: [`UpstreamClient`], retries, per-attempt timeouts and the
//!   overall operation deadline around a transport.
//! - `gemini`: [`GeminiTransport`] for the Generative Language API
//!   (`gemini` feature).

pub mod backoff;
pub mod client;
#[cfg(feature = "gemini")]
pub mod gemini;
pub mod transport;

pub use backoff::BackoffPolicy;
pub use client::{AttemptOutcome, CallRecord, TimeoutConfig, UpstreamAttempt, UpstreamClient};
#[cfg(feature = "gemini")]
pub use gemini::GeminiTransport;
pub use transport::{ChunkStream, TransportResult, UpstreamTransport};
