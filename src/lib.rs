//! Huginn - request orchestration for generative-AI backends
//!
//! This crate sits between route handlers and a hosted generative-AI
//! service. For every call it decides whether to admit the request
//! (per-client rate limiting), whether it can be served from cache, how to
//! retry a failing upstream call within its deadline, and how to relay a
//! streamed response without buffering it whole.
//!
//! # Unary Example
//!
//! ```rust,no_run
//! use huginn::{ClientIdentity, Huginn, InvokeRequest, OperationKind};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> huginn::Result<()> {
//!     let orchestrator = Huginn::builder()
//!         .gemini("your-api-key")
//!         .build()?;
//!
//!     let request = InvokeRequest::new(
//!         OperationKind::Text,
//!         ClientIdentity::from_api_key("client-key"),
//!     )
//!     .params(json!({ "prompt": "Write a haiku about ravens" }));
//!
//!     let invocation = orchestrator.invoke(&request).await?;
//!     println!("{} ({:?})", invocation.response.text, invocation.terminal_state());
//!     Ok(())
//! }
//! ```
//!
//! # Streaming Example
//!
//! ```rust,no_run
//! use futures_util::StreamExt;
//! use huginn::{ClientIdentity, Huginn, InvokeRequest, OperationKind, StreamEvent};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> huginn::Result<()> {
//!     let orchestrator = Huginn::builder().gemini("your-api-key").build()?;
//!
//!     let request = InvokeRequest::new(
//!         OperationKind::Chat,
//!         ClientIdentity::new("10.0.0.7"),
//!     )
//!     .params(json!({ "prompt": "Tell me a story" }));
//!
//!     let mut events = orchestrator.invoke_stream(&request).await?;
//!     while let Some(event) = events.next().await {
//!         match event {
//!             StreamEvent::Chunk(chunk) => print!("{}", chunk.text),
//!             StreamEvent::Done => break,
//!             StreamEvent::Error(failure) => eprintln!("stream failed: {failure}"),
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod gateway;
pub mod rate_limit;
pub mod stream;
pub mod telemetry;
pub mod traits;
pub mod types;
pub mod upstream;

// Re-export main types at crate root
pub use cache::{CacheConfig, CacheKey, CacheStore, SharedCache, SharedLookup};
pub use config::{Config, ModelDefaults};
pub use error::{FailureClass, FailureKind, HuginnError, Result, UpstreamFailure};
pub use gateway::{Huginn, Orchestrator, OrchestratorBuilder};
pub use rate_limit::{Admission, RateLimitConfig, RateLimiter};
pub use stream::{EventStream, StreamConfig, StreamRelay};
pub use telemetry::MetricsSnapshot;
pub use traits::Gateway;
pub use upstream::{BackoffPolicy, TimeoutConfig, UpstreamClient, UpstreamTransport};

#[cfg(feature = "redis")]
pub use cache::RedisCache;

#[cfg(feature = "gemini")]
pub use upstream::GeminiTransport;

// Re-export all types
pub use types::{
    ClientIdentity, FinishReason, InvokeRequest, Invocation, OperationKind, ResponseSource,
    SessionState, StreamChunk, StreamEvent, TerminalState, UpstreamResponse, Usage,
};
