use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{StreamExt, stream};
use huginn::upstream::{ChunkStream, TransportResult};
use huginn::{
    BackoffPolicy, CacheConfig, CacheKey, ClientIdentity, FailureKind, Gateway, Huginn,
    HuginnError, InvokeRequest, MetricsSnapshot, OperationKind, Orchestrator, RateLimitConfig,
    ResponseSource, SharedCache, SharedLookup, StreamChunk, StreamEvent, TerminalState,
    UpstreamFailure, UpstreamResponse, UpstreamTransport,
};
use serde_json::json;
use tokio::sync::oneshot;

// ============================================================================
// Fake backend
// ============================================================================

/// Echoes the prompt back, failing first with any queued failures.
#[derive(Default)]
struct EchoTransport {
    calls: AtomicU32,
    stream_calls: AtomicU32,
    failures: Mutex<VecDeque<UpstreamFailure>>,
    models: Mutex<Vec<String>>,
}

impl EchoTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn failing_first(failures: Vec<UpstreamFailure>) -> Arc<Self> {
        let transport = Self::default();
        *transport.failures.lock().unwrap() = failures.into();
        Arc::new(transport)
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn stream_calls(&self) -> u32 {
        self.stream_calls.load(Ordering::SeqCst)
    }

    fn last_model(&self) -> Option<String> {
        self.models.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl UpstreamTransport for EchoTransport {
    fn name(&self) -> &str {
        "echo"
    }

    async fn call(&self, request: &InvokeRequest, model: &str) -> TransportResult<UpstreamResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.models.lock().unwrap().push(model.to_owned());
        if let Some(failure) = self.failures.lock().unwrap().pop_front() {
            return Err(failure);
        }
        let prompt = request.params["prompt"].as_str().unwrap_or_default();
        Ok(UpstreamResponse::new(format!("echo: {prompt}"), model))
    }

    async fn call_stream(&self, request: &InvokeRequest, model: &str) -> TransportResult<ChunkStream> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        self.models.lock().unwrap().push(model.to_owned());
        let prompt = request.params["prompt"].as_str().unwrap_or_default().to_owned();
        let words: Vec<_> = prompt
            .split_whitespace()
            .map(|w| Ok(StreamChunk::new(format!("{w} "))))
            .collect();
        Ok(Box::pin(stream::iter(words)))
    }
}

/// Streams forever and reports when the stream is dropped.
struct EndlessTransport {
    cancelled: Mutex<Option<oneshot::Sender<()>>>,
}

struct OnDrop(Option<oneshot::Sender<()>>);

impl Drop for OnDrop {
    fn drop(&mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(());
        }
    }
}

#[async_trait]
impl UpstreamTransport for EndlessTransport {
    fn name(&self) -> &str {
        "endless"
    }

    async fn call(&self, _request: &InvokeRequest, _model: &str) -> TransportResult<UpstreamResponse> {
        Err(UpstreamFailure::new(FailureKind::Internal, "stream only"))
    }

    async fn call_stream(&self, _request: &InvokeRequest, _model: &str) -> TransportResult<ChunkStream> {
        let guard = OnDrop(self.cancelled.lock().unwrap().take());
        Ok(Box::pin(stream::unfold(guard, |guard| async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Some((Ok(StreamChunk::new("tick")), guard))
        })))
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn fast_retry() -> BackoffPolicy {
    BackoffPolicy::new()
        .max_attempts(3)
        .base_delay(Duration::from_millis(1))
        .max_delay(Duration::from_millis(5))
        .jitter(false)
}

fn orchestrator(transport: Arc<EchoTransport>, per_minute: u32) -> Orchestrator {
    Huginn::builder()
        .transport_arc(transport)
        .rate_limit(RateLimitConfig::new().per_minute(per_minute).per_hour(1_000))
        .retry(fast_retry())
        .build()
        .unwrap()
}

fn text(client: &str, prompt: &str) -> InvokeRequest {
    InvokeRequest::new(OperationKind::Text, ClientIdentity::new(client))
        .params(json!({ "prompt": prompt }))
}

async fn eventually(orch: &Orchestrator, check: impl Fn(&MetricsSnapshot) -> bool) -> MetricsSnapshot {
    for _ in 0..200 {
        let snapshot = orch.metrics();
        if check(&snapshot) {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    orch.metrics()
}

// ============================================================================
// Unary pipeline
// ============================================================================

#[tokio::test]
async fn identical_requests_hit_cache_until_budget_runs_out() {
    let transport = EchoTransport::new();
    let orch = orchestrator(transport.clone(), 2);
    let request = text("10.0.0.1", "Write a haiku");

    let first = orch.invoke(&request).await.unwrap();
    assert_eq!(first.terminal_state(), TerminalState::ReturnedOk);
    assert_eq!(first.source, ResponseSource::Upstream);
    assert_eq!(first.response.text, "echo: Write a haiku");
    assert_eq!(first.attempts, 1);

    let second = orch.invoke(&request).await.unwrap();
    assert_eq!(second.terminal_state(), TerminalState::ReturnedCached);
    assert!(second.is_cached());
    assert_eq!(second.attempts, 0);
    assert_eq!(second.response, first.response);
    assert_eq!(second.key, first.key);

    // Cache hits still spend the budget.
    let err = orch.invoke(&request).await.unwrap_err();
    assert!(matches!(err, HuginnError::RateLimitExceeded { .. }));
    assert_eq!(err.terminal_state(), TerminalState::RejectedRateLimit);
    let wait = err.retry_after().unwrap();
    assert!(wait > Duration::ZERO && wait <= Duration::from_secs(30));

    assert_eq!(transport.calls(), 1);
    let snapshot = orch.metrics();
    assert_eq!(snapshot.requests, 3);
    assert_eq!(snapshot.cache_hits, 1);
    assert_eq!(snapshot.cache_misses, 1);
    assert_eq!(snapshot.rate_limited, 1);
    assert_eq!(snapshot.upstream_attempts, 1);
}

#[tokio::test]
async fn rejected_request_does_no_cache_or_upstream_work() {
    let transport = EchoTransport::new();
    let orch = orchestrator(transport.clone(), 1);

    orch.invoke(&text("c", "one")).await.unwrap();
    let err = orch.invoke(&text("c", "two")).await.unwrap_err();

    assert!(matches!(err, HuginnError::RateLimitExceeded { .. }));
    assert_eq!(transport.calls(), 1);
    assert_eq!(orch.metrics().cache_misses, 1);
    assert_eq!(orch.cache().len(), 1);
}

#[tokio::test]
async fn clients_have_separate_budgets() {
    let transport = EchoTransport::new();
    let orch = orchestrator(transport, 1);

    orch.invoke(&text("alice", "hi")).await.unwrap();
    orch.invoke(&text("bob", "hi")).await.unwrap();
    assert!(orch.invoke(&text("alice", "hi")).await.is_err());
}

#[tokio::test]
async fn different_params_are_cached_separately() {
    let transport = EchoTransport::new();
    let orch = orchestrator(transport.clone(), 10);

    orch.invoke(&text("c", "a")).await.unwrap();
    orch.invoke(&text("c", "b")).await.unwrap();
    let again = orch.invoke(&text("c", "a")).await.unwrap();

    assert!(again.is_cached());
    assert_eq!(again.response.text, "echo: a");
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn chat_requests_are_not_cached() {
    let transport = EchoTransport::new();
    let orch = orchestrator(transport.clone(), 10);
    let chat = InvokeRequest::new(OperationKind::Chat, ClientIdentity::new("c"))
        .params(json!({ "prompt": "hello" }));

    assert!(!orch.invoke(&chat).await.unwrap().is_cached());
    assert!(!orch.invoke(&chat).await.unwrap().is_cached());
    assert_eq!(transport.calls(), 2);
    assert!(orch.cache().is_empty());
}

#[tokio::test]
async fn request_can_opt_out_of_caching() {
    let transport = EchoTransport::new();
    let orch = orchestrator(transport.clone(), 10);
    let request = text("c", "fresh please").cacheable(false);

    orch.invoke(&request).await.unwrap();
    orch.invoke(&request).await.unwrap();
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn disabled_cache_always_calls_upstream() {
    let transport = EchoTransport::new();
    let orch = Huginn::builder()
        .transport_arc(transport.clone())
        .cache(CacheConfig::disabled())
        .build()
        .unwrap();

    orch.invoke(&text("c", "x")).await.unwrap();
    orch.invoke(&text("c", "x")).await.unwrap();
    assert_eq!(transport.calls(), 2);
    assert_eq!(orch.metrics().cache_misses, 0);
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let transport = EchoTransport::failing_first(vec![
        UpstreamFailure::new(FailureKind::Unavailable, "503"),
        UpstreamFailure::new(FailureKind::Network, "reset"),
    ]);
    let orch = orchestrator(transport.clone(), 10);

    let invocation = orch.invoke(&text("c", "retry me")).await.unwrap();

    assert_eq!(invocation.attempts, 3);
    assert_eq!(transport.calls(), 3);
    let snapshot = orch.metrics();
    assert_eq!(snapshot.upstream_attempts, 3);
    assert_eq!(snapshot.upstream_retries, 2);
}

#[tokio::test]
async fn failed_requests_are_not_cached() {
    let transport = EchoTransport::failing_first(vec![UpstreamFailure::new(
        FailureKind::PolicyRejection,
        "blocked",
    )]);
    let orch = orchestrator(transport.clone(), 10);
    let request = text("c", "sensitive");

    let err = orch.invoke(&request).await.unwrap_err();
    assert!(matches!(err, HuginnError::UpstreamFatal { attempts: 1, .. }));
    assert_eq!(err.terminal_state(), TerminalState::FailedUpstream);
    assert_eq!(orch.metrics().upstream_failures, 1);

    // Nothing was cached, so the next call reaches the upstream again.
    let ok = orch.invoke(&request).await.unwrap();
    assert!(!ok.is_cached());
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn default_model_follows_operation_kind() {
    let transport = EchoTransport::new();
    let orch = Huginn::builder()
        .transport_arc(transport.clone())
        .default_model(OperationKind::Image, "vision-model")
        .default_model(OperationKind::Text, "text-model")
        .build()
        .unwrap();

    let image = InvokeRequest::new(OperationKind::Image, ClientIdentity::new("c"));
    orch.invoke(&image).await.unwrap();
    assert_eq!(transport.last_model().as_deref(), Some("vision-model"));

    orch.invoke(&text("c", "x")).await.unwrap();
    assert_eq!(transport.last_model().as_deref(), Some("text-model"));

    let explicit = text("c", "y").model("pinned");
    assert_eq!(orch.resolve_model(&explicit), "pinned");
    orch.invoke(&explicit).await.unwrap();
    assert_eq!(transport.last_model().as_deref(), Some("pinned"));
}

#[tokio::test]
async fn model_is_part_of_the_cache_key() {
    let transport = EchoTransport::new();
    let orch = orchestrator(transport, 10);

    let a = orch.cache_key(&text("c", "same").model("m1"));
    let b = orch.cache_key(&text("c", "same").model("m2"));
    assert_ne!(a, b);
}

#[tokio::test]
async fn build_without_transport_fails() {
    let err = Huginn::builder().build().err().expect("missing transport");
    assert!(matches!(err, HuginnError::Configuration(_)));
}

struct UnreachableShared;

#[async_trait]
impl SharedCache for UnreachableShared {
    fn name(&self) -> &str {
        "unreachable"
    }

    async fn get(&self, _key: &CacheKey) -> SharedLookup {
        SharedLookup::Unavailable("connection refused".into())
    }

    async fn put(&self, _key: &CacheKey, _value: Vec<u8>, _ttl: Duration) -> huginn::Result<()> {
        Err(HuginnError::CacheUnavailable("connection refused".into()))
    }

    async fn delete(&self, _key: &CacheKey) -> huginn::Result<()> {
        Err(HuginnError::CacheUnavailable("connection refused".into()))
    }
}

#[tokio::test]
async fn unreachable_shared_cache_never_fails_requests() {
    let transport = EchoTransport::new();
    let orch = Huginn::builder()
        .transport_arc(transport.clone())
        .shared_cache(Arc::new(UnreachableShared))
        .build()
        .unwrap();

    let first = orch.invoke(&text("c", "q")).await.unwrap();
    assert!(!first.is_cached());
    let second = orch.invoke(&text("c", "q")).await.unwrap();
    assert!(second.is_cached());

    assert_eq!(transport.calls(), 1);
    assert!(orch.cache().shared_degraded());
    assert!(orch.metrics().shared_cache_errors >= 1);
}

// ============================================================================
// Streaming
// ============================================================================

#[tokio::test]
async fn stream_delivers_chunks_then_done() {
    let transport = EchoTransport::new();
    let orch = orchestrator(transport.clone(), 10);
    let request = text("c", "one two three");

    let events: Vec<StreamEvent> = orch.invoke_stream(&request).await.unwrap().collect().await;

    assert_eq!(
        events,
        vec![
            StreamEvent::Chunk(StreamChunk::new("one ")),
            StreamEvent::Chunk(StreamChunk::new("two ")),
            StreamEvent::Chunk(StreamChunk::new("three ")),
            StreamEvent::Done,
        ]
    );
    let snapshot = eventually(&orch, |m| m.streams_completed == 1).await;
    assert_eq!(snapshot.streams_started, 1);
    assert_eq!(snapshot.streams_completed, 1);
}

#[tokio::test]
async fn streams_bypass_the_cache() {
    let transport = EchoTransport::new();
    let orch = orchestrator(transport.clone(), 10);
    let request = text("c", "same prompt");

    for _ in 0..2 {
        let text = orch.invoke_stream(&request).await.unwrap().collect_text().await.unwrap();
        assert_eq!(text, "same prompt ");
    }

    assert_eq!(transport.stream_calls(), 2);
    assert_eq!(transport.calls(), 0);
    assert!(orch.cache().is_empty());
    assert_eq!(orch.metrics().cache_hits, 0);
}

#[tokio::test]
async fn streams_are_rate_limited() {
    let transport = EchoTransport::new();
    let orch = orchestrator(transport.clone(), 1);

    orch.invoke_stream(&text("c", "a")).await.unwrap();
    let err = orch.invoke_stream(&text("c", "b")).await.err().expect("rejected");

    assert!(matches!(err, HuginnError::RateLimitExceeded { .. }));
    assert_eq!(transport.stream_calls(), 1);
}

#[tokio::test]
async fn dropping_the_event_stream_cancels_upstream() {
    let (tx, cancelled) = oneshot::channel();
    let transport = EndlessTransport {
        cancelled: Mutex::new(Some(tx)),
    };
    let orch = Huginn::builder().transport(transport).build().unwrap();

    let mut events = orch.invoke_stream(&text("c", "forever")).await.unwrap();
    assert!(matches!(events.next().await, Some(StreamEvent::Chunk(_))));
    drop(events);

    tokio::time::timeout(Duration::from_secs(1), cancelled)
        .await
        .expect("upstream cancelled promptly")
        .expect("drop guard fired");

    let snapshot = eventually(&orch, |m| m.streams_cancelled == 1).await;
    assert_eq!(snapshot.streams_cancelled, 1);
}

// ============================================================================
// Trait object
// ============================================================================

#[tokio::test]
async fn orchestrator_works_behind_gateway_trait() {
    let transport = EchoTransport::new();
    let gateway: Arc<dyn Gateway> = Arc::new(orchestrator(transport, 10));

    let invocation = gateway.invoke(&text("c", "dyn")).await.unwrap();
    assert_eq!(invocation.response.text, "echo: dyn");

    let streamed = gateway
        .invoke_stream(&text("c", "dyn stream"))
        .await
        .unwrap()
        .collect_text()
        .await
        .unwrap();
    assert_eq!(streamed, "dyn stream ");
    assert_eq!(gateway.metrics().requests, 2);
}
