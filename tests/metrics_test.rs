//! Metrics emitted by the request pipeline.
//!
//! Uses `metrics_util::debugging::DebuggingRecorder` to capture and assert
//! on emitted metrics without needing a real exporter.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use metrics_util::MetricKind;
use metrics_util::debugging::{DebugValue, DebuggingRecorder};

use huginn::upstream::{ChunkStream, TransportResult};
use huginn::{
    BackoffPolicy, ClientIdentity, FailureKind, Huginn, InvokeRequest, OperationKind,
    Orchestrator, RateLimitConfig, UpstreamFailure, UpstreamResponse, UpstreamTransport, Usage,
    telemetry,
};

// ============================================================================
// Mock transports
// ============================================================================

struct OkTransport;

#[async_trait]
impl UpstreamTransport for OkTransport {
    fn name(&self) -> &str {
        "ok"
    }

    async fn call(&self, _request: &InvokeRequest, model: &str) -> TransportResult<UpstreamResponse> {
        Ok(UpstreamResponse::new("fine", model).with_usage(Usage {
            prompt_tokens: 3,
            completion_tokens: 5,
            total_tokens: 8,
        }))
    }

    async fn call_stream(&self, _request: &InvokeRequest, _model: &str) -> TransportResult<ChunkStream> {
        Ok(Box::pin(futures_util::stream::empty()))
    }
}

struct DownTransport;

#[async_trait]
impl UpstreamTransport for DownTransport {
    fn name(&self) -> &str {
        "down"
    }

    async fn call(&self, _request: &InvokeRequest, _model: &str) -> TransportResult<UpstreamResponse> {
        Err(UpstreamFailure::new(FailureKind::Unavailable, "503"))
    }

    async fn call_stream(&self, _request: &InvokeRequest, _model: &str) -> TransportResult<ChunkStream> {
        Err(UpstreamFailure::new(FailureKind::Unavailable, "503"))
    }
}

// ============================================================================
// Snapshot type alias for readability
// ============================================================================

type SnapshotVec = Vec<(
    metrics_util::CompositeKey,
    Option<metrics::Unit>,
    Option<metrics::SharedString>,
    DebugValue,
)>;

// ============================================================================
// Helpers
// ============================================================================

/// Sum all counter values matching a given metric name.
fn counter_total(snapshot: &SnapshotVec, name: &str) -> u64 {
    counter_where(snapshot, name, |_| true)
}

/// Sum counter values for `name` carrying `label = value`.
fn counter_labelled(snapshot: &SnapshotVec, name: &str, label: &str, value: &str) -> u64 {
    counter_where(snapshot, name, |key| {
        key.key()
            .labels()
            .any(|l| l.key() == label && l.value() == value)
    })
}

fn counter_where(
    snapshot: &SnapshotVec,
    name: &str,
    filter: impl Fn(&metrics_util::CompositeKey) -> bool,
) -> u64 {
    snapshot
        .iter()
        .filter(|(key, _, _, _)| key.kind() == MetricKind::Counter && key.key().name() == name)
        .filter(|(key, _, _, _)| filter(key))
        .map(|(_, _, _, value)| match value {
            DebugValue::Counter(v) => *v,
            _ => 0,
        })
        .sum()
}

/// Check if any histogram entries exist for a given metric name.
fn has_histogram(snapshot: &SnapshotVec, name: &str) -> bool {
    snapshot
        .iter()
        .any(|(key, _, _, _)| key.kind() == MetricKind::Histogram && key.key().name() == name)
}

/// Runs async code within a local recorder scope on the multi-thread runtime.
///
/// `block_in_place` ensures the sync `with_local_recorder` closure stays
/// on the current thread while `block_on` drives the inner async work.
fn recorded<F: Future>(work: F) -> (F::Output, SnapshotVec) {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    let output = metrics::with_local_recorder(&recorder, || {
        tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(work))
    });
    (output, snapshotter.snapshot().into_vec())
}

fn orchestrator(transport: impl UpstreamTransport + 'static, per_minute: u32) -> Orchestrator {
    Huginn::builder()
        .transport(transport)
        .rate_limit(RateLimitConfig::new().per_minute(per_minute))
        .retry(
            BackoffPolicy::new()
                .base_delay(Duration::from_millis(1))
                .jitter(false),
        )
        .build()
        .unwrap()
}

fn request() -> InvokeRequest {
    InvokeRequest::new(OperationKind::Text, ClientIdentity::new("m"))
        .params(serde_json::json!({ "prompt": "p" }))
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn upstream_then_cached_requests_record_metrics() {
    let orch = orchestrator(OkTransport, 10);

    let (results, snapshot) = recorded(async {
        let first = orch.invoke(&request()).await;
        let second = orch.invoke(&request()).await;
        (first, second)
    });
    assert!(results.0.is_ok());
    assert!(results.1.unwrap().is_cached());

    assert_eq!(counter_total(&snapshot, telemetry::REQUESTS_TOTAL), 2);
    assert_eq!(
        counter_labelled(&snapshot, telemetry::REQUESTS_TOTAL, "outcome", "returned_ok"),
        1
    );
    assert_eq!(
        counter_labelled(&snapshot, telemetry::REQUESTS_TOTAL, "outcome", "returned_cached"),
        1
    );
    assert_eq!(counter_total(&snapshot, telemetry::CACHE_MISSES_TOTAL), 1);
    assert_eq!(
        counter_labelled(&snapshot, telemetry::CACHE_HITS_TOTAL, "tier", "local"),
        1
    );
    assert_eq!(counter_total(&snapshot, telemetry::UPSTREAM_ATTEMPTS_TOTAL), 1);
    assert_eq!(
        counter_labelled(&snapshot, telemetry::TOKENS_TOTAL, "direction", "completion"),
        5
    );
    assert!(
        has_histogram(&snapshot, telemetry::REQUEST_DURATION_SECONDS),
        "expected a duration histogram entry"
    );
    assert!(has_histogram(&snapshot, telemetry::UPSTREAM_DURATION_SECONDS));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn rejected_request_records_rate_limit() {
    let orch = orchestrator(OkTransport, 1);

    let (result, snapshot) = recorded(async {
        let _ = orch.invoke(&request()).await;
        orch.invoke(&request()).await
    });
    assert!(result.is_err());

    assert_eq!(counter_total(&snapshot, telemetry::RATE_LIMITED_TOTAL), 1);
    assert_eq!(
        counter_labelled(
            &snapshot,
            telemetry::REQUESTS_TOTAL,
            "outcome",
            "rejected_rate_limit"
        ),
        1
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn failed_upstream_records_retries() {
    let orch = orchestrator(DownTransport, 10);

    let (result, snapshot) = recorded(orch.invoke(&request()));
    assert!(result.is_err());

    assert_eq!(counter_total(&snapshot, telemetry::UPSTREAM_ATTEMPTS_TOTAL), 3);
    assert_eq!(counter_total(&snapshot, telemetry::RETRIES_TOTAL), 2);
    assert_eq!(
        counter_labelled(&snapshot, telemetry::REQUESTS_TOTAL, "outcome", "failed_upstream"),
        1
    );
}

#[tokio::test]
async fn metrics_are_noop_without_recorder() {
    // Verify no panics when no recorder is installed.
    let orch = orchestrator(OkTransport, 10);
    orch.invoke(&request()).await.unwrap();
}
