//! The request pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::cache::{CacheKey, CacheStore};
use crate::config::ModelDefaults;
use crate::rate_limit::{RateLimitConfig, RateLimiter};
use crate::stream::{EventStream, StreamRelay, StreamSession, event_channel};
use crate::telemetry::{self, MetricsSnapshot, Stats};
use crate::traits::Gateway;
use crate::types::{
    InvokeRequest, Invocation, OperationKind, ResponseSource, SessionState, TerminalState,
    UpstreamResponse,
};
use crate::upstream::{UpstreamAttempt, UpstreamClient};
use crate::{HuginnError, Result};

/// Composes admission, caching, upstream calls and stream relay.
///
/// Per request:
///
/// 1. compute the [`CacheKey`];
/// 2. charge the client's rate budget, rejecting with
///    [`HuginnError::RateLimitExceeded`] before any other work;
/// 3. for cacheable unary requests, serve a cache hit without touching
///    the upstream (the budget stays charged);
/// 4. otherwise call the upstream with retries and populate the cache on
///    success.
///
/// Streamed requests are admitted the same way and then handed to the
/// relay; they never read or populate the cache.
///
/// There is no lock around the pipeline: the rate limiter locks one
/// client's budget, the cache one shard.
pub struct Orchestrator {
    limiter: RateLimiter,
    cache: CacheStore,
    upstream: UpstreamClient,
    relay: StreamRelay,
    models: ModelDefaults,
    stream_buffer: usize,
    stats: Arc<Stats>,
}

impl Orchestrator {
    pub(crate) fn new(
        limiter: RateLimiter,
        cache: CacheStore,
        upstream: UpstreamClient,
        relay: StreamRelay,
        models: ModelDefaults,
        stream_buffer: usize,
    ) -> Self {
        Self {
            limiter,
            cache,
            upstream,
            relay,
            models,
            stream_buffer,
            stats: Arc::new(Stats::default()),
        }
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn rate_limit_config(&self) -> &RateLimitConfig {
        self.limiter.config()
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn upstream(&self) -> &UpstreamClient {
        &self.upstream
    }

    /// The model a request will run against.
    pub fn resolve_model(&self, request: &InvokeRequest) -> String {
        match &request.model {
            Some(model) => model.clone(),
            None => self.models.for_operation(request.operation).to_owned(),
        }
    }

    /// Cache key for `request` after model resolution.
    pub fn cache_key(&self, request: &InvokeRequest) -> CacheKey {
        CacheKey::for_request(request, &self.resolve_model(request))
    }

    /// Run a unary request through the pipeline.
    #[instrument(
        skip_all,
        fields(operation = request.operation.as_str(), identity = request.identity.as_str())
    )]
    pub async fn invoke(&self, request: &InvokeRequest) -> Result<Invocation> {
        let started = Instant::now();
        Stats::incr(&self.stats.requests);

        let model = self.resolve_model(request);
        let key = CacheKey::for_request(request, &model);

        self.admit(request, started)?;

        let cacheable = request.is_cacheable() && self.cache.is_enabled();
        if cacheable {
            if let Some(hit) = self.cache.get(&key).await {
                Stats::incr(&self.stats.cache_hits);
                metrics::counter!(telemetry::CACHE_HITS_TOTAL,
                    "operation" => request.operation.as_str(),
                    "tier" => hit.tier.as_str(),
                )
                .increment(1);
                debug!(key = %key, tier = hit.tier.as_str(), "cache hit");
                finish(request.operation, TerminalState::ReturnedCached, started);
                return Ok(Invocation {
                    response: UpstreamResponse::clone(&hit.value),
                    source: ResponseSource::Cache,
                    key,
                    attempts: 0,
                });
            }
            Stats::incr(&self.stats.cache_misses);
            metrics::counter!(telemetry::CACHE_MISSES_TOTAL,
                "operation" => request.operation.as_str(),
            )
            .increment(1);
        }

        let record = self.upstream.invoke_recorded(request, &model).await;
        self.record_attempts(&record.attempts);
        let attempts = record.attempts.len() as u32;

        match record.result {
            Ok(response) => {
                record_usage(&response);
                if cacheable {
                    self.cache.put_default(&key, response.clone()).await;
                }
                finish(request.operation, TerminalState::ReturnedOk, started);
                Ok(Invocation {
                    response,
                    source: ResponseSource::Upstream,
                    key,
                    attempts,
                })
            }
            Err(err) => {
                Stats::incr(&self.stats.upstream_failures);
                warn!(model = %model, attempts, error = %err, "upstream call failed");
                finish(request.operation, TerminalState::FailedUpstream, started);
                Err(err)
            }
        }
    }

    /// Admit a request and start relaying its stream.
    ///
    /// Only opening the stream is retried. The returned [`EventStream`]
    /// ends with a `Done` or `Error` event; dropping it early cancels the
    /// upstream call.
    #[instrument(
        skip_all,
        fields(operation = request.operation.as_str(), identity = request.identity.as_str())
    )]
    pub async fn invoke_stream(&self, request: &InvokeRequest) -> Result<EventStream> {
        let started = Instant::now();
        Stats::incr(&self.stats.requests);

        let model = self.resolve_model(request);
        self.admit(request, started)?;

        let record = self.upstream.invoke_stream(request, &model).await;
        self.record_attempts(&record.attempts);
        let upstream = match record.result {
            Ok(upstream) => upstream,
            Err(err) => {
                Stats::incr(&self.stats.upstream_failures);
                warn!(model = %model, error = %err, "failed to open upstream stream");
                finish(request.operation, TerminalState::FailedUpstream, started);
                return Err(err);
            }
        };

        let session = StreamSession::new(request.operation, upstream);
        let (sink, events) = event_channel(session.id(), self.stream_buffer);
        debug!(session = %session.id(), model = %model, "stream session opened");
        Stats::incr(&self.stats.streams_started);

        let relay = self.relay.clone();
        let stats = Arc::clone(&self.stats);
        tokio::spawn(async move {
            let outcome = relay.relay(session, sink).await;
            match outcome.state() {
                SessionState::Completed => Stats::incr(&stats.streams_completed),
                SessionState::Failed => Stats::incr(&stats.streams_failed),
                SessionState::Cancelled => Stats::incr(&stats.streams_cancelled),
                SessionState::Open => {}
            }
        });

        finish(request.operation, TerminalState::ReturnedOk, started);
        Ok(events)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            shared_cache_errors: self.cache.shared_errors(),
            ..self.stats.snapshot()
        }
    }

    fn admit(&self, request: &InvokeRequest, started: Instant) -> Result<()> {
        let admission = self.limiter.allow(&request.identity, request.cost);
        if admission.allowed {
            return Ok(());
        }
        Stats::incr(&self.stats.rate_limited);
        metrics::counter!(telemetry::RATE_LIMITED_TOTAL,
            "operation" => request.operation.as_str(),
        )
        .increment(1);
        finish(request.operation, TerminalState::RejectedRateLimit, started);
        Err(HuginnError::RateLimitExceeded {
            retry_after: admission.retry_after,
        })
    }

    fn record_attempts(&self, attempts: &[UpstreamAttempt]) {
        let made = attempts.len() as u64;
        Stats::add(&self.stats.upstream_attempts, made);
        Stats::add(&self.stats.upstream_retries, made.saturating_sub(1));
    }
}

fn finish(operation: OperationKind, state: TerminalState, started: Instant) {
    metrics::counter!(telemetry::REQUESTS_TOTAL,
        "operation" => operation.as_str(),
        "outcome" => state.as_str(),
    )
    .increment(1);
    metrics::histogram!(telemetry::REQUEST_DURATION_SECONDS,
        "operation" => operation.as_str(),
    )
    .record(started.elapsed().as_secs_f64());
}

fn record_usage(response: &UpstreamResponse) {
    if let Some(usage) = response.usage {
        metrics::counter!(telemetry::TOKENS_TOTAL, "direction" => "prompt")
            .increment(u64::from(usage.prompt_tokens));
        metrics::counter!(telemetry::TOKENS_TOTAL, "direction" => "completion")
            .increment(u64::from(usage.completion_tokens));
    }
}

#[async_trait]
impl Gateway for Orchestrator {
    async fn invoke(&self, request: &InvokeRequest) -> Result<Invocation> {
        Orchestrator::invoke(self, request).await
    }

    async fn invoke_stream(&self, request: &InvokeRequest) -> Result<EventStream> {
        Orchestrator::invoke_stream(self, request).await
    }

    fn metrics(&self) -> MetricsSnapshot {
        Orchestrator::metrics(self)
    }
}
