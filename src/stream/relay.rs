use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::StreamSession;
use crate::error::UpstreamFailure;
use crate::telemetry;
use crate::types::{SessionState, StreamEvent};

/// The consumer is gone; nothing more can be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("stream consumer disconnected")]
pub struct SinkClosed;

/// Consumer side of a stream session.
#[async_trait]
pub trait StreamSink: Send + Sync {
    /// Deliver one event, waiting for capacity if the consumer is behind.
    async fn send(&mut self, event: StreamEvent) -> Result<(), SinkClosed>;

    /// Resolves once the consumer has disconnected.
    async fn closed(&self);
}

#[async_trait]
impl StreamSink for mpsc::Sender<StreamEvent> {
    async fn send(&mut self, event: StreamEvent) -> Result<(), SinkClosed> {
        mpsc::Sender::send(self, event).await.map_err(|_| SinkClosed)
    }

    async fn closed(&self) {
        mpsc::Sender::closed(self).await;
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Termination {
    Completed,
    UpstreamFailed(UpstreamFailure),
    ConsumerDisconnected,
}

impl Termination {
    pub fn state(&self) -> SessionState {
        match self {
            Self::Completed => SessionState::Completed,
            Self::UpstreamFailed(_) => SessionState::Failed,
            Self::ConsumerDisconnected => SessionState::Cancelled,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::UpstreamFailed(_) => "failed",
            Self::ConsumerDisconnected => "cancelled",
        }
    }
}

/// Summary of a finished session.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayOutcome {
    pub session_id: Uuid,
    pub termination: Termination,
    /// Chunks delivered to the consumer.
    pub chunks: u64,
}

impl RelayOutcome {
    pub fn state(&self) -> SessionState {
        self.termination.state()
    }
}

/// Forwards upstream chunks to a sink as they arrive.
#[derive(Debug, Clone, Default)]
pub struct StreamRelay {
    idle_timeout: Option<Duration>,
}

impl StreamRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Treat an upstream silent for `timeout` as failed.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Run `session` to completion against `sink`.
    ///
    /// A consumer disconnect is noticed while waiting on the upstream as
    /// well as while delivering, so the upstream is dropped within one
    /// relay cycle either way.
    pub async fn relay<S: StreamSink>(&self, session: StreamSession, mut sink: S) -> RelayOutcome {
        let session_id = session.id();
        let operation = session.operation();
        let mut upstream = session.upstream;
        let mut chunks = 0u64;

        let termination = loop {
            let next = tokio::select! {
                biased;
                () = sink.closed() => break Termination::ConsumerDisconnected,
                next = next_with_idle_limit(&mut upstream, self.idle_timeout) => next,
            };

            let event = match next {
                Some(Ok(chunk)) => StreamEvent::Chunk(chunk),
                Some(Err(failure)) => {
                    let marker = StreamEvent::Error(failure.clone());
                    if sink.send(marker).await.is_err() {
                        break Termination::ConsumerDisconnected;
                    }
                    break Termination::UpstreamFailed(failure);
                }
                None => {
                    if sink.send(StreamEvent::Done).await.is_err() {
                        break Termination::ConsumerDisconnected;
                    }
                    break Termination::Completed;
                }
            };

            if sink.send(event).await.is_err() {
                break Termination::ConsumerDisconnected;
            }
            chunks += 1;
        };

        // Cancels any backend work still in flight.
        drop(upstream);

        metrics::counter!(telemetry::STREAMS_TOTAL, "outcome" => termination.label()).increment(1);
        match &termination {
            Termination::UpstreamFailed(failure) => warn!(
                session = %session_id,
                operation = operation.as_str(),
                chunks,
                error = %failure,
                "upstream stream failed"
            ),
            _ => debug!(
                session = %session_id,
                operation = operation.as_str(),
                chunks,
                outcome = termination.label(),
                "stream session ended"
            ),
        }

        RelayOutcome {
            session_id,
            termination,
            chunks,
        }
    }
}

async fn next_with_idle_limit(
    upstream: &mut crate::upstream::ChunkStream,
    idle_timeout: Option<Duration>,
) -> Option<Result<crate::types::StreamChunk, UpstreamFailure>> {
    match idle_timeout {
        None => upstream.next().await,
        Some(limit) => match tokio::time::timeout(limit, upstream.next()).await {
            Ok(next) => next,
            Err(_) => Some(Err(UpstreamFailure::timeout(format!(
                "no data from upstream for {limit:?}"
            )))),
        },
    }
}
