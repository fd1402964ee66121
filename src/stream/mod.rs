//! Incremental relay of streamed upstream responses.
//!
//! A streamed call becomes a [`StreamSession`]: one upstream producer, one
//! consumer. [`StreamRelay`] pulls chunks and forwards each as soon as it
//! arrives, ending the session in exactly one of three ways:
//!
//! - the upstream finishes: a [`StreamEvent::Done`] is sent;
//! - the upstream fails mid-stream: a [`StreamEvent::Error`] marker is sent,
//!   never a silently truncated stream;
//! - the consumer goes away: the upstream stream is dropped at once, which
//!   cancels the backend call.
//!
//! Output already delivered is never retried or replaced, and streamed
//! responses are never cached.
//!
//! [`StreamEvent::Done`]: crate::types::StreamEvent::Done
//! [`StreamEvent::Error`]: crate::types::StreamEvent::Error

mod events;
mod relay;
mod session;

pub use events::{EventStream, event_channel};
pub use relay::{RelayOutcome, SinkClosed, StreamRelay, StreamSink, Termination};
pub use session::StreamSession;

use std::time::Duration;

use serde::Deserialize;

/// Default number of events buffered between relay and consumer.
///
/// A full buffer suspends the relay, which in turn stops pulling from the
/// upstream, so a slow consumer throttles the backend instead of growing
/// memory.
pub const DEFAULT_STREAM_BUFFER: usize = 64;

/// Streaming settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Events buffered per session. Default: 64.
    pub buffer: usize,
    /// Fail the session if the upstream sends nothing for this long.
    /// Default: none.
    #[serde(default, with = "crate::config::opt_millis", rename = "idle_timeout_ms")]
    pub idle_timeout: Option<Duration>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer: DEFAULT_STREAM_BUFFER,
            idle_timeout: None,
        }
    }
}

impl StreamConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffer(mut self, n: usize) -> Self {
        self.buffer = n.max(1);
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }
}
