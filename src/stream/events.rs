use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::{Stream, StreamExt};
use pin_project_lite::pin_project;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::types::StreamEvent;
use crate::{HuginnError, Result};

pin_project! {
    /// Consumer end of a stream session.
    ///
    /// Yields chunk events followed by one terminal event. Dropping it
    /// disconnects the consumer and cancels the upstream call.
    pub struct EventStream {
        session_id: Uuid,
        #[pin]
        inner: ReceiverStream<StreamEvent>,
    }
}

impl EventStream {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Drain the stream into one string, for callers that cannot stream.
    ///
    /// Fails with [`HuginnError::Stream`] if the upstream failed or the
    /// session ended without a terminal event.
    pub async fn collect_text(mut self) -> Result<String> {
        let mut text = String::new();
        while let Some(event) = self.next().await {
            match event {
                StreamEvent::Chunk(chunk) => text.push_str(&chunk.text),
                StreamEvent::Done => return Ok(text),
                StreamEvent::Error(failure) => return Err(HuginnError::Stream(failure.to_string())),
            }
        }
        Err(HuginnError::Stream(
            "stream ended without a terminal event".into(),
        ))
    }
}

impl Stream for EventStream {
    type Item = StreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamEvent>> {
        self.project().inner.poll_next(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

/// Bounded channel between a relay and its consumer.
pub fn event_channel(session_id: Uuid, buffer: usize) -> (mpsc::Sender<StreamEvent>, EventStream) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    let stream = EventStream {
        session_id,
        inner: ReceiverStream::new(rx),
    };
    (tx, stream)
}
