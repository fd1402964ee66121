use std::fmt;

use uuid::Uuid;

use crate::types::OperationKind;
use crate::upstream::ChunkStream;

/// One in-flight streamed response.
///
/// Owns the upstream side of the stream; consuming the session in
/// [`StreamRelay::relay`](super::StreamRelay::relay) drops it when the
/// session ends. How it ended is reported by the returned
/// [`RelayOutcome`](super::RelayOutcome).
pub struct StreamSession {
    id: Uuid,
    operation: OperationKind,
    pub(crate) upstream: ChunkStream,
}

impl StreamSession {
    pub fn new(operation: OperationKind, upstream: ChunkStream) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation,
            upstream,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn operation(&self) -> OperationKind {
        self.operation
    }
}

impl fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSession")
            .field("id", &self.id)
            .field("operation", &self.operation)
            .finish_non_exhaustive()
    }
}
