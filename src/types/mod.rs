//! Public types for the Huginn API.

mod request;
mod response;
mod stream;

pub use request::{ClientIdentity, InvokeRequest, OperationKind};
pub use response::{FinishReason, Invocation, ResponseSource, TerminalState, UpstreamResponse, Usage};
pub use stream::{SessionState, StreamChunk, StreamEvent};
