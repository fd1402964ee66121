//! Orchestrator and its builder

mod builder;
mod orchestrator;

pub use builder::{Huginn, OrchestratorBuilder};
pub use orchestrator::Orchestrator;
