//! The agent loop: bounded multi-turn orchestration of model calls and tool
//! dispatch for one user turn.

mod runner;
mod types;

pub use runner::AgentPipeline;
pub use types::{TurnPhase, TurnRequest};
