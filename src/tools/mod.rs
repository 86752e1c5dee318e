//! Tool execution: the trait tools implement and the per-turn dispatcher.

mod dispatcher;
mod tool;

pub use dispatcher::ToolDispatcher;
pub use tool::{AgentTool, Tool};
