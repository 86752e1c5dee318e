//! Convenience re-exports for common usage.

pub use crate::accumulator::TurnAccumulator;
pub use crate::agent_loop::{AgentPipeline, TurnRequest};
pub use crate::config::PipelineConfig;
pub use crate::error::{PipelineError, Result};
pub use crate::fanout::{FanOut, NoFanOut, SessionBroker};
pub use crate::model::{ModelSpec, ProviderKind};
pub use crate::persist::{MemoryMessageStore, MessageStore, PersistedMessage};
pub use crate::tools::{AgentTool, Tool, ToolDispatcher};
pub use crate::transport::{AttributedTransport, HttpTransport};
pub use crate::types::{
    ContentPart, FinishReason, Role, StreamChunk, ToolCall, ToolDef, ToolResult, UnifiedMessage,
};
