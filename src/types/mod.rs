//! Core data types shared across the pipeline.

pub mod message;
pub mod stream;

pub use message::{
    ContentPart, FileContent, ImageContent, Role, ToolCall, ToolDef, ToolResult, UnifiedMessage,
};
pub use stream::{FinishReason, StreamChunk};
