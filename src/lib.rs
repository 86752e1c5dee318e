//! Tycho — streaming agent pipeline for multi-provider LLM chat.
//!
//! Normalizes three provider wire formats (OpenAI chat/completions and
//! responses, Anthropic messages, Google generateContent) into one message
//! model and one chunk vocabulary, runs a bounded tool-calling agent loop
//! over them, accumulates each turn's stream into a single persisted row,
//! and fans every chunk out to the session's other participants.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use futures::StreamExt;
//! use tycho::prelude::*;
//!
//! # async fn example() -> tycho::error::Result<()> {
//! let pipeline = AgentPipeline::new(
//!     Arc::new(HttpTransport::from_env()),
//!     Arc::new(NoFanOut),
//!     Arc::new(MemoryMessageStore::new()),
//!     PipelineConfig::from_env(),
//! );
//! let request = TurnRequest::new("session-1", "customer-1", "openai:gpt-4o".parse()?, "Hello!");
//! let mut chunks = pipeline.run(request);
//! while let Some(chunk) = chunks.next().await {
//!     println!("{:?}", chunk?);
//! }
//! # Ok(())
//! # }
//! ```

pub mod accumulator;
pub mod agent_loop;
pub mod config;
pub mod error;
pub mod fanout;
pub mod model;
pub mod persist;
pub mod prelude;
pub mod provider;
pub mod tools;
pub mod transport;
pub mod types;
pub mod util;
