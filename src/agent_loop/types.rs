//! Request and state types for the agent loop.

use std::sync::Arc;

use strum::Display;
use tokio_util::sync::CancellationToken;

use crate::model::ModelSpec;
use crate::tools::Tool;
use crate::types::UnifiedMessage;

/// One user turn, submitted to [`AgentPipeline::run`](super::AgentPipeline::run).
pub struct TurnRequest {
    /// Session the turn belongs to; also the fan-out channel key.
    pub session_id: String,
    /// Customer the provider calls are billed to.
    pub customer_id: String,
    pub model: ModelSpec,
    /// Prior conversation, oldest first.
    pub history: Vec<UnifiedMessage>,
    pub user_message: UnifiedMessage,
    pub tools: Vec<Arc<dyn Tool>>,
    /// Cooperative abort signal, checked at iteration boundaries.
    pub cancel: CancellationToken,
}

impl TurnRequest {
    pub fn new(
        session_id: impl Into<String>,
        customer_id: impl Into<String>,
        model: ModelSpec,
        user_text: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            customer_id: customer_id.into(),
            model,
            history: Vec::new(),
            user_message: UnifiedMessage::user(user_text),
            tools: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_history(mut self, history: Vec<UnifiedMessage>) -> Self {
        self.history = history;
        self
    }

    pub fn with_tools(mut self, tools: Vec<Arc<dyn Tool>>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Phases of one user turn, for tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum TurnPhase {
    CallingModel,
    ExecutingTools,
    Finishing,
}
