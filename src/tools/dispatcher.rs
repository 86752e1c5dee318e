//! Concurrent tool dispatch with per-call isolation.
//!
//! The registry is built once per turn request and never mutated afterward;
//! every iteration of the loop sees the same tool set. Each ready call
//! produces exactly one `ToolResult` or `ToolError` chunk — a failing,
//! unknown, or timed-out tool feeds its error back to the model instead of
//! ending the turn.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::types::{StreamChunk, ToolCall, ToolDef, ToolResult};

use super::tool::Tool;

pub struct ToolDispatcher {
    tools: HashMap<String, Arc<dyn Tool>>,
    timeout: Duration,
}

impl ToolDispatcher {
    pub fn new(tools: Vec<Arc<dyn Tool>>, timeout: Duration) -> Self {
        let tools = tools
            .into_iter()
            .map(|t| (t.name().to_string(), t))
            .collect();
        Self { tools, timeout }
    }

    /// Provider-facing definitions for every registered tool.
    pub fn definitions(&self) -> Vec<ToolDef> {
        let mut defs: Vec<ToolDef> = self.tools.values().map(|t| t.definition()).collect();
        // Registry iteration order is arbitrary; keep request bodies stable.
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Execute a batch of ready calls concurrently.
    ///
    /// Results come back in call order regardless of completion order, as
    /// `(chunk, result)` pairs: the chunk for the output stream and the
    /// unified result for the next request's history.
    pub async fn dispatch(
        &self,
        calls: &[ToolCall],
        cancel: &CancellationToken,
    ) -> Vec<(StreamChunk, ToolResult)> {
        join_all(calls.iter().map(|call| self.dispatch_one(call, cancel))).await
    }

    async fn dispatch_one(
        &self,
        call: &ToolCall,
        cancel: &CancellationToken,
    ) -> (StreamChunk, ToolResult) {
        let outcome = self.execute_one(call, cancel).await;
        match outcome {
            Ok(output) => {
                debug!(tool = %call.name, call_id = %call.id, "tool call succeeded");
                (
                    StreamChunk::ToolResult {
                        call_id: call.id.clone(),
                        result: output.clone(),
                    },
                    ToolResult {
                        tool_call_id: call.id.clone(),
                        tool_name: call.name.clone(),
                        output,
                        is_error: false,
                    },
                )
            }
            Err(e) => {
                warn!(tool = %call.name, call_id = %call.id, error = %e, "tool call failed");
                let message = e.to_string();
                (
                    StreamChunk::ToolError {
                        call_id: call.id.clone(),
                        error: message.clone(),
                    },
                    ToolResult {
                        tool_call_id: call.id.clone(),
                        tool_name: call.name.clone(),
                        output: json!({ "error": message }),
                        is_error: true,
                    },
                )
            }
        }
    }

    async fn execute_one(
        &self,
        call: &ToolCall,
        cancel: &CancellationToken,
    ) -> crate::error::Result<serde_json::Value> {
        let tool = self.tools.get(&call.name).ok_or_else(|| {
            PipelineError::ToolExecution {
                tool_name: call.name.clone(),
                message: format!("unknown tool '{}'", call.name),
            }
        })?;

        tokio::select! {
            _ = cancel.cancelled() => Err(PipelineError::ToolExecution {
                tool_name: call.name.clone(),
                message: "execution cancelled".to_string(),
            }),
            result = tokio::time::timeout(self.timeout, tool.execute(&call.input)) => {
                match result {
                    Ok(Ok(output)) => Ok(output),
                    Ok(Err(e)) => Err(PipelineError::ToolExecution {
                        tool_name: call.name.clone(),
                        message: e.to_string(),
                    }),
                    Err(_) => Err(PipelineError::Timeout(self.timeout.as_millis() as u64)),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::AgentTool;
    use pretty_assertions::assert_eq;
    use serde_json::Value;

    fn echo_tool() -> Arc<dyn Tool> {
        Arc::new(AgentTool::new(
            "echo",
            "Echo the input back",
            json!({"type": "object"}),
            |input: Value| async move { Ok(input) },
        ))
    }

    fn failing_tool() -> Arc<dyn Tool> {
        Arc::new(AgentTool::new(
            "boom",
            "Always fails",
            json!({"type": "object"}),
            |_| async {
                Err(PipelineError::ToolExecution {
                    tool_name: "boom".to_string(),
                    message: "exploded".to_string(),
                })
            },
        ))
    }

    fn call(id: &str, name: &str) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            input: json!({"n": 1}),
        }
    }

    #[tokio::test]
    async fn every_call_yields_exactly_one_chunk_in_call_order() {
        let dispatcher = ToolDispatcher::new(
            vec![echo_tool(), failing_tool()],
            Duration::from_secs(5),
        );
        let cancel = CancellationToken::new();
        let results = dispatcher
            .dispatch(
                &[call("c1", "echo"), call("c2", "boom"), call("c3", "nope")],
                &cancel,
            )
            .await;

        assert_eq!(results.len(), 3);
        assert_eq!(
            results[0].0,
            StreamChunk::ToolResult {
                call_id: "c1".to_string(),
                result: json!({"n": 1}),
            }
        );
        assert!(matches!(
            &results[1].0,
            StreamChunk::ToolError { call_id, .. } if call_id == "c2"
        ));
        assert!(results[1].1.is_error);
        assert!(matches!(
            &results[2].0,
            StreamChunk::ToolError { call_id, error } if call_id == "c3" && error.contains("unknown tool")
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_tools_time_out_without_ending_the_batch() {
        let slow: Arc<dyn Tool> = Arc::new(AgentTool::new(
            "slow",
            "Sleeps forever",
            json!({"type": "object"}),
            |_| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(json!({}))
            },
        ));
        let dispatcher = ToolDispatcher::new(vec![slow, echo_tool()], Duration::from_millis(100));
        let cancel = CancellationToken::new();
        let results = dispatcher
            .dispatch(&[call("c1", "slow"), call("c2", "echo")], &cancel)
            .await;

        assert!(matches!(&results[0].0, StreamChunk::ToolError { .. }));
        assert!(matches!(&results[1].0, StreamChunk::ToolResult { .. }));
    }

    #[tokio::test]
    async fn cancellation_resolves_pending_calls_as_errors() {
        let dispatcher = ToolDispatcher::new(
            vec![Arc::new(AgentTool::new(
                "wait",
                "Waits",
                json!({"type": "object"}),
                |_| async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(json!({}))
                },
            )) as Arc<dyn Tool>],
            Duration::from_secs(7200),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let results = dispatcher.dispatch(&[call("c1", "wait")], &cancel).await;
        assert!(matches!(
            &results[0].0,
            StreamChunk::ToolError { error, .. } if error.contains("cancelled")
        ));
    }

    #[test]
    fn definitions_are_sorted_by_name() {
        let dispatcher = ToolDispatcher::new(
            vec![failing_tool(), echo_tool()],
            Duration::from_secs(5),
        );
        let names: Vec<String> = dispatcher
            .definitions()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["boom".to_string(), "echo".to_string()]);
    }
}
