//! Per-turn stream accumulation.
//!
//! A [`TurnAccumulator`] is constructed fresh for every user turn and owned
//! exclusively by the task running that turn. All bookkeeping lives in this
//! value; there is no process-wide accumulation state of any kind.
//!
//! The pending-call guard is the load-bearing rule here: a tool result is
//! only counted if its `call_id` matches a previously observed ready call
//! that has not already been resolved. Duplicate and out-of-band results are
//! dropped, so `completed_tool_results` can never exceed the set of calls
//! that actually happened.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::persist::PersistedMessage;
use crate::types::{Role, StreamChunk, ToolCall, ToolResult};

/// Hard ceiling on persisted tool results, whatever upstream does.
const RESULT_CAP: usize = 100;

pub struct TurnAccumulator {
    session_id: String,
    model_id: String,
    text: String,
    completed_tool_calls: Vec<ToolCall>,
    completed_tool_results: Vec<ToolResult>,
    pending_tool_calls: HashMap<String, ToolCall>,
}

impl TurnAccumulator {
    pub fn new(session_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            model_id: model_id.into(),
            text: String::new(),
            completed_tool_calls: Vec::new(),
            completed_tool_results: Vec::new(),
            pending_tool_calls: HashMap::new(),
        }
    }

    /// Record that the turn switched models (provider fallback), so the
    /// persisted row names the model that actually answered.
    pub fn set_model_id(&mut self, model_id: impl Into<String>) {
        self.model_id = model_id.into();
    }

    /// Apply one chunk, in arrival order.
    pub fn observe(&mut self, chunk: &StreamChunk) {
        match chunk {
            StreamChunk::TextDelta { text } => self.text.push_str(text),
            StreamChunk::ToolCallReady { id, name, input } => {
                let call = ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                };
                debug!(call_id = %id, tool = %name, "tool call pending");
                self.completed_tool_calls.push(call.clone());
                self.pending_tool_calls.insert(id.clone(), call);
            }
            StreamChunk::ToolResult { call_id, result } => {
                self.resolve(call_id, result.clone(), false);
            }
            StreamChunk::ToolError { call_id, error } => {
                self.resolve(call_id, serde_json::json!({ "error": error }), true);
            }
            // Start/delta chunks are display traffic; finish is the runner's
            // signal to persist.
            StreamChunk::ToolCallStart { .. }
            | StreamChunk::ToolInputDelta { .. }
            | StreamChunk::Finish { .. } => {}
        }
    }

    fn resolve(&mut self, call_id: &str, output: serde_json::Value, is_error: bool) {
        match self.pending_tool_calls.remove(call_id) {
            Some(call) => {
                debug!(call_id, tool = %call.name, is_error, "tool call resolved");
                self.completed_tool_results.push(ToolResult {
                    tool_call_id: call_id.to_string(),
                    tool_name: call.name,
                    output,
                    is_error,
                });
            }
            None => {
                debug!(call_id, "dropping result with no pending call");
            }
        }
    }

    /// Finalize into the row to insert, applying the corruption cap.
    pub fn into_persisted(mut self) -> PersistedMessage {
        let bound = (self.completed_tool_calls.len() * 2).min(RESULT_CAP);
        if self.completed_tool_results.len() > bound {
            warn!(
                session_id = %self.session_id,
                results = self.completed_tool_results.len(),
                bound,
                "corrupted tool-result accumulation, truncating before persist"
            );
            self.completed_tool_results.truncate(bound);
        }

        PersistedMessage::new(
            self.session_id,
            Role::Assistant,
            self.text,
            self.model_id,
            self.completed_tool_calls,
            self.completed_tool_results,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn ready(id: &str, name: &str) -> StreamChunk {
        StreamChunk::ToolCallReady {
            id: id.to_string(),
            name: name.to_string(),
            input: json!({}),
        }
    }

    fn result(call_id: &str) -> StreamChunk {
        StreamChunk::ToolResult {
            call_id: call_id.to_string(),
            result: json!({"ok": true}),
        }
    }

    #[test]
    fn text_deltas_accumulate_in_order() {
        let mut acc = TurnAccumulator::new("s1", "gpt-4o");
        acc.observe(&StreamChunk::TextDelta {
            text: "Hello, ".to_string(),
        });
        acc.observe(&StreamChunk::TextDelta {
            text: "world".to_string(),
        });
        let row = acc.into_persisted();
        assert_eq!(row.content, "Hello, world");
    }

    #[test]
    fn duplicate_results_are_counted_once() {
        let mut acc = TurnAccumulator::new("s1", "gpt-4o");
        acc.observe(&ready("c1", "search"));
        acc.observe(&result("c1"));
        acc.observe(&result("c1"));
        let row = acc.into_persisted();
        assert_eq!(row.tool_calls.len(), 1);
        assert_eq!(row.tool_results.len(), 1);
    }

    #[test]
    fn out_of_band_results_are_dropped() {
        let mut acc = TurnAccumulator::new("s1", "gpt-4o");
        acc.observe(&result("never-called"));
        acc.observe(&StreamChunk::ToolError {
            call_id: "also-never-called".to_string(),
            error: "boom".to_string(),
        });
        let row = acc.into_persisted();
        assert!(row.tool_results.is_empty());
    }

    #[test]
    fn errors_resolve_pending_calls_as_error_results() {
        let mut acc = TurnAccumulator::new("s1", "gpt-4o");
        acc.observe(&ready("c1", "search"));
        acc.observe(&StreamChunk::ToolError {
            call_id: "c1".to_string(),
            error: "boom".to_string(),
        });
        let row = acc.into_persisted();
        assert_eq!(row.tool_results.len(), 1);
        assert_eq!(row.tool_results[0]["is_error"], json!(true));
    }

    #[test]
    fn duplicate_tool_names_with_distinct_ids_both_count() {
        let mut acc = TurnAccumulator::new("s1", "gemini-2.0-flash");
        acc.observe(&ready("call_a", "search"));
        acc.observe(&ready("call_b", "search"));
        acc.observe(&result("call_a"));
        acc.observe(&result("call_b"));
        let row = acc.into_persisted();
        assert_eq!(row.tool_calls.len(), 2);
        assert_eq!(row.tool_results.len(), 2);
    }

    #[test]
    fn replaying_a_stream_into_a_fresh_accumulator_is_deterministic() {
        let chunks = vec![
            StreamChunk::TextDelta {
                text: "done".to_string(),
            },
            ready("c1", "search"),
            result("c1"),
            StreamChunk::Finish {
                reason: crate::types::FinishReason::Stop,
            },
        ];
        let run = |chunks: &[StreamChunk]| {
            let mut acc = TurnAccumulator::new("s1", "gpt-4o");
            for c in chunks {
                acc.observe(c);
            }
            acc.into_persisted()
        };
        let a = run(&chunks);
        let b = run(&chunks);
        assert_ne!(a.id, b.id); // two inserts, two rows
        assert_eq!(a.content, b.content);
        assert_eq!(a.tool_calls, b.tool_calls);
        assert_eq!(a.tool_results, b.tool_results);
    }

    #[test]
    fn pathological_result_volume_is_capped_before_persist() {
        let mut acc = TurnAccumulator::new("s1", "gpt-4o");
        acc.observe(&ready("c1", "search"));
        acc.observe(&ready("c2", "search"));
        acc.observe(&result("c1"));
        acc.observe(&result("c2"));
        // Simulate the historical corruption: results that bypassed the
        // pending guard.
        for i in 0..50 {
            acc.completed_tool_results.push(ToolResult {
                tool_call_id: format!("corrupt-{i}"),
                tool_name: "search".to_string(),
                output: json!({}),
                is_error: false,
            });
        }
        let row = acc.into_persisted();
        // min(2 calls * 2, 100) = 4
        assert_eq!(row.tool_results.len(), 4);
    }
}
