//! Streaming types — one incremental unit of model or tool output, uniform
//! across providers.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// One logical event in the turn's output stream.
///
/// The serde tags double as the outbound SSE event vocabulary, so the HTTP
/// layer can re-serialize a chunk without renaming anything.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamChunk {
    /// Incremental assistant text.
    TextDelta { text: String },
    /// A tool call has started streaming; its input is not yet complete.
    #[serde(rename = "tool-input-start")]
    ToolCallStart { id: String, name: String },
    /// A fragment of a tool call's JSON input.
    ToolInputDelta { id: String, partial_json: String },
    /// A tool call whose full input is known. Only now may it be dispatched.
    ToolCallReady {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    /// Output of a dispatched tool.
    #[serde(rename = "tool-output-available")]
    ToolResult {
        call_id: String,
        result: serde_json::Value,
    },
    /// A dispatched tool failed; the model sees the error and may recover.
    ToolError { call_id: String, error: String },
    /// Terminal signal for the logical stream.
    Finish { reason: FinishReason },
}

/// Why a turn finished, normalized across providers.
///
/// Unknown upstream reasons map to `Other`, never an error.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Error,
    Other,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_tags_match_sse_vocabulary() {
        let cases = [
            (
                StreamChunk::TextDelta {
                    text: "hi".to_string(),
                },
                "text-delta",
            ),
            (
                StreamChunk::ToolCallStart {
                    id: "c1".to_string(),
                    name: "get_weather".to_string(),
                },
                "tool-input-start",
            ),
            (
                StreamChunk::ToolResult {
                    call_id: "c1".to_string(),
                    result: serde_json::json!({"ok": true}),
                },
                "tool-output-available",
            ),
            (
                StreamChunk::Finish {
                    reason: FinishReason::Stop,
                },
                "finish",
            ),
        ];
        for (chunk, tag) in cases {
            let v = serde_json::to_value(&chunk).unwrap();
            assert_eq!(v["type"], tag);
        }
    }

    #[test]
    fn finish_reason_round_trips_through_serde() {
        let v = serde_json::to_value(FinishReason::ToolCalls).unwrap();
        assert_eq!(v, "tool-calls");
        let back: FinishReason = serde_json::from_value(v).unwrap();
        assert_eq!(back, FinishReason::ToolCalls);
    }
}
