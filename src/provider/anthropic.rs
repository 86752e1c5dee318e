//! Anthropic Messages adapter.
//!
//! Wire quirks bridged here: system messages hoist to a top-level `system`
//! array of text blocks (original order preserved), tool-call input travels
//! as a parsed object, and tool results must live inside `user`-role content
//! blocks — appended to the previous user message when there is one.

use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{json, Value};

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::model::{ModelSpec, ProviderKind};
use crate::types::{
    ContentPart, FileContent, FinishReason, ImageContent, Role, StreamChunk, ToolCall, ToolDef,
    ToolResult, UnifiedMessage,
};

use super::openai::parse_arguments;
use super::{EncodedRequest, EventDecoder, ProviderAdapter};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicAdapter {
    model: ModelSpec,
}

impl AnthropicAdapter {
    pub fn new(model: ModelSpec) -> Self {
        Self { model }
    }
}

impl ProviderAdapter for AnthropicAdapter {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn encode_request(
        &self,
        messages: &[UnifiedMessage],
        tools: &[ToolDef],
        config: &PipelineConfig,
    ) -> Result<EncodedRequest, PipelineError> {
        let mut system_blocks: Vec<Value> = Vec::new();
        let mut wire_messages: Vec<Value> = Vec::new();

        for msg in messages {
            match msg.role {
                Role::System => {
                    system_blocks.push(json!({ "type": "text", "text": msg.text() }));
                }
                Role::User => {
                    wire_messages.push(json!({
                        "role": "user",
                        "content": encode_user_blocks(&msg.content),
                    }));
                }
                Role::Assistant => {
                    wire_messages.push(json!({
                        "role": "assistant",
                        "content": encode_assistant_blocks(&msg.content),
                    }));
                }
                Role::Tool => {
                    let blocks: Vec<Value> = msg
                        .content
                        .iter()
                        .filter_map(|part| match part {
                            ContentPart::ToolResult(tr) => Some(json!({
                                "type": "tool_result",
                                "tool_use_id": tr.tool_call_id,
                                "content": tr.output.to_string(),
                                "is_error": tr.is_error,
                            })),
                            _ => None,
                        })
                        .collect();
                    append_to_user_message(&mut wire_messages, blocks);
                }
            }
        }

        let mut body = json!({
            "model": self.model.model_id,
            "messages": wire_messages,
            "max_tokens": DEFAULT_MAX_TOKENS,
            "stream": true,
        });
        let obj = body.as_object_mut().expect("body is an object");

        if !system_blocks.is_empty() {
            obj.insert("system".into(), system_blocks.into());
        }
        if !tools.is_empty() {
            let tool_defs: Vec<Value> = tools
                .iter()
                .map(|t| {
                    let mut def = json!({
                        "name": t.name,
                        "input_schema": t.input_schema,
                    });
                    if let Some(ref description) = t.description {
                        def.as_object_mut()
                            .expect("def is an object")
                            .insert("description".into(), description.clone().into());
                    }
                    def
                })
                .collect();
            obj.insert("tools".into(), tool_defs.into());
        }

        let mut extra_headers = HeaderMap::new();
        extra_headers.insert("anthropic-version", HeaderValue::from_static(API_VERSION));

        let base = config
            .get_base_url("anthropic")
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Ok(EncodedRequest {
            provider: ProviderKind::Anthropic,
            url: format!("{base}/messages"),
            extra_headers,
            body,
        })
    }

    fn decode_request(&self, body: &Value) -> Result<Vec<UnifiedMessage>, PipelineError> {
        let mut messages: Vec<UnifiedMessage> = Vec::new();

        if let Some(Value::Array(system_blocks)) = body.get("system") {
            for block in system_blocks {
                let text = block.get("text").and_then(|t| t.as_str()).unwrap_or("");
                messages.push(UnifiedMessage::system(text));
            }
        }

        let wire_messages = body
            .get("messages")
            .and_then(|m| m.as_array())
            .ok_or_else(|| PipelineError::Stream("missing messages array".to_string()))?;

        for wire in wire_messages {
            let role = wire.get("role").and_then(|r| r.as_str()).unwrap_or("");
            match role {
                "user" => decode_user_message(wire, &mut messages),
                "assistant" => messages.push(decode_assistant_message(wire)),
                other => {
                    return Err(PipelineError::Stream(format!(
                        "unexpected wire role '{other}'"
                    )))
                }
            }
        }
        Ok(messages)
    }

    fn decoder(&self) -> Box<dyn EventDecoder> {
        Box::new(AnthropicDecoder::default())
    }
}

/// Tool-result grouping rule: if the previous encoded message is already a
/// user message, append the blocks; otherwise create one.
fn append_to_user_message(wire_messages: &mut Vec<Value>, blocks: Vec<Value>) {
    if blocks.is_empty() {
        return;
    }
    if let Some(last) = wire_messages.last_mut() {
        if last.get("role").and_then(|r| r.as_str()) == Some("user") {
            if let Some(Value::Array(content)) = last.get_mut("content") {
                content.extend(blocks);
                return;
            }
        }
    }
    wire_messages.push(json!({ "role": "user", "content": blocks }));
}

fn encode_user_blocks(parts: &[ContentPart]) -> Vec<Value> {
    parts
        .iter()
        .filter_map(|part| match part {
            ContentPart::Text { text } => Some(json!({ "type": "text", "text": text })),
            ContentPart::Image(img) => Some(json!({
                "type": "image",
                "source": {
                    "type": "base64",
                    "media_type": img.media_type,
                    "data": img.data,
                }
            })),
            ContentPart::File(file) => Some(json!({
                "type": "document",
                "source": {
                    "type": "base64",
                    "media_type": file.media_type,
                    "data": file.data,
                },
                "title": file.filename,
            })),
            _ => None,
        })
        .collect()
}

fn encode_assistant_blocks(parts: &[ContentPart]) -> Vec<Value> {
    parts
        .iter()
        .filter_map(|part| match part {
            ContentPart::Text { text } if !text.is_empty() => {
                Some(json!({ "type": "text", "text": text }))
            }
            ContentPart::ToolCall(tc) => Some(json!({
                "type": "tool_use",
                "id": tc.id,
                "name": tc.name,
                "input": tc.input,
            })),
            ContentPart::Reasoning {
                text,
                signature: Some(signature),
            } => Some(json!({
                "type": "thinking",
                "thinking": text,
                "signature": signature,
            })),
            _ => None,
        })
        .collect()
}

fn decode_user_message(wire: &Value, messages: &mut Vec<UnifiedMessage>) {
    let blocks = match wire.get("content") {
        Some(Value::Array(blocks)) => blocks.as_slice(),
        Some(Value::String(text)) => {
            messages.push(UnifiedMessage::user(text.clone()));
            return;
        }
        _ => return,
    };

    // A merged wire message holds user blocks and tool_result blocks;
    // consecutive runs of each kind fold back into separate messages.
    let mut user_parts: Vec<ContentPart> = Vec::new();
    let mut tool_parts: Vec<ToolResult> = Vec::new();
    let flush_user = |parts: &mut Vec<ContentPart>, messages: &mut Vec<UnifiedMessage>| {
        if !parts.is_empty() {
            messages.push(UnifiedMessage {
                role: Role::User,
                content: std::mem::take(parts),
            });
        }
    };
    let flush_tool = |parts: &mut Vec<ToolResult>, messages: &mut Vec<UnifiedMessage>| {
        if !parts.is_empty() {
            messages.push(UnifiedMessage::tool_results(std::mem::take(parts)));
        }
    };

    for block in blocks {
        match block.get("type").and_then(|t| t.as_str()) {
            Some("tool_result") => {
                flush_user(&mut user_parts, messages);
                let raw = block.get("content").and_then(|c| c.as_str()).unwrap_or("");
                let output: Value =
                    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
                tool_parts.push(ToolResult {
                    tool_call_id: block
                        .get("tool_use_id")
                        .and_then(|i| i.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    tool_name: String::new(),
                    output,
                    is_error: block
                        .get("is_error")
                        .and_then(|e| e.as_bool())
                        .unwrap_or(false),
                });
            }
            Some("text") => {
                flush_tool(&mut tool_parts, messages);
                user_parts.push(ContentPart::Text {
                    text: block
                        .get("text")
                        .and_then(|t| t.as_str())
                        .unwrap_or("")
                        .to_string(),
                });
            }
            Some("image") => {
                flush_tool(&mut tool_parts, messages);
                user_parts.push(ContentPart::Image(ImageContent {
                    data: block
                        .pointer("/source/data")
                        .and_then(|d| d.as_str())
                        .unwrap_or("")
                        .to_string(),
                    media_type: block
                        .pointer("/source/media_type")
                        .and_then(|m| m.as_str())
                        .unwrap_or("")
                        .to_string(),
                }));
            }
            Some("document") => {
                flush_tool(&mut tool_parts, messages);
                user_parts.push(ContentPart::File(FileContent {
                    data: block
                        .pointer("/source/data")
                        .and_then(|d| d.as_str())
                        .unwrap_or("")
                        .to_string(),
                    media_type: block
                        .pointer("/source/media_type")
                        .and_then(|m| m.as_str())
                        .unwrap_or("")
                        .to_string(),
                    filename: block
                        .get("title")
                        .and_then(|t| t.as_str())
                        .unwrap_or("")
                        .to_string(),
                }));
            }
            _ => {}
        }
    }
    flush_user(&mut user_parts, messages);
    flush_tool(&mut tool_parts, messages);
}

fn decode_assistant_message(wire: &Value) -> UnifiedMessage {
    let mut content = Vec::new();
    match wire.get("content") {
        Some(Value::String(text)) => content.push(ContentPart::Text { text: text.clone() }),
        Some(Value::Array(blocks)) => {
            for block in blocks {
                match block.get("type").and_then(|t| t.as_str()) {
                    Some("text") => content.push(ContentPart::Text {
                        text: block
                            .get("text")
                            .and_then(|t| t.as_str())
                            .unwrap_or("")
                            .to_string(),
                    }),
                    Some("tool_use") => content.push(ContentPart::ToolCall(ToolCall {
                        id: block
                            .get("id")
                            .and_then(|i| i.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        name: block
                            .get("name")
                            .and_then(|n| n.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        input: block.get("input").cloned().unwrap_or(json!({})),
                    })),
                    Some("thinking") => content.push(ContentPart::Reasoning {
                        text: block
                            .get("thinking")
                            .and_then(|t| t.as_str())
                            .unwrap_or("")
                            .to_string(),
                        signature: block
                            .get("signature")
                            .and_then(|s| s.as_str())
                            .map(|s| s.to_string()),
                    }),
                    _ => {}
                }
            }
        }
        _ => {}
    }
    UnifiedMessage {
        role: Role::Assistant,
        content,
    }
}

fn map_stop_reason(reason: &str) -> FinishReason {
    match reason {
        "end_turn" | "stop_sequence" => FinishReason::Stop,
        "max_tokens" => FinishReason::Length,
        "tool_use" => FinishReason::ToolCalls,
        "refusal" => FinishReason::ContentFilter,
        _ => FinishReason::Other,
    }
}

struct CurrentTool {
    id: String,
    name: String,
    input: String,
}

/// Incremental decoder for Messages API SSE events. Content blocks arrive
/// strictly sequentially; `input_json_delta` fragments accumulate until the
/// block's stop event.
#[derive(Default)]
struct AnthropicDecoder {
    current_tool: Option<CurrentTool>,
    saw_tool_use: bool,
    finished: bool,
}

impl EventDecoder for AnthropicDecoder {
    fn decode_event(&mut self, data: &str) -> Vec<StreamChunk> {
        let Ok(event) = serde_json::from_str::<Value>(data) else {
            return Vec::new();
        };
        let event_type = event.get("type").and_then(|t| t.as_str()).unwrap_or("");
        let mut chunks = Vec::new();

        match event_type {
            "content_block_start" => {
                if let Some(block) = event.get("content_block") {
                    if block.get("type").and_then(|t| t.as_str()) == Some("tool_use") {
                        let id = block
                            .get("id")
                            .and_then(|i| i.as_str())
                            .unwrap_or_default()
                            .to_string();
                        let name = block
                            .get("name")
                            .and_then(|n| n.as_str())
                            .unwrap_or_default()
                            .to_string();
                        chunks.push(StreamChunk::ToolCallStart {
                            id: id.clone(),
                            name: name.clone(),
                        });
                        self.current_tool = Some(CurrentTool {
                            id,
                            name,
                            input: String::new(),
                        });
                    }
                }
            }
            "content_block_delta" => {
                if let Some(delta) = event.get("delta") {
                    match delta.get("type").and_then(|t| t.as_str()) {
                        Some("text_delta") => {
                            if let Some(text) = delta.get("text").and_then(|t| t.as_str()) {
                                chunks.push(StreamChunk::TextDelta {
                                    text: text.to_string(),
                                });
                            }
                        }
                        Some("input_json_delta") => {
                            if let (Some(tool), Some(fragment)) = (
                                self.current_tool.as_mut(),
                                delta.get("partial_json").and_then(|j| j.as_str()),
                            ) {
                                if !fragment.is_empty() {
                                    tool.input.push_str(fragment);
                                    chunks.push(StreamChunk::ToolInputDelta {
                                        id: tool.id.clone(),
                                        partial_json: fragment.to_string(),
                                    });
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }
            "content_block_stop" => {
                if let Some(tool) = self.current_tool.take() {
                    self.saw_tool_use = true;
                    chunks.push(StreamChunk::ToolCallReady {
                        input: parse_arguments(&tool.input),
                        id: tool.id,
                        name: tool.name,
                    });
                }
            }
            "message_delta" => {
                if let Some(reason) = event
                    .pointer("/delta/stop_reason")
                    .and_then(|s| s.as_str())
                {
                    if !self.finished {
                        self.finished = true;
                        // A plain stop with tool use means "call these
                        // tools"; any other reason (max_tokens, refusal)
                        // keeps its own signal.
                        let mapped = map_stop_reason(reason);
                        let reason = if self.saw_tool_use && mapped == FinishReason::Stop {
                            FinishReason::ToolCalls
                        } else {
                            mapped
                        };
                        chunks.push(StreamChunk::Finish { reason });
                    }
                }
            }
            "message_stop" => {
                if !self.finished {
                    self.finished = true;
                    chunks.push(StreamChunk::Finish {
                        reason: if self.saw_tool_use {
                            FinishReason::ToolCalls
                        } else {
                            FinishReason::Stop
                        },
                    });
                }
            }
            "error" => {
                if !self.finished {
                    self.finished = true;
                    chunks.push(StreamChunk::Finish {
                        reason: FinishReason::Error,
                    });
                }
            }
            _ => {}
        }

        chunks
    }

    fn finish(&mut self) -> Vec<StreamChunk> {
        // A tool block left open at end-of-stream still surfaces, so its
        // input is not lost.
        match self.current_tool.take() {
            Some(tool) => vec![StreamChunk::ToolCallReady {
                input: parse_arguments(&tool.input),
                id: tool.id,
                name: tool.name,
            }],
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn adapter() -> AnthropicAdapter {
        AnthropicAdapter::new(ModelSpec::new(ProviderKind::Anthropic, "claude-sonnet-4"))
    }

    #[test]
    fn system_messages_hoist_to_block_array_in_order() {
        let encoded = adapter()
            .encode_request(
                &[
                    UnifiedMessage::system("first"),
                    UnifiedMessage::system("second"),
                    UnifiedMessage::user("hello"),
                ],
                &[],
                &PipelineConfig::default(),
            )
            .unwrap();
        assert_eq!(
            encoded.body["system"],
            json!([
                {"type": "text", "text": "first"},
                {"type": "text", "text": "second"},
            ])
        );
        assert_eq!(encoded.body["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn tool_results_merge_into_previous_user_message() {
        let messages = vec![
            UnifiedMessage::user("look this up"),
            UnifiedMessage::tool_result(ToolResult {
                tool_call_id: "toolu_1".to_string(),
                tool_name: "search".to_string(),
                output: json!({"hits": 3}),
                is_error: false,
            }),
        ];
        let encoded = adapter()
            .encode_request(&messages, &[], &PipelineConfig::default())
            .unwrap();
        let wire = encoded.body["messages"].as_array().unwrap();
        assert_eq!(wire.len(), 1);
        let blocks = wire[0]["content"].as_array().unwrap();
        assert_eq!(blocks[0]["type"], "text");
        assert_eq!(blocks[1]["type"], "tool_result");
        assert_eq!(blocks[1]["tool_use_id"], "toolu_1");
    }

    #[test]
    fn tool_results_without_preceding_user_get_their_own_message() {
        let messages = vec![
            UnifiedMessage {
                role: Role::Assistant,
                content: vec![ContentPart::ToolCall(ToolCall {
                    id: "toolu_1".to_string(),
                    name: "search".to_string(),
                    input: json!({"q": "rust"}),
                })],
            },
            UnifiedMessage::tool_result(ToolResult {
                tool_call_id: "toolu_1".to_string(),
                tool_name: "search".to_string(),
                output: json!({"hits": 3}),
                is_error: false,
            }),
        ];
        let encoded = adapter()
            .encode_request(&messages, &[], &PipelineConfig::default())
            .unwrap();
        let wire = encoded.body["messages"].as_array().unwrap();
        assert_eq!(wire.len(), 2);
        assert_eq!(wire[1]["role"], "user");
        assert_eq!(wire[1]["content"][0]["type"], "tool_result");
    }

    #[test]
    fn tool_input_stays_a_parsed_object_on_encode() {
        let messages = vec![UnifiedMessage {
            role: Role::Assistant,
            content: vec![ContentPart::ToolCall(ToolCall {
                id: "toolu_1".to_string(),
                name: "search".to_string(),
                input: json!({"q": "rust"}),
            })],
        }];
        let encoded = adapter()
            .encode_request(&messages, &[], &PipelineConfig::default())
            .unwrap();
        assert_eq!(
            encoded.body["messages"][0]["content"][0]["input"],
            json!({"q": "rust"})
        );
    }

    #[test]
    fn version_header_is_always_present() {
        let encoded = adapter()
            .encode_request(
                &[UnifiedMessage::user("hi")],
                &[],
                &PipelineConfig::default(),
            )
            .unwrap();
        assert_eq!(
            encoded.extra_headers.get("anthropic-version").unwrap(),
            API_VERSION
        );
    }

    #[test]
    fn decoder_assembles_tool_use_block() {
        let mut decoder = AnthropicDecoder::default();
        let mut chunks = Vec::new();
        chunks.extend(decoder.decode_event(
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"toolu_1","name":"search"}}"#,
        ));
        chunks.extend(decoder.decode_event(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{\"q\":"}}"#,
        ));
        chunks.extend(decoder.decode_event(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"\"rust\"}"}}"#,
        ));
        chunks.extend(decoder.decode_event(r#"{"type":"content_block_stop","index":0}"#));
        chunks.extend(decoder.decode_event(
            r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":10}}"#,
        ));

        assert_eq!(
            chunks,
            vec![
                StreamChunk::ToolCallStart {
                    id: "toolu_1".to_string(),
                    name: "search".to_string(),
                },
                StreamChunk::ToolInputDelta {
                    id: "toolu_1".to_string(),
                    partial_json: "{\"q\":".to_string(),
                },
                StreamChunk::ToolInputDelta {
                    id: "toolu_1".to_string(),
                    partial_json: "\"rust\"}".to_string(),
                },
                StreamChunk::ToolCallReady {
                    id: "toolu_1".to_string(),
                    name: "search".to_string(),
                    input: json!({"q": "rust"}),
                },
                StreamChunk::Finish {
                    reason: FinishReason::ToolCalls,
                },
            ]
        );
    }

    #[test]
    fn truncated_tool_turn_keeps_its_length_signal() {
        let mut decoder = AnthropicDecoder::default();
        let mut chunks = Vec::new();
        chunks.extend(decoder.decode_event(
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"toolu_1","name":"search"}}"#,
        ));
        chunks.extend(decoder.decode_event(r#"{"type":"content_block_stop","index":0}"#));
        chunks.extend(decoder.decode_event(
            r#"{"type":"message_delta","delta":{"stop_reason":"max_tokens"},"usage":{"output_tokens":10}}"#,
        ));
        assert_eq!(
            chunks.last(),
            Some(&StreamChunk::Finish {
                reason: FinishReason::Length
            })
        );
    }

    #[test]
    fn message_stop_without_delta_finishes_with_stop() {
        let mut decoder = AnthropicDecoder::default();
        let chunks = decoder.decode_event(r#"{"type":"message_stop"}"#);
        assert_eq!(
            chunks,
            vec![StreamChunk::Finish {
                reason: FinishReason::Stop
            }]
        );
        // A second terminal event must not produce a second finish.
        assert!(decoder.decode_event(r#"{"type":"message_stop"}"#).is_empty());
    }
}
