//! OpenAI Chat Completions adapter.
//!
//! Wire quirks bridged here: tool-call arguments travel as a JSON-encoded
//! string (stringified on encode, parsed on decode), system messages stay
//! inline with role `system`, and tool results are separate `tool`-role
//! messages keyed by `tool_call_id`.

use std::collections::HashMap;

use reqwest::header::HeaderMap;
use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::model::{ModelSpec, ProviderKind};
use crate::types::{
    ContentPart, FileContent, FinishReason, ImageContent, Role, StreamChunk, ToolCall, ToolDef,
    ToolResult, UnifiedMessage,
};

use super::{EncodedRequest, EventDecoder, ProviderAdapter};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiAdapter {
    model: ModelSpec,
}

impl OpenAiAdapter {
    pub fn new(model: ModelSpec) -> Self {
        Self { model }
    }
}

impl ProviderAdapter for OpenAiAdapter {
    fn provider(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    fn encode_request(
        &self,
        messages: &[UnifiedMessage],
        tools: &[ToolDef],
        config: &PipelineConfig,
    ) -> Result<EncodedRequest, PipelineError> {
        let mut wire_messages = Vec::new();
        for msg in messages {
            encode_message(msg, &mut wire_messages);
        }

        let mut body = json!({
            "model": self.model.model_id,
            "messages": wire_messages,
            "stream": true,
        });
        let obj = body.as_object_mut().expect("body is an object");

        if !tools.is_empty() {
            let tool_defs: Vec<Value> = tools.iter().map(encode_tool).collect();
            obj.insert("tools".into(), tool_defs.into());
        }

        let base = config
            .get_base_url("openai")
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Ok(EncodedRequest {
            provider: ProviderKind::OpenAi,
            url: format!("{base}/chat/completions"),
            extra_headers: HeaderMap::new(),
            body,
        })
    }

    fn decode_request(&self, body: &Value) -> Result<Vec<UnifiedMessage>, PipelineError> {
        let wire_messages = body
            .get("messages")
            .and_then(|m| m.as_array())
            .ok_or_else(|| PipelineError::Stream("missing messages array".to_string()))?;

        let mut messages: Vec<UnifiedMessage> = Vec::new();
        for wire in wire_messages {
            let role = wire.get("role").and_then(|r| r.as_str()).unwrap_or("");
            if role == "tool" {
                let result = decode_tool_message(wire)?;
                // One unified tool message may fan out to several wire
                // messages; fold consecutive ones back together.
                if let Some(last) = messages.last_mut() {
                    if last.role == Role::Tool {
                        last.content.push(ContentPart::ToolResult(result));
                        continue;
                    }
                }
                messages.push(UnifiedMessage::tool_result(result));
            } else {
                messages.push(decode_message(role, wire)?);
            }
        }
        Ok(messages)
    }

    fn decoder(&self) -> Box<dyn EventDecoder> {
        Box::new(OpenAiChatDecoder::default())
    }
}

fn encode_tool(tool: &ToolDef) -> Value {
    let mut function = json!({
        "name": tool.name,
        "parameters": tool.input_schema,
    });
    let f = function.as_object_mut().expect("function is an object");
    if let Some(ref description) = tool.description {
        f.insert("description".into(), description.clone().into());
    }
    if let Some(strict) = tool.strict {
        f.insert("strict".into(), strict.into());
    }
    json!({ "type": "function", "function": function })
}

fn encode_message(msg: &UnifiedMessage, out: &mut Vec<Value>) {
    let role = match msg.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => {
            // One wire message per result part.
            for part in &msg.content {
                if let ContentPart::ToolResult(tr) = part {
                    out.push(json!({
                        "role": "tool",
                        "tool_call_id": tr.tool_call_id,
                        "name": tr.tool_name,
                        "content": tr.output.to_string(),
                    }));
                }
            }
            return;
        }
    };

    let tool_calls: Vec<&ToolCall> = msg.tool_calls();
    if !tool_calls.is_empty() {
        let tc_json: Vec<Value> = tool_calls
            .iter()
            .map(|tc| {
                json!({
                    "id": tc.id,
                    "type": "function",
                    "function": {
                        "name": tc.name,
                        "arguments": tc.input.to_string(),
                    }
                })
            })
            .collect();
        let text = msg.text();
        out.push(json!({
            "role": role,
            "content": if text.is_empty() { Value::Null } else { Value::String(text) },
            "tool_calls": tc_json,
        }));
        return;
    }

    // Simple single-text message
    if msg.content.len() == 1 {
        if let ContentPart::Text { ref text } = msg.content[0] {
            out.push(json!({ "role": role, "content": text }));
            return;
        }
    }

    let parts: Vec<Value> = msg
        .content
        .iter()
        .filter_map(|part| match part {
            ContentPart::Text { text } => Some(json!({ "type": "text", "text": text })),
            ContentPart::Image(img) => Some(json!({
                "type": "image_url",
                "image_url": { "url": format!("data:{};base64,{}", img.media_type, img.data) }
            })),
            ContentPart::File(file) => Some(json!({
                "type": "file",
                "file": {
                    "filename": file.filename,
                    "file_data": format!("data:{};base64,{}", file.media_type, file.data),
                }
            })),
            // Not representable on this wire
            ContentPart::Reasoning { .. } => None,
            ContentPart::ToolCall(_) | ContentPart::ToolResult(_) => None,
        })
        .collect();
    out.push(json!({ "role": role, "content": parts }));
}

fn decode_message(role: &str, wire: &Value) -> Result<UnifiedMessage, PipelineError> {
    let role = match role {
        "system" => Role::System,
        "user" => Role::User,
        "assistant" => Role::Assistant,
        other => {
            return Err(PipelineError::Stream(format!(
                "unexpected wire role '{other}'"
            )))
        }
    };

    let mut content = Vec::new();
    match wire.get("content") {
        Some(Value::String(text)) => content.push(ContentPart::Text { text: text.clone() }),
        Some(Value::Array(parts)) => {
            for part in parts {
                match part.get("type").and_then(|t| t.as_str()) {
                    Some("text") => {
                        let text = part.get("text").and_then(|t| t.as_str()).unwrap_or("");
                        content.push(ContentPart::Text {
                            text: text.to_string(),
                        });
                    }
                    Some("image_url") => {
                        let url = part
                            .pointer("/image_url/url")
                            .and_then(|u| u.as_str())
                            .unwrap_or("");
                        if let Some((media_type, data)) = split_data_url(url) {
                            content.push(ContentPart::Image(ImageContent { data, media_type }));
                        }
                    }
                    Some("file") => {
                        let filename = part
                            .pointer("/file/filename")
                            .and_then(|f| f.as_str())
                            .unwrap_or("")
                            .to_string();
                        let url = part
                            .pointer("/file/file_data")
                            .and_then(|u| u.as_str())
                            .unwrap_or("");
                        if let Some((media_type, data)) = split_data_url(url) {
                            content.push(ContentPart::File(FileContent {
                                data,
                                media_type,
                                filename,
                            }));
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }

    if let Some(Value::Array(tool_calls)) = wire.get("tool_calls") {
        for tc in tool_calls {
            let arguments = tc
                .pointer("/function/arguments")
                .and_then(|a| a.as_str())
                .unwrap_or("{}");
            let input: Value = serde_json::from_str(arguments)?;
            content.push(ContentPart::ToolCall(ToolCall {
                id: tc
                    .get("id")
                    .and_then(|i| i.as_str())
                    .unwrap_or_default()
                    .to_string(),
                name: tc
                    .pointer("/function/name")
                    .and_then(|n| n.as_str())
                    .unwrap_or_default()
                    .to_string(),
                input,
            }));
        }
    }

    Ok(UnifiedMessage { role, content })
}

fn decode_tool_message(wire: &Value) -> Result<ToolResult, PipelineError> {
    let raw = wire.get("content").and_then(|c| c.as_str()).unwrap_or("");
    let output: Value =
        serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok(ToolResult {
        tool_call_id: wire
            .get("tool_call_id")
            .and_then(|i| i.as_str())
            .unwrap_or_default()
            .to_string(),
        tool_name: wire
            .get("name")
            .and_then(|n| n.as_str())
            .unwrap_or_default()
            .to_string(),
        output,
        is_error: false,
    })
}

fn split_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (media_type, data) = rest.split_once(";base64,")?;
    Some((media_type.to_string(), data.to_string()))
}

pub(crate) fn map_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "stop" => FinishReason::Stop,
        "length" => FinishReason::Length,
        "tool_calls" | "function_call" => FinishReason::ToolCalls,
        "content_filter" => FinishReason::ContentFilter,
        _ => FinishReason::Other,
    }
}

/// Parse accumulated argument text, tolerating an empty buffer. A buffer
/// that is not valid JSON indicates an upstream framing bug; the call still
/// goes out with empty input rather than a raw string.
pub(crate) fn parse_arguments(raw: &str) -> Value {
    if raw.is_empty() {
        return json!({});
    }
    match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(err) => {
            warn!(%err, "discarding unparseable tool-call arguments");
            json!({})
        }
    }
}

#[derive(Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Incremental decoder for chat/completions SSE chunks.
///
/// Argument fragments accumulate per tool-call index; `ToolCallReady` is
/// emitted only once the turn's finish reason arrives (or the stream ends),
/// by which point all fragments are in.
#[derive(Default)]
struct OpenAiChatDecoder {
    calls: Vec<PartialCall>,
    by_index: HashMap<u64, usize>,
    finished: bool,
}

impl OpenAiChatDecoder {
    fn flush_ready(&mut self) -> Vec<StreamChunk> {
        self.calls
            .drain(..)
            .map(|call| StreamChunk::ToolCallReady {
                input: parse_arguments(&call.arguments),
                id: call.id,
                name: call.name,
            })
            .collect()
    }
}

impl EventDecoder for OpenAiChatDecoder {
    fn decode_event(&mut self, data: &str) -> Vec<StreamChunk> {
        let Ok(event) = serde_json::from_str::<Value>(data) else {
            return Vec::new();
        };
        let Some(choice) = event.get("choices").and_then(|c| c.as_array()).and_then(|c| c.first())
        else {
            return Vec::new();
        };

        let mut chunks = Vec::new();

        if let Some(text) = choice.pointer("/delta/content").and_then(|c| c.as_str()) {
            if !text.is_empty() {
                chunks.push(StreamChunk::TextDelta {
                    text: text.to_string(),
                });
            }
        }

        if let Some(Value::Array(tool_calls)) = choice.pointer("/delta/tool_calls") {
            for tc in tool_calls {
                let index = tc.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
                let slot = match self.by_index.get(&index) {
                    Some(&slot) => slot,
                    None => {
                        let id = tc
                            .get("id")
                            .and_then(|i| i.as_str())
                            .map(|s| s.to_string())
                            .unwrap_or_else(|| Uuid::new_v4().to_string());
                        let name = tc
                            .pointer("/function/name")
                            .and_then(|n| n.as_str())
                            .unwrap_or_default()
                            .to_string();
                        self.calls.push(PartialCall {
                            id: id.clone(),
                            name: name.clone(),
                            arguments: String::new(),
                        });
                        let slot = self.calls.len() - 1;
                        self.by_index.insert(index, slot);
                        chunks.push(StreamChunk::ToolCallStart { id, name });
                        slot
                    }
                };
                if let Some(fragment) =
                    tc.pointer("/function/arguments").and_then(|a| a.as_str())
                {
                    if !fragment.is_empty() {
                        self.calls[slot].arguments.push_str(fragment);
                        chunks.push(StreamChunk::ToolInputDelta {
                            id: self.calls[slot].id.clone(),
                            partial_json: fragment.to_string(),
                        });
                    }
                }
            }
        }

        if let Some(reason) = choice.get("finish_reason").and_then(|r| r.as_str()) {
            if !self.finished {
                self.finished = true;
                chunks.extend(self.flush_ready());
                chunks.push(StreamChunk::Finish {
                    reason: map_finish_reason(reason),
                });
            }
        }

        chunks
    }

    fn finish(&mut self) -> Vec<StreamChunk> {
        if self.finished {
            return Vec::new();
        }
        // Stream ended without a finish_reason; don't lose completed calls.
        self.flush_ready()
    }
}
