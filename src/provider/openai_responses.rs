//! OpenAI Responses adapter, selected when a model's capability flags ask
//! for the `/responses` endpoint instead of chat/completions.
//!
//! The wire differs from chat/completions in shape but not in spirit:
//! conversation turns become `input` items, tool calls and their outputs are
//! standalone `function_call` / `function_call_output` items with stringified
//! JSON payloads, and streaming arrives as typed `response.*` events.

use std::collections::{HashMap, HashSet};

use reqwest::header::HeaderMap;
use serde_json::{json, Value};

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::model::{ModelSpec, ProviderKind};
use crate::types::{
    ContentPart, FinishReason, Role, StreamChunk, ToolCall, ToolDef, ToolResult, UnifiedMessage,
};

use super::openai::parse_arguments;
use super::{EncodedRequest, EventDecoder, ProviderAdapter};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiResponsesAdapter {
    model: ModelSpec,
}

impl OpenAiResponsesAdapter {
    pub fn new(model: ModelSpec) -> Self {
        Self { model }
    }
}

impl ProviderAdapter for OpenAiResponsesAdapter {
    fn provider(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    fn encode_request(
        &self,
        messages: &[UnifiedMessage],
        tools: &[ToolDef],
        config: &PipelineConfig,
    ) -> Result<EncodedRequest, PipelineError> {
        let mut body = json!({
            "model": self.model.model_id,
            "input": build_input_items(messages),
            "stream": true,
        });

        if !tools.is_empty() {
            // Tool definitions are flattened here, unlike the nested
            // `function` object on chat/completions.
            let tool_defs: Vec<Value> = tools
                .iter()
                .map(|t| {
                    let mut def = json!({
                        "type": "function",
                        "name": t.name,
                        "parameters": t.input_schema,
                    });
                    let obj = def.as_object_mut().expect("def is an object");
                    if let Some(ref description) = t.description {
                        obj.insert("description".into(), description.clone().into());
                    }
                    if let Some(strict) = t.strict {
                        obj.insert("strict".into(), strict.into());
                    }
                    def
                })
                .collect();
            body.as_object_mut()
                .expect("body is an object")
                .insert("tools".into(), tool_defs.into());
        }

        let base = config
            .get_base_url("openai")
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Ok(EncodedRequest {
            provider: ProviderKind::OpenAi,
            url: format!("{base}/responses"),
            extra_headers: HeaderMap::new(),
            body,
        })
    }

    fn decode_request(&self, body: &Value) -> Result<Vec<UnifiedMessage>, PipelineError> {
        let input = body
            .get("input")
            .and_then(|i| i.as_array())
            .ok_or_else(|| PipelineError::Stream("missing input array".to_string()))?;

        let mut messages: Vec<UnifiedMessage> = Vec::new();
        for item in input {
            if let Some(role) = item.get("role").and_then(|r| r.as_str()) {
                messages.push(decode_role_item(role, item)?);
                continue;
            }
            match item.get("type").and_then(|t| t.as_str()) {
                Some("function_call") => {
                    let call = ContentPart::ToolCall(ToolCall {
                        id: item
                            .get("call_id")
                            .and_then(|i| i.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        name: item
                            .get("name")
                            .and_then(|n| n.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        input: serde_json::from_str(
                            item.get("arguments").and_then(|a| a.as_str()).unwrap_or("{}"),
                        )?,
                    });
                    // Calls follow their assistant turn as standalone items;
                    // fold them back into it.
                    match messages.last_mut() {
                        Some(prev) if prev.role == Role::Assistant => prev.content.push(call),
                        _ => messages.push(UnifiedMessage {
                            role: Role::Assistant,
                            content: vec![call],
                        }),
                    }
                }
                Some("function_call_output") => {
                    let raw = item.get("output").and_then(|o| o.as_str()).unwrap_or("");
                    let result = ToolResult {
                        tool_call_id: item
                            .get("call_id")
                            .and_then(|i| i.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        tool_name: String::new(),
                        output: serde_json::from_str(raw)
                            .unwrap_or_else(|_| Value::String(raw.to_string())),
                        is_error: false,
                    };
                    match messages.last_mut() {
                        Some(prev) if prev.role == Role::Tool => {
                            prev.content.push(ContentPart::ToolResult(result));
                        }
                        _ => messages.push(UnifiedMessage::tool_result(result)),
                    }
                }
                other => {
                    return Err(PipelineError::Stream(format!(
                        "unexpected input item type {other:?}"
                    )))
                }
            }
        }
        Ok(messages)
    }

    fn decoder(&self) -> Box<dyn EventDecoder> {
        Box::new(ResponsesDecoder::default())
    }
}

fn build_input_items(messages: &[UnifiedMessage]) -> Vec<Value> {
    let mut input = Vec::new();
    for msg in messages {
        match msg.role {
            Role::System | Role::User | Role::Assistant => {
                let role = match msg.role {
                    Role::System => "system",
                    Role::User => "user",
                    _ => "assistant",
                };
                let part_type = if msg.role == Role::Assistant {
                    "output_text"
                } else {
                    "input_text"
                };
                let mut content_parts = Vec::new();
                for part in &msg.content {
                    match part {
                        ContentPart::Text { text } => {
                            content_parts.push(json!({ "type": part_type, "text": text }));
                        }
                        ContentPart::Image(img) => {
                            content_parts.push(json!({
                                "type": "input_image",
                                "image_url": format!("data:{};base64,{}", img.media_type, img.data),
                            }));
                        }
                        ContentPart::File(file) => {
                            content_parts.push(json!({
                                "type": "input_file",
                                "filename": file.filename,
                                "file_data":
                                    format!("data:{};base64,{}", file.media_type, file.data),
                            }));
                        }
                        _ => {}
                    }
                }
                if !content_parts.is_empty() {
                    let content = match content_parts.as_slice() {
                        [only] if only.get("text").is_some() => only["text"].clone(),
                        _ => Value::Array(content_parts),
                    };
                    input.push(json!({ "role": role, "content": content }));
                }
                if msg.role == Role::Assistant {
                    for tc in msg.tool_calls() {
                        input.push(json!({
                            "type": "function_call",
                            "call_id": tc.id,
                            "name": tc.name,
                            "arguments": tc.input.to_string(),
                        }));
                    }
                }
            }
            Role::Tool => {
                for tr in msg.tool_results_parts() {
                    input.push(json!({
                        "type": "function_call_output",
                        "call_id": tr.tool_call_id,
                        "output": tr.output.to_string(),
                    }));
                }
            }
        }
    }
    input
}

fn decode_role_item(role: &str, item: &Value) -> Result<UnifiedMessage, PipelineError> {
    let role = match role {
        "system" | "developer" => Role::System,
        "user" => Role::User,
        "assistant" => Role::Assistant,
        other => {
            return Err(PipelineError::Stream(format!(
                "unexpected input role '{other}'"
            )))
        }
    };
    let mut content = Vec::new();
    match item.get("content") {
        Some(Value::String(text)) => content.push(ContentPart::Text { text: text.clone() }),
        Some(Value::Array(parts)) => {
            for part in parts {
                if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                    content.push(ContentPart::Text {
                        text: text.to_string(),
                    });
                }
            }
        }
        _ => {}
    }
    Ok(UnifiedMessage { role, content })
}

/// Incremental decoder for `response.*` SSE events.
///
/// `output_item.added` announces a call before its arguments stream in;
/// `output_item.done` closes it. An `emitted` set guards against the done
/// event replaying a call that already surfaced.
#[derive(Default)]
struct ResponsesDecoder {
    /// item_id → call_id, for routing argument deltas.
    call_ids: HashMap<String, String>,
    call_args: HashMap<String, String>,
    call_names: HashMap<String, String>,
    emitted: HashSet<String>,
    saw_tool_call: bool,
    finished: bool,
}

impl ResponsesDecoder {
    fn ready_chunk(&mut self, call_id: String, name: String, arguments: &str) -> Vec<StreamChunk> {
        if self.emitted.contains(&call_id) {
            return Vec::new();
        }
        self.emitted.insert(call_id.clone());
        self.saw_tool_call = true;
        vec![StreamChunk::ToolCallReady {
            input: parse_arguments(arguments),
            id: call_id,
            name,
        }]
    }

    fn finish_chunk(&mut self, reason: FinishReason) -> Vec<StreamChunk> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        // Only a plain completion gets upgraded; an incomplete or failed
        // turn keeps its own reason even when calls were parsed.
        let reason = if self.saw_tool_call && reason == FinishReason::Stop {
            FinishReason::ToolCalls
        } else {
            reason
        };
        vec![StreamChunk::Finish { reason }]
    }
}

impl EventDecoder for ResponsesDecoder {
    fn decode_event(&mut self, data: &str) -> Vec<StreamChunk> {
        let Ok(event) = serde_json::from_str::<Value>(data) else {
            return Vec::new();
        };
        let event_type = event.get("type").and_then(|t| t.as_str()).unwrap_or("");

        match event_type {
            "response.output_text.delta" => {
                match event.get("delta").and_then(|d| d.as_str()) {
                    Some(delta) if !delta.is_empty() => vec![StreamChunk::TextDelta {
                        text: delta.to_string(),
                    }],
                    _ => Vec::new(),
                }
            }
            "response.output_item.added" => {
                let Some(item) = event.get("item") else {
                    return Vec::new();
                };
                if item.get("type").and_then(|t| t.as_str()) != Some("function_call") {
                    return Vec::new();
                }
                let call_id = item
                    .get("call_id")
                    .and_then(|v| v.as_str())
                    .or_else(|| item.get("id").and_then(|v| v.as_str()))
                    .unwrap_or_default()
                    .to_string();
                let name = item
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                if let Some(item_id) = item.get("id").and_then(|v| v.as_str()) {
                    self.call_ids.insert(item_id.to_string(), call_id.clone());
                }
                self.call_names.insert(call_id.clone(), name.clone());
                vec![StreamChunk::ToolCallStart { id: call_id, name }]
            }
            "response.function_call_arguments.delta" => {
                let call_id = event
                    .get("call_id")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
                    .or_else(|| {
                        let item_id = event.get("item_id").and_then(|v| v.as_str())?;
                        Some(
                            self.call_ids
                                .get(item_id)
                                .cloned()
                                .unwrap_or_else(|| item_id.to_string()),
                        )
                    });
                let (Some(call_id), Some(delta)) =
                    (call_id, event.get("delta").and_then(|v| v.as_str()))
                else {
                    return Vec::new();
                };
                if delta.is_empty() {
                    return Vec::new();
                }
                self.call_args
                    .entry(call_id.clone())
                    .or_default()
                    .push_str(delta);
                vec![StreamChunk::ToolInputDelta {
                    id: call_id,
                    partial_json: delta.to_string(),
                }]
            }
            "response.output_item.done" => {
                let Some(item) = event.get("item") else {
                    return Vec::new();
                };
                if item.get("type").and_then(|t| t.as_str()) != Some("function_call") {
                    return Vec::new();
                }
                let call_id = item
                    .get("call_id")
                    .and_then(|v| v.as_str())
                    .or_else(|| item.get("id").and_then(|v| v.as_str()))
                    .unwrap_or_default()
                    .to_string();
                let name = item
                    .get("name")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
                    .or_else(|| self.call_names.get(&call_id).cloned())
                    .unwrap_or_default();
                let arguments = item
                    .get("arguments")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
                    .or_else(|| self.call_args.remove(&call_id))
                    .unwrap_or_default();
                self.ready_chunk(call_id, name, &arguments)
            }
            "response.completed" | "response.done" => {
                let reason = match event.pointer("/response/status").and_then(|s| s.as_str()) {
                    Some("incomplete") => {
                        match event
                            .pointer("/response/incomplete_details/reason")
                            .and_then(|r| r.as_str())
                        {
                            Some("content_filter") => FinishReason::ContentFilter,
                            _ => FinishReason::Length,
                        }
                    }
                    Some("failed") => FinishReason::Error,
                    _ => FinishReason::Stop,
                };
                self.finish_chunk(reason)
            }
            "response.failed" => self.finish_chunk(FinishReason::Error),
            _ => Vec::new(),
        }
    }

    fn finish(&mut self) -> Vec<StreamChunk> {
        // A call whose done event never arrived still surfaces from its
        // accumulated argument fragments.
        let pending: Vec<(String, String)> = self.call_args.drain().collect();
        let mut chunks = Vec::new();
        for (call_id, args) in pending {
            let name = self.call_names.get(&call_id).cloned().unwrap_or_default();
            chunks.extend(self.ready_chunk(call_id, name, &args));
        }
        chunks.extend(self.finish_chunk(FinishReason::Stop));
        chunks
    }
}
