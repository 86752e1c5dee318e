//! Google generateContent adapter.
//!
//! Wire quirks bridged here: the assistant role is called `model`, system
//! text travels as `systemInstruction` (except for the gemma sub-family,
//! which gets it prepended to the first user turn), function calls carry no
//! ids (synthetic UUIDs are minted on decode), tool results ride in
//! `user`-role `functionResponse` parts, and tool schemas must be converted
//! to the OpenAPI flavor before anything touches the network.

use reqwest::header::HeaderMap;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::model::{ModelSpec, ProviderKind};
use crate::types::{
    ContentPart, FileContent, FinishReason, ImageContent, Role, StreamChunk, ToolCall, ToolDef,
    ToolResult, UnifiedMessage,
};

use super::schema::to_openapi_schema;
use super::{EncodedRequest, EventDecoder, ProviderAdapter};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GoogleAdapter {
    model: ModelSpec,
}

impl GoogleAdapter {
    pub fn new(model: ModelSpec) -> Self {
        Self { model }
    }
}

impl ProviderAdapter for GoogleAdapter {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Google
    }

    fn encode_request(
        &self,
        messages: &[UnifiedMessage],
        tools: &[ToolDef],
        config: &PipelineConfig,
    ) -> Result<EncodedRequest, PipelineError> {
        let mut system_texts: Vec<String> = Vec::new();
        let mut contents: Vec<Value> = Vec::new();

        for msg in messages {
            match msg.role {
                Role::System => system_texts.push(msg.text()),
                Role::User => contents.push(json!({
                    "role": "user",
                    "parts": encode_user_parts(&msg.content),
                })),
                Role::Assistant => contents.push(json!({
                    "role": "model",
                    "parts": encode_model_parts(&msg.content),
                })),
                Role::Tool => {
                    let parts: Vec<Value> = msg
                        .tool_results_parts()
                        .iter()
                        .map(|tr| {
                            json!({
                                "functionResponse": {
                                    "name": tr.tool_name,
                                    "response": { "content": tr.output },
                                }
                            })
                        })
                        .collect();
                    append_to_user_turn(&mut contents, parts);
                }
            }
        }

        let mut body = json!({ "contents": contents });
        let obj = body.as_object_mut().expect("body is an object");

        if !system_texts.is_empty() {
            let system_text = system_texts.join("\n\n");
            if self.model.system_in_first_user_turn() {
                prepend_to_first_user_turn(
                    obj.get_mut("contents")
                        .and_then(|c| c.as_array_mut())
                        .expect("contents is an array"),
                    system_text,
                );
            } else {
                obj.insert(
                    "systemInstruction".into(),
                    json!({ "parts": [{ "text": system_text }] }),
                );
            }
        }

        if !tools.is_empty() {
            let mut declarations = Vec::with_capacity(tools.len());
            for tool in tools {
                let mut decl = json!({
                    "name": tool.name,
                    "parameters": to_openapi_schema(&tool.input_schema)?,
                });
                if let Some(ref description) = tool.description {
                    decl.as_object_mut()
                        .expect("decl is an object")
                        .insert("description".into(), description.clone().into());
                }
                declarations.push(decl);
            }
            obj.insert(
                "tools".into(),
                json!([{ "functionDeclarations": declarations }]),
            );
        }

        let base = config
            .get_base_url("google")
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Ok(EncodedRequest {
            provider: ProviderKind::Google,
            url: format!(
                "{base}/models/{}:streamGenerateContent?alt=sse",
                self.model.model_id
            ),
            extra_headers: HeaderMap::new(),
            body,
        })
    }

    fn decode_request(&self, body: &Value) -> Result<Vec<UnifiedMessage>, PipelineError> {
        let mut messages: Vec<UnifiedMessage> = Vec::new();

        if let Some(text) = body.pointer("/systemInstruction/parts/0/text") {
            if let Some(text) = text.as_str() {
                messages.push(UnifiedMessage::system(text));
            }
        }

        let contents = body
            .get("contents")
            .and_then(|c| c.as_array())
            .ok_or_else(|| PipelineError::Stream("missing contents array".to_string()))?;

        for content in contents {
            let role = content.get("role").and_then(|r| r.as_str()).unwrap_or("");
            let parts = content
                .get("parts")
                .and_then(|p| p.as_array())
                .map(|p| p.as_slice())
                .unwrap_or(&[]);
            match role {
                "user" => decode_user_parts(parts, &mut messages),
                "model" => messages.push(decode_model_parts(parts)),
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
        Box::new(GoogleDecoder::default())
    }
}

/// Tool-result grouping rule: if the previous encoded turn is already a
/// user turn, append the parts; otherwise create one.
fn append_to_user_turn(contents: &mut Vec<Value>, parts: Vec<Value>) {
    if parts.is_empty() {
        return;
    }
    if let Some(last) = contents.last_mut() {
        if last.get("role").and_then(|r| r.as_str()) == Some("user") {
            if let Some(Value::Array(existing)) = last.get_mut("parts") {
                existing.extend(parts);
                return;
            }
        }
    }
    contents.push(json!({ "role": "user", "parts": parts }));
}

fn prepend_to_first_user_turn(contents: &mut Vec<Value>, system_text: String) {
    for content in contents.iter_mut() {
        if content.get("role").and_then(|r| r.as_str()) == Some("user") {
            if let Some(Value::Array(parts)) = content.get_mut("parts") {
                parts.insert(0, json!({ "text": system_text }));
                return;
            }
        }
    }
    contents.insert(
        0,
        json!({ "role": "user", "parts": [{ "text": system_text }] }),
    );
}

fn encode_user_parts(parts: &[ContentPart]) -> Vec<Value> {
    parts
        .iter()
        .filter_map(|part| match part {
            ContentPart::Text { text } => Some(json!({ "text": text })),
            ContentPart::Image(img) => Some(json!({
                "inlineData": { "mimeType": img.media_type, "data": img.data }
            })),
            ContentPart::File(file) => Some(json!({
                "inlineData": { "mimeType": file.media_type, "data": file.data }
            })),
            _ => None,
        })
        .collect()
}

fn encode_model_parts(parts: &[ContentPart]) -> Vec<Value> {
    parts
        .iter()
        .filter_map(|part| match part {
            ContentPart::Text { text } if !text.is_empty() => Some(json!({ "text": text })),
            // Call ids do not exist on this wire; they are re-minted on
            // decode.
            ContentPart::ToolCall(tc) => Some(json!({
                "functionCall": { "name": tc.name, "args": tc.input }
            })),
            _ => None,
        })
        .collect()
}

fn decode_user_parts(parts: &[Value], messages: &mut Vec<UnifiedMessage>) {
    // A merged wire turn holds user parts and functionResponse parts;
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

    for part in parts {
        if let Some(fr) = part.get("functionResponse") {
            flush_user(&mut user_parts, messages);
            tool_parts.push(ToolResult {
                tool_call_id: synthetic_call_id(),
                tool_name: fr
                    .get("name")
                    .and_then(|n| n.as_str())
                    .unwrap_or_default()
                    .to_string(),
                output: fr
                    .pointer("/response/content")
                    .cloned()
                    .unwrap_or(Value::Null),
                is_error: false,
            });
        } else if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
            flush_tool(&mut tool_parts, messages);
            user_parts.push(ContentPart::Text {
                text: text.to_string(),
            });
        } else if let Some(inline) = part.get("inlineData") {
            flush_tool(&mut tool_parts, messages);
            let media_type = inline
                .get("mimeType")
                .and_then(|m| m.as_str())
                .unwrap_or("")
                .to_string();
            let data = inline
                .get("data")
                .and_then(|d| d.as_str())
                .unwrap_or("")
                .to_string();
            if media_type.starts_with("image/") {
                user_parts.push(ContentPart::Image(ImageContent { data, media_type }));
            } else {
                user_parts.push(ContentPart::File(FileContent {
                    data,
                    media_type,
                    filename: String::new(),
                }));
            }
        }
    }

    flush_user(&mut user_parts, messages);
    flush_tool(&mut tool_parts, messages);
}

fn decode_model_parts(parts: &[Value]) -> UnifiedMessage {
    let content = parts
        .iter()
        .filter_map(|part| {
            if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                Some(ContentPart::Text {
                    text: text.to_string(),
                })
            } else {
                part.get("functionCall").map(|fc| {
                    ContentPart::ToolCall(ToolCall {
                        id: synthetic_call_id(),
                        name: fc
                            .get("name")
                            .and_then(|n| n.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        input: fc.get("args").cloned().unwrap_or(json!({})),
                    })
                })
            }
        })
        .collect();
    UnifiedMessage {
        role: Role::Assistant,
        content,
    }
}

fn synthetic_call_id() -> String {
    format!("call_{}", Uuid::new_v4().simple())
}

fn map_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "STOP" => FinishReason::Stop,
        "MAX_TOKENS" => FinishReason::Length,
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" => {
            FinishReason::ContentFilter
        }
        _ => FinishReason::Other,
    }
}

/// Incremental decoder for streamed generateContent responses. Function-call
/// arguments arrive complete in a single part, so each call yields an
/// immediate start/ready pair sharing one synthetic id.
#[derive(Default)]
struct GoogleDecoder {
    saw_function_call: bool,
    finished: bool,
}

impl EventDecoder for GoogleDecoder {
    fn decode_event(&mut self, data: &str) -> Vec<StreamChunk> {
        let Ok(event) = serde_json::from_str::<Value>(data) else {
            return Vec::new();
        };
        let mut chunks = Vec::new();

        let Some(candidate) = event.pointer("/candidates/0") else {
            return chunks;
        };

        if let Some(parts) = candidate.pointer("/content/parts").and_then(|p| p.as_array()) {
            for part in parts {
                if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                    if !text.is_empty() {
                        chunks.push(StreamChunk::TextDelta {
                            text: text.to_string(),
                        });
                    }
                } else if let Some(fc) = part.get("functionCall") {
                    let id = synthetic_call_id();
                    let name = fc
                        .get("name")
                        .and_then(|n| n.as_str())
                        .unwrap_or_default()
                        .to_string();
                    self.saw_function_call = true;
                    chunks.push(StreamChunk::ToolCallStart {
                        id: id.clone(),
                        name: name.clone(),
                    });
                    chunks.push(StreamChunk::ToolCallReady {
                        id,
                        name,
                        input: fc.get("args").cloned().unwrap_or(json!({})),
                    });
                }
            }
        }

        if let Some(reason) = candidate.get("finishReason").and_then(|r| r.as_str()) {
            if !self.finished {
                self.finished = true;
                // STOP with function calls means "call these tools"; any
                // other reason (MAX_TOKENS, SAFETY) keeps its own signal.
                let mapped = map_finish_reason(reason);
                let reason = if self.saw_function_call && mapped == FinishReason::Stop {
                    FinishReason::ToolCalls
                } else {
                    mapped
                };
                chunks.push(StreamChunk::Finish { reason });
            }
        }

        chunks
    }

    fn finish(&mut self) -> Vec<StreamChunk> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        vec![StreamChunk::Finish {
            reason: if self.saw_function_call {
                FinishReason::ToolCalls
            } else {
                FinishReason::Stop
            },
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn adapter(model_id: &str) -> GoogleAdapter {
        GoogleAdapter::new(ModelSpec::new(ProviderKind::Google, model_id))
    }

    #[test]
    fn system_text_becomes_system_instruction() {
        let encoded = adapter("gemini-2.0-flash")
            .encode_request(
                &[
                    UnifiedMessage::system("be brief"),
                    UnifiedMessage::user("hi"),
                ],
                &[],
                &PipelineConfig::default(),
            )
            .unwrap();
        assert_eq!(
            encoded.body["systemInstruction"]["parts"][0]["text"],
            "be brief"
        );
        assert_eq!(encoded.body["contents"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn gemma_models_fold_system_into_first_user_turn() {
        let encoded = adapter("gemma-3-27b-it")
            .encode_request(
                &[
                    UnifiedMessage::system("be brief"),
                    UnifiedMessage::user("hi"),
                ],
                &[],
                &PipelineConfig::default(),
            )
            .unwrap();
        assert!(encoded.body.get("systemInstruction").is_none());
        let parts = encoded.body["contents"][0]["parts"].as_array().unwrap();
        assert_eq!(parts[0]["text"], "be brief");
        assert_eq!(parts[1]["text"], "hi");
    }

    #[test]
    fn assistant_role_is_model_and_calls_carry_no_id() {
        let messages = vec![UnifiedMessage {
            role: Role::Assistant,
            content: vec![ContentPart::ToolCall(ToolCall {
                id: "call_abc".to_string(),
                name: "search".to_string(),
                input: json!({"q": "rust"}),
            })],
        }];
        let encoded = adapter("gemini-2.0-flash")
            .encode_request(&messages, &[], &PipelineConfig::default())
            .unwrap();
        let content = &encoded.body["contents"][0];
        assert_eq!(content["role"], "model");
        assert_eq!(
            content["parts"][0],
            json!({"functionCall": {"name": "search", "args": {"q": "rust"}}})
        );
    }

    #[test]
    fn tool_results_merge_into_previous_user_turn() {
        let messages = vec![
            UnifiedMessage::user("context note"),
            UnifiedMessage::tool_result(ToolResult {
                tool_call_id: "call_abc".to_string(),
                tool_name: "search".to_string(),
                output: json!({"hits": 3}),
                is_error: false,
            }),
        ];
        let adapter = adapter("gemini-2.0-flash");
        let encoded = adapter
            .encode_request(&messages, &[], &PipelineConfig::default())
            .unwrap();
        let contents = encoded.body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 1);
        let parts = contents[0]["parts"].as_array().unwrap();
        assert_eq!(parts[0]["text"], "context note");
        assert!(parts[1].get("functionResponse").is_some());

        // The merged turn splits back into its original two messages.
        let decoded = adapter.decode_request(&encoded.body).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].role, Role::User);
        assert_eq!(decoded[1].role, Role::Tool);
    }

    #[test]
    fn tool_results_ride_in_user_role_function_response_parts() {
        let messages = vec![UnifiedMessage::tool_result(ToolResult {
            tool_call_id: "call_abc".to_string(),
            tool_name: "search".to_string(),
            output: json!({"hits": 3}),
            is_error: false,
        })];
        let encoded = adapter("gemini-2.0-flash")
            .encode_request(&messages, &[], &PipelineConfig::default())
            .unwrap();
        assert_eq!(
            encoded.body["contents"][0],
            json!({
                "role": "user",
                "parts": [{
                    "functionResponse": {
                        "name": "search",
                        "response": {"content": {"hits": 3}},
                    }
                }],
            })
        );
    }

    #[test]
    fn invalid_tool_schema_fails_before_any_request_is_built() {
        let tool = ToolDef::new("bad", json!({"anyOf": [{"type": "string"}]}));
        let err = adapter("gemini-2.0-flash")
            .encode_request(&[UnifiedMessage::user("hi")], &[tool], &PipelineConfig::default())
            .unwrap_err();
        assert!(matches!(err, PipelineError::SchemaConversion(_)));
    }

    #[test]
    fn decoded_function_calls_get_distinct_synthetic_ids() {
        let mut decoder = GoogleDecoder::default();
        let chunks = decoder.decode_event(
            r#"{"candidates":[{"content":{"parts":[
                {"functionCall":{"name":"a","args":{}}},
                {"functionCall":{"name":"b","args":{}}}
            ]},"finishReason":"STOP"}]}"#,
        );
        let ids: Vec<&String> = chunks
            .iter()
            .filter_map(|c| match c {
                StreamChunk::ToolCallReady { id, .. } => Some(id),
                _ => None,
            })
            .collect();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
        assert!(ids[0].starts_with("call_"));
        // Function calls override the wire's STOP.
        assert_eq!(
            chunks.last(),
            Some(&StreamChunk::Finish {
                reason: FinishReason::ToolCalls
            })
        );
    }

    #[test]
    fn truncated_tool_turn_keeps_its_length_signal() {
        let mut decoder = GoogleDecoder::default();
        let chunks = decoder.decode_event(
            r#"{"candidates":[{"content":{"parts":[
                {"functionCall":{"name":"search","args":{"q":"rust"}}}
            ]},"finishReason":"MAX_TOKENS"}]}"#,
        );
        assert_eq!(
            chunks.last(),
            Some(&StreamChunk::Finish {
                reason: FinishReason::Length
            })
        );
    }

    #[test]
    fn safety_stops_map_to_content_filter() {
        let mut decoder = GoogleDecoder::default();
        let chunks = decoder
            .decode_event(r#"{"candidates":[{"content":{"parts":[]},"finishReason":"SAFETY"}]}"#);
        assert_eq!(
            chunks,
            vec![StreamChunk::Finish {
                reason: FinishReason::ContentFilter
            }]
        );
    }

    #[test]
    fn stream_without_finish_reason_flushes_stop_at_eos() {
        let mut decoder = GoogleDecoder::default();
        let chunks =
            decoder.decode_event(r#"{"candidates":[{"content":{"parts":[{"text":"hi"}]}}]}"#);
        assert_eq!(
            chunks,
            vec![StreamChunk::TextDelta {
                text: "hi".to_string()
            }]
        );
        assert_eq!(
            decoder.finish(),
            vec![StreamChunk::Finish {
                reason: FinishReason::Stop
            }]
        );
    }
}
