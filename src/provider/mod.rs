//! Provider adapters: bidirectional translation between the unified message
//! model and each provider wire format.

pub mod anthropic;
pub mod google;
pub mod http;
pub mod openai;
pub mod openai_responses;
pub mod schema;

use reqwest::header::HeaderMap;

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::model::{ModelSpec, ProviderKind};
use crate::types::{StreamChunk, ToolDef, UnifiedMessage};

/// A fully encoded provider call, ready for the transport capability.
///
/// Credentials and attribution headers are deliberately absent: attaching
/// them is the transport's job.
#[derive(Debug, Clone)]
pub struct EncodedRequest {
    pub provider: ProviderKind,
    pub url: String,
    /// Provider-dialect headers that are not credentials (e.g. API version).
    pub extra_headers: HeaderMap,
    pub body: serde_json::Value,
}

/// Stateful incremental decoder for one streaming provider response.
///
/// The transport feeds it each SSE `data:` payload in provider order; it
/// emits zero or more uniform chunks per payload. Partial tool-call argument
/// fragments are held back until a complete `ToolCallReady` can be emitted —
/// a call is never surfaced for dispatch with incomplete input.
pub trait EventDecoder: Send {
    fn decode_event(&mut self, data: &str) -> Vec<StreamChunk>;

    /// Flush any trailing state at end-of-stream.
    fn finish(&mut self) -> Vec<StreamChunk>;
}

/// Closed adapter capability with exactly four implementations: OpenAI
/// chat/completions, OpenAI responses, Anthropic messages, Google
/// generateContent. Adding a provider means adding one implementation here,
/// not threading branches through the pipeline.
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> ProviderKind;

    /// Encode a conversation plus tool definitions into one provider call.
    /// Pure data transformation: only schema conversion (provider C) can
    /// fail, and it fails before any network activity.
    fn encode_request(
        &self,
        messages: &[UnifiedMessage],
        tools: &[ToolDef],
        config: &PipelineConfig,
    ) -> Result<EncodedRequest, PipelineError>;

    /// Decode an encoded request body back into unified messages.
    ///
    /// Inverse of `encode_request` over the feature subset the provider
    /// supports; used to rehydrate history and to verify the round-trip law.
    fn decode_request(&self, body: &serde_json::Value)
        -> Result<Vec<UnifiedMessage>, PipelineError>;

    /// Fresh incremental decoder for one streaming response.
    fn decoder(&self) -> Box<dyn EventDecoder>;
}

/// Select the adapter for a model, honoring its capability flags.
pub fn adapter_for(model: &ModelSpec) -> Box<dyn ProviderAdapter> {
    match model.provider {
        ProviderKind::OpenAi if model.uses_responses_api => {
            Box::new(openai_responses::OpenAiResponsesAdapter::new(model.clone()))
        }
        ProviderKind::OpenAi => Box::new(openai::OpenAiAdapter::new(model.clone())),
        ProviderKind::Anthropic => Box::new(anthropic::AnthropicAdapter::new(model.clone())),
        ProviderKind::Google => Box::new(google::GoogleAdapter::new(model.clone())),
    }
}
