//! Model identity and capability flags.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::PipelineError;

/// The three backing provider families.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Google,
}

/// A concrete model plus the capability flags that select transport branches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelSpec {
    pub provider: ProviderKind,
    pub model_id: String,
    /// Some OpenAI models require the responses-style endpoint instead of
    /// chat/completions.
    #[serde(default)]
    pub uses_responses_api: bool,
}

impl ModelSpec {
    pub fn new(provider: ProviderKind, model_id: impl Into<String>) -> Self {
        Self {
            provider,
            model_id: model_id.into(),
            uses_responses_api: false,
        }
    }

    pub fn with_responses_api(mut self) -> Self {
        self.uses_responses_api = true;
        self
    }

    /// The Gemma sub-family does not accept a `systemInstruction` field; its
    /// system text is prepended to the first user turn instead.
    pub fn system_in_first_user_turn(&self) -> bool {
        self.provider == ProviderKind::Google && self.model_id.starts_with("gemma")
    }
}

impl FromStr for ModelSpec {
    type Err = PipelineError;

    /// Parse `"provider:model-id"`, e.g. `"anthropic:claude-sonnet-4"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (provider, model_id) = s.split_once(':').ok_or_else(|| {
            PipelineError::Configuration(format!(
                "invalid model spec '{s}', expected 'provider:model-id'"
            ))
        })?;
        let provider = provider.parse::<ProviderKind>().map_err(|_| {
            PipelineError::Configuration(format!("unknown provider '{provider}'"))
        })?;
        if model_id.is_empty() {
            return Err(PipelineError::Configuration(format!(
                "empty model id in '{s}'"
            )));
        }
        Ok(Self::new(provider, model_id))
    }
}

impl std::fmt::Display for ModelSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.provider, self.model_id)
    }
}
