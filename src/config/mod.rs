//! Pipeline configuration (layered: code > env > defaults).

use std::collections::HashMap;
use std::time::Duration;

use crate::model::ModelSpec;
use crate::util::RetryPolicy;

/// Default hard cap on model iterations per user turn.
pub const DEFAULT_MAX_ITERATIONS: usize = 10;

/// Default per-tool execution timeout.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for the agent pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    base_urls: HashMap<String, String>,
    /// Hard iteration cap per user turn. Exceeding it forces a graceful
    /// `Finish { reason: Length }`, never an unbounded loop.
    pub max_iterations: usize,
    /// Shared timeout applied to every tool invocation.
    pub tool_timeout: Duration,
    /// Retry policy for model calls.
    pub retry: RetryPolicy,
    /// Model substituted once per turn when the primary provider rejects the
    /// call for balance reasons. Richer fallback policies live outside the
    /// pipeline.
    pub fallback_model: Option<ModelSpec>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            base_urls: HashMap::new(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            retry: RetryPolicy::default(),
            fallback_model: None,
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load overrides from environment variables (and `.env` if present).
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let mut config = Self::new();

        let url_mappings = [
            ("OPENAI_BASE_URL", "openai"),
            ("ANTHROPIC_BASE_URL", "anthropic"),
            ("GOOGLE_BASE_URL", "google"),
        ];
        for (env_var, provider) in &url_mappings {
            if let Ok(url) = std::env::var(env_var) {
                config.set_base_url(provider, url);
            }
        }

        if let Ok(raw) = std::env::var("TYCHO_MAX_ITERATIONS") {
            if let Ok(n) = raw.parse::<usize>() {
                if n > 0 {
                    config.max_iterations = n;
                }
            }
        }
        if let Ok(raw) = std::env::var("TYCHO_TOOL_TIMEOUT_MS") {
            if let Ok(ms) = raw.parse::<u64>() {
                config.tool_timeout = Duration::from_millis(ms);
            }
        }
        if let Ok(raw) = std::env::var("TYCHO_FALLBACK_MODEL") {
            if let Ok(spec) = raw.parse::<ModelSpec>() {
                config.fallback_model = Some(spec);
            }
        }

        config
    }

    pub fn set_base_url(&mut self, provider: &str, url: impl Into<String>) {
        self.base_urls.insert(provider.to_string(), url.into());
    }

    pub fn with_base_url(mut self, provider: &str, url: impl Into<String>) -> Self {
        self.set_base_url(provider, url);
        self
    }

    pub fn with_fallback_model(mut self, model: ModelSpec) -> Self {
        self.fallback_model = Some(model);
        self
    }

    pub fn get_base_url(&self, provider: &str) -> Option<String> {
        self.base_urls.get(provider).cloned()
    }
}
