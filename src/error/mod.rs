//! Error types for the pipeline.

use thiserror::Error;

/// Primary error type for all pipeline operations.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Rate limited: retry after {retry_after_ms:?}ms")]
    RateLimited { retry_after_ms: Option<u64> },

    /// Billing rejection from an upstream provider. Not a crash: the agent
    /// loop may substitute a fallback provider for the same logical turn.
    #[error("Provider balance rejected: {provider} — {message}")]
    ProviderBalance { provider: String, message: String },

    /// A tool schema that cannot be converted for the target provider.
    /// Fatal for the turn, raised before any network call.
    #[error("Schema conversion error: {0}")]
    SchemaConversion(String),

    #[error("Tool execution error: {tool_name} — {message}")]
    ToolExecution { tool_name: String, message: String },

    #[error("Timeout after {0}ms")]
    Timeout(u64),

    #[error("Stream error: {0}")]
    Stream(String),
}

/// Coarse classification used for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Authentication,
    RateLimit,
    Network,
    Timeout,
    Server,
    Api,
    Balance,
    Schema,
    ToolExecution,
    Serialization,
    Configuration,
    Stream,
}

impl PipelineError {
    /// Create an API error.
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Classify this error into a category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Authentication(_) => ErrorCategory::Authentication,
            Self::RateLimited { .. } => ErrorCategory::RateLimit,
            Self::Network(_) => ErrorCategory::Network,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::Configuration(_) => ErrorCategory::Configuration,
            Self::Serialization(_) => ErrorCategory::Serialization,
            Self::ProviderBalance { .. } => ErrorCategory::Balance,
            Self::SchemaConversion(_) => ErrorCategory::Schema,
            Self::ToolExecution { .. } => ErrorCategory::ToolExecution,
            Self::Stream(_) => ErrorCategory::Stream,
            Self::Api { status, .. } => match status {
                401 | 403 => ErrorCategory::Authentication,
                429 => ErrorCategory::RateLimit,
                500..=599 => ErrorCategory::Server,
                _ => ErrorCategory::Api,
            },
        }
    }

    /// Whether this error is worth retrying with backoff.
    ///
    /// Balance rejections are deliberately excluded: they are handled by
    /// provider fallback, not by retrying the same upstream.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::RateLimit
                | ErrorCategory::Network
                | ErrorCategory::Timeout
                | ErrorCategory::Server
        )
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, PipelineError>;
