//! Shared HTTP client, SSE parsing, and status-mapping utilities.

use std::sync::OnceLock;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};

use crate::error::PipelineError;

static SHARED_CLIENT: OnceLock<reqwest::Client> = OnceLock::new();

/// Get (or create) the shared reqwest client.
pub fn shared_client() -> &'static reqwest::Client {
    SHARED_CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .pool_max_idle_per_host(10)
            .build()
            .expect("Failed to build HTTP client")
    })
}

/// Build default headers for a Bearer-token API.
pub fn bearer_headers(api_key: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Ok(val) = HeaderValue::from_str(&format!("Bearer {api_key}")) {
        headers.insert(AUTHORIZATION, val);
    }
    headers
}

/// Build Anthropic-style headers (x-api-key + version).
pub fn anthropic_headers(api_key: &str, version: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Ok(val) = HeaderValue::from_str(api_key) {
        headers.insert("x-api-key", val);
    }
    if let Ok(val) = HeaderValue::from_str(version) {
        headers.insert("anthropic-version", val);
    }
    headers
}

/// Build Google-style headers (x-goog-api-key).
pub fn google_headers(api_key: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Ok(val) = HeaderValue::from_str(api_key) {
        headers.insert("x-goog-api-key", val);
    }
    headers
}

/// Parse an SSE "data:" line, returning None for "[DONE]".
pub fn parse_sse_data(line: &str) -> Option<&str> {
    let data = line.strip_prefix("data: ")?;
    if data == "[DONE]" {
        return None;
    }
    Some(data)
}

/// Map a non-200 HTTP status into a pipeline error.
///
/// Billing rejections (402, or a 403 whose body names the balance) become
/// `ProviderBalance` so the agent loop can substitute a fallback provider
/// instead of failing the turn.
pub fn status_to_error(provider: &str, status: u16, body: &str) -> PipelineError {
    match status {
        402 => PipelineError::ProviderBalance {
            provider: provider.to_string(),
            message: body.to_string(),
        },
        403 if looks_like_balance_rejection(body) => PipelineError::ProviderBalance {
            provider: provider.to_string(),
            message: body.to_string(),
        },
        401 | 403 => PipelineError::Authentication(body.to_string()),
        429 => PipelineError::RateLimited {
            retry_after_ms: extract_retry_after(body),
        },
        _ => PipelineError::api(status, body),
    }
}

fn looks_like_balance_rejection(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("insufficient") && (lower.contains("balance") || lower.contains("credit"))
        || lower.contains("billing")
}

fn extract_retry_after(body: &str) -> Option<u64> {
    // Try to parse retry-after from a JSON error body
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("retry_after"))
                .and_then(|r| r.as_f64())
                .map(|s| (s * 1000.0) as u64)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;

    #[test]
    fn sse_data_lines_strip_prefix_and_done() {
        assert_eq!(parse_sse_data("data: {\"x\":1}"), Some("{\"x\":1}"));
        assert_eq!(parse_sse_data("data: [DONE]"), None);
        assert_eq!(parse_sse_data("event: ping"), None);
    }

    #[test]
    fn payment_required_maps_to_balance() {
        let err = status_to_error("openai", 402, "payment required");
        assert_eq!(err.category(), ErrorCategory::Balance);
    }

    #[test]
    fn forbidden_with_balance_body_maps_to_balance() {
        let err = status_to_error("anthropic", 403, "insufficient credit balance");
        assert_eq!(err.category(), ErrorCategory::Balance);
        let err = status_to_error("anthropic", 403, "key disabled");
        assert_eq!(err.category(), ErrorCategory::Authentication);
    }

    #[test]
    fn rate_limit_extracts_retry_after() {
        let err = status_to_error("openai", 429, r#"{"error":{"retry_after":1.5}}"#);
        match err {
            PipelineError::RateLimited { retry_after_ms } => {
                assert_eq!(retry_after_ms, Some(1500));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
