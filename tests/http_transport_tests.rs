//! HTTP transport behavior against a mock server: credential dialects,
//! attribution, status mapping, and SSE decoding end to end.

use futures::StreamExt;
use pretty_assertions::assert_eq;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use tycho::config::PipelineConfig;
use tycho::error::{ErrorCategory, PipelineError};
use tycho::model::ModelSpec;
use tycho::provider::adapter_for;
use tycho::transport::stream::chunk_stream;
use tycho::transport::{AttributedTransport, HttpTransport, ProviderCredentials};
use tycho::types::{FinishReason, StreamChunk, UnifiedMessage};

fn credentials() -> ProviderCredentials {
    ProviderCredentials {
        openai_api_key: Some("test-openai-key".to_string()),
        anthropic_api_key: Some("test-anthropic-key".to_string()),
        google_api_key: None,
    }
}

async fn encode_for(server: &MockServer, model: &str) -> tycho::provider::EncodedRequest {
    let model: ModelSpec = model.parse().unwrap();
    let provider = model.provider.to_string();
    let config =
        PipelineConfig::default().with_base_url(&provider, format!("{}/v1", server.uri()));
    adapter_for(&model)
        .encode_request(&[UnifiedMessage::user("hi")], &[], &config)
        .unwrap()
}

#[tokio::test]
async fn openai_calls_carry_bearer_auth_and_attribution() {
    let server = MockServer::start().await;
    let sse = "data: {\"choices\":[{\"delta\":{\"content\":\"hey\"}}]}\n\n\
data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n\
data: [DONE]\n\n";
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer test-openai-key"))
        .and(header("x-customer-id", "cust-42"))
        .and(body_partial_json(serde_json::json!({"stream": true})))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(sse),
        )
        .expect(1)
        .mount(&server)
        .await;

    let transport = HttpTransport::new(credentials());
    let request = encode_for(&server, "openai:gpt-4o").await;
    let bytes = transport
        .perform_attributed_call(&request, "cust-42")
        .await
        .unwrap();

    let model: ModelSpec = "openai:gpt-4o".parse().unwrap();
    let chunks: Vec<StreamChunk> = chunk_stream(bytes, adapter_for(&model).decoder())
        .map(|c| c.unwrap())
        .collect()
        .await;
    assert_eq!(
        chunks,
        vec![
            StreamChunk::TextDelta {
                text: "hey".to_string()
            },
            StreamChunk::Finish {
                reason: FinishReason::Stop
            },
        ]
    );
}

#[tokio::test]
async fn anthropic_calls_use_the_x_api_key_dialect() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "test-anthropic-key"))
        .and(header("anthropic-version", "2023-06-01"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string("data: {\"type\":\"message_stop\"}\n\n"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let transport = HttpTransport::new(credentials());
    let request = encode_for(&server, "anthropic:claude-sonnet-4").await;
    transport
        .perform_attributed_call(&request, "cust-42")
        .await
        .unwrap();
}

#[tokio::test]
async fn payment_required_surfaces_as_balance_rejection() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(402).set_body_string("payment required"))
        .mount(&server)
        .await;

    let transport = HttpTransport::new(credentials());
    let request = encode_for(&server, "openai:gpt-4o").await;
    let err = transport
        .perform_attributed_call(&request, "cust-42")
        .await
        .map(|_| ())
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Balance);
}

#[tokio::test]
async fn rate_limits_carry_the_upstream_retry_hint() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(429).set_body_string(r#"{"error":{"retry_after":2.0}}"#),
        )
        .mount(&server)
        .await;

    let transport = HttpTransport::new(credentials());
    let request = encode_for(&server, "openai:gpt-4o").await;
    let err = transport
        .perform_attributed_call(&request, "cust-42")
        .await
        .map(|_| ())
        .unwrap_err();
    match err {
        PipelineError::RateLimited { retry_after_ms } => assert_eq!(retry_after_ms, Some(2000)),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn missing_credentials_fail_before_any_request() {
    let server = MockServer::start().await;
    let transport = HttpTransport::new(ProviderCredentials::default());
    let request = encode_for(&server, "openai:gpt-4o").await;
    let err = transport
        .perform_attributed_call(&request, "cust-42")
        .await
        .map(|_| ())
        .unwrap_err();
    assert!(matches!(err, PipelineError::Configuration(_)));
    assert!(server.received_requests().await.unwrap().is_empty());
}
