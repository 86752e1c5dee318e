//! Transport capability: carries encoded provider calls over HTTP with
//! credentials and billing attribution attached.
//!
//! Adapters hand over an [`EncodedRequest`] with no secrets in it; the
//! transport injects the per-provider credential dialect and tags every call
//! with the customer it is billed to. Keeping this behind a trait lets tests
//! script provider behavior without a network.

pub mod stream;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue};
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::model::ProviderKind;
use crate::provider::http::{
    anthropic_headers, bearer_headers, google_headers, shared_client, status_to_error,
};
use crate::provider::EncodedRequest;

/// Header naming the customer a provider call is attributed to.
pub const ATTRIBUTION_HEADER: &str = "x-customer-id";

const ANTHROPIC_API_VERSION: &str = "2023-06-01";

/// A byte stream of one provider response body.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Performs provider calls on behalf of an attributed customer.
#[async_trait]
pub trait AttributedTransport: Send + Sync {
    /// Send the encoded request and return the raw streaming response body.
    ///
    /// Non-success statuses are mapped to pipeline errors before any bytes
    /// are surfaced, so callers only ever stream successful responses.
    async fn perform_attributed_call(
        &self,
        request: &EncodedRequest,
        customer_id: &str,
    ) -> Result<ByteStream>;
}

/// API keys for each provider, read from the environment.
#[derive(Debug, Clone, Default)]
pub struct ProviderCredentials {
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub google_api_key: Option<String>,
}

impl ProviderCredentials {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self {
            openai_api_key: std::env::var("OPENAI_API_KEY").ok(),
            anthropic_api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
            google_api_key: std::env::var("GOOGLE_API_KEY").ok(),
        }
    }

    fn key_for(&self, provider: ProviderKind) -> Result<&str> {
        let key = match provider {
            ProviderKind::OpenAi => self.openai_api_key.as_deref(),
            ProviderKind::Anthropic => self.anthropic_api_key.as_deref(),
            ProviderKind::Google => self.google_api_key.as_deref(),
        };
        key.ok_or_else(|| {
            PipelineError::Configuration(format!("no API key configured for {provider}"))
        })
    }
}

/// Production transport over the shared reqwest client.
pub struct HttpTransport {
    credentials: ProviderCredentials,
}

impl HttpTransport {
    pub fn new(credentials: ProviderCredentials) -> Self {
        Self { credentials }
    }

    pub fn from_env() -> Self {
        Self::new(ProviderCredentials::from_env())
    }

    fn headers_for(&self, request: &EncodedRequest) -> Result<HeaderMap> {
        let key = self.credentials.key_for(request.provider)?;
        let mut headers = match request.provider {
            ProviderKind::OpenAi => bearer_headers(key),
            ProviderKind::Anthropic => anthropic_headers(key, ANTHROPIC_API_VERSION),
            ProviderKind::Google => google_headers(key),
        };
        for (name, value) in request.extra_headers.iter() {
            headers.insert(name.clone(), value.clone());
        }
        Ok(headers)
    }
}

#[async_trait]
impl AttributedTransport for HttpTransport {
    async fn perform_attributed_call(
        &self,
        request: &EncodedRequest,
        customer_id: &str,
    ) -> Result<ByteStream> {
        let mut headers = self.headers_for(request)?;
        let attribution = HeaderValue::from_str(customer_id).map_err(|_| {
            PipelineError::Configuration(format!("customer id '{customer_id}' is not a valid header value"))
        })?;
        headers.insert(ATTRIBUTION_HEADER, attribution);

        debug!(
            provider = %request.provider,
            url = %request.url,
            customer_id,
            "dispatching provider call"
        );

        let response = shared_client()
            .post(&request.url)
            .headers(headers)
            .json(&request.body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_to_error(
                &request.provider.to_string(),
                status.as_u16(),
                &body,
            ));
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(PipelineError::Network))
            .boxed())
    }
}
