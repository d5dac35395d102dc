use std::time::Duration;

use anyhow::Result;
use axum::http::HeaderMap;
use reqwest::header;
use slipstream_core::GatewayError;
use slipstream_pool::{AdapterRequest, UpstreamAccount};
use tracing::debug;

/// Headers never forwarded towards an upstream.
const HOP_BY_HOP: &[&str] = &[
    "host",
    "authorization",
    "content-type",
    "content-length",
    "connection",
    "transfer-encoding",
    "keep-alive",
    "upgrade",
    "proxy-authorization",
    "te",
    "trailer",
];

/// Shared outbound HTTP client. TLS towards the platform uses real system
/// trust; there is no retry layer, health checks own failure handling.
#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    timeout: Duration,
}

impl UpstreamClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { http, timeout })
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    fn map_transport_error(err: reqwest::Error) -> GatewayError {
        if err.is_timeout() {
            GatewayError::UpstreamTimeout
        } else {
            GatewayError::UpstreamError {
                status: 0,
                body: GatewayError::snippet(&err.to_string()),
            }
        }
    }

    /// Forward a credential-swapped RPC body to the platform. Client headers
    /// ride along except hop-by-hop and identity headers, which the gateway
    /// owns; the content type is the already-normalised one.
    pub async fn forward_platform(
        &self,
        url: &str,
        content_type: &str,
        bearer: &str,
        client_headers: &HeaderMap,
        body: Vec<u8>,
    ) -> Result<reqwest::Response, GatewayError> {
        let mut request = self
            .http
            .post(url)
            .timeout(self.timeout)
            .header(header::CONTENT_TYPE, content_type)
            .header(header::AUTHORIZATION, format!("Bearer {bearer}"))
            .body(body);
        for (name, value) in client_headers {
            let lowered = name.as_str().to_ascii_lowercase();
            if HOP_BY_HOP.contains(&lowered.as_str()) {
                continue;
            }
            request = request.header(name, value);
        }
        debug!(url, "forwarding platform RPC");
        request.send().await.map_err(Self::map_transport_error)
    }

    /// Send an adapter-built request (probe or translated chat).
    pub async fn send_adapter_request(
        &self,
        request: AdapterRequest,
    ) -> Result<reqwest::Response, GatewayError> {
        self.http
            .post(&request.url)
            .timeout(self.timeout)
            .header(header::CONTENT_TYPE, request.content_type)
            .header(header::AUTHORIZATION, format!("Bearer {}", request.bearer))
            .body(request.body)
            .send()
            .await
            .map_err(Self::map_transport_error)
    }

    /// Forward an OpenAI-shaped chat completion to a pooled upstream
    /// account.
    pub async fn openai_chat(
        &self,
        account: &UpstreamAccount,
        payload: &serde_json::Value,
    ) -> Result<reqwest::Response, GatewayError> {
        let url = format!(
            "{}/chat/completions",
            account.base_url.trim_end_matches('/')
        );
        self.http
            .post(&url)
            .timeout(self.timeout)
            .bearer_auth(&account.api_key)
            .json(payload)
            .send()
            .await
            .map_err(Self::map_transport_error)
    }
}
