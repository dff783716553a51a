/// HTTP client for the LLM provider endpoint
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client as ReqwestClient;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::warn;

use crate::domain::models::LlmConfig;
use crate::domain::ports::{LlmClient, LlmRequest, LlmResponse};

use super::{backoff::Backoff, error::LlmApiError, rate_limiter::TokenBucketRateLimiter};

/// Wire request body: `messages`, `max_tokens`, and a model id.
#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: &'a [crate::domain::ports::LlmMessage],
}

/// Wire response: `{content, usage: {total_tokens}, model}`.
#[derive(Debug, Deserialize)]
struct WireResponse {
    content: String,
    usage: WireUsage,
    model: String,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    total_tokens: u64,
}

/// Production client for the provider endpoint.
///
/// Carries connection pooling and token-bucket rate limiting. Transient
/// failures (429, 5xx, transport) are retried against a bounded doubling
/// backoff; a rejected request surfaces immediately.
pub struct HttpLlmClient {
    http_client: ReqwestClient,
    api_key: String,
    base_url: String,
    default_model: String,
    rate_limiter: TokenBucketRateLimiter,
    max_retries: u32,
    initial_backoff_ms: u64,
    max_backoff_ms: u64,
}

impl HttpLlmClient {
    pub fn new(config: &LlmConfig, api_key: String) -> Result<Self> {
        let http_client = ReqwestClient::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .pool_max_idle_per_host(10)
            .tcp_nodelay(true)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            http_client,
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            default_model: config.model.clone(),
            rate_limiter: TokenBucketRateLimiter::new(config.requests_per_second),
            max_retries: config.max_retries,
            initial_backoff_ms: config.initial_backoff_ms,
            max_backoff_ms: config.max_backoff_ms,
        })
    }

    async fn send_request(&self, request: &LlmRequest) -> Result<LlmResponse, LlmApiError> {
        let model = request.model.as_deref().unwrap_or(&self.default_model);
        let body = WireRequest {
            model,
            max_tokens: request.max_tokens,
            messages: &request.messages,
        };

        let response = self
            .http_client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmApiError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "failed to read error response".to_string());
            return Err(LlmApiError::classify(status, body));
        }

        let wire: WireResponse = response.json().await.map_err(|e| {
            // A torn or malformed success body is as opaque as a transport
            // failure; give the endpoint another chance.
            LlmApiError::Unreachable(format!("malformed provider response: {e}"))
        })?;
        Ok(LlmResponse {
            content: wire.content,
            total_tokens: wire.usage.total_tokens,
            model: wire.model,
        })
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse> {
        self.rate_limiter.acquire().await;

        let mut delays = Backoff::new(self.max_retries, self.initial_backoff_ms, self.max_backoff_ms);
        loop {
            match self.send_request(&request).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() => match delays.next() {
                    Some(delay) => {
                        warn!(
                            error = %e,
                            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            "provider request failed; backing off"
                        );
                        sleep(delay).await;
                    }
                    None => return Err(e.into()),
                },
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::LlmMessage;
    use reqwest::StatusCode;

    fn config(base_url: &str) -> LlmConfig {
        LlmConfig {
            base_url: base_url.to_string(),
            model: "test-model".to_string(),
            max_tokens: 256,
            timeout_secs: 5,
            requests_per_second: 100.0,
            max_retries: 3,
            initial_backoff_ms: 10,
            max_backoff_ms: 50,
        }
    }

    fn request() -> LlmRequest {
        LlmRequest {
            messages: vec![LlmMessage::user("hello")],
            max_tokens: 256,
            model: None,
        }
    }

    #[tokio::test]
    async fn successful_completion_extracts_tokens() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/messages")
            .match_header("x-api-key", "k")
            .with_status(200)
            .with_body(r#"{"content":"done","usage":{"total_tokens":17},"model":"test-model"}"#)
            .create_async()
            .await;

        let client = HttpLlmClient::new(&config(&server.url()), "k".to_string()).unwrap();
        let response = client.complete(request()).await.unwrap();
        assert_eq!(response.content, "done");
        assert_eq!(response.total_tokens, 17);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn rate_limited_twice_then_succeeds() {
        let mut server = mockito::Server::new_async().await;
        let rate_limited = server
            .mock("POST", "/v1/messages")
            .with_status(429)
            .with_body("slow down")
            .expect(2)
            .create_async()
            .await;
        let ok = server
            .mock("POST", "/v1/messages")
            .with_status(200)
            .with_body(r#"{"content":"ok","usage":{"total_tokens":5},"model":"test-model"}"#)
            .create_async()
            .await;

        let client = HttpLlmClient::new(&config(&server.url()), "k".to_string()).unwrap();
        let response = client.complete(request()).await.unwrap();
        // Token count reflects only the accepted response.
        assert_eq!(response.total_tokens, 5);
        rate_limited.assert_async().await;
        ok.assert_async().await;
    }

    #[tokio::test]
    async fn rejected_request_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/messages")
            .with_status(401)
            .with_body("bad key")
            .expect(1)
            .create_async()
            .await;

        let client = HttpLlmClient::new(&config(&server.url()), "bad".to_string()).unwrap();
        let err = client.complete(request()).await.unwrap_err();
        let api_err = err.downcast_ref::<LlmApiError>().expect("typed error");
        assert!(matches!(api_err, LlmApiError::Rejected { .. }));
        assert_eq!(api_err.status(), Some(StatusCode::UNAUTHORIZED));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn server_faults_are_retried_until_the_budget_runs_dry() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/messages")
            .with_status(503)
            .with_body("overloaded")
            .expect(4) // initial + 3 retries
            .create_async()
            .await;

        let client = HttpLlmClient::new(&config(&server.url()), "k".to_string()).unwrap();
        let err = client.complete(request()).await.unwrap_err();
        let api_err = err.downcast_ref::<LlmApiError>().expect("typed error");
        assert!(api_err.is_transient());
        assert_eq!(api_err.status(), Some(StatusCode::SERVICE_UNAVAILABLE));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn malformed_success_body_is_retried_as_transient() {
        let mut server = mockito::Server::new_async().await;
        let torn = server
            .mock("POST", "/v1/messages")
            .with_status(200)
            .with_body(r#"{"content":"ok","usa"#)
            .expect(1)
            .create_async()
            .await;
        let ok = server
            .mock("POST", "/v1/messages")
            .with_status(200)
            .with_body(r#"{"content":"ok","usage":{"total_tokens":9},"model":"test-model"}"#)
            .expect(1)
            .create_async()
            .await;

        let client = HttpLlmClient::new(&config(&server.url()), "k".to_string()).unwrap();
        let response = client.complete(request()).await.unwrap();
        assert_eq!(response.total_tokens, 9);
        torn.assert_async().await;
        ok.assert_async().await;
    }
}
