//! LLM provider port.
//!
//! The provider is a request/response text endpoint; the core has no
//! opinion on which model answers. Retry and rate limiting live behind
//! the implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: String,
    pub content: String,
}

impl LlmMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }
}

/// Request to the provider endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmRequest {
    pub messages: Vec<LlmMessage>,
    pub max_tokens: u32,
    /// Overrides the configured default model when set
    pub model: Option<String>,
}

/// Response from the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    pub content: String,
    pub total_tokens: u64,
    pub model: String,
}

/// Text-completion endpoint. 429/5xx are retried internally per policy;
/// other 4xx surface as terminal errors.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: LlmRequest) -> anyhow::Result<LlmResponse>;
}
