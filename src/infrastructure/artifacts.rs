//! Artifact store HTTP client.
//!
//! The store is an opaque blob service: bytes in, URI out. The returned URI
//! is recorded verbatim against the task.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client as ReqwestClient;
use serde::Deserialize;

use crate::domain::models::{ArtifactStoreConfig, ArtifactType};
use crate::domain::ports::ArtifactStore;

#[derive(Debug, Deserialize)]
struct UploadResponse {
    uri: String,
}

/// HTTP implementation of the artifact store contract.
pub struct HttpArtifactStore {
    http_client: ReqwestClient,
    base_url: String,
}

impl HttpArtifactStore {
    pub fn new(config: &ArtifactStoreConfig) -> Result<Self> {
        let http_client = ReqwestClient::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("failed to build artifact store client")?;
        Ok(Self {
            http_client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ArtifactStore for HttpArtifactStore {
    async fn upload(
        &self,
        artifact_type: ArtifactType,
        bytes: Vec<u8>,
        metadata: BTreeMap<String, String>,
    ) -> Result<String> {
        let metadata_json =
            serde_json::to_string(&metadata).context("failed to encode artifact metadata")?;

        let response = self
            .http_client
            .post(format!("{}/artifacts", self.base_url))
            .header("content-type", "application/octet-stream")
            .header("x-artifact-type", artifact_type.as_str())
            .header("x-artifact-metadata", metadata_json)
            .body(bytes)
            .send()
            .await
            .context("artifact upload request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("artifact upload rejected ({status}): {body}");
        }

        let parsed: UploadResponse = response
            .json()
            .await
            .context("failed to parse artifact store response")?;
        Ok(parsed.uri)
    }
}
