//! Artifact store port: opaque blob upload.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::domain::models::ArtifactType;

/// Blob service returning opaque URIs, stored verbatim by the registry.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn upload(
        &self,
        artifact_type: ArtifactType,
        bytes: Vec<u8>,
        metadata: BTreeMap<String, String>,
    ) -> anyhow::Result<String>;
}
