//! Atomic JSON document persistence.
//!
//! Every durable document (taskset, pool, slot metadata) is a single JSON
//! file written via write-temp-then-rename, so readers never observe a torn
//! document. Concurrent writers are serialized by the file locks owned by
//! the calling service; this layer only guarantees atomicity of each write.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::domain::error::StoreError;

/// Write `value` as pretty JSON to `path` atomically.
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let json = serde_json::to_vec_pretty(value).map_err(|e| StoreError::Corrupt {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| io_err(path, e))?;
    }

    // Unique temp name so a crashed writer never collides with a live one.
    let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, &json).await.map_err(|e| io_err(&tmp, e))?;
    tokio::fs::rename(&tmp, path).await.map_err(|e| io_err(path, e))?;
    debug!(path = %path.display(), bytes = json.len(), "wrote document");
    Ok(())
}

/// Read a JSON document. Missing file maps to `StoreError::NotFound`.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StoreError::NotFound(path.display().to_string()));
        }
        Err(e) => return Err(io_err(path, e)),
    };
    serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

fn io_err(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io { path: path.display().to_string(), source }
}

/// A directory of JSON documents keyed by name.
#[derive(Debug, Clone)]
pub struct DocumentStore {
    dir: PathBuf,
}

impl DocumentStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    pub async fn exists(&self, name: &str) -> bool {
        tokio::fs::try_exists(self.path_for(name)).await.unwrap_or(false)
    }

    pub async fn read<T: DeserializeOwned>(&self, name: &str) -> Result<T, StoreError> {
        read_json(&self.path_for(name)).await
    }

    pub async fn write<T: Serialize>(&self, name: &str, value: &T) -> Result<(), StoreError> {
        write_json_atomic(&self.path_for(name), value).await
    }

    /// Names of every stored document, sorted.
    pub async fn list(&self) -> Result<Vec<String>, StoreError> {
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(io_err(&self.dir, e)),
        };
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_err(&self.dir, e))? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}
