//! Append-only event logs.
//!
//! One line-delimited JSON file per spec under `events/`. Appends are
//! serialized per spec within the process; each append is a single write of
//! one line. Files rotate to `.N` suffixes at a size threshold and rotated
//! files are retained until explicitly pruned.
//!
//! Timestamps are kept monotonic per task: if the wall clock regresses, the
//! appended event is re-clocked to one millisecond past the previous event.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::domain::error::StoreError;
use crate::domain::models::TaskEvent;

/// Per-spec JSONL event log with size-based rotation.
pub struct EventLog {
    dir: PathBuf,
    max_bytes: u64,
    /// spec → append guard + last-seen timestamp per task
    state: Mutex<HashMap<String, Arc<Mutex<SpecLogState>>>>,
}

#[derive(Default)]
struct SpecLogState {
    last_timestamps: HashMap<String, DateTime<Utc>>,
}

impl EventLog {
    pub fn new(dir: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            dir: dir.into(),
            max_bytes,
            state: Mutex::new(HashMap::new()),
        }
    }

    fn log_path(&self, spec_name: &str) -> PathBuf {
        self.dir.join(format!("{spec_name}.events.jsonl"))
    }

    async fn spec_state(&self, spec_name: &str) -> Arc<Mutex<SpecLogState>> {
        let mut state = self.state.lock().await;
        state
            .entry(spec_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SpecLogState::default())))
            .clone()
    }

    /// Append one event, rotating first if the live file is at the
    /// threshold. Returns the event as written (possibly re-clocked).
    pub async fn append(&self, mut event: TaskEvent) -> Result<TaskEvent, StoreError> {
        let spec_state = self.spec_state(&event.spec_name).await;
        let mut guard = spec_state.lock().await;

        // Monotonic per-task clock.
        let key = event.task_id.clone();
        if let Some(prev) = guard.last_timestamps.get(&key) {
            if event.timestamp <= *prev {
                let bumped = *prev + Duration::milliseconds(1);
                warn!(
                    spec = %event.spec_name,
                    task = %event.task_id,
                    "clock regressed; re-clocking event to {bumped}"
                );
                event.timestamp = bumped;
            }
        }
        guard.last_timestamps.insert(key, event.timestamp);

        let path = self.log_path(&event.spec_name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| io_err(parent, e))?;
        }
        self.rotate_if_needed(&path).await?;

        let mut line = serde_json::to_string(&event).map_err(|e| StoreError::Corrupt {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| io_err(&path, e))?;
        file.write_all(line.as_bytes()).await.map_err(|e| io_err(&path, e))?;
        file.flush().await.map_err(|e| io_err(&path, e))?;

        Ok(event)
    }

    /// Rotate `path` to the next free `.N` suffix when at or past the
    /// size threshold.
    async fn rotate_if_needed(&self, path: &Path) -> Result<(), StoreError> {
        let size = match tokio::fs::metadata(path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(io_err(path, e)),
        };
        if size < self.max_bytes {
            return Ok(());
        }

        let next = self.rotated_indices(path).await?.last().copied().unwrap_or(0) + 1;
        let rotated = rotated_path(path, next);
        tokio::fs::rename(path, &rotated).await.map_err(|e| io_err(path, e))?;
        debug!(from = %path.display(), to = %rotated.display(), size, "rotated event log");
        Ok(())
    }

    /// Existing rotation indices for a log, ascending (`.1` is oldest).
    async fn rotated_indices(&self, path: &Path) -> Result<Vec<u32>, StoreError> {
        let Some(parent) = path.parent() else { return Ok(Vec::new()) };
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            return Ok(Vec::new());
        };
        let prefix = format!("{file_name}.");

        let mut indices = Vec::new();
        let mut entries = match tokio::fs::read_dir(parent).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(indices),
            Err(e) => return Err(io_err(parent, e)),
        };
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_err(parent, e))? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(suffix) = name.strip_prefix(&prefix) {
                    if let Ok(n) = suffix.parse::<u32>() {
                        indices.push(n);
                    }
                }
            }
        }
        indices.sort_unstable();
        Ok(indices)
    }

    /// Read events for a spec in append order (rotated files first),
    /// optionally filtered by task id and time range. Unparsable lines are
    /// skipped with a warning rather than poisoning the query.
    pub async fn query(
        &self,
        spec_name: &str,
        task_id: Option<&str>,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<TaskEvent>, StoreError> {
        let path = self.log_path(spec_name);
        let mut files: Vec<PathBuf> = self
            .rotated_indices(&path)
            .await?
            .into_iter()
            .map(|n| rotated_path(&path, n))
            .collect();
        files.push(path);

        let mut events = Vec::new();
        for file in files {
            let content = match tokio::fs::read_to_string(&file).await {
                Ok(content) => content,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(io_err(&file, e)),
            };
            for line in content.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<TaskEvent>(line) {
                    Ok(event) => {
                        if let Some(id) = task_id {
                            if event.task_id != id {
                                continue;
                            }
                        }
                        if let Some(since) = since {
                            if event.timestamp < since {
                                continue;
                            }
                        }
                        if let Some(until) = until {
                            if event.timestamp > until {
                                continue;
                            }
                        }
                        events.push(event);
                    }
                    Err(e) => {
                        warn!(file = %file.display(), error = %e, "skipping unparsable event line");
                    }
                }
            }
        }
        Ok(events)
    }

    /// Delete rotated files for a spec, keeping the live log. Returns the
    /// number of files removed.
    pub async fn prune(&self, spec_name: &str) -> Result<usize, StoreError> {
        let path = self.log_path(spec_name);
        let indices = self.rotated_indices(&path).await?;
        let mut removed = 0;
        for n in indices {
            let rotated = rotated_path(&path, n);
            tokio::fs::remove_file(&rotated).await.map_err(|e| io_err(&rotated, e))?;
            removed += 1;
        }
        Ok(removed)
    }
}

fn rotated_path(path: &Path, index: u32) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".{index}"));
    path.with_file_name(name)
}

fn io_err(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io { path: path.display().to_string(), source }
}
