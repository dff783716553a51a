//! Task store port: the registry contract consumed by the dispatcher,
//! runners, and the CLI.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::error::RegistryError;
use crate::domain::models::{Artifact, ArtifactType, Task, TaskEvent, TaskState, Taskset};

/// Recognized metadata keys for `update_task_state`. Anything else is
/// carried opaquely in the task's metadata map.
pub mod meta_keys {
    pub const RUNNER_ID: &str = "runner_id";
    pub const ASSIGNED_SLOT: &str = "assigned_slot";
    pub const RESERVED_BRANCH: &str = "reserved_branch";
    pub const FAILURE_REASON: &str = "failure_reason";
    pub const FAILURE_DETAIL: &str = "failure_detail";
}

/// Durable store of tasksets and events; the authority on task state.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Spec names of every stored taskset.
    async fn list_tasksets(&self) -> Result<Vec<String>, RegistryError>;

    async fn get_taskset(&self, spec_name: &str) -> Result<Taskset, RegistryError>;

    /// Guarded state transition under the per-spec lock. Recognized metadata
    /// keys update assignment fields; transitioning to Done cascades
    /// ready-computation over dependents. Updating to the current state is a
    /// no-op. Returns the task after the update.
    async fn update_task_state(
        &self,
        spec_name: &str,
        task_id: &str,
        new_state: TaskState,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> Result<Task, RegistryError>;

    /// Ready tasks, optionally skill-filtered, priority-descending with
    /// id-ascending tie-breaking.
    async fn get_ready_tasks(
        &self,
        spec_name: &str,
        required_skill: Option<&str>,
    ) -> Result<Vec<Task>, RegistryError>;

    async fn add_artifact(
        &self,
        spec_name: &str,
        task_id: &str,
        artifact_type: ArtifactType,
        uri: &str,
        size_bytes: u64,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> Result<Artifact, RegistryError>;

    /// Append an event independent of any state change (heartbeats,
    /// external signals).
    async fn record_event(&self, event: TaskEvent) -> Result<(), RegistryError>;

    async fn query_events(
        &self,
        spec_name: &str,
        task_id: Option<&str>,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<TaskEvent>, RegistryError>;

    /// Whether a cancel has been requested for the task. Runners poll this
    /// at suspension points.
    async fn is_cancel_requested(&self, spec_name: &str, task_id: &str) -> Result<bool, RegistryError>;

    /// Failed → Ready retry, consuming one unit of the budget. The budget
    /// is the task's own `max_retries` unless the caller passes a larger
    /// override (the dispatcher does, for transient failure reasons).
    async fn retry_task(
        &self,
        spec_name: &str,
        task_id: &str,
        budget_override: Option<u32>,
    ) -> Result<Task, RegistryError>;
}
