//! Task Registry.
//!
//! Durable store of tasksets, tasks, and events; the single source of truth
//! for task state. Every read-then-write runs under the per-spec file lock,
//! persists the taskset atomically, and only then appends events, so readers
//! never observe state ahead of its document.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use crate::domain::error::{FailureReason, RegistryError};
use crate::domain::models::{
    Artifact, ArtifactType, DepGraph, EventType, RegistryConfig, Task, TaskEvent, TaskState,
    Taskset, TasksetValidationError,
};
use crate::domain::ports::{meta_keys, TaskStore};
use crate::infrastructure::event_log::EventLog;
use crate::infrastructure::lock::{LockGuard, LockManager};
use crate::infrastructure::store::DocumentStore;

/// Graph export formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphFormat {
    Dot,
    Mermaid,
}

/// The registry.
pub struct TaskRegistry {
    tasksets: DocumentStore,
    events: Arc<EventLog>,
    locks: LockManager,
}

impl TaskRegistry {
    pub fn new(config: &RegistryConfig) -> Self {
        let root = PathBuf::from(&config.data_dir);
        Self {
            tasksets: DocumentStore::new(root.join("tasksets")),
            events: Arc::new(EventLog::new(root.join("events"), config.max_event_log_bytes)),
            locks: LockManager::new(root.join("locks"), config.lock_timeout_secs, config.lock_lease_secs),
        }
    }

    pub fn event_log(&self) -> Arc<EventLog> {
        Arc::clone(&self.events)
    }

    async fn lock_spec(&self, spec_name: &str) -> Result<LockGuard, RegistryError> {
        let guard = self.locks.acquire(spec_name).await?;
        if let Some(stale) = &guard.cleared_stale {
            let event = TaskEvent::taskset_scoped(EventType::StaleLockCleared, spec_name)
                .with_detail("owner_id", stale.owner_id.clone())
                .with_detail("pid", stale.pid)
                .with_detail("lease_expired_at", stale.lease_expires_at.to_rfc3339());
            if let Err(e) = self.events.append(event).await {
                warn!(spec = spec_name, error = %e, "failed to record stale lock event");
            }
        }
        Ok(guard)
    }

    async fn load(&self, spec_name: &str) -> Result<Taskset, RegistryError> {
        self.tasksets.read(spec_name).await.map_err(|e| match e {
            crate::domain::error::StoreError::NotFound(_) => {
                RegistryError::TasksetNotFound(spec_name.to_string())
            }
            other => RegistryError::Storage(other),
        })
    }

    async fn persist(&self, taskset: &mut Taskset) -> Result<(), RegistryError> {
        taskset.touch();
        self.tasksets.write(&taskset.spec_name, taskset).await?;
        Ok(())
    }

    async fn emit(&self, event: TaskEvent) {
        if let Err(e) = self.events.append(event).await {
            warn!(error = %e, "failed to append event");
        }
    }

    // ------------------------------------------------------------------
    // Taskset lifecycle
    // ------------------------------------------------------------------

    /// Validate and persist a new taskset, emitting `TasksetCreated`.
    #[instrument(skip(self, tasks), fields(spec = spec_name))]
    pub async fn create_taskset(
        &self,
        spec_name: &str,
        tasks: Vec<Task>,
    ) -> Result<Taskset, RegistryError> {
        if self.tasksets.exists(spec_name).await {
            return Err(RegistryError::DuplicateTaskset(spec_name.to_string()));
        }

        let taskset = Taskset::new(spec_name, tasks).map_err(|e| match e {
            TasksetValidationError::UnknownDependency { task_id, dependency } => {
                RegistryError::UnknownDependency { task_id, dependency }
            }
            TasksetValidationError::CircularDependency(cycle) => {
                RegistryError::CircularDependency(cycle)
            }
            other => RegistryError::Validation(other.to_string()),
        })?;

        let _guard = self.lock_spec(spec_name).await?;
        // Re-check under the lock: another creator may have won the race.
        if self.tasksets.exists(spec_name).await {
            return Err(RegistryError::DuplicateTaskset(spec_name.to_string()));
        }
        self.tasksets.write(spec_name, &taskset).await?;

        self.emit(
            TaskEvent::taskset_scoped(EventType::TasksetCreated, spec_name)
                .with_detail("task_count", taskset.tasks.len()),
        )
        .await;
        info!(spec = spec_name, tasks = taskset.tasks.len(), "taskset created");
        Ok(taskset)
    }

    /// Operator cancel. Running tasks get a `CancelRequested` event the
    /// runner observes at its next suspension point; Ready tasks fail
    /// immediately with reason `Cancelled`.
    pub async fn cancel_task(&self, spec_name: &str, task_id: &str) -> Result<(), RegistryError> {
        let taskset = self.get_taskset(spec_name).await?;
        let task = taskset.task(task_id).ok_or_else(|| RegistryError::TaskNotFound {
            spec_name: spec_name.to_string(),
            task_id: task_id.to_string(),
        })?;

        match task.state {
            TaskState::Running => {
                self.emit(TaskEvent::new(EventType::CancelRequested, spec_name, task_id)).await;
                Ok(())
            }
            TaskState::Ready => {
                let mut metadata = BTreeMap::new();
                metadata.insert(
                    meta_keys::FAILURE_REASON.to_string(),
                    serde_json::Value::from(FailureReason::Cancelled.as_str()),
                );
                self.update_task_state(spec_name, task_id, TaskState::Failed, metadata).await?;
                Ok(())
            }
            state => Err(RegistryError::Validation(format!(
                "cannot cancel task {task_id} in state {}",
                state.as_str()
            ))),
        }
    }

    /// Render the dependency graph for operators.
    pub async fn export_dependency_graph(
        &self,
        spec_name: &str,
        format: GraphFormat,
    ) -> Result<String, RegistryError> {
        let taskset = self.get_taskset(spec_name).await?;
        let graph = taskset.graph();
        Ok(match format {
            GraphFormat::Dot => graph.to_dot(),
            GraphFormat::Mermaid => graph.to_mermaid(),
        })
    }

    /// Topological execution layers (defensive cycle detection included).
    pub async fn execution_order(&self, spec_name: &str) -> Result<Vec<Vec<String>>, RegistryError> {
        let taskset = self.get_taskset(spec_name).await?;
        DepGraph::from_tasks(&taskset.tasks)
            .execution_order()
            .map_err(RegistryError::CircularDependency)
    }

    /// Delete rotated event log files for a spec.
    pub async fn prune_events(&self, spec_name: &str) -> Result<usize, RegistryError> {
        Ok(self.events.prune(spec_name).await?)
    }

    /// Reconcile the taskset with its human-readable checklist document.
    #[instrument(skip(self), fields(spec = spec_name))]
    pub async fn sync_checklist(
        &self,
        spec_name: &str,
        doc_path: &std::path::Path,
        direction: crate::services::checklist::SyncDirection,
    ) -> Result<crate::services::checklist::SyncResult, RegistryError> {
        use crate::services::checklist::ChecklistSync;

        let _guard = self.lock_spec(spec_name).await?;
        let mut taskset = self.load(spec_name).await?;

        let result = ChecklistSync::sync_file(&mut taskset, doc_path, direction).await?;

        // Defensive: additions from the doc must keep the taskset sound.
        Taskset::validate_tasks(&taskset.tasks)
            .map_err(|e| RegistryError::Validation(e.to_string()))?;

        let registry_changed = !result.tasks_added.is_empty()
            || !result.titles_updated.is_empty()
            || !result.tasks_reenabled.is_empty();
        if registry_changed {
            self.persist(&mut taskset).await?;
            for task_id in &result.tasks_reenabled {
                self.emit(
                    TaskEvent::new(EventType::StateChanged, spec_name, task_id.clone())
                        .with_detail("from", TaskState::Failed.as_str())
                        .with_detail("to", TaskState::Ready.as_str())
                        .with_detail("source", "checklist_reenable"),
                )
                .await;
            }
        }
        Ok(result)
    }

    fn apply_metadata(task: &mut Task, metadata: &BTreeMap<String, serde_json::Value>) {
        for (key, value) in metadata {
            match key.as_str() {
                meta_keys::RUNNER_ID => task.runner_id = value.as_str().map(ToString::to_string),
                meta_keys::ASSIGNED_SLOT => {
                    task.assigned_slot = value.as_str().map(ToString::to_string);
                }
                meta_keys::RESERVED_BRANCH => {
                    task.reserved_branch = value.as_str().map(ToString::to_string);
                }
                _ => {
                    task.metadata.insert(key.clone(), value.clone());
                }
            }
        }
    }

    fn event_type_for(new_state: TaskState) -> EventType {
        match new_state {
            TaskState::Running => EventType::TaskStarted,
            TaskState::Done => EventType::TaskCompleted,
            TaskState::Failed => EventType::TaskFailed,
            TaskState::Ready | TaskState::Blocked => EventType::StateChanged,
        }
    }
}

#[async_trait]
impl TaskStore for TaskRegistry {
    async fn list_tasksets(&self) -> Result<Vec<String>, RegistryError> {
        Ok(self.tasksets.list().await?)
    }

    async fn get_taskset(&self, spec_name: &str) -> Result<Taskset, RegistryError> {
        self.load(spec_name).await
    }

    #[instrument(skip(self, metadata), fields(spec = spec_name, task = task_id, to = new_state.as_str()))]
    async fn update_task_state(
        &self,
        spec_name: &str,
        task_id: &str,
        new_state: TaskState,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> Result<Task, RegistryError> {
        let _guard = self.lock_spec(spec_name).await?;
        let mut taskset = self.load(spec_name).await?;

        let task = taskset.task_mut(task_id).ok_or_else(|| RegistryError::TaskNotFound {
            spec_name: spec_name.to_string(),
            task_id: task_id.to_string(),
        })?;

        // Idempotence under equality: same-state update is a no-op and emits
        // no second event.
        if task.state == new_state {
            return Ok(task.clone());
        }

        let from = task.state;
        if !task.can_transition_to(new_state) {
            return Err(RegistryError::InvalidStateTransition {
                task_id: task_id.to_string(),
                from,
                to: new_state,
            });
        }

        task.transition_to(new_state).map_err(RegistryError::Validation)?;
        Self::apply_metadata(task, &metadata);
        if new_state == TaskState::Done {
            task.assigned_slot = None;
            task.runner_id = None;
        }
        let updated = task.clone();

        // Cascade ready-computation for dependents once a task completes.
        let promoted = if new_state == TaskState::Done {
            taskset.refresh_ready_states()
        } else {
            Vec::new()
        };

        self.persist(&mut taskset).await?;

        let mut event = TaskEvent::new(Self::event_type_for(new_state), spec_name, task_id)
            .with_detail("from", from.as_str())
            .with_detail("to", new_state.as_str());
        for (key, value) in &metadata {
            event = event.with_detail(key.clone(), value.clone());
        }
        self.emit(event).await;

        for dependent in promoted {
            self.emit(
                TaskEvent::new(EventType::DependencyUnblocked, spec_name, dependent)
                    .with_detail("completed_dependency", task_id),
            )
            .await;
        }

        Ok(updated)
    }

    async fn get_ready_tasks(
        &self,
        spec_name: &str,
        required_skill: Option<&str>,
    ) -> Result<Vec<Task>, RegistryError> {
        let taskset = self.load(spec_name).await?;
        Ok(taskset.ready_tasks(required_skill).into_iter().cloned().collect())
    }

    async fn add_artifact(
        &self,
        spec_name: &str,
        task_id: &str,
        artifact_type: ArtifactType,
        uri: &str,
        size_bytes: u64,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> Result<Artifact, RegistryError> {
        let _guard = self.lock_spec(spec_name).await?;
        let mut taskset = self.load(spec_name).await?;

        let task = taskset.task_mut(task_id).ok_or_else(|| RegistryError::TaskNotFound {
            spec_name: spec_name.to_string(),
            task_id: task_id.to_string(),
        })?;

        let mut artifact = Artifact::new(artifact_type, uri, size_bytes);
        artifact.metadata = metadata;
        task.artifacts.push(artifact.clone());
        task.updated_at = Utc::now();

        self.persist(&mut taskset).await?;
        self.emit(
            TaskEvent::new(EventType::ArtifactAdded, spec_name, task_id)
                .with_detail("artifact_type", artifact_type.as_str())
                .with_detail("uri", uri)
                .with_detail("size_bytes", size_bytes),
        )
        .await;
        Ok(artifact)
    }

    async fn record_event(&self, event: TaskEvent) -> Result<(), RegistryError> {
        self.events.append(event).await?;
        Ok(())
    }

    async fn query_events(
        &self,
        spec_name: &str,
        task_id: Option<&str>,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<TaskEvent>, RegistryError> {
        Ok(self.events.query(spec_name, task_id, since, until).await?)
    }

    async fn is_cancel_requested(&self, spec_name: &str, task_id: &str) -> Result<bool, RegistryError> {
        let events = self.events.query(spec_name, Some(task_id), None, None).await?;
        // Only cancels issued after the latest start apply; earlier ones
        // belong to previous attempts.
        let last_start = events
            .iter()
            .rposition(|e| e.event_type == EventType::TaskStarted)
            .map_or(0, |i| i + 1);
        Ok(events[last_start..]
            .iter()
            .any(|e| e.event_type == EventType::CancelRequested))
    }

    async fn retry_task(
        &self,
        spec_name: &str,
        task_id: &str,
        budget_override: Option<u32>,
    ) -> Result<Task, RegistryError> {
        let _guard = self.lock_spec(spec_name).await?;
        let mut taskset = self.load(spec_name).await?;

        let task = taskset.task_mut(task_id).ok_or_else(|| RegistryError::TaskNotFound {
            spec_name: spec_name.to_string(),
            task_id: task_id.to_string(),
        })?;

        if task.state != TaskState::Failed {
            return Err(RegistryError::InvalidStateTransition {
                task_id: task_id.to_string(),
                from: task.state,
                to: TaskState::Ready,
            });
        }
        let budget = budget_override.unwrap_or(0).max(task.max_retries);
        if task.retry_count >= budget {
            return Err(RegistryError::RetryBudgetExhausted {
                spec_name: spec_name.to_string(),
                task_id: task_id.to_string(),
            });
        }
        task.retry_count += 1;
        task.assigned_slot = None;
        task.reserved_branch = None;
        task.runner_id = None;
        task.transition_to(TaskState::Ready).map_err(RegistryError::Validation)?;
        let retry_count = task.retry_count;
        let updated = task.clone();

        self.persist(&mut taskset).await?;
        self.emit(
            TaskEvent::new(EventType::StateChanged, spec_name, task_id)
                .with_detail("from", TaskState::Failed.as_str())
                .with_detail("to", TaskState::Ready.as_str())
                .with_detail("retry_count", retry_count),
        )
        .await;
        Ok(updated)
    }
}
