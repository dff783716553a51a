//! Task event domain model.
//!
//! Events are the immutable audit trail of the registry. They are appended
//! to a per-spec line-delimited JSON log and never mutated. Consumers treat
//! them as hints and confirm against taskset state when authoritativeness
//! matters.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TasksetCreated,
    TaskAssigned,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    StateChanged,
    ArtifactAdded,
    DependencyUnblocked,
    RunnerHeartbeat,
    HeartbeatTimeout,
    CancelRequested,
    StaleLockCleared,
    SlotRecovered,
    DispatchSkipped,
    RetryScheduled,
    DeadlockSuspected,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TasksetCreated => "taskset_created",
            Self::TaskAssigned => "task_assigned",
            Self::TaskStarted => "task_started",
            Self::TaskCompleted => "task_completed",
            Self::TaskFailed => "task_failed",
            Self::StateChanged => "state_changed",
            Self::ArtifactAdded => "artifact_added",
            Self::DependencyUnblocked => "dependency_unblocked",
            Self::RunnerHeartbeat => "runner_heartbeat",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::CancelRequested => "cancel_requested",
            Self::StaleLockCleared => "stale_lock_cleared",
            Self::SlotRecovered => "slot_recovered",
            Self::DispatchSkipped => "dispatch_skipped",
            Self::RetryScheduled => "retry_scheduled",
            Self::DeadlockSuspected => "deadlock_suspected",
        }
    }
}

/// Immutable audit record. `task_id` is empty for taskset-scoped events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub event_type: EventType,
    pub spec_name: String,
    #[serde(default)]
    pub task_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub details: BTreeMap<String, serde_json::Value>,
}

impl TaskEvent {
    pub fn new(event_type: EventType, spec_name: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            event_type,
            spec_name: spec_name.into(),
            task_id: task_id.into(),
            timestamp: Utc::now(),
            details: BTreeMap::new(),
        }
    }

    pub fn taskset_scoped(event_type: EventType, spec_name: impl Into<String>) -> Self {
        Self::new(event_type, spec_name, "")
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}
