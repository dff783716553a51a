//! Task domain model.
//!
//! Tasks are discrete units of work executed by agent runners.
//! Within a taskset they form a DAG via their dependency lists.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// State of a task in the execution pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// All non-optional dependencies are done; eligible for dispatch
    Ready,
    /// Claimed by a runner with a slot and reserved branch
    Running,
    /// Waiting on unfinished dependencies
    Blocked,
    /// Completed successfully
    Done,
    /// Terminal failure (retryable within the retry budget)
    Failed,
}

impl Default for TaskState {
    fn default() -> Self {
        Self::Ready
    }
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Blocked => "blocked",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "ready" => Some(Self::Ready),
            "running" => Some(Self::Running),
            "blocked" => Some(Self::Blocked),
            "done" | "complete" | "completed" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Check if this is a terminal state. Failed is only terminal once the
    /// retry budget is exhausted, which the registry decides.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Valid transitions from this state.
    pub fn valid_transitions(&self) -> &'static [TaskState] {
        match self {
            Self::Blocked => &[Self::Ready],
            Self::Ready => &[Self::Running, Self::Blocked, Self::Failed],
            Self::Running => &[Self::Done, Self::Failed],
            Self::Failed => &[Self::Ready], // bounded retry
            Self::Done => &[],
        }
    }

    pub fn can_transition_to(&self, new_state: Self) -> bool {
        self.valid_transitions().contains(&new_state)
    }
}

/// Type of artifact recorded against a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    Diff,
    Log,
    TestResult,
}

impl ArtifactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Diff => "diff",
            Self::Log => "log",
            Self::TestResult => "test_result",
        }
    }
}

/// Reference to an externally stored blob. Append-only per task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    #[serde(rename = "type")]
    pub artifact_type: ArtifactType,
    /// Opaque URI returned by the artifact store, stored verbatim
    pub uri: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Artifact {
    pub fn new(artifact_type: ArtifactType, uri: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            artifact_type,
            uri: uri.into(),
            size_bytes,
            created_at: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }
}

/// A discrete unit of work with a hierarchical id (e.g. `"1.2.3"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    /// Ordered textual constraints the work must satisfy
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    pub state: TaskState,
    /// Ids of tasks within the same taskset that must be Done first
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub required_skill: Option<String>,
    /// Higher runs first
    #[serde(default)]
    pub priority: i32,
    /// Optional tasks never block their dependents
    #[serde(default)]
    pub is_optional: bool,
    pub assigned_slot: Option<String>,
    pub reserved_branch: Option<String>,
    pub runner_id: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a new task. Born Ready; adding a dependency moves it to Blocked.
    pub fn new(id: impl Into<String>, title: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            description: description.into(),
            acceptance_criteria: Vec::new(),
            state: TaskState::Ready,
            dependencies: Vec::new(),
            required_skill: None,
            priority: 0,
            is_optional: false,
            assigned_slot: None,
            reserved_branch: None,
            runner_id: None,
            artifacts: Vec::new(),
            metadata: BTreeMap::new(),
            retry_count: 0,
            max_retries: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Add a dependency.
    pub fn with_dependency(mut self, task_id: impl Into<String>) -> Self {
        let task_id = task_id.into();
        if task_id != self.id && !self.dependencies.contains(&task_id) {
            self.dependencies.push(task_id);
            self.state = TaskState::Blocked;
        }
        self
    }

    pub fn with_skill(mut self, skill: impl Into<String>) -> Self {
        self.required_skill = Some(skill.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_acceptance_criteria(mut self, criteria: Vec<String>) -> Self {
        self.acceptance_criteria = criteria;
        self
    }

    pub fn optional(mut self) -> Self {
        self.is_optional = true;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Check if a task id is well formed: dot-separated decimal segments.
    pub fn is_valid_id(id: &str) -> bool {
        !id.is_empty()
            && id
                .split('.')
                .all(|seg| !seg.is_empty() && seg.bytes().all(|b| b.is_ascii_digit()))
    }

    pub fn can_transition_to(&self, new_state: TaskState) -> bool {
        self.state.can_transition_to(new_state)
    }

    /// Transition to a new state, updating `updated_at`.
    pub fn transition_to(&mut self, new_state: TaskState) -> Result<(), String> {
        if !self.can_transition_to(new_state) {
            return Err(format!(
                "cannot transition from {} to {}",
                self.state.as_str(),
                new_state.as_str()
            ));
        }
        self.state = new_state;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn can_retry(&self) -> bool {
        self.state == TaskState::Failed && self.retry_count < self.max_retries
    }

    /// Consume one unit of the retry budget and return to Ready.
    pub fn retry(&mut self) -> Result<(), String> {
        if !self.can_retry() {
            return Err("cannot retry: either not failed or retry budget exhausted".to_string());
        }
        self.retry_count += 1;
        self.assigned_slot = None;
        self.reserved_branch = None;
        self.runner_id = None;
        self.transition_to(TaskState::Ready)
    }

    /// Validate intrinsic task fields (id shape, title, self-dependency).
    pub fn validate(&self) -> Result<(), String> {
        if !Self::is_valid_id(&self.id) {
            return Err(format!("invalid task id: {:?}", self.id));
        }
        if self.title.trim().is_empty() {
            return Err("task title cannot be empty".to_string());
        }
        if self.dependencies.contains(&self.id) {
            return Err(format!("task {} cannot depend on itself", self.id));
        }
        Ok(())
    }
}

/// Everything a runner needs to execute one task against one slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskContext {
    pub task_id: String,
    pub spec_name: String,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: Vec<String>,
    /// Titles of completed dependencies, for prompt context
    pub dependencies: Vec<String>,
    pub required_skill: Option<String>,
    pub slot_id: String,
    pub slot_path: String,
    pub branch_name: String,
    #[serde(default)]
    pub test_commands: Vec<String>,
    pub timeout_seconds: u64,
    #[serde(default)]
    pub related_files: Vec<String>,
    pub max_tokens: Option<u32>,
    pub playbook_path: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_born_ready_without_dependencies() {
        let task = Task::new("1.1", "Implement login", "Add the login endpoint");
        assert_eq!(task.state, TaskState::Ready);
    }

    #[test]
    fn task_born_blocked_with_dependencies() {
        let task = Task::new("1.2", "Wire login UI", "Hook the endpoint up").with_dependency("1.1");
        assert_eq!(task.state, TaskState::Blocked);
        assert_eq!(task.dependencies, vec!["1.1".to_string()]);
    }

    #[test]
    fn self_dependency_ignored_by_builder_and_caught_by_validate() {
        let task = Task::new("1.1", "t", "d").with_dependency("1.1");
        assert!(task.dependencies.is_empty());

        let mut task = Task::new("1.1", "t", "d");
        task.dependencies.push("1.1".to_string());
        assert!(task.validate().is_err());
    }

    #[test]
    fn id_validation() {
        assert!(Task::is_valid_id("1"));
        assert!(Task::is_valid_id("1.2.3"));
        assert!(Task::is_valid_id("12.0.7"));
        assert!(!Task::is_valid_id(""));
        assert!(!Task::is_valid_id("1."));
        assert!(!Task::is_valid_id(".1"));
        assert!(!Task::is_valid_id("a.b"));
        assert!(!Task::is_valid_id("1..2"));
    }

    #[test]
    fn all_valid_transitions_succeed() {
        let mut t = Task::new("1", "t", "d");
        assert!(t.transition_to(TaskState::Running).is_ok());
        assert!(t.transition_to(TaskState::Done).is_ok());

        let mut t = Task::new("1", "t", "d");
        t.transition_to(TaskState::Running).unwrap();
        assert!(t.transition_to(TaskState::Failed).is_ok());
        assert!(t.transition_to(TaskState::Ready).is_ok());

        let mut t = Task::new("2", "t", "d").with_dependency("1");
        assert!(t.transition_to(TaskState::Ready).is_ok());
        assert!(t.transition_to(TaskState::Blocked).is_ok());

        // Immediate-fail admission
        let mut t = Task::new("1", "t", "d");
        assert!(t.transition_to(TaskState::Failed).is_ok());
    }

    #[test]
    fn invalid_transitions_return_err() {
        // Blocked → Running must pass through Ready
        let mut t = Task::new("2", "t", "d").with_dependency("1");
        assert!(t.transition_to(TaskState::Running).is_err());

        // Ready → Done must pass through Running
        let mut t = Task::new("1", "t", "d");
        assert!(t.transition_to(TaskState::Done).is_err());

        // Done is terminal
        let mut t = Task::new("1", "t", "d");
        t.transition_to(TaskState::Running).unwrap();
        t.transition_to(TaskState::Done).unwrap();
        assert!(t.transition_to(TaskState::Ready).is_err());
        assert!(t.transition_to(TaskState::Failed).is_err());
        assert!(t.transition_to(TaskState::Running).is_err());

        // Failed cannot re-enter Running directly
        let mut t = Task::new("1", "t", "d");
        t.transition_to(TaskState::Failed).unwrap();
        assert!(t.transition_to(TaskState::Running).is_err());
    }

    #[test]
    fn retry_consumes_budget_and_clears_assignment() {
        let mut t = Task::new("1", "t", "d").with_max_retries(1);
        t.transition_to(TaskState::Running).unwrap();
        t.assigned_slot = Some("demo-slot1".to_string());
        t.reserved_branch = Some("necro/demo/1".to_string());
        t.runner_id = Some("runner-a".to_string());
        t.transition_to(TaskState::Failed).unwrap();

        assert!(t.can_retry());
        t.retry().unwrap();
        assert_eq!(t.state, TaskState::Ready);
        assert_eq!(t.retry_count, 1);
        assert!(t.assigned_slot.is_none());
        assert!(t.reserved_branch.is_none());
        assert!(t.runner_id.is_none());

        t.transition_to(TaskState::Running).unwrap();
        t.transition_to(TaskState::Failed).unwrap();
        assert!(!t.can_retry());
        assert!(t.retry().is_err());
    }

    #[test]
    fn state_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&TaskState::Ready).unwrap(), "\"ready\"");
        assert_eq!(serde_json::to_string(&TaskState::Done).unwrap(), "\"done\"");
        assert_eq!(TaskState::from_str("FAILED"), Some(TaskState::Failed));
        assert_eq!(TaskState::from_str("nope"), None);
    }

    #[test]
    fn artifacts_append() {
        let mut t = Task::new("1", "t", "d");
        t.artifacts.push(Artifact::new(ArtifactType::Diff, "blob://d1", 120));
        t.artifacts.push(Artifact::new(ArtifactType::Log, "blob://l1", 64));
        assert_eq!(t.artifacts.len(), 2);
        assert_eq!(t.artifacts[0].artifact_type, ArtifactType::Diff);
    }
}
