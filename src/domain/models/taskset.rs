//! Taskset domain model.
//!
//! A taskset is the named collection of tasks produced by planning one spec.
//! It is the unit of persistence for the registry: one JSON document per
//! spec, rewritten atomically on every mutation.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::graph::DepGraph;
use super::task::{Task, TaskState};

/// Why taskset admission was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TasksetValidationError {
    InvalidTaskId(String),
    DuplicateTaskId(String),
    UnknownDependency { task_id: String, dependency: String },
    CircularDependency(Vec<String>),
    InvalidTask { task_id: String, reason: String },
}

impl std::fmt::Display for TasksetValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidTaskId(id) => write!(f, "invalid task id {id:?}"),
            Self::DuplicateTaskId(id) => write!(f, "duplicate task id {id}"),
            Self::UnknownDependency { task_id, dependency } => {
                write!(f, "task {task_id} depends on unknown task {dependency}")
            }
            Self::CircularDependency(cycle) => {
                write!(f, "circular dependency: {}", cycle.join(" -> "))
            }
            Self::InvalidTask { task_id, reason } => write!(f, "task {task_id}: {reason}"),
        }
    }
}

/// Named collection of tasks for one spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Taskset {
    /// Unique across the registry
    pub spec_name: String,
    /// Monotonic, bumped on every persisted write
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Taskset {
    /// Assemble and validate a new taskset. Initial states are derived from
    /// the dependency lists: no deps ⇒ Ready, deps ⇒ Blocked.
    pub fn new(spec_name: impl Into<String>, mut tasks: Vec<Task>) -> Result<Self, TasksetValidationError> {
        let spec_name = spec_name.into();
        Self::validate_tasks(&tasks)?;

        for task in &mut tasks {
            task.state = if task.dependencies.is_empty() {
                TaskState::Ready
            } else {
                TaskState::Blocked
            };
        }

        let now = Utc::now();
        let mut taskset = Self {
            spec_name,
            version: 1,
            created_at: now,
            updated_at: now,
            tasks,
            metadata: BTreeMap::new(),
        };
        // Tasks whose deps are all optional start Ready immediately.
        taskset.refresh_ready_states();
        Ok(taskset)
    }

    /// Structural validation: id shapes, uniqueness, dangling deps, cycles.
    pub fn validate_tasks(tasks: &[Task]) -> Result<(), TasksetValidationError> {
        let mut seen: HashSet<&str> = HashSet::new();
        for task in tasks {
            if !Task::is_valid_id(&task.id) {
                return Err(TasksetValidationError::InvalidTaskId(task.id.clone()));
            }
            if !seen.insert(&task.id) {
                return Err(TasksetValidationError::DuplicateTaskId(task.id.clone()));
            }
            if let Err(reason) = task.validate() {
                return Err(TasksetValidationError::InvalidTask {
                    task_id: task.id.clone(),
                    reason,
                });
            }
        }
        for task in tasks {
            for dep in &task.dependencies {
                if !seen.contains(dep.as_str()) {
                    return Err(TasksetValidationError::UnknownDependency {
                        task_id: task.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
        // Cycles among blocking edges are fatal; optional dependencies never
        // gate readiness, so a mutually-optional pair is admissible.
        if let Some(cycle) = DepGraph::from_tasks(tasks).find_blocking_cycle() {
            return Err(TasksetValidationError::CircularDependency(cycle));
        }
        Ok(())
    }

    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn task_mut(&mut self, task_id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == task_id)
    }

    /// A task's dependencies are satisfied when every non-optional dependency
    /// is Done. Optional dependencies never gate readiness.
    pub fn dependencies_satisfied(&self, task: &Task) -> bool {
        task.dependencies.iter().all(|dep_id| {
            self.task(dep_id)
                .map(|dep| dep.is_optional || dep.state == TaskState::Done)
                .unwrap_or(false)
        })
    }

    /// Promote Blocked tasks whose dependencies are now satisfied. Returns the
    /// ids promoted, in id order.
    pub fn refresh_ready_states(&mut self) -> Vec<String> {
        let mut promoted = Vec::new();
        let snapshot = self.clone();
        for task in &mut self.tasks {
            if task.state == TaskState::Blocked && snapshot.dependencies_satisfied(task) {
                task.state = TaskState::Ready;
                task.updated_at = Utc::now();
                promoted.push(task.id.clone());
            }
        }
        promoted.sort();
        promoted
    }

    /// All tasks currently in `state`, in id order.
    pub fn tasks_in_state(&self, state: TaskState) -> Vec<&Task> {
        let mut matching: Vec<&Task> = self.tasks.iter().filter(|t| t.state == state).collect();
        matching.sort_by(|a, b| a.id.cmp(&b.id));
        matching
    }

    /// Ready tasks, optionally filtered by skill, sorted by priority
    /// descending with id-ascending tie-breaking.
    pub fn ready_tasks(&self, required_skill: Option<&str>) -> Vec<&Task> {
        let mut ready: Vec<&Task> = self
            .tasks
            .iter()
            .filter(|t| t.state == TaskState::Ready)
            .filter(|t| match required_skill {
                Some(skill) => t.required_skill.as_deref() == Some(skill),
                None => true,
            })
            .collect();
        ready.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
        ready
    }

    pub fn graph(&self) -> DepGraph {
        DepGraph::from_tasks(&self.tasks)
    }

    /// True while any task is non-terminal; guards against deletion.
    pub fn has_active_tasks(&self) -> bool {
        self.tasks.iter().any(|t| !t.is_terminal())
    }

    /// Bump version and touch `updated_at`. Callers do this once per
    /// persisted mutation.
    pub fn touch(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }
}
