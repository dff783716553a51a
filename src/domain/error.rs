//! Domain error types.
//!
//! Each component surfaces its own thiserror enum, classified along the
//! transient/permanent axis so callers can decide between retry, surfacing,
//! and isolation without matching concrete variants.

use thiserror::Error;

use super::models::TaskState;

/// Errors surfaced by the task registry.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("taskset not found: {0}")]
    TasksetNotFound(String),

    #[error("taskset already exists: {0}")]
    DuplicateTaskset(String),

    #[error("task not found: {spec_name}/{task_id}")]
    TaskNotFound { spec_name: String, task_id: String },

    #[error("task {task_id} depends on unknown task {dependency}")]
    UnknownDependency { task_id: String, dependency: String },

    #[error("circular dependency: {}", .0.join(" -> "))]
    CircularDependency(Vec<String>),

    #[error("invalid state transition for {task_id}: {from:?} -> {to:?}")]
    InvalidStateTransition {
        task_id: String,
        from: TaskState,
        to: TaskState,
    },

    #[error("invalid taskset: {0}")]
    Validation(String),

    #[error("retry budget exhausted for {spec_name}/{task_id}")]
    RetryBudgetExhausted { spec_name: String, task_id: String },

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("checklist sync failed: {0}")]
    ChecklistSync(String),
}

impl RegistryError {
    /// Lock contention is the only retryable registry failure; everything
    /// else is a caller mistake or requires intervention.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Lock(LockError::Timeout { .. }))
    }
}

/// Errors surfaced by the repo pool manager.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("pool not found: {0}")]
    PoolNotFound(String),

    #[error("pool already exists: {0}")]
    PoolAlreadyExists(String),

    #[error("slot not found: {0}")]
    SlotNotFound(String),

    #[error("no available slot in pool {0}")]
    NoAvailableSlot(String),

    #[error("slot {slot_id} is allocated to {holder}; pass force to override")]
    SlotAllocated { slot_id: String, holder: String },

    #[error("slot {slot_id} failed integrity verification: {reason}")]
    IntegrityFailure { slot_id: String, reason: String },

    #[error("slot {slot_id} is unrecoverable: {reason}")]
    Unrecoverable { slot_id: String, reason: String },

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

impl PoolError {
    /// `NoAvailableSlot` is a scheduling hint, not a failure.
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, Self::NoAvailableSlot(_))
    }

    pub fn is_transient(&self) -> bool {
        match self {
            Self::NoAvailableSlot(_) | Self::Lock(LockError::Timeout { .. }) => true,
            Self::Git(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// File lock errors.
#[derive(Error, Debug)]
pub enum LockError {
    #[error("timed out acquiring lock {name} after {waited_ms}ms")]
    Timeout { name: String, waited_ms: u64 },

    #[error("lock file {name} is corrupt: {reason}")]
    Corrupt { name: String, reason: String },

    #[error("lock {name} io error: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Git subprocess errors. Exit codes are authoritative; stderr is carried
/// for diagnostics.
#[derive(Error, Debug)]
pub enum GitError {
    #[error("git {command} failed (exit {code:?}): {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("git push rejected as non-fast-forward: {stderr}")]
    NonFastForward { stderr: String },

    #[error("failed to spawn git: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("git {command} timed out after {secs}s")]
    Timeout { command: String, secs: u64 },

    #[error("git {command} aborted by cancellation")]
    Cancelled { command: String },
}

impl GitError {
    /// Network-flavored failures worth retrying; a rejected push is retried
    /// by the rebase loop, not blindly.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::CommandFailed { stderr, .. } => {
                let s = stderr.to_lowercase();
                s.contains("could not resolve host")
                    || s.contains("connection refused")
                    || s.contains("connection reset")
                    || s.contains("early eof")
                    || s.contains("remote end hung up")
            }
            _ => false,
        }
    }
}

/// Atomic document store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("document not found: {0}")]
    NotFound(String),

    #[error("failed to parse {path}: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Why a task failed. Written into `TaskFailed` event details and consulted
/// by the dispatcher's retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    WorkspacePreparationError,
    ImplementationError,
    TestFailure,
    PushConflict,
    LlmError,
    ArtifactUploadError,
    Timeout,
    Cancelled,
    HeartbeatTimeout,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkspacePreparationError => "workspace_preparation_error",
            Self::ImplementationError => "implementation_error",
            Self::TestFailure => "test_failure",
            Self::PushConflict => "push_conflict",
            Self::LlmError => "llm_error",
            Self::ArtifactUploadError => "artifact_upload_error",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::HeartbeatTimeout => "heartbeat_timeout",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "workspace_preparation_error" => Some(Self::WorkspacePreparationError),
            "implementation_error" => Some(Self::ImplementationError),
            "test_failure" => Some(Self::TestFailure),
            "push_conflict" => Some(Self::PushConflict),
            "llm_error" => Some(Self::LlmError),
            "artifact_upload_error" => Some(Self::ArtifactUploadError),
            "timeout" => Some(Self::Timeout),
            "cancelled" => Some(Self::Cancelled),
            "heartbeat_timeout" => Some(Self::HeartbeatTimeout),
            _ => None,
        }
    }

    /// Whether the dispatcher's transient retry budget applies. Acceptance
    /// failures are not transient; cancellation never consumes the budget.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::PushConflict | Self::LlmError | Self::ArtifactUploadError | Self::HeartbeatTimeout
        )
    }
}

/// Errors surfaced by an agent runner stage. Converted into a single
/// `TaskFailed` event by the runner; the dispatcher never sees panics.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("workspace preparation failed: {0}")]
    WorkspacePreparation(String),

    #[error("failed to apply edits: {0}")]
    Implementation(String),

    #[error("test command failed: {command} (exit {code:?})")]
    TestFailure { command: String, code: Option<i32> },

    #[error("push conflict after {attempts} attempts: {stderr}")]
    PushConflict { attempts: u32, stderr: String },

    #[error("llm invocation failed: {0}")]
    Llm(String),

    #[error("artifact upload failed: {0}")]
    ArtifactUpload(String),

    #[error("task exceeded {0}s timeout")]
    Timeout(u64),

    #[error("cancelled")]
    Cancelled,
}

impl RunnerError {
    pub fn reason(&self) -> FailureReason {
        match self {
            Self::WorkspacePreparation(_) => FailureReason::WorkspacePreparationError,
            Self::Implementation(_) => FailureReason::ImplementationError,
            Self::TestFailure { .. } => FailureReason::TestFailure,
            Self::PushConflict { .. } => FailureReason::PushConflict,
            Self::Llm(_) => FailureReason::LlmError,
            Self::ArtifactUpload(_) => FailureReason::ArtifactUploadError,
            Self::Timeout(_) => FailureReason::Timeout,
            Self::Cancelled => FailureReason::Cancelled,
        }
    }
}
