//! Task executor port: the contract between the dispatcher and whatever
//! runs a task. The production implementation is the agent runner; a
//! container or managed-job adapter implements the same trait without new
//! externally visible states.

use async_trait::async_trait;
use tokio::sync::watch;

use crate::domain::error::FailureReason;
use crate::domain::models::TaskContext;

/// Terminal outcome of one task execution.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Done,
    Failed { reason: FailureReason, detail: String },
}

impl TaskOutcome {
    pub fn failed(reason: FailureReason, detail: impl Into<String>) -> Self {
        Self::Failed { reason, detail: detail.into() }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }
}

/// Completion report handed back to the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskReport {
    pub spec_name: String,
    pub task_id: String,
    pub slot_id: String,
    pub outcome: TaskOutcome,
    /// Human-readable summary for the terminal event
    pub summary: String,
}

/// Executes one task end-to-end within an allocated slot.
///
/// `cancel` flips to `true` when the operator requests cancellation; the
/// executor observes it at every suspension point and returns with a
/// `Cancelled` outcome.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, context: TaskContext, cancel: watch::Receiver<bool>) -> TaskReport;
}
