//! Workspace pool port: the slot-allocation contract the dispatcher
//! schedules against.

use async_trait::async_trait;

use crate::domain::error::PoolError;
use crate::domain::models::Slot;

/// Bounded pool of pre-initialized git worktrees.
#[async_trait]
pub trait WorkspacePool: Send + Sync {
    /// Allocate the least-recently-released Available slot, recording the
    /// holding task. Fails with `PoolError::NoAvailableSlot` when the pool
    /// is exhausted; the dispatcher treats that as a scheduling hint.
    async fn allocate_slot(
        &self,
        repo_name: &str,
        spec_name: &str,
        task_id: &str,
    ) -> Result<Slot, PoolError>;

    /// Return a slot to the pool, optionally running post-release cleanup.
    async fn release_slot(&self, slot_id: &str, cleanup: bool) -> Result<(), PoolError>;

    /// Number of Available slots, for dispatch admission checks.
    async fn available_slots(&self, repo_name: &str) -> Result<usize, PoolError>;
}
