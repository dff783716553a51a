//! Services: the four core subsystems of the orchestration plane.

pub mod checklist;
pub mod dispatcher;
pub mod pool;
pub mod registry;

pub use checklist::{ChecklistDoc, ChecklistSync, SyncDirection, SyncResult};
pub use dispatcher::Dispatcher;
pub use pool::{AnomalyReport, RecoveryReport, RepoPoolManager, SlotStatus};
pub use registry::{GraphFormat, TaskRegistry};
