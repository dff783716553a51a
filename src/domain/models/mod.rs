//! Domain models: the typed vocabulary of the orchestration plane.

pub mod config;
pub mod event;
pub mod graph;
pub mod slot;
pub mod task;
pub mod taskset;

pub use config::{
    ArtifactStoreConfig, Config, DispatcherConfig, LlmConfig, LoggingConfig, PoolConfig,
    RegistryConfig, RunnerConfig, SecretsConfig,
};
pub use event::{EventType, TaskEvent};
pub use graph::DepGraph;
pub use slot::{CleanupPolicy, Pool, Slot, SlotState};
pub use task::{Artifact, ArtifactType, Task, TaskContext, TaskState};
pub use taskset::{Taskset, TasksetValidationError};
