//! CLI surface.
//!
//! Exit codes: 0 success, 1 user error, 2 transient error (retry
//! suggested), 3 fatal.

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};

use crate::domain::error::{PoolError, RegistryError};

#[derive(Parser, Debug)]
#[command(name = "necrocode", version, about = "Distributed build automation: job descriptions in, pull requests out")]
pub struct Cli {
    /// Emit machine-readable JSON instead of tables
    #[arg(long, global = true)]
    pub json: bool,

    /// Path to a config file (defaults to hierarchical .necrocode/ loading)
    #[arg(long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Scaffold .necrocode/config.yaml in the current directory
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },
    /// Create a taskset from a checklist document
    Submit {
        /// Spec name (unique across the registry)
        spec_name: String,
        /// Checklist document to import tasks from
        #[arg(long)]
        checklist: String,
    },
    /// Taskset operations
    #[command(subcommand)]
    Taskset(TasksetCommands),
    /// Task operations
    #[command(subcommand)]
    Task(TaskCommands),
    /// Export the dependency graph
    Graph {
        spec_name: String,
        /// dot | mermaid
        #[arg(long, default_value = "dot")]
        format: String,
    },
    /// Event log operations
    #[command(subcommand)]
    Events(EventCommands),
    /// Repo pool operations
    #[command(subcommand)]
    Pool(PoolCommands),
    /// Synchronize a taskset with its checklist document
    Sync {
        spec_name: String,
        /// Checklist path
        #[arg(long)]
        doc: String,
        /// fromdoc | todoc | both
        #[arg(long, default_value = "both")]
        direction: String,
    },
    /// Start the dispatcher loop
    Run {
        /// Override configured max concurrency
        #[arg(long)]
        max_concurrency: Option<usize>,
    },
}

#[derive(Subcommand, Debug)]
pub enum TasksetCommands {
    /// List stored tasksets
    List,
    /// Show one taskset with per-task state
    Show { spec_name: String },
}

#[derive(Subcommand, Debug)]
pub enum TaskCommands {
    /// Show task details
    Show { spec_name: String, task_id: String },
    /// Cancel a task (running tasks abort cooperatively)
    Cancel { spec_name: String, task_id: String },
    /// Retry a failed task within its budget
    Retry { spec_name: String, task_id: String },
}

#[derive(Subcommand, Debug)]
pub enum EventCommands {
    /// Query events for a spec
    Query {
        spec_name: String,
        /// Restrict to one task
        #[arg(long)]
        task: Option<String>,
        /// Maximum rows shown
        #[arg(long, default_value = "100")]
        limit: usize,
    },
    /// Delete rotated event log files
    Prune { spec_name: String },
}

#[derive(Subcommand, Debug)]
pub enum PoolCommands {
    /// Clone and carve a new pool of worktree slots
    Create {
        repo_name: String,
        repo_url: String,
        #[arg(long, default_value = "3")]
        slots: u32,
        /// Skip fetch/reset before each allocation
        #[arg(long)]
        no_fetch_on_allocate: bool,
    },
    /// Show pool and slot status
    Status { repo_name: String },
    /// Detect and repair anomalies across all pools
    Recover {
        /// Also force-release slots allocated past the threshold
        #[arg(long)]
        release_long_allocated: bool,
    },
    /// Add one slot to a pool
    AddSlot { repo_name: String },
    /// Remove a slot (refuses allocated slots unless forced)
    RemoveSlot {
        slot_id: String,
        #[arg(long)]
        force: bool,
    },
}

/// Map an error chain to the documented exit codes.
pub fn exit_code_for(error: &anyhow::Error) -> i32 {
    if let Some(e) = error.downcast_ref::<RegistryError>() {
        return match e {
            RegistryError::TasksetNotFound(_)
            | RegistryError::TaskNotFound { .. }
            | RegistryError::DuplicateTaskset(_)
            | RegistryError::UnknownDependency { .. }
            | RegistryError::CircularDependency(_)
            | RegistryError::InvalidStateTransition { .. }
            | RegistryError::RetryBudgetExhausted { .. }
            | RegistryError::Validation(_) => 1,
            RegistryError::Lock(_) => 2,
            RegistryError::Storage(_) | RegistryError::ChecklistSync(_) => 3,
        };
    }
    if let Some(e) = error.downcast_ref::<PoolError>() {
        return match e {
            PoolError::PoolNotFound(_)
            | PoolError::SlotNotFound(_)
            | PoolError::PoolAlreadyExists(_)
            | PoolError::SlotAllocated { .. } => 1,
            PoolError::NoAvailableSlot(_) | PoolError::Lock(_) => 2,
            PoolError::IntegrityFailure { .. }
            | PoolError::Unrecoverable { .. }
            | PoolError::Git(_)
            | PoolError::Storage(_) => 3,
        };
    }
    3
}
