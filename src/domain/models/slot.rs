//! Slot and pool domain models.
//!
//! A slot is one pre-initialized git worktree; a pool is the fixed set of
//! slots for a single repository. Slots cycle Available ⇄ Allocated, with
//! Cleaning as a transient state and Error for isolation after detected
//! corruption.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// State of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    /// Idle and allocatable
    Available,
    /// Held by exactly one running task
    Allocated,
    /// Undergoing cleanup or recovery
    Cleaning,
    /// Isolated after integrity failure; excluded from allocation
    Error,
}

impl SlotState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Allocated => "allocated",
            Self::Cleaning => "cleaning",
            Self::Error => "error",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "available" => Some(Self::Available),
            "allocated" => Some(Self::Allocated),
            "cleaning" => Some(Self::Cleaning),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// One git worktree in a repository pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slot {
    /// Stable unique id, `<repo>-slot<k>`; also the lock file stem
    pub slot_id: String,
    pub repo_name: String,
    pub repo_url: String,
    pub slot_path: String,
    pub state: SlotState,
    /// Deterministic slot branch, `worktree/<repo>/slot<k>`
    pub current_branch: String,
    pub current_commit: Option<String>,
    /// Non-decreasing across the slot's lifetime
    pub allocation_count: u64,
    pub total_usage_seconds: u64,
    pub last_allocated_at: Option<DateTime<Utc>>,
    pub last_released_at: Option<DateTime<Utc>>,
    /// `(spec_name, task_id)` of the current holder while Allocated
    pub holder: Option<(String, String)>,
    /// Why the slot was isolated, while in Error
    pub isolation_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Slot {
    pub fn new(
        repo_name: impl Into<String>,
        repo_url: impl Into<String>,
        index: u32,
        slot_path: impl Into<String>,
    ) -> Self {
        let repo_name = repo_name.into();
        Self {
            slot_id: Self::slot_id_for(&repo_name, index),
            current_branch: Self::branch_for(&repo_name, index),
            repo_name,
            repo_url: repo_url.into(),
            slot_path: slot_path.into(),
            state: SlotState::Available,
            current_commit: None,
            allocation_count: 0,
            total_usage_seconds: 0,
            last_allocated_at: None,
            last_released_at: None,
            holder: None,
            isolation_reason: None,
            created_at: Utc::now(),
        }
    }

    pub fn slot_id_for(repo_name: &str, index: u32) -> String {
        format!("{repo_name}-slot{index}")
    }

    pub fn branch_for(repo_name: &str, index: u32) -> String {
        format!("worktree/{repo_name}/slot{index}")
    }

    pub fn dir_name_for(index: u32) -> String {
        format!("slot{index}")
    }

    /// Mark allocated to a holder. Counters only move forward.
    pub fn allocate_to(&mut self, spec_name: impl Into<String>, task_id: impl Into<String>) {
        self.state = SlotState::Allocated;
        self.holder = Some((spec_name.into(), task_id.into()));
        self.allocation_count += 1;
        self.last_allocated_at = Some(Utc::now());
    }

    /// Mark released, accumulating usage time.
    pub fn release(&mut self) {
        let now = Utc::now();
        if let Some(allocated_at) = self.last_allocated_at {
            let used = (now - allocated_at).num_seconds().max(0);
            self.total_usage_seconds += u64::try_from(used).unwrap_or(0);
        }
        self.state = SlotState::Available;
        self.holder = None;
        self.last_released_at = Some(now);
    }

    /// How long the current allocation has been held.
    pub fn allocated_for(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        if self.state != SlotState::Allocated {
            return None;
        }
        self.last_allocated_at.map(|at| now - at)
    }
}

/// Cleanup behavior toggles for a pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupPolicy {
    /// Fetch all remotes and hard-reset before handing a slot out
    pub fetch_on_allocate: bool,
    /// Reset and clean untracked files when a slot is returned
    pub clean_on_release: bool,
    pub warmup_enabled: bool,
    /// Repo-specific commands run after cleanup to prime caches
    #[serde(default)]
    pub warmup_commands: Vec<String>,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self {
            fetch_on_allocate: true,
            clean_on_release: true,
            warmup_enabled: false,
            warmup_commands: Vec::new(),
        }
    }
}

/// The set of slots for one repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pool {
    pub repo_name: String,
    pub repo_url: String,
    pub num_slots: u32,
    pub slots: Vec<Slot>,
    pub cleanup_policy: CleanupPolicy,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Pool {
    pub fn slot(&self, slot_id: &str) -> Option<&Slot> {
        self.slots.iter().find(|s| s.slot_id == slot_id)
    }

    pub fn slot_mut(&mut self, slot_id: &str) -> Option<&mut Slot> {
        self.slots.iter_mut().find(|s| s.slot_id == slot_id)
    }

    /// Pick the next slot for allocation: least-recently-released Available
    /// slot first (never-released slots sort before all released ones),
    /// ties broken by slot id. Deterministic and allocator-independent.
    pub fn next_available(&self) -> Option<&Slot> {
        self.slots
            .iter()
            .filter(|s| s.state == SlotState::Available)
            .min_by(|a, b| {
                a.last_released_at
                    .cmp(&b.last_released_at)
                    .then_with(|| a.slot_id.cmp(&b.slot_id))
            })
    }

    pub fn available_count(&self) -> usize {
        self.slots.iter().filter(|s| s.state == SlotState::Available).count()
    }
}
