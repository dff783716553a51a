//! Repo Pool Manager.
//!
//! Maintains, per repository, a fixed-size pool of ready-to-use git
//! worktrees carved out of one shared bare clone. Slots are handed out
//! least-recently-released first; allocation, release, and recovery run
//! under per-slot file locks, with a short pool-document lock serializing
//! `pool.json` rewrites.
//!
//! Layout per repository:
//!
//! ```text
//! <workspaces_dir>/<repo_name>/
//!   .main_repo/          bare repository, shared by all worktrees
//!   worktrees/slot<k>/
//!   pool.json
//!   locks/<slot_id>.lock
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::domain::error::PoolError;
use crate::domain::models::{
    CleanupPolicy, EventType, Pool, PoolConfig, Slot, SlotState, TaskEvent,
};
use crate::domain::ports::WorkspacePool;
use crate::infrastructure::event_log::EventLog;
use crate::infrastructure::git::Git;
use crate::infrastructure::lock::{LockInfo, LockManager};
use crate::infrastructure::store::{read_json, write_json_atomic};

/// Name of the meta-lock guarding `pool.json` rewrites. Short critical
/// sections only; never held across git subprocesses.
const POOL_DOC_LOCK: &str = "_pool";

/// Status view for one slot.
#[derive(Debug, Clone, Serialize)]
pub struct SlotStatus {
    pub slot: Slot,
    pub lock_holder: Option<LockInfo>,
    pub disk_usage_bytes: u64,
}

/// What `detect_anomalies` found.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AnomalyReport {
    /// Slots allocated longer than the threshold, with held hours
    pub long_allocated: Vec<(String, f64)>,
    /// Slots failing integrity verification, with the reason
    pub corrupted: Vec<(String, String)>,
    /// Lock files without a matching slot, or stale beyond the threshold
    pub orphan_locks: Vec<String>,
}

impl AnomalyReport {
    pub fn is_clean(&self) -> bool {
        self.long_allocated.is_empty() && self.corrupted.is_empty() && self.orphan_locks.is_empty()
    }
}

/// Counts returned by `auto_recover`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub released: usize,
    pub recovered: usize,
    pub isolated: usize,
    pub locks_cleared: usize,
}

/// The pool manager.
pub struct RepoPoolManager {
    config: PoolConfig,
    git: Git,
    /// Slot/pool events land here under spec name `pool-<repo>`
    events: Option<Arc<EventLog>>,
}

impl RepoPoolManager {
    pub fn new(config: PoolConfig) -> Self {
        Self { config, git: Git::new(), events: None }
    }

    pub fn with_events(mut self, events: Arc<EventLog>) -> Self {
        self.events = Some(events);
        self
    }

    fn repo_dir(&self, repo_name: &str) -> PathBuf {
        PathBuf::from(&self.config.workspaces_dir).join(repo_name)
    }

    fn bare_dir(&self, repo_name: &str) -> PathBuf {
        self.repo_dir(repo_name).join(".main_repo")
    }

    fn worktrees_dir(&self, repo_name: &str) -> PathBuf {
        self.repo_dir(repo_name).join("worktrees")
    }

    fn pool_doc(&self, repo_name: &str) -> PathBuf {
        self.repo_dir(repo_name).join("pool.json")
    }

    fn locks(&self, repo_name: &str) -> LockManager {
        LockManager::new(
            self.repo_dir(repo_name).join("locks"),
            self.config.lock_timeout_secs,
            self.config.lock_lease_secs,
        )
    }

    async fn emit(&self, repo_name: &str, event_type: EventType, slot_id: &str, detail: &str) {
        if let Some(events) = &self.events {
            let event = TaskEvent::new(event_type, format!("pool-{repo_name}"), slot_id)
                .with_detail("detail", detail);
            if let Err(e) = events.append(event).await {
                warn!(repo = repo_name, error = %e, "failed to record pool event");
            }
        }
    }

    async fn load_pool(&self, repo_name: &str) -> Result<Pool, PoolError> {
        read_json(&self.pool_doc(repo_name)).await.map_err(|e| match e {
            crate::domain::error::StoreError::NotFound(_) => {
                PoolError::PoolNotFound(repo_name.to_string())
            }
            other => PoolError::Storage(other),
        })
    }

    async fn save_pool(&self, pool: &mut Pool) -> Result<(), PoolError> {
        pool.updated_at = Utc::now();
        write_json_atomic(&self.pool_doc(&pool.repo_name), pool).await?;
        Ok(())
    }

    /// Persist the slot's own metadata document inside its worktree.
    async fn save_slot_doc(&self, slot: &Slot) -> Result<(), PoolError> {
        let path = Path::new(&slot.slot_path).join("slot.json");
        write_json_atomic(&path, slot).await?;
        Ok(())
    }

    /// Mutate one slot under the pool-document lock and persist. The closure
    /// runs on fresh state so concurrent slot operations never lose updates.
    async fn update_slot<F>(&self, repo_name: &str, slot_id: &str, mutate: F) -> Result<Slot, PoolError>
    where
        F: FnOnce(&mut Slot),
    {
        let locks = self.locks(repo_name);
        let _doc_guard = locks.acquire(POOL_DOC_LOCK).await?;
        let mut pool = self.load_pool(repo_name).await?;
        let slot = pool
            .slot_mut(slot_id)
            .ok_or_else(|| PoolError::SlotNotFound(slot_id.to_string()))?;
        mutate(slot);
        let updated = slot.clone();
        self.save_pool(&mut pool).await?;
        self.save_slot_doc(&updated).await.ok(); // slot dir may be gone mid-recovery
        Ok(updated)
    }

    /// Resolve the repo owning a slot id. Slot ids embed the repo name, but
    /// repo names may themselves contain dashes, so scan the pools.
    async fn find_repo_for_slot(&self, slot_id: &str) -> Result<String, PoolError> {
        for repo_name in self.list_repos().await {
            if let Ok(pool) = self.load_pool(&repo_name).await {
                if pool.slot(slot_id).is_some() {
                    return Ok(repo_name);
                }
            }
        }
        Err(PoolError::SlotNotFound(slot_id.to_string()))
    }

    /// Repository names with a pool document.
    pub async fn list_repos(&self) -> Vec<String> {
        let mut repos = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(&self.config.workspaces_dir).await else {
            return repos;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if let Some(name) = entry.file_name().to_str() {
                if tokio::fs::try_exists(self.pool_doc(name)).await.unwrap_or(false) {
                    repos.push(name.to_string());
                }
            }
        }
        repos.sort();
        repos
    }

    // ------------------------------------------------------------------
    // Pool lifecycle
    // ------------------------------------------------------------------

    /// Clone the repository once (bare), then create `num_slots` worktrees
    /// on deterministic slot branches.
    #[instrument(skip(self, cleanup_policy), fields(repo = repo_name, slots = num_slots))]
    pub async fn create_pool(
        &self,
        repo_name: &str,
        repo_url: &str,
        num_slots: u32,
        cleanup_policy: CleanupPolicy,
    ) -> Result<Pool, PoolError> {
        if tokio::fs::try_exists(self.pool_doc(repo_name)).await.unwrap_or(false) {
            return Err(PoolError::PoolAlreadyExists(repo_name.to_string()));
        }

        let repo_dir = self.repo_dir(repo_name);
        tokio::fs::create_dir_all(&repo_dir).await.map_err(|e| {
            PoolError::Storage(crate::domain::error::StoreError::Io {
                path: repo_dir.display().to_string(),
                source: e,
            })
        })?;

        info!(repo = repo_name, url = repo_url, "cloning bare repository");
        self.git.clone_bare(&repo_dir, repo_url, ".main_repo").await?;

        let mut slots = Vec::new();
        for index in 1..=num_slots {
            let slot = self.create_slot_worktree(repo_name, repo_url, index).await?;
            slots.push(slot);
        }

        let now = Utc::now();
        let mut pool = Pool {
            repo_name: repo_name.to_string(),
            repo_url: repo_url.to_string(),
            num_slots,
            slots,
            cleanup_policy,
            created_at: now,
            updated_at: now,
        };
        self.save_pool(&mut pool).await?;
        for slot in &pool.slots {
            self.save_slot_doc(slot).await?;
        }
        info!(repo = repo_name, slots = num_slots, "pool created");
        Ok(pool)
    }

    async fn create_slot_worktree(
        &self,
        repo_name: &str,
        repo_url: &str,
        index: u32,
    ) -> Result<Slot, PoolError> {
        let bare = self.bare_dir(repo_name);
        let worktree_path = self.worktrees_dir(repo_name).join(Slot::dir_name_for(index));
        let branch = Slot::branch_for(repo_name, index);
        let path_str = worktree_path.display().to_string();

        if self.git.branch_exists(&bare, &branch).await? {
            // Left over from a removed slot; re-attach rather than fail.
            self.git.run(&bare, &["worktree", "add", &path_str, &branch]).await?;
        } else {
            self.git.worktree_add(&bare, &path_str, &branch, "HEAD").await?;
        }

        let mut slot = Slot::new(repo_name, repo_url, index, path_str);
        slot.current_commit = Some(self.git.rev_parse_head(&worktree_path).await?);
        Ok(slot)
    }

    pub async fn get_pool(&self, repo_name: &str) -> Result<Pool, PoolError> {
        self.load_pool(repo_name).await
    }

    /// Grow the pool by one slot.
    pub async fn add_slot(&self, repo_name: &str) -> Result<Slot, PoolError> {
        let pool = self.load_pool(repo_name).await?;
        let next_index = pool
            .slots
            .iter()
            .filter_map(|s| {
                s.slot_id
                    .rsplit("slot")
                    .next()
                    .and_then(|n| n.parse::<u32>().ok())
            })
            .max()
            .unwrap_or(0)
            + 1;

        let slot = self.create_slot_worktree(repo_name, &pool.repo_url, next_index).await?;
        let slot_id = slot.slot_id.clone();

        let locks = self.locks(repo_name);
        let _doc_guard = locks.acquire(POOL_DOC_LOCK).await?;
        let mut pool = self.load_pool(repo_name).await?;
        pool.slots.push(slot.clone());
        pool.num_slots = u32::try_from(pool.slots.len()).unwrap_or(pool.num_slots);
        self.save_pool(&mut pool).await?;
        self.save_slot_doc(&slot).await?;

        info!(repo = repo_name, slot = %slot_id, "slot added");
        Ok(slot)
    }

    /// Shrink the pool. Fails on an allocated slot unless forced.
    pub async fn remove_slot(&self, slot_id: &str, force: bool) -> Result<(), PoolError> {
        let repo_name = self.find_repo_for_slot(slot_id).await?;
        let locks = self.locks(&repo_name);
        let _slot_guard = locks.acquire(slot_id).await?;

        let pool = self.load_pool(&repo_name).await?;
        let slot = pool
            .slot(slot_id)
            .ok_or_else(|| PoolError::SlotNotFound(slot_id.to_string()))?
            .clone();

        if slot.state == SlotState::Allocated && !force {
            let holder = slot
                .holder
                .as_ref()
                .map(|(spec, task)| format!("{spec}/{task}"))
                .unwrap_or_else(|| "unknown".to_string());
            return Err(PoolError::SlotAllocated { slot_id: slot_id.to_string(), holder });
        }

        if let Err(e) = self.git.worktree_remove(&self.bare_dir(&repo_name), &slot.slot_path, force).await {
            warn!(slot = slot_id, error = %e, "worktree remove failed; pruning");
            let _ = tokio::fs::remove_dir_all(&slot.slot_path).await;
            self.git.worktree_prune(&self.bare_dir(&repo_name)).await?;
        }

        let _doc_guard = locks.acquire(POOL_DOC_LOCK).await?;
        let mut pool = self.load_pool(&repo_name).await?;
        pool.slots.retain(|s| s.slot_id != slot_id);
        pool.num_slots = u32::try_from(pool.slots.len()).unwrap_or(0);
        self.save_pool(&mut pool).await?;

        info!(repo = %repo_name, slot = slot_id, "slot removed");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// LRU candidates, most-eligible first.
    fn lru_candidates(pool: &Pool) -> Vec<Slot> {
        let mut available: Vec<Slot> = pool
            .slots
            .iter()
            .filter(|s| s.state == SlotState::Available)
            .cloned()
            .collect();
        available.sort_by(|a, b| {
            a.last_released_at
                .cmp(&b.last_released_at)
                .then_with(|| a.slot_id.cmp(&b.slot_id))
        });
        available
    }

    async fn pre_allocate_cleanup(&self, pool: &Pool, slot: &Slot) -> Result<(), PoolError> {
        if pool.cleanup_policy.fetch_on_allocate {
            self.cleanup_worktree(slot, true).await?;
        }
        if pool.cleanup_policy.warmup_enabled {
            self.run_warmup(pool, slot).await;
        }
        Ok(())
    }

    /// Deterministic restoration of a worktree to a known-clean state.
    async fn cleanup_worktree(&self, slot: &Slot, fetch: bool) -> Result<(), PoolError> {
        let dir = Path::new(&slot.slot_path);
        if fetch {
            self.git.fetch_all(dir).await?;
        }
        self.git.checkout(dir, &slot.current_branch).await?;

        // Prefer the remote default branch tip; fall back to the slot branch
        // itself for pools cloned from local repos without tracking refs.
        let target = match self.git.default_branch(dir).await {
            Ok(default) if self
                .git
                .run(dir, &["rev-parse", "--verify", &format!("origin/{default}")])
                .await
                .is_ok() =>
            {
                format!("origin/{default}")
            }
            _ => slot.current_branch.clone(),
        };
        self.git.reset_hard(dir, &target).await?;
        self.git.clean_untracked(dir, &["slot.json"]).await?;
        Ok(())
    }

    /// Warmup commands are best-effort cache priming; failures are logged,
    /// never fatal.
    async fn run_warmup(&self, pool: &Pool, slot: &Slot) {
        for command in &pool.cleanup_policy.warmup_commands {
            let parts: Vec<&str> = command.split_whitespace().collect();
            let Some((program, args)) = parts.split_first() else { continue };
            let result = tokio::process::Command::new(program)
                .args(args)
                .current_dir(&slot.slot_path)
                .output()
                .await;
            match result {
                Ok(out) if out.status.success() => {}
                Ok(out) => warn!(
                    slot = %slot.slot_id,
                    command,
                    code = out.status.code(),
                    "warmup command failed"
                ),
                Err(e) => warn!(slot = %slot.slot_id, command, error = %e, "warmup command error"),
            }
        }
    }

    // ------------------------------------------------------------------
    // Integrity & recovery
    // ------------------------------------------------------------------

    /// A slot is healthy iff its directory and `.git` exist, HEAD resolves
    /// to a commit, and `git status` runs cleanly.
    pub async fn verify_slot_integrity(&self, slot: &Slot) -> Result<(), String> {
        let dir = Path::new(&slot.slot_path);
        if !dir.exists() {
            return Err("worktree directory missing".to_string());
        }
        if !dir.join(".git").exists() {
            return Err(".git missing".to_string());
        }
        match self.git.rev_parse_head(dir).await {
            Ok(commit) if !commit.is_empty() => {}
            Ok(_) => return Err("HEAD resolved to empty commit".to_string()),
            Err(e) => return Err(format!("rev-parse HEAD failed: {e}")),
        }
        if let Err(e) = self.git.status_porcelain(dir).await {
            return Err(format!("status failed: {e}"));
        }
        Ok(())
    }

    pub async fn get_slot_status(&self, slot_id: &str) -> Result<SlotStatus, PoolError> {
        let repo_name = self.find_repo_for_slot(slot_id).await?;
        let pool = self.load_pool(&repo_name).await?;
        let slot = pool
            .slot(slot_id)
            .ok_or_else(|| PoolError::SlotNotFound(slot_id.to_string()))?
            .clone();
        let lock_holder = self.locks(&repo_name).inspect(slot_id).unwrap_or(None);
        let disk_usage_bytes = dir_size(Path::new(&slot.slot_path));
        Ok(SlotStatus { slot, lock_holder, disk_usage_bytes })
    }

    /// Scan every pool for long-held allocations, corrupted slots, and
    /// orphaned or stale lock files.
    #[instrument(skip(self))]
    pub async fn detect_anomalies(&self, max_allocation_hours: u64) -> Result<AnomalyReport, PoolError> {
        let mut report = AnomalyReport::default();
        let now = Utc::now();
        let threshold_secs = max_allocation_hours.saturating_mul(3600);

        for repo_name in self.list_repos().await {
            let pool = self.load_pool(&repo_name).await?;

            for slot in &pool.slots {
                if let Some(held) = slot.allocated_for(now) {
                    let held_secs = held.num_seconds().max(0).unsigned_abs();
                    if held_secs > threshold_secs {
                        report
                            .long_allocated
                            .push((slot.slot_id.clone(), held_secs as f64 / 3600.0));
                    }
                }
                if slot.state != SlotState::Error {
                    if let Err(reason) = self.verify_slot_integrity(slot).await {
                        report.corrupted.push((slot.slot_id.clone(), reason));
                    }
                }
            }

            let locks = self.locks(&repo_name);
            for name in locks.list() {
                if name == POOL_DOC_LOCK {
                    continue;
                }
                if pool.slot(&name).is_none() {
                    report.orphan_locks.push(name);
                    continue;
                }
                if let Ok(Some(info)) = locks.inspect(&name) {
                    let age_secs = (now - info.acquired_at).num_seconds().max(0).unsigned_abs();
                    if info.lease_expired(now) && age_secs > self.config.lock_staleness_secs {
                        report.orphan_locks.push(name);
                    }
                }
            }
        }

        Ok(report)
    }

    /// Verify and repair one slot. Returns true when the slot returned to
    /// Available through actual repair (not `force`).
    #[instrument(skip(self), fields(slot = slot_id))]
    pub async fn recover_slot(&self, slot_id: &str, force: bool) -> Result<bool, PoolError> {
        let repo_name = self.find_repo_for_slot(slot_id).await?;
        let locks = self.locks(&repo_name);
        let _slot_guard = locks.acquire(slot_id).await?;

        let slot = self
            .update_slot(&repo_name, slot_id, |s| {
                s.state = SlotState::Cleaning;
            })
            .await?;

        let healthy = match self.verify_slot_integrity(&slot).await {
            Ok(()) => self.git.fsck(Path::new(&slot.slot_path)).await.is_ok(),
            Err(_) => false,
        };

        let repaired = if healthy {
            self.cleanup_worktree(&slot, false).await.is_ok()
        } else {
            self.rebuild_worktree(&repo_name, &slot).await
        };

        if repaired {
            let commit = self.git.rev_parse_head(Path::new(&slot.slot_path)).await.ok();
            self.update_slot(&repo_name, slot_id, |s| {
                s.state = SlotState::Available;
                s.isolation_reason = None;
                s.current_commit = commit.clone();
            })
            .await?;
            self.emit(&repo_name, EventType::SlotRecovered, slot_id, "recovered").await;
            info!(slot = slot_id, "slot recovered");
            return Ok(true);
        }

        if force {
            self.update_slot(&repo_name, slot_id, |s| {
                s.state = SlotState::Available;
                s.isolation_reason = None;
            })
            .await?;
            warn!(slot = slot_id, "slot force-marked available despite failed repair");
            return Ok(false);
        }

        self.update_slot(&repo_name, slot_id, |s| {
            s.state = SlotState::Error;
            s.isolation_reason = Some("recovery failed".to_string());
        })
        .await?;
        Ok(false)
    }

    /// Delete and recreate the worktree under the same slot id.
    async fn rebuild_worktree(&self, repo_name: &str, slot: &Slot) -> bool {
        let bare = self.bare_dir(repo_name);
        let _ = tokio::fs::remove_dir_all(&slot.slot_path).await;
        if let Err(e) = self.git.worktree_prune(&bare).await {
            warn!(slot = %slot.slot_id, error = %e, "worktree prune failed");
            return false;
        }

        let result = match self.git.branch_exists(&bare, &slot.current_branch).await {
            Ok(true) => {
                self.git
                    .run(&bare, &["worktree", "add", &slot.slot_path, &slot.current_branch])
                    .await
                    .map(|_| ())
            }
            Ok(false) => {
                self.git
                    .worktree_add(&bare, &slot.slot_path, &slot.current_branch, "HEAD")
                    .await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => self.verify_slot_integrity(slot).await.is_ok(),
            Err(e) => {
                warn!(slot = %slot.slot_id, error = %e, "worktree rebuild failed");
                false
            }
        }
    }

    /// Quarantine a slot until explicit recovery.
    pub async fn isolate_slot(&self, slot_id: &str, reason: &str) -> Result<(), PoolError> {
        let repo_name = self.find_repo_for_slot(slot_id).await?;
        let locks = self.locks(&repo_name);
        let _slot_guard = locks.acquire(slot_id).await?;
        let reason = reason.to_string();
        self.update_slot(&repo_name, slot_id, move |s| {
            s.state = SlotState::Error;
            s.isolation_reason = Some(reason);
        })
        .await?;
        Ok(())
    }

    /// Compose detection and recovery.
    #[instrument(skip(self))]
    pub async fn auto_recover(
        &self,
        max_allocation_hours: u64,
        release_long_allocated: bool,
    ) -> Result<RecoveryReport, PoolError> {
        let anomalies = self.detect_anomalies(max_allocation_hours).await?;
        let mut report = RecoveryReport::default();

        if release_long_allocated {
            for (slot_id, hours) in &anomalies.long_allocated {
                warn!(slot = %slot_id, hours, "force-releasing long-allocated slot");
                if self.release_slot(slot_id, true).await.is_ok() {
                    report.released += 1;
                }
            }
        }

        for (slot_id, reason) in &anomalies.corrupted {
            warn!(slot = %slot_id, reason, "recovering corrupted slot");
            match self.recover_slot(slot_id, false).await {
                Ok(true) => report.recovered += 1,
                Ok(false) | Err(_) => report.isolated += 1,
            }
        }

        for name in &anomalies.orphan_locks {
            for repo_name in self.list_repos().await {
                let locks = self.locks(&repo_name);
                if locks.lock_path(name).exists() {
                    if let Ok(cleared) = locks.force_release(name) {
                        report.locks_cleared += 1;
                        let detail = cleared
                            .map(|i| format!("owner {} pid {}", i.owner_id, i.pid))
                            .unwrap_or_else(|| "unreadable lock".to_string());
                        self.emit(&repo_name, EventType::StaleLockCleared, name, &detail).await;
                    }
                }
            }
        }

        info!(?report, "auto-recover complete");
        Ok(report)
    }
}

#[async_trait]
impl WorkspacePool for RepoPoolManager {
    #[instrument(skip(self), fields(repo = repo_name, task = task_id))]
    async fn allocate_slot(
        &self,
        repo_name: &str,
        spec_name: &str,
        task_id: &str,
    ) -> Result<Slot, PoolError> {
        let pool = self.load_pool(repo_name).await?;
        let locks = self.locks(repo_name);

        for candidate in Self::lru_candidates(&pool) {
            let slot_guard = match locks.acquire(&candidate.slot_id).await {
                Ok(guard) => guard,
                Err(e) => {
                    warn!(slot = %candidate.slot_id, error = %e, "slot lock contended; trying next");
                    continue;
                }
            };

            // Re-check under the lock; another allocator may have won.
            let current = self.load_pool(repo_name).await?;
            let Some(slot) = current.slot(&candidate.slot_id) else { continue };
            if slot.state != SlotState::Available {
                continue;
            }
            let slot = slot.clone();

            if let Err(e) = self.pre_allocate_cleanup(&current, &slot).await {
                warn!(slot = %slot.slot_id, error = %e, "pre-allocate cleanup failed; isolating");
                self.update_slot(repo_name, &slot.slot_id, |s| {
                    s.state = SlotState::Error;
                    s.isolation_reason = Some(format!("pre-allocate cleanup failed: {e}"));
                })
                .await?;
                continue;
            }

            let commit = self.git.rev_parse_head(Path::new(&slot.slot_path)).await.ok();
            let spec = spec_name.to_string();
            let task = task_id.to_string();
            let allocated = self
                .update_slot(repo_name, &slot.slot_id, move |s| {
                    s.allocate_to(spec, task);
                    s.current_commit = commit;
                })
                .await?;

            drop(slot_guard);
            info!(slot = %allocated.slot_id, task = task_id, "slot allocated");
            return Ok(allocated);
        }

        Err(PoolError::NoAvailableSlot(repo_name.to_string()))
    }

    #[instrument(skip(self), fields(slot = slot_id))]
    async fn release_slot(&self, slot_id: &str, cleanup: bool) -> Result<(), PoolError> {
        let repo_name = self.find_repo_for_slot(slot_id).await?;
        let locks = self.locks(&repo_name);
        let _slot_guard = locks.acquire(slot_id).await?;

        let pool = self.load_pool(&repo_name).await?;
        let slot = pool
            .slot(slot_id)
            .ok_or_else(|| PoolError::SlotNotFound(slot_id.to_string()))?
            .clone();

        if slot.state == SlotState::Available {
            return Ok(()); // idempotent release
        }

        if cleanup && pool.cleanup_policy.clean_on_release {
            // Post-release cleanup skips the fetch.
            if let Err(e) = self.cleanup_worktree(&slot, false).await {
                warn!(slot = slot_id, error = %e, "post-release cleanup failed; isolating");
                self.update_slot(&repo_name, slot_id, |s| {
                    s.state = SlotState::Error;
                    s.isolation_reason = Some(format!("post-release cleanup failed: {e}"));
                })
                .await?;
                return Err(PoolError::IntegrityFailure {
                    slot_id: slot_id.to_string(),
                    reason: e.to_string(),
                });
            }
        }

        self.update_slot(&repo_name, slot_id, Slot::release).await?;
        info!(slot = slot_id, "slot released");
        Ok(())
    }

    async fn available_slots(&self, repo_name: &str) -> Result<usize, PoolError> {
        Ok(self.load_pool(repo_name).await?.available_count())
    }
}

/// Recursive directory size; best-effort, unreadable entries count zero.
fn dir_size(path: &Path) -> u64 {
    let mut total = 0;
    let mut stack = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else { continue };
        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else { continue };
            if meta.is_dir() {
                stack.push(entry.path());
            } else {
                total += meta.len();
            }
        }
    }
    total
}
