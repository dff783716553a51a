//! Pool manager integration against real git repositories.

mod common;

use std::path::Path;

use common::{git, init_origin};
use necrocode::domain::error::PoolError;
use necrocode::domain::models::{CleanupPolicy, PoolConfig, SlotState};
use necrocode::domain::ports::WorkspacePool;
use necrocode::services::pool::RepoPoolManager;

fn manager(workspaces: &Path) -> RepoPoolManager {
    RepoPoolManager::new(PoolConfig {
        workspaces_dir: workspaces.display().to_string(),
        max_allocation_hours: 4,
        lock_staleness_secs: 3600,
        lock_timeout_secs: 5,
        lock_lease_secs: 60,
    })
}

async fn setup(dir: &Path, slots: u32) -> (RepoPoolManager, String) {
    let origin = dir.join("origin");
    tokio::fs::create_dir_all(&origin).await.unwrap();
    init_origin(&origin).await;

    let pool = manager(&dir.join("workspaces"));
    pool.create_pool("demo", &origin.display().to_string(), slots, CleanupPolicy::default())
        .await
        .unwrap();
    (pool, origin.display().to_string())
}

#[tokio::test]
async fn create_pool_lays_out_bare_repo_and_worktrees() {
    let dir = tempfile::tempdir().unwrap();
    let (pool, _) = setup(dir.path(), 2).await;

    let repo_dir = dir.path().join("workspaces/demo");
    assert!(repo_dir.join(".main_repo").exists());
    assert!(repo_dir.join("worktrees/slot1/.git").exists());
    assert!(repo_dir.join("worktrees/slot2/README.md").exists());
    assert!(repo_dir.join("pool.json").exists());
    assert!(repo_dir.join("worktrees/slot1/slot.json").exists());

    let loaded = pool.get_pool("demo").await.unwrap();
    assert_eq!(loaded.num_slots, 2);
    assert!(loaded.slots.iter().all(|s| s.state == SlotState::Available));
    assert_eq!(loaded.slots[0].current_branch, "worktree/demo/slot1");
    assert!(loaded.slots[0].current_commit.is_some());

    let err = pool
        .create_pool("demo", "wherever", 1, CleanupPolicy::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::PoolAlreadyExists(_)));
}

#[tokio::test]
async fn allocate_release_cycle_restores_clean_available_state() {
    let dir = tempfile::tempdir().unwrap();
    let (pool, _) = setup(dir.path(), 1).await;

    let slot = pool.allocate_slot("demo", "spec-a", "1.1").await.unwrap();
    assert_eq!(slot.state, SlotState::Allocated);
    assert_eq!(slot.holder, Some(("spec-a".to_string(), "1.1".to_string())));
    assert_eq!(slot.allocation_count, 1);

    // Dirty the worktree the way a task would.
    let slot_dir = Path::new(&slot.slot_path);
    tokio::fs::write(slot_dir.join("scratch.txt"), "junk").await.unwrap();
    tokio::fs::write(slot_dir.join("README.md"), "mutated").await.unwrap();

    pool.release_slot(&slot.slot_id, true).await.unwrap();

    let loaded = pool.get_pool("demo").await.unwrap();
    let released = loaded.slot(&slot.slot_id).unwrap();
    assert_eq!(released.state, SlotState::Available);
    assert!(released.last_released_at.is_some());
    assert!(released.holder.is_none());

    // No residual working-tree changes beyond the slot metadata document.
    let status = git(slot_dir, &["status", "--porcelain"]).await;
    let residue: Vec<&str> = status
        .lines()
        .filter(|l| !l.ends_with("slot.json"))
        .collect();
    assert!(residue.is_empty(), "residue: {residue:?}");
    assert!(!slot_dir.join("scratch.txt").exists());
    assert!(slot_dir.join("slot.json").exists());
}

#[tokio::test]
async fn lru_allocation_prefers_least_recently_released() {
    let dir = tempfile::tempdir().unwrap();
    let (pool, _) = setup(dir.path(), 2).await;

    // First pass: never-released slots go in id order.
    let first = pool.allocate_slot("demo", "s", "1").await.unwrap();
    assert_eq!(first.slot_id, "demo-slot1");
    let second = pool.allocate_slot("demo", "s", "2").await.unwrap();
    assert_eq!(second.slot_id, "demo-slot2");

    pool.release_slot("demo-slot2", false).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    pool.release_slot("demo-slot1", false).await.unwrap();

    // slot2 was released first, so it is the LRU choice.
    let third = pool.allocate_slot("demo", "s", "3").await.unwrap();
    assert_eq!(third.slot_id, "demo-slot2");
}

#[tokio::test]
async fn exhausted_pool_reports_no_available_slot() {
    let dir = tempfile::tempdir().unwrap();
    let (pool, _) = setup(dir.path(), 1).await;

    pool.allocate_slot("demo", "s", "1").await.unwrap();
    let err = pool.allocate_slot("demo", "s", "2").await.unwrap_err();
    assert!(matches!(err, PoolError::NoAvailableSlot(_)));
    assert!(err.is_resource_exhausted());
    assert_eq!(pool.available_slots("demo").await.unwrap(), 0);
}

#[tokio::test]
async fn corrupted_slot_is_detected_recovered_and_allocatable() {
    let dir = tempfile::tempdir().unwrap();
    let (pool, _) = setup(dir.path(), 2).await;

    // Rip the .git link out of slot1.
    let loaded = pool.get_pool("demo").await.unwrap();
    let victim = loaded.slot("demo-slot1").unwrap().clone();
    tokio::fs::remove_file(Path::new(&victim.slot_path).join(".git")).await.unwrap();

    let anomalies = pool.detect_anomalies(4).await.unwrap();
    assert_eq!(anomalies.corrupted.len(), 1);
    assert_eq!(anomalies.corrupted[0].0, "demo-slot1");

    let report = pool.auto_recover(4, false).await.unwrap();
    assert_eq!(report.recovered, 1);
    assert_eq!(report.isolated, 0);

    let healed = pool.get_pool("demo").await.unwrap();
    assert_eq!(healed.slot("demo-slot1").unwrap().state, SlotState::Available);

    // The healed slot allocates again. slot1 was never released, so LRU
    // picks it first.
    let slot = pool.allocate_slot("demo", "s", "1").await.unwrap();
    assert_eq!(slot.slot_id, "demo-slot1");
}

#[tokio::test]
async fn isolated_slots_are_excluded_until_recovered() {
    let dir = tempfile::tempdir().unwrap();
    let (pool, _) = setup(dir.path(), 1).await;

    pool.isolate_slot("demo-slot1", "operator request").await.unwrap();
    let loaded = pool.get_pool("demo").await.unwrap();
    assert_eq!(loaded.slot("demo-slot1").unwrap().state, SlotState::Error);
    assert_eq!(
        loaded.slot("demo-slot1").unwrap().isolation_reason.as_deref(),
        Some("operator request")
    );

    let err = pool.allocate_slot("demo", "s", "1").await.unwrap_err();
    assert!(matches!(err, PoolError::NoAvailableSlot(_)));

    assert!(pool.recover_slot("demo-slot1", false).await.unwrap());
    pool.allocate_slot("demo", "s", "1").await.unwrap();
}

#[tokio::test]
async fn remove_slot_refuses_allocated_unless_forced() {
    let dir = tempfile::tempdir().unwrap();
    let (pool, _) = setup(dir.path(), 2).await;

    let slot = pool.allocate_slot("demo", "s", "1").await.unwrap();
    let err = pool.remove_slot(&slot.slot_id, false).await.unwrap_err();
    assert!(matches!(err, PoolError::SlotAllocated { .. }));

    pool.remove_slot(&slot.slot_id, true).await.unwrap();
    let loaded = pool.get_pool("demo").await.unwrap();
    assert_eq!(loaded.slots.len(), 1);
    assert_eq!(loaded.num_slots, 1);
}

#[tokio::test]
async fn add_slot_grows_pool_with_next_index() {
    let dir = tempfile::tempdir().unwrap();
    let (pool, _) = setup(dir.path(), 1).await;

    let added = pool.add_slot("demo").await.unwrap();
    assert_eq!(added.slot_id, "demo-slot2");
    assert_eq!(added.current_branch, "worktree/demo/slot2");
    assert_eq!(pool.get_pool("demo").await.unwrap().num_slots, 2);
    assert!(Path::new(&added.slot_path).join(".git").exists());
}

#[tokio::test]
async fn orphan_locks_are_detected_and_cleared() {
    let dir = tempfile::tempdir().unwrap();
    let (pool, _) = setup(dir.path(), 1).await;

    let locks_dir = dir.path().join("workspaces/demo/locks");
    tokio::fs::create_dir_all(&locks_dir).await.unwrap();
    tokio::fs::write(locks_dir.join("ghost-slot9.lock"), "{}").await.unwrap();

    let anomalies = pool.detect_anomalies(4).await.unwrap();
    assert!(anomalies.orphan_locks.contains(&"ghost-slot9".to_string()));

    let report = pool.auto_recover(4, false).await.unwrap();
    assert_eq!(report.locks_cleared, 1);
    assert!(!locks_dir.join("ghost-slot9.lock").exists());
}

#[tokio::test]
async fn slot_status_exposes_counters_and_disk_usage() {
    let dir = tempfile::tempdir().unwrap();
    let (pool, _) = setup(dir.path(), 1).await;

    pool.allocate_slot("demo", "spec", "1").await.unwrap();
    let status = pool.get_slot_status("demo-slot1").await.unwrap();
    assert_eq!(status.slot.state, SlotState::Allocated);
    assert_eq!(status.slot.allocation_count, 1);
    assert!(status.disk_usage_bytes > 0);
    assert!(status.lock_holder.is_none());
}
