//! Dispatcher integration with a real registry and mock pool/executor.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{registry_at, task};
use necrocode::domain::error::{FailureReason, PoolError};
use necrocode::domain::models::{DispatcherConfig, EventType, Slot, TaskContext, TaskState};
use necrocode::domain::ports::{
    TaskExecutor, TaskOutcome, TaskReport, TaskStore, WorkspacePool,
};
use necrocode::services::dispatcher::Dispatcher;
use tokio::sync::watch;
use tokio::sync::Mutex;

// ---------------------------------------------------------------------
// Mocks
// ---------------------------------------------------------------------

struct MockPool {
    capacity: usize,
    allocated: Mutex<HashSet<String>>,
}

impl MockPool {
    fn new(capacity: usize) -> Self {
        Self { capacity, allocated: Mutex::new(HashSet::new()) }
    }
}

#[async_trait]
impl WorkspacePool for MockPool {
    async fn allocate_slot(
        &self,
        repo_name: &str,
        spec_name: &str,
        task_id: &str,
    ) -> Result<Slot, PoolError> {
        let mut allocated = self.allocated.lock().await;
        for index in 1..=u32::try_from(self.capacity).unwrap_or(0) {
            let slot_id = Slot::slot_id_for(repo_name, index);
            if !allocated.contains(&slot_id) {
                allocated.insert(slot_id.clone());
                let mut slot = Slot::new(repo_name, "mock://repo", index, format!("/tmp/{slot_id}"));
                slot.allocate_to(spec_name, task_id);
                return Ok(slot);
            }
        }
        Err(PoolError::NoAvailableSlot(repo_name.to_string()))
    }

    async fn release_slot(&self, slot_id: &str, _cleanup: bool) -> Result<(), PoolError> {
        self.allocated.lock().await.remove(slot_id);
        Ok(())
    }

    async fn available_slots(&self, _repo_name: &str) -> Result<usize, PoolError> {
        Ok(self.capacity - self.allocated.lock().await.len())
    }
}

#[derive(Clone)]
enum Behavior {
    Succeed,
    Fail(FailureReason),
    HangUntilCancel,
}

struct MockExecutor {
    behavior: Behavior,
    calls: Mutex<Vec<String>>,
}

impl MockExecutor {
    fn new(behavior: Behavior) -> Self {
        Self { behavior, calls: Mutex::new(Vec::new()) }
    }

    async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl TaskExecutor for MockExecutor {
    async fn execute(&self, context: TaskContext, mut cancel: watch::Receiver<bool>) -> TaskReport {
        self.calls.lock().await.push(context.task_id.clone());
        let outcome = match &self.behavior {
            Behavior::Succeed => TaskOutcome::Done,
            Behavior::Fail(reason) => TaskOutcome::failed(*reason, "mock failure"),
            Behavior::HangUntilCancel => loop {
                if *cancel.borrow() {
                    break TaskOutcome::failed(FailureReason::Cancelled, "cancelled");
                }
                if cancel.changed().await.is_err() {
                    break TaskOutcome::failed(FailureReason::Cancelled, "orphaned");
                }
            },
        };
        TaskReport {
            spec_name: context.spec_name,
            task_id: context.task_id,
            slot_id: context.slot_id,
            outcome,
            summary: "mock".to_string(),
        }
    }
}

fn config() -> DispatcherConfig {
    DispatcherConfig {
        max_concurrency: 4,
        poll_interval_secs: 1,
        heartbeat_timeout_secs: 3600,
        retry_initial_backoff_secs: 120,
        retry_max_backoff_secs: 240,
        ..DispatcherConfig::default()
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(80)).await;
}

// ---------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------

#[tokio::test]
async fn linear_chain_runs_to_completion_in_event_order() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(registry_at(dir.path()));
    registry
        .create_taskset("demo", vec![
            task("1.1", &[]).with_skill("backend"),
            task("1.2", &["1.1"]).with_skill("backend"),
        ])
        .await
        .unwrap();

    let pool = Arc::new(MockPool::new(1));
    let executor = Arc::new(MockExecutor::new(Behavior::Succeed));
    let mut dispatcher = Dispatcher::new(registry.clone(), pool, executor.clone(), config());

    dispatcher.tick().await.unwrap();
    settle().await;
    dispatcher.tick().await.unwrap();
    settle().await;
    dispatcher.tick().await.unwrap();

    let taskset = registry.get_taskset("demo").await.unwrap();
    assert_eq!(taskset.task("1.1").unwrap().state, TaskState::Done);
    assert_eq!(taskset.task("1.2").unwrap().state, TaskState::Done);
    assert_eq!(executor.calls().await, vec!["1.1", "1.2"]);

    // Both ran in the same single slot.
    let events = registry.query_events("demo", None, None, None).await.unwrap();
    let types: Vec<(EventType, String)> = events
        .iter()
        .map(|e| (e.event_type, e.task_id.clone()))
        .collect();
    let expected = vec![
        (EventType::TasksetCreated, String::new()),
        (EventType::TaskAssigned, "1.1".to_string()),
        (EventType::TaskStarted, "1.1".to_string()),
        (EventType::TaskCompleted, "1.1".to_string()),
        (EventType::DependencyUnblocked, "1.2".to_string()),
        (EventType::TaskAssigned, "1.2".to_string()),
        (EventType::TaskStarted, "1.2".to_string()),
        (EventType::TaskCompleted, "1.2".to_string()),
    ];
    assert_eq!(types, expected);
}

#[tokio::test]
async fn no_dispatch_when_no_slots_available() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(registry_at(dir.path()));
    registry.create_taskset("demo", vec![task("1", &[])]).await.unwrap();

    let pool = Arc::new(MockPool::new(0));
    let executor = Arc::new(MockExecutor::new(Behavior::Succeed));
    let mut dispatcher = Dispatcher::new(registry.clone(), pool, executor.clone(), config());

    dispatcher.tick().await.unwrap();
    settle().await;

    assert!(executor.calls().await.is_empty());
    let taskset = registry.get_taskset("demo").await.unwrap();
    assert_eq!(taskset.task("1").unwrap().state, TaskState::Ready);

    let events = registry.query_events("demo", Some("1"), None, None).await.unwrap();
    let skip = events
        .iter()
        .find(|e| e.event_type == EventType::DispatchSkipped)
        .expect("skip event");
    assert_eq!(skip.details.get("reason").and_then(|v| v.as_str()), Some("no_available_slot"));
}

#[tokio::test]
async fn global_concurrency_cap_is_enforced() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(registry_at(dir.path()));
    registry
        .create_taskset("demo", vec![task("1", &[]), task("2", &[])])
        .await
        .unwrap();

    let pool = Arc::new(MockPool::new(2));
    let executor = Arc::new(MockExecutor::new(Behavior::HangUntilCancel));
    let mut dispatcher = Dispatcher::new(
        registry.clone(),
        pool,
        executor.clone(),
        DispatcherConfig { max_concurrency: 1, ..config() },
    );

    dispatcher.tick().await.unwrap();
    settle().await;

    assert_eq!(dispatcher.active_count(), 1);
    assert_eq!(executor.calls().await.len(), 1);
    let taskset = registry.get_taskset("demo").await.unwrap();
    let running = taskset.tasks.iter().filter(|t| t.state == TaskState::Running).count();
    assert_eq!(running, 1);
}

#[tokio::test]
async fn per_skill_limit_is_enforced() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(registry_at(dir.path()));
    registry
        .create_taskset("demo", vec![
            task("1", &[]).with_skill("backend"),
            task("2", &[]).with_skill("backend"),
            task("3", &[]).with_skill("frontend"),
        ])
        .await
        .unwrap();

    let mut per_skill = std::collections::BTreeMap::new();
    per_skill.insert("backend".to_string(), 1);
    let pool = Arc::new(MockPool::new(3));
    let executor = Arc::new(MockExecutor::new(Behavior::HangUntilCancel));
    let mut dispatcher = Dispatcher::new(
        registry.clone(),
        pool,
        executor.clone(),
        DispatcherConfig { per_skill_limits: per_skill, ..config() },
    );

    dispatcher.tick().await.unwrap();
    settle().await;

    // One backend task capped out; the frontend task is unaffected.
    let calls = executor.calls().await;
    assert_eq!(calls.len(), 2);
    assert!(calls.contains(&"3".to_string()));
}

#[tokio::test]
async fn priority_descending_with_fifo_tiebreak() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(registry_at(dir.path()));

    let low = task("1", &[]).with_priority(1);
    let tie_first = task("2", &[]).with_priority(5);
    tokio::time::sleep(Duration::from_millis(5)).await;
    let tie_second = task("3", &[]).with_priority(5);
    registry
        .create_taskset("demo", vec![low, tie_second, tie_first])
        .await
        .unwrap();

    let pool = Arc::new(MockPool::new(3));
    let executor = Arc::new(MockExecutor::new(Behavior::Succeed));
    let mut dispatcher = Dispatcher::new(registry.clone(), pool, executor.clone(), config());

    dispatcher.tick().await.unwrap();
    settle().await;

    // Equal priorities dispatch in submission order; low priority last.
    assert_eq!(executor.calls().await, vec!["2", "3", "1"]);
}

#[tokio::test]
async fn transient_failure_schedules_backoff_retry() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(registry_at(dir.path()));
    registry.create_taskset("demo", vec![task("1", &[])]).await.unwrap();

    let pool = Arc::new(MockPool::new(1));
    let executor = Arc::new(MockExecutor::new(Behavior::Fail(FailureReason::PushConflict)));
    let mut dispatcher = Dispatcher::new(
        registry.clone(),
        pool.clone(),
        executor.clone(),
        DispatcherConfig { transient_max_retries: 2, ..config() },
    );

    dispatcher.tick().await.unwrap();
    settle().await;
    dispatcher.tick().await.unwrap();

    // Failed, then immediately re-admitted to Ready with a backoff window.
    let taskset = registry.get_taskset("demo").await.unwrap();
    let t = taskset.task("1").unwrap();
    assert_eq!(t.state, TaskState::Ready);
    assert_eq!(t.retry_count, 1);

    let events = registry.query_events("demo", Some("1"), None, None).await.unwrap();
    assert!(events.iter().any(|e| e.event_type == EventType::TaskFailed));
    assert!(events.iter().any(|e| e.event_type == EventType::RetryScheduled));

    // Backoff (120s in this config) keeps it parked; no second execution.
    dispatcher.tick().await.unwrap();
    settle().await;
    assert_eq!(executor.calls().await.len(), 1);
    // The slot went back to the pool.
    assert_eq!(pool.available_slots("demo").await.unwrap(), 1);
}

#[tokio::test]
async fn acceptance_failure_is_not_retried() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(registry_at(dir.path()));
    registry.create_taskset("demo", vec![task("1", &[])]).await.unwrap();

    let pool = Arc::new(MockPool::new(1));
    let executor = Arc::new(MockExecutor::new(Behavior::Fail(FailureReason::TestFailure)));
    let mut dispatcher = Dispatcher::new(registry.clone(), pool, executor.clone(), config());

    dispatcher.tick().await.unwrap();
    settle().await;
    dispatcher.tick().await.unwrap();

    let taskset = registry.get_taskset("demo").await.unwrap();
    assert_eq!(taskset.task("1").unwrap().state, TaskState::Failed);
    assert_eq!(taskset.task("1").unwrap().retry_count, 0);
}

#[tokio::test]
async fn heartbeat_timeout_fails_task_and_frees_slot() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(registry_at(dir.path()));
    registry.create_taskset("demo", vec![task("1", &[])]).await.unwrap();

    let pool = Arc::new(MockPool::new(1));
    let executor = Arc::new(MockExecutor::new(Behavior::HangUntilCancel));
    let mut dispatcher = Dispatcher::new(
        registry.clone(),
        pool.clone(),
        executor.clone(),
        DispatcherConfig {
            heartbeat_timeout_secs: 0,
            transient_max_retries: 0,
            ..config()
        },
    );

    dispatcher.tick().await.unwrap();
    settle().await;
    dispatcher.tick().await.unwrap();

    let taskset = registry.get_taskset("demo").await.unwrap();
    assert_eq!(taskset.task("1").unwrap().state, TaskState::Failed);

    let events = registry.query_events("demo", Some("1"), None, None).await.unwrap();
    assert!(events.iter().any(|e| e.event_type == EventType::HeartbeatTimeout));
    assert_eq!(pool.available_slots("demo").await.unwrap(), 1);
    assert_eq!(dispatcher.active_count(), 0);
}

#[tokio::test]
async fn cancel_aborts_cooperatively_without_consuming_retry_budget() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(registry_at(dir.path()));
    registry
        .create_taskset("demo", vec![task("5.1", &[]).with_max_retries(3)])
        .await
        .unwrap();

    let pool = Arc::new(MockPool::new(1));
    let executor = Arc::new(MockExecutor::new(Behavior::HangUntilCancel));
    let mut dispatcher = Dispatcher::new(registry.clone(), pool.clone(), executor.clone(), config());

    dispatcher.tick().await.unwrap();
    settle().await;
    assert_eq!(
        registry.get_taskset("demo").await.unwrap().task("5.1").unwrap().state,
        TaskState::Running
    );

    registry.cancel_task("demo", "5.1").await.unwrap();
    dispatcher.tick().await.unwrap(); // signals the runner
    settle().await; // runner observes the flip and reports Cancelled
    dispatcher.tick().await.unwrap(); // drains the report

    let taskset = registry.get_taskset("demo").await.unwrap();
    let t = taskset.task("5.1").unwrap();
    assert_eq!(t.state, TaskState::Failed);
    assert_eq!(t.retry_count, 0, "cancellation must not consume the retry budget");
    assert_eq!(
        t.metadata.get("failure_reason").and_then(|v| v.as_str()),
        Some("cancelled")
    );
    assert_eq!(pool.available_slots("demo").await.unwrap(), 1);
}

#[tokio::test]
async fn running_metadata_links_task_slot_and_branch() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(registry_at(dir.path()));
    registry.create_taskset("demo", vec![task("1", &[])]).await.unwrap();

    let pool = Arc::new(MockPool::new(1));
    let executor = Arc::new(MockExecutor::new(Behavior::HangUntilCancel));
    let mut dispatcher = Dispatcher::new(registry.clone(), pool, executor, config());

    dispatcher.tick().await.unwrap();
    settle().await;

    let taskset = registry.get_taskset("demo").await.unwrap();
    let t = taskset.task("1").unwrap();
    assert_eq!(t.state, TaskState::Running);
    assert_eq!(t.assigned_slot.as_deref(), Some("demo-slot1"));
    assert_eq!(t.reserved_branch.as_deref(), Some("necro/demo/1"));
    assert!(t.runner_id.is_some());
}

#[tokio::test]
async fn blocked_tasks_are_never_dispatched() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(registry_at(dir.path()));
    registry
        .create_taskset("demo", vec![task("1", &[]), task("2", &["1"])])
        .await
        .unwrap();

    let pool = Arc::new(MockPool::new(2));
    let executor = Arc::new(MockExecutor::new(Behavior::HangUntilCancel));
    let mut dispatcher = Dispatcher::new(registry.clone(), pool, executor.clone(), config());

    dispatcher.tick().await.unwrap();
    settle().await;

    assert_eq!(executor.calls().await, vec!["1"]);
    assert_eq!(
        registry.get_taskset("demo").await.unwrap().task("2").unwrap().state,
        TaskState::Blocked
    );
}
