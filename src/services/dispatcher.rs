//! Dispatcher.
//!
//! A single scheduling loop that matches Ready tasks to available slots and
//! executor capacity. Each tick drains completions, polices heartbeats and
//! cancellations, then walks the ready snapshot in effective-priority order
//! and dispatches what fits. Worker executions run as independent tokio
//! tasks; the loop never blocks on them.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::domain::error::{FailureReason, PoolError, RegistryError};
use crate::domain::models::{DispatcherConfig, EventType, Task, TaskContext, TaskEvent, TaskState};
use crate::domain::ports::{
    meta_keys, TaskExecutor, TaskOutcome, TaskReport, TaskStore, WorkspacePool,
};

/// Key for one task across tasksets.
type TaskKey = (String, String); // (spec_name, task_id)

/// Book-keeping for one in-flight execution.
struct InFlight {
    slot_id: String,
    skill: Option<String>,
    started_at: DateTime<Utc>,
    cancel_tx: watch::Sender<bool>,
    cancel_requested_at: Option<DateTime<Utc>>,
    abort: tokio::task::AbortHandle,
}

/// The scheduling loop.
pub struct Dispatcher {
    registry: Arc<dyn TaskStore>,
    pool: Arc<dyn WorkspacePool>,
    executor: Arc<dyn TaskExecutor>,
    config: DispatcherConfig,
    /// spec → repository; specs absent from the map use their own name
    repo_mapping: BTreeMap<String, String>,

    in_flight: HashMap<TaskKey, InFlight>,
    executions: JoinSet<TaskReport>,
    /// Tasks waiting out a retry backoff
    not_before: HashMap<TaskKey, DateTime<Utc>>,
    /// First time a task was observed Ready, for aging and deadlock checks
    ready_since: HashMap<TaskKey, DateTime<Utc>>,
    /// Last reason recorded in a DispatchSkipped event, to avoid spam
    last_skip_reason: HashMap<TaskKey, String>,
    last_started_at: Option<DateTime<Utc>>,
    last_deadlock_report: Option<DateTime<Utc>>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<dyn TaskStore>,
        pool: Arc<dyn WorkspacePool>,
        executor: Arc<dyn TaskExecutor>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            registry,
            pool,
            executor,
            config,
            repo_mapping: BTreeMap::new(),
            in_flight: HashMap::new(),
            executions: JoinSet::new(),
            not_before: HashMap::new(),
            ready_since: HashMap::new(),
            last_skip_reason: HashMap::new(),
            last_started_at: None,
            last_deadlock_report: None,
        }
    }

    /// Route a spec's tasks to a repository pool other than `spec_name`.
    pub fn with_repo_mapping(mut self, mapping: BTreeMap<String, String>) -> Self {
        self.repo_mapping = mapping;
        self
    }

    fn repo_for(&self, spec_name: &str) -> String {
        self.repo_mapping
            .get(spec_name)
            .cloned()
            .unwrap_or_else(|| spec_name.to_string())
    }

    pub fn active_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Run until `shutdown` flips true. Cooperative: one tick, then sleep.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!(max_concurrency = self.config.max_concurrency, "dispatcher started");
        loop {
            if let Err(e) = self.tick().await {
                warn!(error = %e, "dispatcher tick failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs(self.config.poll_interval_secs)) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("dispatcher shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// One scheduling pass. Public so tests can drive the loop
    /// deterministically.
    pub async fn tick(&mut self) -> Result<(), RegistryError> {
        self.drain_completions().await;
        self.check_heartbeats().await;
        self.check_cancellations().await;
        self.dispatch_ready().await?;
        self.check_deadlock().await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Completions
    // ------------------------------------------------------------------

    async fn drain_completions(&mut self) {
        while let Some(joined) = self.executions.try_join_next() {
            match joined {
                Ok(report) => self.handle_report(report).await,
                Err(e) if e.is_cancelled() => {} // force-cancelled; handled at the cancel site
                Err(e) => warn!(error = %e, "executor task panicked"),
            }
        }
    }

    async fn handle_report(&mut self, report: TaskReport) {
        let key = (report.spec_name.clone(), report.task_id.clone());
        let Some(_flight) = self.in_flight.remove(&key) else {
            // Already reaped by heartbeat/cancel policing.
            return;
        };

        match &report.outcome {
            TaskOutcome::Done => {
                if let Err(e) = self
                    .registry
                    .update_task_state(&report.spec_name, &report.task_id, TaskState::Done, BTreeMap::new())
                    .await
                {
                    warn!(task = %report.task_id, error = %e, "failed to record completion");
                }
            }
            TaskOutcome::Failed { reason, detail } => {
                let mut metadata = BTreeMap::new();
                metadata.insert(
                    meta_keys::FAILURE_REASON.to_string(),
                    serde_json::Value::from(reason.as_str()),
                );
                metadata.insert(
                    meta_keys::FAILURE_DETAIL.to_string(),
                    serde_json::Value::from(truncate(detail, 2000)),
                );
                match self
                    .registry
                    .update_task_state(&report.spec_name, &report.task_id, TaskState::Failed, metadata)
                    .await
                {
                    Ok(task) => self.maybe_schedule_retry(&key, &task, *reason).await,
                    Err(e) => warn!(task = %report.task_id, error = %e, "failed to record failure"),
                }
            }
        }

        self.release(&report.spec_name, &report.slot_id).await;
    }

    async fn maybe_schedule_retry(&mut self, key: &TaskKey, task: &Task, reason: FailureReason) {
        // Cancellation never consumes the retry budget and is never retried
        // automatically.
        if reason == FailureReason::Cancelled {
            return;
        }
        let budget_override = if reason.is_transient() {
            Some(self.config.transient_max_retries.max(task.max_retries))
        } else {
            None
        };
        let allowed = budget_override.unwrap_or(task.max_retries);
        if task.retry_count >= allowed {
            return;
        }

        match self.registry.retry_task(&key.0, &key.1, budget_override).await {
            Ok(retried) => {
                let backoff = retry_backoff(retried.retry_count, &self.config);
                let resume_at = Utc::now() + backoff;
                self.not_before.insert(key.clone(), resume_at);
                self.registry
                    .record_event(
                        TaskEvent::new(EventType::RetryScheduled, &key.0, &key.1)
                            .with_detail("reason", reason.as_str())
                            .with_detail("retry_count", retried.retry_count)
                            .with_detail("backoff_secs", backoff.num_seconds()),
                    )
                    .await
                    .ok();
                info!(task = %key.1, retry = retried.retry_count, backoff_secs = backoff.num_seconds(), "retry scheduled");
            }
            Err(e) => debug!(task = %key.1, error = %e, "retry not scheduled"),
        }
    }

    // ------------------------------------------------------------------
    // Heartbeats & cancellation
    // ------------------------------------------------------------------

    async fn check_heartbeats(&mut self) {
        let timeout = Duration::seconds(i64::try_from(self.config.heartbeat_timeout_secs).unwrap_or(120));
        let now = Utc::now();

        let mut stale: Vec<TaskKey> = Vec::new();
        for (key, flight) in &self.in_flight {
            let last_beat = match self
                .registry
                .query_events(&key.0, Some(&key.1), Some(flight.started_at), None)
                .await
            {
                Ok(events) => events
                    .iter()
                    .filter(|e| e.event_type == EventType::RunnerHeartbeat)
                    .map(|e| e.timestamp)
                    .max()
                    .unwrap_or(flight.started_at),
                Err(_) => flight.started_at,
            };
            if now - last_beat > timeout {
                stale.push(key.clone());
            }
        }

        for key in stale {
            warn!(spec = %key.0, task = %key.1, "runner heartbeat stale; failing task");
            let Some(flight) = self.in_flight.remove(&key) else { continue };
            let _ = flight.cancel_tx.send(true);
            flight.abort.abort();

            self.registry
                .record_event(TaskEvent::new(EventType::HeartbeatTimeout, &key.0, &key.1))
                .await
                .ok();

            let mut metadata = BTreeMap::new();
            metadata.insert(
                meta_keys::FAILURE_REASON.to_string(),
                serde_json::Value::from(FailureReason::HeartbeatTimeout.as_str()),
            );
            match self
                .registry
                .update_task_state(&key.0, &key.1, TaskState::Failed, metadata)
                .await
            {
                Ok(task) => {
                    self.maybe_schedule_retry(&key, &task, FailureReason::HeartbeatTimeout).await;
                }
                Err(e) => warn!(task = %key.1, error = %e, "failed to record heartbeat failure"),
            }
            self.release(&key.0, &flight.slot_id).await;
        }
    }

    async fn check_cancellations(&mut self) {
        let grace = Duration::seconds(i64::try_from(self.config.cancel_grace_secs).unwrap_or(30));
        let now = Utc::now();

        let keys: Vec<TaskKey> = self.in_flight.keys().cloned().collect();
        for key in keys {
            let requested = self.registry.is_cancel_requested(&key.0, &key.1).await.unwrap_or(false);
            if !requested {
                continue;
            }

            let expired = {
                let flight = self.in_flight.get_mut(&key).expect("key from in_flight");
                if flight.cancel_requested_at.is_none() {
                    info!(spec = %key.0, task = %key.1, "cancel requested; signalling runner");
                    flight.cancel_requested_at = Some(now);
                    let _ = flight.cancel_tx.send(true);
                }
                flight
                    .cancel_requested_at
                    .map(|at| now - at > grace)
                    .unwrap_or(false)
            };

            // Cooperative runners report Cancelled themselves; after the
            // grace period the slot is force-released.
            if expired {
                warn!(spec = %key.0, task = %key.1, "cancel grace expired; force-releasing");
                let flight = self.in_flight.remove(&key).expect("key from in_flight");
                flight.abort.abort();

                let mut metadata = BTreeMap::new();
                metadata.insert(
                    meta_keys::FAILURE_REASON.to_string(),
                    serde_json::Value::from(FailureReason::Cancelled.as_str()),
                );
                if let Err(e) = self
                    .registry
                    .update_task_state(&key.0, &key.1, TaskState::Failed, metadata)
                    .await
                {
                    warn!(task = %key.1, error = %e, "failed to record cancellation");
                }
                self.release(&key.0, &flight.slot_id).await;
            }
        }
    }

    async fn release(&self, spec_name: &str, slot_id: &str) {
        if let Err(e) = self.pool.release_slot(slot_id, true).await {
            warn!(spec = spec_name, slot = slot_id, error = %e, "slot release failed");
        }
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    async fn dispatch_ready(&mut self) -> Result<(), RegistryError> {
        let now = Utc::now();
        let mut candidates: Vec<(TaskKey, Task, i32)> = Vec::new();

        for spec_name in self.registry.list_tasksets().await? {
            for task in self.registry.get_ready_tasks(&spec_name, None).await? {
                let key = (spec_name.clone(), task.id.clone());
                if self.in_flight.contains_key(&key) {
                    continue;
                }
                if let Some(resume_at) = self.not_before.get(&key) {
                    if *resume_at > now {
                        continue;
                    }
                    self.not_before.remove(&key);
                }
                let since = *self.ready_since.entry(key.clone()).or_insert(now);
                let ready_secs = (now - since).num_seconds().max(0).unsigned_abs();
                let effective = task.priority.saturating_add(aging_boost(ready_secs, &self.config));
                candidates.push((key, task, effective));
            }
        }

        // Drop aging entries for tasks that left Ready.
        let live: std::collections::HashSet<TaskKey> =
            candidates.iter().map(|(k, _, _)| k.clone()).collect();
        self.ready_since
            .retain(|k, _| live.contains(k) || self.in_flight.contains_key(k));

        // Strict effective priority, then submission time, then id.
        candidates.sort_by(|a, b| {
            b.2.cmp(&a.2)
                .then_with(|| a.1.created_at.cmp(&b.1.created_at))
                .then_with(|| a.0.cmp(&b.0))
        });

        for (key, task, _effective) in candidates {
            if self.in_flight.len() >= self.config.max_concurrency {
                self.record_skip(&key, "max_concurrency").await;
                break;
            }
            if let Some(skill) = &task.required_skill {
                if let Some(limit) = self.config.per_skill_limits.get(skill) {
                    let active = self
                        .in_flight
                        .values()
                        .filter(|f| f.skill.as_deref() == Some(skill))
                        .count();
                    if active >= *limit {
                        self.record_skip(&key, "skill_limit").await;
                        continue;
                    }
                }
            }

            let repo_name = self.repo_for(&key.0);
            match self.pool.available_slots(&repo_name).await {
                Ok(0) => {
                    self.record_skip(&key, "no_available_slot").await;
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(repo = %repo_name, error = %e, "pool query failed");
                    continue;
                }
            }

            if let Err(e) = self.dispatch_one(&key, &task, &repo_name).await {
                warn!(spec = %key.0, task = %key.1, error = %e, "dispatch failed");
            }
        }
        Ok(())
    }

    #[instrument(skip(self, task), fields(spec = %key.0, task = %key.1, repo = repo_name))]
    async fn dispatch_one(&mut self, key: &TaskKey, task: &Task, repo_name: &str) -> Result<(), RegistryError> {
        let slot = match self.pool.allocate_slot(repo_name, &key.0, &key.1).await {
            Ok(slot) => slot,
            Err(e) if matches!(e, PoolError::NoAvailableSlot(_)) => {
                self.record_skip(key, "no_available_slot").await;
                return Ok(());
            }
            Err(e) => {
                warn!(error = %e, "slot allocation failed");
                return Ok(());
            }
        };

        let runner_id = format!("runner-{}", uuid::Uuid::new_v4().simple());
        let branch = format!("necro/{}/{}", key.0, key.1);

        self.registry
            .record_event(
                TaskEvent::new(EventType::TaskAssigned, &key.0, &key.1)
                    .with_detail("runner_id", runner_id.clone())
                    .with_detail("slot_id", slot.slot_id.clone())
                    .with_detail("branch", branch.clone()),
            )
            .await
            .ok();

        let mut metadata = BTreeMap::new();
        metadata.insert(meta_keys::RUNNER_ID.to_string(), serde_json::Value::from(runner_id.clone()));
        metadata.insert(
            meta_keys::ASSIGNED_SLOT.to_string(),
            serde_json::Value::from(slot.slot_id.clone()),
        );
        metadata.insert(meta_keys::RESERVED_BRANCH.to_string(), serde_json::Value::from(branch.clone()));

        if let Err(e) = self
            .registry
            .update_task_state(&key.0, &key.1, TaskState::Running, metadata)
            .await
        {
            warn!(error = %e, "failed to mark task running; returning slot");
            self.release(&key.0, &slot.slot_id).await;
            return Err(e);
        }

        let context = self.build_context(key, task, &slot.slot_id, &slot.slot_path, &branch).await?;
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let executor = Arc::clone(&self.executor);
        let abort = self
            .executions
            .spawn(async move { executor.execute(context, cancel_rx).await });

        self.in_flight.insert(
            key.clone(),
            InFlight {
                slot_id: slot.slot_id.clone(),
                skill: task.required_skill.clone(),
                started_at: Utc::now(),
                cancel_tx,
                cancel_requested_at: None,
                abort,
            },
        );
        self.ready_since.remove(key);
        self.last_skip_reason.remove(key);
        self.last_started_at = Some(Utc::now());
        info!(slot = %slot.slot_id, runner = %runner_id, "task dispatched");
        Ok(())
    }

    async fn build_context(
        &self,
        key: &TaskKey,
        task: &Task,
        slot_id: &str,
        slot_path: &str,
        branch: &str,
    ) -> Result<TaskContext, RegistryError> {
        let taskset = self.registry.get_taskset(&key.0).await?;
        let completed_deps: Vec<String> = task
            .dependencies
            .iter()
            .filter_map(|dep_id| taskset.task(dep_id))
            .filter(|dep| dep.state == TaskState::Done)
            .map(|dep| format!("{} {}", dep.id, dep.title))
            .collect();

        let timeout_seconds = task
            .metadata
            .get("timeout_seconds")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(self.config.default_task_timeout_secs);
        let test_commands = task
            .metadata
            .get("test_commands")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(ToString::to_string))
                    .collect()
            })
            .unwrap_or_default();
        let related_files = task
            .metadata
            .get("related_files")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(ToString::to_string))
                    .collect()
            })
            .unwrap_or_default();

        Ok(TaskContext {
            task_id: task.id.clone(),
            spec_name: key.0.clone(),
            title: task.title.clone(),
            description: task.description.clone(),
            acceptance_criteria: task.acceptance_criteria.clone(),
            dependencies: completed_deps,
            required_skill: task.required_skill.clone(),
            slot_id: slot_id.to_string(),
            slot_path: slot_path.to_string(),
            branch_name: branch.to_string(),
            test_commands,
            timeout_seconds,
            related_files,
            max_tokens: task
                .metadata
                .get("max_tokens")
                .and_then(serde_json::Value::as_u64)
                .and_then(|v| u32::try_from(v).ok()),
            playbook_path: task
                .metadata
                .get("playbook_path")
                .and_then(|v| v.as_str().map(ToString::to_string)),
        })
    }

    async fn record_skip(&mut self, key: &TaskKey, reason: &str) {
        if self.last_skip_reason.get(key).map(String::as_str) == Some(reason) {
            return;
        }
        self.last_skip_reason.insert(key.clone(), reason.to_string());
        self.registry
            .record_event(
                TaskEvent::new(EventType::DispatchSkipped, &key.0, &key.1).with_detail("reason", reason),
            )
            .await
            .ok();
    }

    // ------------------------------------------------------------------
    // Deadlock detection
    // ------------------------------------------------------------------

    async fn check_deadlock(&mut self) {
        let threshold = Duration::seconds(i64::try_from(self.config.deadlock_threshold_secs).unwrap_or(600));
        let now = Utc::now();

        let Some(oldest_ready) = self.ready_since.values().min().copied() else { return };
        if now - oldest_ready < threshold {
            return;
        }
        if let Some(started) = self.last_started_at {
            if now - started < threshold {
                return;
            }
        }
        // Only a starved scheduler with zero slot headroom counts.
        let mut any_available = false;
        let repos: std::collections::HashSet<String> = self
            .ready_since
            .keys()
            .map(|(spec, _)| self.repo_for(spec))
            .collect();
        for repo in repos {
            if self.pool.available_slots(&repo).await.unwrap_or(0) > 0 {
                any_available = true;
                break;
            }
        }
        if any_available {
            return;
        }
        // Throttle to one report per threshold window.
        if let Some(last) = self.last_deadlock_report {
            if now - last < threshold {
                return;
            }
        }
        self.last_deadlock_report = Some(now);

        let ready: Vec<String> = self.ready_since.keys().map(|(s, t)| format!("{s}/{t}")).collect();
        let allocated: Vec<String> = self
            .in_flight
            .iter()
            .map(|((s, t), f)| format!("{s}/{t}@{}", f.slot_id))
            .collect();
        warn!(?ready, ?allocated, "deadlock suspected");

        // The snapshot goes to the first affected spec's log.
        if let Some((spec, _)) = self.ready_since.keys().next().cloned() {
            self.registry
                .record_event(
                    TaskEvent::taskset_scoped(EventType::DeadlockSuspected, spec)
                        .with_detail("ready_tasks", serde_json::json!(ready))
                        .with_detail("allocations", serde_json::json!(allocated)),
                )
                .await
                .ok();
        }
    }
}

/// +1 effective priority per aging interval past the threshold, capped.
fn aging_boost(ready_for_secs: u64, config: &DispatcherConfig) -> i32 {
    if ready_for_secs <= config.aging_threshold_secs || config.aging_interval_secs == 0 {
        return 0;
    }
    let over = ready_for_secs - config.aging_threshold_secs;
    let steps = over / config.aging_interval_secs;
    i32::try_from(steps).unwrap_or(i32::MAX).min(config.max_aging_delta)
}

/// Exponential backoff doubling from the initial delay, capped at the max.
fn retry_backoff(retry_count: u32, config: &DispatcherConfig) -> Duration {
    let exp = retry_count.saturating_sub(1).min(20);
    let secs = config
        .retry_initial_backoff_secs
        .saturating_mul(1_u64 << exp)
        .min(config.retry_max_backoff_secs);
    Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}
