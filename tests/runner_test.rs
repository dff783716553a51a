//! Agent runner pipeline against real git repositories, with mock LLM and
//! artifact store.

mod common;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{git, init_origin, registry_at, task};
use necrocode::application::runner::AgentRunner;
use necrocode::domain::error::FailureReason;
use necrocode::domain::models::{
    ArtifactType, RunnerConfig, SecretsConfig, TaskContext, TaskState,
};
use necrocode::domain::ports::{
    ArtifactStore, LlmClient, LlmRequest, LlmResponse, TaskExecutor, TaskOutcome, TaskStore,
};
use necrocode::infrastructure::logging::SecretRedactor;
use necrocode::services::registry::TaskRegistry;
use tokio::sync::watch;
use tokio::sync::Mutex;

// ---------------------------------------------------------------------
// Mocks
// ---------------------------------------------------------------------

struct ScriptedLlm {
    response: String,
    requests: Mutex<Vec<LlmRequest>>,
}

impl ScriptedLlm {
    fn new(response: impl Into<String>) -> Self {
        Self { response: response.into(), requests: Mutex::new(Vec::new()) }
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, request: LlmRequest) -> anyhow::Result<LlmResponse> {
        self.requests.lock().await.push(request);
        Ok(LlmResponse {
            content: self.response.clone(),
            total_tokens: 321,
            model: "scripted".to_string(),
        })
    }
}

/// Hangs forever; used for cancellation coverage.
struct StuckLlm;

#[async_trait]
impl LlmClient for StuckLlm {
    async fn complete(&self, _request: LlmRequest) -> anyhow::Result<LlmResponse> {
        std::future::pending().await
    }
}

#[derive(Default)]
struct RecordingArtifactStore {
    uploads: Mutex<Vec<(ArtifactType, usize)>>,
}

#[async_trait]
impl ArtifactStore for RecordingArtifactStore {
    async fn upload(
        &self,
        artifact_type: ArtifactType,
        bytes: Vec<u8>,
        _metadata: BTreeMap<String, String>,
    ) -> anyhow::Result<String> {
        let mut uploads = self.uploads.lock().await;
        uploads.push((artifact_type, bytes.len()));
        Ok(format!("blob://test/{}-{}", artifact_type.as_str(), uploads.len()))
    }
}

// ---------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------

fn runner_config() -> RunnerConfig {
    RunnerConfig {
        heartbeat_interval_secs: 1,
        default_task_timeout_secs: 120,
        test_command_timeout_secs: 30,
        fail_fast: true,
        file_tree_depth: 3,
        push_max_attempts: 3,
    }
}

fn edit_response() -> String {
    serde_json::json!({
        "code_changes": [
            {"file_path": "src/answer.txt", "operation": "create", "content": "42\n"}
        ],
        "explanation": "wrote the answer file"
    })
    .to_string()
}

/// Clone origin into a slot directory and configure a commit identity.
async fn clone_slot(origin: &Path, slot: &Path) {
    let parent = slot.parent().unwrap();
    tokio::fs::create_dir_all(parent).await.unwrap();
    git(parent, &["clone", origin.to_str().unwrap(), slot.file_name().unwrap().to_str().unwrap()])
        .await;
    git(slot, &["config", "user.email", "runner@necrocode.dev"]).await;
    git(slot, &["config", "user.name", "Runner"]).await;
}

struct Fixture {
    registry: Arc<TaskRegistry>,
    artifacts: Arc<RecordingArtifactStore>,
    origin: std::path::PathBuf,
    slot: std::path::PathBuf,
    _dir: tempfile::TempDir,
}

async fn fixture(task_id: &str) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let origin = dir.path().join("origin");
    tokio::fs::create_dir_all(&origin).await.unwrap();
    init_origin(&origin).await;

    let slot = dir.path().join("slots/slot1");
    clone_slot(&origin, &slot).await;

    let registry = Arc::new(registry_at(dir.path()));
    registry.create_taskset("demo", vec![task(task_id, &[])]).await.unwrap();
    registry
        .update_task_state("demo", task_id, TaskState::Running, BTreeMap::new())
        .await
        .unwrap();

    Fixture {
        registry,
        artifacts: Arc::new(RecordingArtifactStore::default()),
        origin,
        slot,
        _dir: dir,
    }
}

fn context(fixture: &Fixture, task_id: &str, test_commands: Vec<String>) -> TaskContext {
    TaskContext {
        task_id: task_id.to_string(),
        spec_name: "demo".to_string(),
        title: "Write the answer".to_string(),
        description: "Create src/answer.txt containing 42.".to_string(),
        acceptance_criteria: vec!["src/answer.txt exists".to_string()],
        dependencies: vec![],
        required_skill: Some("backend".to_string()),
        slot_id: "demo-slot1".to_string(),
        slot_path: fixture.slot.display().to_string(),
        branch_name: format!("necro/demo/{task_id}"),
        test_commands,
        timeout_seconds: 120,
        related_files: vec!["README.md".to_string()],
        max_tokens: None,
        playbook_path: None,
    }
}

fn runner(fixture: &Fixture, llm: Arc<dyn LlmClient>) -> AgentRunner {
    AgentRunner::new(
        fixture.registry.clone(),
        llm,
        fixture.artifacts.clone(),
        runner_config(),
        SecretRedactor::from_config(&SecretsConfig::default()),
    )
}

// ---------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------

#[tokio::test]
async fn happy_path_applies_edits_tests_pushes_and_uploads() {
    let fx = fixture("1").await;
    let llm = Arc::new(ScriptedLlm::new(edit_response()));
    let runner = runner(&fx, llm.clone());

    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let report = runner
        .execute(context(&fx, "1", vec!["echo tests-ok".to_string()]), cancel_rx)
        .await;

    assert_eq!(report.outcome, TaskOutcome::Done, "summary: {}", report.summary);

    // The edit landed and was committed on the task branch.
    assert_eq!(
        tokio::fs::read_to_string(fx.slot.join("src/answer.txt")).await.unwrap(),
        "42\n"
    );
    let subject = git(&fx.slot, &["log", "-1", "--format=%s"]).await;
    assert_eq!(subject.trim(), "spirit(backend): Write the answer [Task 1]");

    // The branch is on the origin.
    let remote_head = git(&fx.origin, &["rev-parse", "necro/demo/1"]).await;
    let local_head = git(&fx.slot, &["rev-parse", "HEAD"]).await;
    assert_eq!(remote_head, local_head);

    // Diff, log, and test results were uploaded and recorded.
    let uploads = fx.artifacts.uploads.lock().await;
    let kinds: Vec<ArtifactType> = uploads.iter().map(|(k, _)| *k).collect();
    assert!(kinds.contains(&ArtifactType::Diff));
    assert!(kinds.contains(&ArtifactType::Log));
    assert!(kinds.contains(&ArtifactType::TestResult));

    let taskset = fx.registry.get_taskset("demo").await.unwrap();
    assert_eq!(taskset.task("1").unwrap().artifacts.len(), 3);

    // The prompt carried the related file and the acceptance criterion.
    let requests = llm.requests.lock().await;
    let prompt = &requests[0].messages[0].content;
    assert!(prompt.contains("src/answer.txt exists"));
    assert!(prompt.contains("# demo"));
}

#[tokio::test]
async fn push_conflict_is_rebased_and_retried_to_success() {
    let fx = fixture("2").await;

    // Someone else already pushed to the task branch with divergent history.
    let helper = fx._dir.path().join("helper");
    clone_slot(&fx.origin, &helper).await;
    git(&helper, &["checkout", "-b", "necro/demo/2"]).await;
    tokio::fs::write(helper.join("upstream.txt"), "upstream change\n").await.unwrap();
    git(&helper, &["add", "-A"]).await;
    git(&helper, &["commit", "-m", "upstream work"]).await;
    git(&helper, &["push", "origin", "necro/demo/2"]).await;

    let llm = Arc::new(ScriptedLlm::new(edit_response()));
    let runner = runner(&fx, llm);

    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let report = runner
        .execute(context(&fx, "2", vec!["echo ok".to_string()]), cancel_rx)
        .await;

    // One rejected push, one rebase, one success; no failure surfaced.
    assert_eq!(report.outcome, TaskOutcome::Done, "summary: {}", report.summary);

    // The remote branch now contains both the upstream commit and ours.
    let log = git(&fx.origin, &["log", "--format=%s", "necro/demo/2"]).await;
    assert!(log.contains("upstream work"));
    assert!(log.contains("spirit(backend): Write the answer [Task 2]"));
}

#[tokio::test]
async fn failing_tests_fail_the_task_with_artifacts() {
    let fx = fixture("3").await;
    let llm = Arc::new(ScriptedLlm::new(edit_response()));
    let runner = runner(&fx, llm);

    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let report = runner
        .execute(context(&fx, "3", vec!["exit 7".to_string()]), cancel_rx)
        .await;

    match &report.outcome {
        TaskOutcome::Failed { reason, .. } => assert_eq!(*reason, FailureReason::TestFailure),
        other => panic!("expected test failure, got {other:?}"),
    }

    // Nothing was pushed.
    let branches = git(&fx.origin, &["branch", "--list", "necro/demo/3"]).await;
    assert!(branches.trim().is_empty());

    // Log and test results still made it up for triage.
    let uploads = fx.artifacts.uploads.lock().await;
    let kinds: Vec<ArtifactType> = uploads.iter().map(|(k, _)| *k).collect();
    assert!(kinds.contains(&ArtifactType::Log));
    assert!(kinds.contains(&ArtifactType::TestResult));
}

#[tokio::test]
async fn malformed_llm_response_is_an_implementation_error() {
    let fx = fixture("4").await;
    let llm = Arc::new(ScriptedLlm::new("I think you should try refactoring. No JSON here."));
    let runner = runner(&fx, llm);

    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let report = runner
        .execute(context(&fx, "4", vec!["echo unreachable".to_string()]), cancel_rx)
        .await;

    match &report.outcome {
        TaskOutcome::Failed { reason, .. } => {
            assert_eq!(*reason, FailureReason::ImplementationError);
        }
        other => panic!("expected implementation error, got {other:?}"),
    }
}

#[tokio::test]
async fn cancel_mid_llm_aborts_promptly() {
    let fx = fixture("5.1").await;
    let runner = Arc::new(runner(&fx, Arc::new(StuckLlm)));

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let ctx = context(&fx, "5.1", vec![]);
    let handle = tokio::spawn({
        let runner = Arc::clone(&runner);
        async move { runner.execute(ctx, cancel_rx).await }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel_tx.send(true).unwrap();

    let report = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("cancel must interrupt the LLM call")
        .unwrap();
    match &report.outcome {
        TaskOutcome::Failed { reason, .. } => assert_eq!(*reason, FailureReason::Cancelled),
        other => panic!("expected cancellation, got {other:?}"),
    }
}

#[tokio::test]
async fn timeout_aborts_the_pipeline() {
    let fx = fixture("6").await;
    let runner = runner(&fx, Arc::new(StuckLlm));

    let mut ctx = context(&fx, "6", vec![]);
    ctx.timeout_seconds = 1;

    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let report = runner.execute(ctx, cancel_rx).await;
    match &report.outcome {
        TaskOutcome::Failed { reason, .. } => assert_eq!(*reason, FailureReason::Timeout),
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn heartbeats_are_recorded_during_execution() {
    let fx = fixture("7").await;
    let runner = runner(&fx, Arc::new(StuckLlm));

    let mut ctx = context(&fx, "7", vec![]);
    ctx.timeout_seconds = 3;

    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let _report = runner.execute(ctx, cancel_rx).await;

    let events = fx.registry.query_events("demo", Some("7"), None, None).await.unwrap();
    let beats = events
        .iter()
        .filter(|e| e.event_type == necrocode::domain::models::EventType::RunnerHeartbeat)
        .count();
    assert!(beats >= 1, "expected at least one heartbeat, saw {beats}");
}
