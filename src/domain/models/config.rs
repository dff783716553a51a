//! Configuration domain model.
//!
//! The full configuration tree with serde defaults. Loading and hierarchical
//! merging live in `infrastructure::config`; every component receives the
//! relevant sub-struct through its constructor rather than reading globals.

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub registry: RegistryConfig,
    pub pool: PoolConfig,
    pub dispatcher: DispatcherConfig,
    pub runner: RunnerConfig,
    pub llm: LlmConfig,
    pub artifact_store: ArtifactStoreConfig,
    pub logging: LoggingConfig,
    pub secrets: SecretsConfig,
}

/// Task registry storage and locking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Root for tasksets/, events/ and locks/
    pub data_dir: String,
    /// Per-spec lock acquisition timeout
    pub lock_timeout_secs: u64,
    /// Lease duration written into lock files
    pub lock_lease_secs: u64,
    /// Event log rotation threshold
    pub max_event_log_bytes: u64,
    /// Path of the human-readable checklist document, relative to a spec dir
    pub checklist_path: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            data_dir: ".necrocode/registry".to_string(),
            lock_timeout_secs: 30,
            lock_lease_secs: 300,
            max_event_log_bytes: 100 * 1024 * 1024,
            checklist_path: "tasks.md".to_string(),
        }
    }
}

/// Repo pool layout and hygiene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub workspaces_dir: String,
    /// Slots allocated longer than this are anomalous
    pub max_allocation_hours: u64,
    /// Lock files older than this with a dead owner or expired lease are stale
    pub lock_staleness_secs: u64,
    pub lock_timeout_secs: u64,
    pub lock_lease_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workspaces_dir: ".necrocode/workspaces".to_string(),
            max_allocation_hours: 4,
            lock_staleness_secs: 3600,
            lock_timeout_secs: 30,
            lock_lease_secs: 300,
        }
    }
}

/// Scheduling loop tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub max_concurrency: usize,
    /// `skill → cap`; skills absent from the map are uncapped
    pub per_skill_limits: std::collections::BTreeMap<String, usize>,
    pub poll_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    /// Ready longer than this starts accruing aging boosts
    pub aging_threshold_secs: u64,
    /// One effective-priority step per interval past the threshold
    pub aging_interval_secs: u64,
    pub max_aging_delta: i32,
    pub deadlock_threshold_secs: u64,
    pub retry_initial_backoff_secs: u64,
    pub retry_max_backoff_secs: u64,
    /// Retry budget applied to transient failure reasons
    pub transient_max_retries: u32,
    /// Delay between cancel request and forced slot release
    pub cancel_grace_secs: u64,
    pub auto_release_long_allocated: bool,
    /// Timeout handed to runners when a task carries none of its own
    pub default_task_timeout_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            per_skill_limits: std::collections::BTreeMap::new(),
            poll_interval_secs: 2,
            heartbeat_timeout_secs: 120,
            aging_threshold_secs: 300,
            aging_interval_secs: 60,
            max_aging_delta: 3,
            deadlock_threshold_secs: 600,
            retry_initial_backoff_secs: 10,
            retry_max_backoff_secs: 300,
            transient_max_retries: 2,
            cancel_grace_secs: 30,
            auto_release_long_allocated: false,
            default_task_timeout_secs: 3600,
        }
    }
}

/// Agent runner pipeline tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub heartbeat_interval_secs: u64,
    pub default_task_timeout_secs: u64,
    pub test_command_timeout_secs: u64,
    pub fail_fast: bool,
    /// Depth cap on the file tree embedded in prompts
    pub file_tree_depth: usize,
    pub push_max_attempts: u32,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            default_task_timeout_secs: 3600,
            test_command_timeout_secs: 600,
            fail_fast: true,
            file_tree_depth: 3,
            push_max_attempts: 3,
        }
    }
}

/// LLM provider endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    pub requests_per_second: f64,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.anthropic.com".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            max_tokens: 8192,
            timeout_secs: 300,
            requests_per_second: 10.0,
            max_retries: 3,
            initial_backoff_ms: 10_000,
            max_backoff_ms: 300_000,
        }
    }
}

/// Artifact blob service endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactStoreConfig {
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for ArtifactStoreConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9800".to_string(),
            timeout_secs: 60,
        }
    }
}

/// Logging output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace | debug | info | warn | error
    pub level: String,
    /// json | pretty
    pub format: String,
    /// Log file directory; empty means stderr only
    pub dir: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            dir: String::new(),
        }
    }
}

/// Names of environment variables holding credentials. The values are read
/// at the point of use and masked by the log redactor; they are never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsConfig {
    pub llm_api_key_env: String,
    pub git_token_env: String,
    /// Additional env var names whose values must never appear in logs
    pub extra_secret_envs: Vec<String>,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            llm_api_key_env: "NECROCODE_LLM_API_KEY".to_string(),
            git_token_env: "NECROCODE_GIT_TOKEN".to_string(),
            extra_secret_envs: Vec::new(),
        }
    }
}
