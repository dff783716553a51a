//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::path::Path;

use necrocode::domain::models::{RegistryConfig, Task};
use necrocode::services::registry::TaskRegistry;

pub fn registry_at(dir: &Path) -> TaskRegistry {
    TaskRegistry::new(&RegistryConfig {
        data_dir: dir.join("registry").display().to_string(),
        lock_timeout_secs: 5,
        lock_lease_secs: 60,
        max_event_log_bytes: 1024 * 1024,
        checklist_path: "tasks.md".to_string(),
    })
}

pub fn task(id: &str, deps: &[&str]) -> Task {
    let mut t = Task::new(id, format!("Task {id}"), format!("Do the work for {id}"));
    for dep in deps {
        t = t.with_dependency(*dep);
    }
    t
}

/// Run a git command in `dir`, panicking on failure.
pub async fn git(dir: &Path, args: &[&str]) -> String {
    let output = tokio::process::Command::new("git")
        .current_dir(dir)
        .args(args)
        .output()
        .await
        .expect("failed to spawn git");
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).to_string()
}

/// Initialize a repository with one commit on `main` and return its HEAD.
pub async fn init_origin(dir: &Path) -> String {
    git(dir, &["init", "-b", "main"]).await;
    git(dir, &["config", "user.email", "ci@necrocode.dev"]).await;
    git(dir, &["config", "user.name", "CI"]).await;
    tokio::fs::write(dir.join("README.md"), "# demo\n").await.unwrap();
    tokio::fs::write(dir.join("Makefile"), "test:\n\t@echo tests pass\n").await.unwrap();
    git(dir, &["add", "-A"]).await;
    git(dir, &["commit", "-m", "initial"]).await;
    git(dir, &["rev-parse", "HEAD"]).await.trim().to_string()
}
