//! Git subprocess abstraction.
//!
//! Every repository interaction goes through `git` invocations. Exit codes
//! are authoritative; stderr is captured for diagnostics. Cancellation
//! sends SIGTERM to the running subprocess.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::domain::error::GitError;

/// Captured output of a successful git invocation.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn stdout_trimmed(&self) -> String {
        self.stdout.trim().to_string()
    }
}

/// Thin wrapper over the `git` binary.
#[derive(Debug, Clone, Default)]
pub struct Git;

impl Git {
    pub fn new() -> Self {
        Self
    }

    /// Run git with `args` in `dir`. Non-zero exit maps to `CommandFailed`,
    /// with push rejections specialized to `NonFastForward`.
    pub async fn run(&self, dir: &Path, args: &[&str]) -> Result<GitOutput, GitError> {
        debug!(dir = %dir.display(), args = ?args, "git");
        let output = Command::new("git")
            .current_dir(dir)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;
        Self::interpret(args, output)
    }

    /// Run git, aborting with SIGTERM when `cancel` flips to true.
    pub async fn run_cancellable(
        &self,
        dir: &Path,
        args: &[&str],
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<GitOutput, GitError> {
        if *cancel.borrow() {
            return Err(GitError::Cancelled { command: args.join(" ") });
        }

        debug!(dir = %dir.display(), args = ?args, "git (cancellable)");
        let mut child = Command::new("git")
            .current_dir(dir)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let pid = child.id();

        let wait = child.wait_with_output();
        tokio::pin!(wait);

        loop {
            tokio::select! {
                output = &mut wait => {
                    return Self::interpret(args, output?);
                }
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        if let Some(pid) = pid {
                            terminate(pid, &args.join(" "));
                        }
                        // Give git a moment to clean up its lock files.
                        let _ = tokio::time::timeout(
                            std::time::Duration::from_secs(5),
                            &mut wait,
                        )
                        .await;
                        return Err(GitError::Cancelled { command: args.join(" ") });
                    }
                }
            }
        }
    }

    fn interpret(args: &[&str], output: std::process::Output) -> Result<GitOutput, GitError> {
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if output.status.success() {
            return Ok(GitOutput { stdout, stderr });
        }
        if args.first() == Some(&"push") && is_non_fast_forward(&stderr) {
            return Err(GitError::NonFastForward { stderr });
        }
        Err(GitError::CommandFailed {
            command: args.join(" "),
            code: output.status.code(),
            stderr,
        })
    }

    // ------------------------------------------------------------------
    // Repository setup
    // ------------------------------------------------------------------

    pub async fn clone_bare(&self, cwd: &Path, url: &str, dest: &str) -> Result<(), GitError> {
        self.run(cwd, &["clone", "--bare", url, dest]).await.map(|_| ())
    }

    /// Add a worktree on a new branch from `start_point`.
    pub async fn worktree_add(
        &self,
        repo_dir: &Path,
        worktree_path: &str,
        branch: &str,
        start_point: &str,
    ) -> Result<(), GitError> {
        self.run(repo_dir, &["worktree", "add", "-b", branch, worktree_path, start_point])
            .await
            .map(|_| ())
    }

    pub async fn worktree_remove(&self, repo_dir: &Path, worktree_path: &str, force: bool) -> Result<(), GitError> {
        let result = if force {
            self.run(repo_dir, &["worktree", "remove", "--force", worktree_path]).await
        } else {
            self.run(repo_dir, &["worktree", "remove", worktree_path]).await
        };
        result.map(|_| ())
    }

    /// Drop stale worktree registrations after a directory was deleted
    /// out from under git.
    pub async fn worktree_prune(&self, repo_dir: &Path) -> Result<(), GitError> {
        self.run(repo_dir, &["worktree", "prune"]).await.map(|_| ())
    }

    // ------------------------------------------------------------------
    // Working tree hygiene
    // ------------------------------------------------------------------

    pub async fn fetch_all(&self, dir: &Path) -> Result<(), GitError> {
        self.run(dir, &["fetch", "--all", "--prune"]).await.map(|_| ())
    }

    pub async fn checkout(&self, dir: &Path, branch: &str) -> Result<(), GitError> {
        self.run(dir, &["checkout", branch]).await.map(|_| ())
    }

    pub async fn checkout_new_branch(&self, dir: &Path, branch: &str) -> Result<(), GitError> {
        self.run(dir, &["checkout", "-B", branch]).await.map(|_| ())
    }

    pub async fn reset_hard(&self, dir: &Path, target: &str) -> Result<(), GitError> {
        self.run(dir, &["reset", "--hard", target]).await.map(|_| ())
    }

    /// `clean -fdx`, optionally sparing named paths (slot metadata lives
    /// inside the worktree and must survive cleanup).
    pub async fn clean_untracked(&self, dir: &Path, keep: &[&str]) -> Result<(), GitError> {
        let mut args = vec!["clean", "-fdx"];
        for pattern in keep {
            args.push("-e");
            args.push(pattern);
        }
        self.run(dir, &args).await.map(|_| ())
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub async fn rev_parse_head(&self, dir: &Path) -> Result<String, GitError> {
        let out = self.run(dir, &["rev-parse", "HEAD"]).await?;
        Ok(out.stdout_trimmed())
    }

    pub async fn status_porcelain(&self, dir: &Path) -> Result<String, GitError> {
        let out = self.run(dir, &["status", "--porcelain"]).await?;
        Ok(out.stdout)
    }

    pub async fn fsck(&self, dir: &Path) -> Result<(), GitError> {
        self.run(dir, &["fsck", "--no-progress"]).await.map(|_| ())
    }

    pub async fn branch_exists(&self, dir: &Path, branch: &str) -> Result<bool, GitError> {
        match self
            .run(dir, &["show-ref", "--verify", "--quiet", &format!("refs/heads/{branch}")])
            .await
        {
            Ok(_) => Ok(true),
            Err(GitError::CommandFailed { code: Some(1), .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Resolve the remote default branch, falling back to main/master
    /// detection when `origin/HEAD` is unset.
    pub async fn default_branch(&self, dir: &Path) -> Result<String, GitError> {
        if let Ok(out) = self.run(dir, &["symbolic-ref", "refs/remotes/origin/HEAD"]).await {
            if let Some(branch) = out.stdout_trimmed().strip_prefix("refs/remotes/origin/") {
                return Ok(branch.to_string());
            }
        }
        for candidate in ["main", "master"] {
            if self
                .run(dir, &["show-ref", "--verify", "--quiet", &format!("refs/remotes/origin/{candidate}")])
                .await
                .is_ok()
            {
                return Ok(candidate.to_string());
            }
            if self.branch_exists(dir, candidate).await? {
                return Ok(candidate.to_string());
            }
        }
        Err(GitError::CommandFailed {
            command: "symbolic-ref refs/remotes/origin/HEAD".to_string(),
            code: None,
            stderr: "unable to determine default branch".to_string(),
        })
    }

    pub async fn diff(&self, dir: &Path, range: &str) -> Result<String, GitError> {
        let out = self.run(dir, &["diff", range]).await?;
        Ok(out.stdout)
    }

    // ------------------------------------------------------------------
    // Commit & publish
    // ------------------------------------------------------------------

    pub async fn add_all(&self, dir: &Path) -> Result<(), GitError> {
        self.run(dir, &["add", "-A"]).await.map(|_| ())
    }

    pub async fn commit(&self, dir: &Path, message: &str) -> Result<(), GitError> {
        self.run(dir, &["commit", "-m", message]).await.map(|_| ())
    }

    pub async fn push(&self, dir: &Path, remote: &str, branch: &str) -> Result<(), GitError> {
        self.run(dir, &["push", remote, branch]).await.map(|_| ())
    }

    pub async fn rebase(&self, dir: &Path, onto: &str) -> Result<(), GitError> {
        match self.run(dir, &["rebase", onto]).await {
            Ok(_) => Ok(()),
            Err(e) => {
                // Leave no half-applied rebase behind.
                if let Err(abort_err) = self.run(dir, &["rebase", "--abort"]).await {
                    warn!(error = %abort_err, "rebase --abort failed after rebase error");
                }
                Err(e)
            }
        }
    }
}

fn is_non_fast_forward(stderr: &str) -> bool {
    let s = stderr.to_lowercase();
    s.contains("non-fast-forward") || s.contains("[rejected]") || s.contains("fetch first")
}

fn terminate(pid: u32, command: &str) {
    let Ok(pid) = i32::try_from(pid) else { return };
    warn!(pid, command, "terminating git subprocess");
    if let Err(e) = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), nix::sys::signal::Signal::SIGTERM) {
        warn!(pid, error = %e, "failed to signal git subprocess");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn init_repo(dir: &Path) {
        let git = Git::new();
        git.run(dir, &["init", "-b", "main"]).await.unwrap();
        git.run(dir, &["config", "user.email", "test@necrocode.dev"]).await.unwrap();
        git.run(dir, &["config", "user.name", "Test"]).await.unwrap();
        tokio::fs::write(dir.join("README.md"), "hello\n").await.unwrap();
        git.add_all(dir).await.unwrap();
        git.commit(dir, "initial").await.unwrap();
    }

    #[tokio::test]
    async fn rev_parse_head_returns_commit() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path()).await;
        let head = Git::new().rev_parse_head(dir.path()).await.unwrap();
        assert_eq!(head.len(), 40);
    }

    #[tokio::test]
    async fn failed_command_carries_stderr_and_code() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path()).await;
        let err = Git::new().checkout(dir.path(), "no-such-branch").await.unwrap_err();
        match err {
            GitError::CommandFailed { command, code, stderr } => {
                assert!(command.starts_with("checkout"));
                assert!(code.is_some());
                assert!(!stderr.is_empty());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn branch_exists_distinguishes() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path()).await;
        let git = Git::new();
        assert!(git.branch_exists(dir.path(), "main").await.unwrap());
        assert!(!git.branch_exists(dir.path(), "ghost").await.unwrap());
    }

    #[tokio::test]
    async fn status_porcelain_reflects_untracked_and_clean() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path()).await;
        let git = Git::new();

        assert!(git.status_porcelain(dir.path()).await.unwrap().is_empty());
        tokio::fs::write(dir.path().join("junk.txt"), "x").await.unwrap();
        assert!(git.status_porcelain(dir.path()).await.unwrap().contains("junk.txt"));

        tokio::fs::write(dir.path().join("keep.json"), "x").await.unwrap();
        git.clean_untracked(dir.path(), &["keep.json"]).await.unwrap();
        let status = git.status_porcelain(dir.path()).await.unwrap();
        assert!(!status.contains("junk.txt"));
        assert!(status.contains("keep.json"));
    }

    #[test]
    fn non_fast_forward_detection() {
        assert!(is_non_fast_forward("! [rejected]  main -> main (non-fast-forward)"));
        assert!(is_non_fast_forward("hint: Updates were rejected... git pull / fetch first"));
        assert!(!is_non_fast_forward("fatal: could not read from remote repository"));
    }

    #[tokio::test]
    async fn cancelled_before_start_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path()).await;
        let (tx, mut rx) = watch::channel(true);
        let err = Git::new()
            .run_cancellable(dir.path(), &["status"], &mut rx)
            .await
            .unwrap_err();
        assert!(matches!(err, GitError::Cancelled { .. }));
        drop(tx);
    }
}
