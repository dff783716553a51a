//! File-lock manager.
//!
//! Named exclusion locks backed by lock files created with `create_new`
//! (O_EXCL). The file body is a small JSON object carrying the owner id,
//! pid, and lease expiry, so other processes can reason about staleness.
//!
//! A lock is cleared as stale only when its lease has expired AND its owner
//! pid is no longer alive (or cannot be determined). An unexpired lease is
//! always honored, even if the pid looks dead.

use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::error::LockError;

/// Contents of a lock file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockInfo {
    pub owner_id: String,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
    pub lease_expires_at: DateTime<Utc>,
}

impl LockInfo {
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at < now
    }
}

/// Whether the owning process of a lock is still alive. `Unknown` is
/// returned for locks taken by other hosts or unparsable pids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Liveness {
    Alive,
    Dead,
    Unknown,
}

fn pid_liveness(pid: u32) -> Liveness {
    let Ok(pid) = i32::try_from(pid) else { return Liveness::Unknown };
    match nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None) {
        Ok(()) => Liveness::Alive,
        Err(nix::errno::Errno::ESRCH) => Liveness::Dead,
        Err(_) => Liveness::Unknown, // e.g. EPERM: alive but not ours
    }
}

/// Guard for a held lock. Dropping releases it (best effort); prefer the
/// explicit `release` in non-panic paths.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    pub info: LockInfo,
    /// Stale lock cleared to make way for this acquisition, if any. The
    /// caller is expected to record a `StaleLockCleared` event for it.
    pub cleared_stale: Option<LockInfo>,
    released: bool,
}

impl LockGuard {
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %self.path.display(), error = %e, "failed to remove lock file");
                }
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Manager for the lock files of one directory.
#[derive(Debug, Clone)]
pub struct LockManager {
    dir: PathBuf,
    timeout: StdDuration,
    lease: Duration,
}

impl LockManager {
    pub fn new(dir: impl Into<PathBuf>, timeout_secs: u64, lease_secs: u64) -> Self {
        Self {
            dir: dir.into(),
            timeout: StdDuration::from_secs(timeout_secs),
            lease: Duration::seconds(i64::try_from(lease_secs).unwrap_or(300)),
        }
    }

    pub fn lock_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.lock"))
    }

    /// Acquire the named lock, retrying with jittered backoff until the
    /// configured timeout.
    pub async fn acquire(&self, name: &str) -> Result<LockGuard, LockError> {
        let path = self.lock_path(name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| LockError::Io {
                name: name.to_string(),
                source: e,
            })?;
        }

        let started = std::time::Instant::now();
        let mut backoff_ms: u64 = 10;
        let mut cleared_stale = None;

        loop {
            match self.try_create(&path, name) {
                Ok(info) => {
                    debug!(lock = name, owner = %info.owner_id, "acquired lock");
                    return Ok(LockGuard { path, info, cleared_stale, released: false });
                }
                Err(LockError::Io { source, .. })
                    if source.kind() == std::io::ErrorKind::AlreadyExists =>
                {
                    if let Some(stale) = self.clear_if_stale(&path, name)? {
                        cleared_stale = Some(stale);
                        continue; // retry immediately after clearing
                    }
                }
                Err(e) => return Err(e),
            }

            if started.elapsed() >= self.timeout {
                return Err(LockError::Timeout {
                    name: name.to_string(),
                    waited_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                });
            }

            let jitter = rand::thread_rng().gen_range(0..=backoff_ms / 2);
            tokio::time::sleep(StdDuration::from_millis(backoff_ms + jitter)).await;
            backoff_ms = (backoff_ms * 2).min(500);
        }
    }

    fn try_create(&self, path: &Path, name: &str) -> Result<LockInfo, LockError> {
        let now = Utc::now();
        let info = LockInfo {
            owner_id: Uuid::new_v4().to_string(),
            pid: std::process::id(),
            acquired_at: now,
            lease_expires_at: now + self.lease,
        };
        let body = serde_json::to_vec_pretty(&info).map_err(|e| LockError::Corrupt {
            name: name.to_string(),
            reason: e.to_string(),
        })?;

        // create_new gives O_EXCL semantics: exactly one creator wins.
        let file = std::fs::OpenOptions::new().write(true).create_new(true).open(path);
        match file {
            Ok(mut f) => {
                use std::io::Write;
                f.write_all(&body).map_err(|e| LockError::Io { name: name.to_string(), source: e })?;
                Ok(info)
            }
            Err(e) => Err(LockError::Io { name: name.to_string(), source: e }),
        }
    }

    /// Inspect a contended lock file and remove it when stale. Returns the
    /// cleared lock info so the caller can record it.
    fn clear_if_stale(&self, path: &Path, name: &str) -> Result<Option<LockInfo>, LockError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            // Holder released between our create attempt and this read.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(LockError::Io { name: name.to_string(), source: e }),
        };

        let info: LockInfo = match serde_json::from_str(&content) {
            Ok(info) => info,
            Err(e) => {
                // Unparsable body: without a lease to honor we treat it as
                // corrupt and surface rather than silently steal.
                return Err(LockError::Corrupt { name: name.to_string(), reason: e.to_string() });
            }
        };

        let now = Utc::now();
        if !info.lease_expired(now) {
            return Ok(None);
        }
        if pid_liveness(info.pid) == Liveness::Alive {
            // Expired lease but the holder still runs; honor it and keep
            // waiting rather than yanking a live process's lock.
            return Ok(None);
        }

        warn!(
            lock = name,
            owner = %info.owner_id,
            pid = info.pid,
            lease_expired = %info.lease_expires_at,
            "clearing stale lock"
        );
        match std::fs::remove_file(path) {
            Ok(()) => Ok(Some(info)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(LockError::Io { name: name.to_string(), source: e }),
        }
    }

    /// Read a lock file without acquiring, for status displays and anomaly
    /// scans.
    pub fn inspect(&self, name: &str) -> Result<Option<LockInfo>, LockError> {
        let path = self.lock_path(name);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(LockError::Io { name: name.to_string(), source: e }),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| LockError::Corrupt { name: name.to_string(), reason: e.to_string() })
    }

    /// Names (stems) of all lock files in the directory.
    pub fn list(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else { return Vec::new() };
        let mut names: Vec<String> = entries
            .flatten()
            .filter_map(|e| {
                let name = e.file_name().to_str()?.to_string();
                name.strip_suffix(".lock").map(ToString::to_string)
            })
            .collect();
        names.sort();
        names
    }

    /// Force-remove a lock file regardless of lease. For operator recovery.
    pub fn force_release(&self, name: &str) -> Result<Option<LockInfo>, LockError> {
        let info = self.inspect(name).unwrap_or(None);
        match std::fs::remove_file(self.lock_path(name)) {
            Ok(()) => Ok(info),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(LockError::Io { name: name.to_string(), source: e }),
        }
    }
}
