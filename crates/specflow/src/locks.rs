//! Run-level and spec-level locking.
//!
//! Two layers of cross-process coordination, both file-based:
//!
//! - The coarse run lock refuses to start a run whose spec set overlaps
//!   another live run. Liveness is judged by the recorded PID; locks
//!   whose owner is gone are reclaimed.
//! - The fine-grained spec lock proves liveness with a heartbeat
//!   refreshed every 30 seconds by a background task. The stored PID is
//!   informational only, since PIDs are recycled; a lock is stale once
//!   its heartbeat is older than two minutes, and acquiring over a stale
//!   lock is permitted.
//!
//! All lock writes use the temp-file + rename pattern.

use crate::store::{atomic_write_json, StoreError};
use chrono::Utc;
use specflow_core::state::{RunLockFile, SpecLockFile, HEARTBEAT_INTERVAL_SECS};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("specs {specs:?} are already claimed by run {other_run} (pid {pid})")]
    Overlap {
        other_run: String,
        pid: u32,
        specs: Vec<String>,
    },
    #[error("spec `{spec_id}` is locked by run {run_id} and its heartbeat is fresh")]
    SpecHeld { spec_id: String, run_id: String },
}

pub type Result<T> = std::result::Result<T, LockError>;

/// Manages lock files under the state directory.
#[derive(Debug, Clone)]
pub struct LockManager {
    state_dir: PathBuf,
}

impl LockManager {
    pub fn new(state_dir: PathBuf) -> Self {
        Self { state_dir }
    }

    fn run_lock_path(&self, run_id: &str) -> PathBuf {
        self.state_dir.join(format!("{run_id}.lock"))
    }

    fn spec_lock_path(&self, run_id: &str, spec_id: &str) -> PathBuf {
        self.state_dir.join(run_id).join(format!("{spec_id}.lock"))
    }

    /// Acquire the coarse run lock.
    ///
    /// Scans every other run lock on disk: an overlap with a lock whose
    /// PID is still alive is an error; stale locks are removed and their
    /// claims ignored.
    pub fn acquire_run_lock(&self, run_id: &str, spec_ids: &[String]) -> Result<RunLockGuard> {
        let entries = std::fs::read_dir(&self.state_dir).map_err(|source| LockError::Io {
            path: self.state_dir.clone(),
            source,
        })?;

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("lock") || !path.is_file() {
                continue;
            }
            let Ok(bytes) = std::fs::read(&path) else {
                continue;
            };
            let Ok(lock) = serde_json::from_slice::<RunLockFile>(&bytes) else {
                tracing::warn!(path = %path.display(), "removing unreadable run lock");
                let _ = std::fs::remove_file(&path);
                continue;
            };
            if lock.run_id == run_id || !lock.overlaps(spec_ids) {
                continue;
            }
            if pid_alive(lock.pid) {
                let overlapping: Vec<String> = lock
                    .specs
                    .iter()
                    .filter(|s| spec_ids.contains(s))
                    .cloned()
                    .collect();
                return Err(LockError::Overlap {
                    other_run: lock.run_id,
                    pid: lock.pid,
                    specs: overlapping,
                });
            }
            tracing::warn!(
                other_run = %lock.run_id,
                pid = lock.pid,
                "removing stale run lock from dead process"
            );
            let _ = std::fs::remove_file(&path);
        }

        let lock = RunLockFile {
            run_id: run_id.to_string(),
            pid: std::process::id(),
            specs: spec_ids.to_vec(),
            started_at: Utc::now(),
        };
        let path = self.run_lock_path(run_id);
        atomic_write_json(&path, &lock)?;
        Ok(RunLockGuard { path })
    }

    /// Acquire a spec lock and start its heartbeat task.
    ///
    /// Fails when a fresh lock exists; a stale one is overwritten.
    pub fn acquire_spec_lock(&self, run_id: &str, spec_id: &str) -> Result<SpecLockGuard> {
        let path = self.spec_lock_path(run_id, spec_id);

        if let Ok(bytes) = std::fs::read(&path) {
            if let Ok(existing) = serde_json::from_slice::<SpecLockFile>(&bytes) {
                if !existing.is_stale() {
                    return Err(LockError::SpecHeld {
                        spec_id: spec_id.to_string(),
                        run_id: existing.run_id,
                    });
                }
                tracing::warn!(
                    spec_id,
                    other_run = %existing.run_id,
                    "taking over stale spec lock"
                );
            }
        }

        let mut lock = SpecLockFile::new(spec_id, run_id);
        atomic_write_json(&path, &lock)?;

        // Heartbeat task: refresh every 30 s until released. Failures are
        // swallowed; the lock simply goes stale.
        let token = CancellationToken::new();
        let task_token = token.clone();
        let task_path = path.clone();
        let task = tokio::spawn(async move {
            let interval = Duration::from_secs(HEARTBEAT_INTERVAL_SECS as u64);
            loop {
                tokio::select! {
                    () = task_token.cancelled() => break,
                    () = tokio::time::sleep(interval) => {
                        lock.heartbeat = Utc::now();
                        if let Err(err) = atomic_write_json(&task_path, &lock) {
                            tracing::warn!(%err, "heartbeat refresh failed");
                        }
                    }
                }
            }
        });

        Ok(SpecLockGuard {
            path,
            token,
            task: Some(task),
        })
    }

    /// Read a spec lock from disk, if present and parseable.
    pub fn read_spec_lock(&self, run_id: &str, spec_id: &str) -> Option<SpecLockFile> {
        let bytes = std::fs::read(self.spec_lock_path(run_id, spec_id)).ok()?;
        serde_json::from_slice(&bytes).ok()
    }
}

/// Held run lock; removing the file on release or drop.
#[derive(Debug)]
pub struct RunLockGuard {
    path: PathBuf,
}

impl RunLockGuard {
    pub fn release(self) {
        // Removal happens in Drop.
    }
}

impl Drop for RunLockGuard {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), %err, "failed to remove run lock");
            }
        }
    }
}

/// Held spec lock with its heartbeat task.
#[derive(Debug)]
pub struct SpecLockGuard {
    path: PathBuf,
    token: CancellationToken,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl SpecLockGuard {
    /// Stop the heartbeat and remove the lock file.
    pub async fn release(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), %err, "failed to remove spec lock");
            }
        }
    }
}

impl Drop for SpecLockGuard {
    fn drop(&mut self) {
        self.token.cancel();
        // Best-effort removal if release() was never awaited.
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Whether a process with this PID is alive.
fn pid_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use specflow_core::state::LOCK_STALE_AFTER_SECS;
    use tempfile::TempDir;

    fn manager() -> (TempDir, LockManager) {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("state")).unwrap();
        let manager = LockManager::new(dir.path().join("state"));
        (dir, manager)
    }

    fn specs(ids: &[&str]) -> Vec<String> {
        ids.iter().map(ToString::to_string).collect()
    }

    #[tokio::test]
    async fn run_lock_acquire_and_release() {
        let (_dir, manager) = manager();
        let guard = manager.acquire_run_lock("run-1", &specs(&["a", "b"])).unwrap();
        assert!(manager.state_dir.join("run-1.lock").exists());
        guard.release();
        assert!(!manager.state_dir.join("run-1.lock").exists());
    }

    #[tokio::test]
    async fn overlapping_live_run_lock_is_refused() {
        let (_dir, manager) = manager();
        // A lock held by this very process counts as alive.
        let _guard = manager.acquire_run_lock("run-1", &specs(&["a", "b"])).unwrap();

        let err = manager
            .acquire_run_lock("run-2", &specs(&["b", "c"]))
            .unwrap_err();
        match err {
            LockError::Overlap { other_run, specs, .. } => {
                assert_eq!(other_run, "run-1");
                assert_eq!(specs, vec!["b"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn disjoint_runs_may_coexist() {
        let (_dir, manager) = manager();
        let _guard1 = manager.acquire_run_lock("run-1", &specs(&["a"])).unwrap();
        let _guard2 = manager.acquire_run_lock("run-2", &specs(&["b"])).unwrap();
    }

    #[tokio::test]
    async fn stale_run_lock_from_dead_pid_is_reclaimed() {
        let (_dir, manager) = manager();
        // PIDs near u32::MAX do not exist on any sane system.
        let dead = RunLockFile {
            run_id: "crashed".to_string(),
            pid: u32::MAX - 1,
            specs: specs(&["a"]),
            started_at: Utc::now(),
        };
        atomic_write_json(&manager.state_dir.join("crashed.lock"), &dead).unwrap();

        let _guard = manager.acquire_run_lock("run-1", &specs(&["a"])).unwrap();
        assert!(!manager.state_dir.join("crashed.lock").exists());
    }

    #[tokio::test]
    async fn spec_lock_writes_heartbeat_and_releases() {
        let (_dir, manager) = manager();
        let guard = manager.acquire_spec_lock("run-1", "a").unwrap();

        let lock = manager.read_spec_lock("run-1", "a").unwrap();
        assert_eq!(lock.spec_id, "a");
        assert_eq!(lock.run_id, "run-1");
        assert!(!lock.is_stale());

        guard.release().await;
        assert!(manager.read_spec_lock("run-1", "a").is_none());
    }

    #[tokio::test]
    async fn fresh_spec_lock_blocks_second_acquire() {
        let (_dir, manager) = manager();
        let _guard = manager.acquire_spec_lock("run-1", "a").unwrap();

        let err = manager.acquire_spec_lock("run-2", "a").unwrap_err();
        assert!(matches!(err, LockError::SpecHeld { .. }));
    }

    #[tokio::test]
    async fn stale_spec_lock_can_be_taken_over() {
        let (_dir, manager) = manager();
        let mut stale = SpecLockFile::new("a", "old-run");
        stale.heartbeat = Utc::now() - ChronoDuration::seconds(LOCK_STALE_AFTER_SECS + 60);
        let path = manager.state_dir.join("run-1").join("a.lock");
        atomic_write_json(&path, &stale).unwrap();

        let guard = manager.acquire_spec_lock("run-1", "a").unwrap();
        let lock = manager.read_spec_lock("run-1", "a").unwrap();
        assert_eq!(lock.run_id, "run-1");
        guard.release().await;
    }
}
