//! Working-copy provider capability.
//!
//! A provider creates and removes isolated working copies bound to a
//! branch. The default implementation uses native git worktrees placed
//! under a configurable base directory, with optional directory copies
//! (build caches) and a setup script for fresh copies.

use crate::git::{GitError, GitTool};
use crate::runner::{args, CommandRunner, RunnerError};
use async_trait::async_trait;
use specflow_core::config::WorktreeConfig;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error(transparent)]
    Git(#[from] GitError),
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("setup script `{script}` exited with status {exit_code}")]
    Setup { script: String, exit_code: i32 },
}

pub type Result<T> = std::result::Result<T, WorktreeError>;

/// Capability for working-copy lifecycle management.
#[async_trait]
pub trait WorktreeProvider: Send + Sync {
    /// Create a working copy named `name` bound to `branch`, creating the
    /// branch from `base` when it does not exist yet. Returns the path of
    /// the new working copy.
    async fn create(
        &self,
        cancel: &CancellationToken,
        name: &str,
        branch: &str,
        base: &str,
    ) -> Result<PathBuf>;

    /// Remove the working copy named `name`.
    async fn remove(&self, cancel: &CancellationToken, name: &str, force: bool) -> Result<()>;

    /// All branch names in the underlying repository.
    async fn branches(&self, cancel: &CancellationToken) -> Result<Vec<String>>;

    /// The path a working copy of this name would live at.
    fn path_for(&self, name: &str) -> PathBuf;
}

/// Git-worktree-backed provider.
pub struct GitWorktreeProvider {
    repo_root: PathBuf,
    config: WorktreeConfig,
    git: GitTool,
    runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for GitWorktreeProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitWorktreeProvider")
            .field("repo_root", &self.repo_root)
            .finish_non_exhaustive()
    }
}

impl GitWorktreeProvider {
    pub fn new(repo_root: PathBuf, config: WorktreeConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            repo_root,
            config,
            git: GitTool::new(Arc::clone(&runner)),
            runner,
        }
    }

    /// Worktrees default to siblings of the repository root.
    fn base_dir(&self) -> PathBuf {
        self.config.base_dir.clone().unwrap_or_else(|| {
            self.repo_root
                .parent()
                .map_or_else(|| self.repo_root.clone(), Path::to_path_buf)
        })
    }

    async fn run_setup(&self, cancel: &CancellationToken, path: &Path) -> Result<()> {
        let Some(script) = &self.config.setup_script else {
            return Ok(());
        };
        if !self.config.auto_setup {
            return Ok(());
        }
        tracing::info!(script, path = %path.display(), "running worktree setup script");
        let out = self
            .runner
            .run(cancel, path, "sh", &args(&["-c", script]))
            .await?;
        if !out.success() {
            return Err(WorktreeError::Setup {
                script: script.clone(),
                exit_code: out.exit_code,
            });
        }
        Ok(())
    }

    fn copy_cached_dirs(&self, dest: &Path) -> Result<()> {
        for dir in &self.config.copy_dirs {
            let from = self.repo_root.join(dir);
            let to = dest.join(dir);
            if from.is_dir() && !to.exists() {
                copy_dir_recursive(&from, &to)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl WorktreeProvider for GitWorktreeProvider {
    async fn create(
        &self,
        cancel: &CancellationToken,
        name: &str,
        branch: &str,
        base: &str,
    ) -> Result<PathBuf> {
        let path = self.path_for(name);
        self.git
            .worktree_add(cancel, &self.repo_root, &path, branch, base)
            .await?;
        self.copy_cached_dirs(&path)?;
        self.run_setup(cancel, &path).await?;
        Ok(path)
    }

    async fn remove(&self, cancel: &CancellationToken, name: &str, force: bool) -> Result<()> {
        let path = self.path_for(name);
        self.git
            .worktree_remove(cancel, &self.repo_root, &path, force)
            .await?;
        Ok(())
    }

    async fn branches(&self, cancel: &CancellationToken) -> Result<Vec<String>> {
        Ok(self.git.list_branches(cancel, &self.repo_root).await?)
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.base_dir()
            .join(format!("{}{name}", self.config.prefix))
    }
}

fn copy_dir_recursive(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
