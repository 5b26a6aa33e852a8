//! Git operations for the orchestrator.
//!
//! All source-control work goes through [`GitTool`], which treats git as
//! a black-box command behind the [`CommandRunner`] capability: branch
//! management, merges with conflicted-path collection, commit counting,
//! and conflict-marker scanning for the merge engine.

use crate::runner::{args, CommandRunner, RunOutput, RunnerError};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git {cmd} failed: {stderr}")]
    CommandFailed { cmd: String, stderr: String },
    #[error("could not launch git: {0}")]
    Launch(String),
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error("unexpected git output: {0}")]
    BadOutput(String),
}

pub type Result<T> = std::result::Result<T, GitError>;

/// Outcome of a merge attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Merged cleanly (or nothing to do).
    Clean,
    /// Merge stopped with conflicts in the listed paths. The conflict
    /// markers are left in the working tree for resolution.
    Conflicts(Vec<String>),
}

/// A single `<<<<<<< ... >>>>>>>` block extracted from a conflicted file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictHunk {
    /// 1-based line of the opening marker.
    pub start_line: usize,
    /// 1-based line of the closing marker.
    pub end_line: usize,
    pub text: String,
}

/// Git command wrapper over the command-runner capability.
#[derive(Clone)]
pub struct GitTool {
    runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for GitTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitTool").finish_non_exhaustive()
    }
}

impl GitTool {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn git(
        &self,
        cancel: &CancellationToken,
        dir: &Path,
        arguments: &[&str],
    ) -> Result<RunOutput> {
        let out = self
            .runner
            .run(cancel, dir, "git", &args(arguments))
            .await?;
        if out.launch_failed() {
            return Err(GitError::Launch(out.stderr));
        }
        Ok(out)
    }

    async fn git_ok(
        &self,
        cancel: &CancellationToken,
        dir: &Path,
        arguments: &[&str],
    ) -> Result<RunOutput> {
        let out = self.git(cancel, dir, arguments).await?;
        if !out.success() {
            return Err(GitError::CommandFailed {
                cmd: arguments.join(" "),
                stderr: out.stderr.trim().to_string(),
            });
        }
        Ok(out)
    }

    /// Whether a local branch exists.
    pub async fn branch_exists(
        &self,
        cancel: &CancellationToken,
        dir: &Path,
        branch: &str,
    ) -> Result<bool> {
        let reference = format!("refs/heads/{branch}");
        let out = self
            .git(cancel, dir, &["rev-parse", "--verify", "--quiet", &reference])
            .await?;
        Ok(out.success())
    }

    /// All local branch names.
    pub async fn list_branches(
        &self,
        cancel: &CancellationToken,
        dir: &Path,
    ) -> Result<Vec<String>> {
        let out = self
            .git_ok(
                cancel,
                dir,
                &["for-each-ref", "--format=%(refname:short)", "refs/heads"],
            )
            .await?;
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(ToString::to_string)
            .collect())
    }

    /// Create a branch from a base without checking it out.
    pub async fn create_branch(
        &self,
        cancel: &CancellationToken,
        dir: &Path,
        branch: &str,
        base: &str,
    ) -> Result<()> {
        self.git_ok(cancel, dir, &["branch", branch, base]).await?;
        Ok(())
    }

    /// Checkout a branch in the working copy.
    pub async fn checkout(
        &self,
        cancel: &CancellationToken,
        dir: &Path,
        branch: &str,
    ) -> Result<()> {
        self.git_ok(cancel, dir, &["checkout", branch]).await?;
        Ok(())
    }

    /// The currently checked-out branch.
    pub async fn current_branch(
        &self,
        cancel: &CancellationToken,
        dir: &Path,
    ) -> Result<String> {
        let out = self
            .git_ok(cancel, dir, &["branch", "--show-current"])
            .await?;
        Ok(out.stdout.trim().to_string())
    }

    /// SHA of HEAD.
    pub async fn head_sha(&self, cancel: &CancellationToken, dir: &Path) -> Result<String> {
        let out = self.git_ok(cancel, dir, &["rev-parse", "HEAD"]).await?;
        Ok(out.stdout.trim().to_string())
    }

    /// Whether the working tree has uncommitted changes (staged,
    /// unstaged, or untracked).
    pub async fn has_uncommitted(&self, cancel: &CancellationToken, dir: &Path) -> Result<bool> {
        let out = self.git_ok(cancel, dir, &["status", "--porcelain"]).await?;
        Ok(!out.stdout.trim().is_empty())
    }

    /// Paths with uncommitted changes.
    pub async fn uncommitted_files(
        &self,
        cancel: &CancellationToken,
        dir: &Path,
    ) -> Result<Vec<String>> {
        let out = self.git_ok(cancel, dir, &["status", "--porcelain"]).await?;
        Ok(out
            .stdout
            .lines()
            .filter(|l| l.len() > 3)
            .map(|l| l[3..].trim().to_string())
            .collect())
    }

    /// Number of commits on HEAD that are not on `base` (`base..HEAD`).
    pub async fn commits_ahead(
        &self,
        cancel: &CancellationToken,
        dir: &Path,
        base: &str,
    ) -> Result<u64> {
        let range = format!("{base}..HEAD");
        let out = self
            .git_ok(cancel, dir, &["rev-list", "--count", &range])
            .await?;
        out.stdout
            .trim()
            .parse()
            .map_err(|_| GitError::BadOutput(format!("rev-list --count: {}", out.stdout.trim())))
    }

    /// Root of the repository containing `dir`, if any.
    pub async fn toplevel(
        &self,
        cancel: &CancellationToken,
        dir: &Path,
    ) -> Result<Option<std::path::PathBuf>> {
        let out = self
            .git(cancel, dir, &["rev-parse", "--show-toplevel"])
            .await?;
        if out.success() {
            Ok(Some(std::path::PathBuf::from(out.stdout.trim())))
        } else {
            Ok(None)
        }
    }

    /// URL of the `origin` remote, if configured.
    pub async fn remote_url(
        &self,
        cancel: &CancellationToken,
        dir: &Path,
    ) -> Result<Option<String>> {
        let out = self
            .git(cancel, dir, &["remote", "get-url", "origin"])
            .await?;
        if out.success() {
            let url = out.stdout.trim().to_string();
            Ok((!url.is_empty()).then_some(url))
        } else {
            Ok(None)
        }
    }

    /// Merge `branch` into the current branch.
    ///
    /// On conflict the markers are left in place and the conflicted
    /// paths are returned; the caller decides whether to resolve or
    /// abort.
    pub async fn merge(
        &self,
        cancel: &CancellationToken,
        dir: &Path,
        branch: &str,
    ) -> Result<MergeOutcome> {
        let out = self.git(cancel, dir, &["merge", "--no-edit", branch]).await?;
        if out.success() {
            return Ok(MergeOutcome::Clean);
        }
        let conflicts = self.conflicted_files(cancel, dir).await?;
        if conflicts.is_empty() {
            return Err(GitError::CommandFailed {
                cmd: format!("merge {branch}"),
                stderr: out.stderr.trim().to_string(),
            });
        }
        Ok(MergeOutcome::Conflicts(conflicts))
    }

    /// Paths currently in the unmerged state.
    pub async fn conflicted_files(
        &self,
        cancel: &CancellationToken,
        dir: &Path,
    ) -> Result<Vec<String>> {
        let out = self
            .git_ok(cancel, dir, &["diff", "--name-only", "--diff-filter=U"])
            .await?;
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(ToString::to_string)
            .collect())
    }

    /// Abort an in-progress merge, restoring a clean tree.
    pub async fn abort_merge(&self, cancel: &CancellationToken, dir: &Path) {
        if let Err(err) = self.git(cancel, dir, &["merge", "--abort"]).await {
            tracing::warn!(%err, "git merge --abort failed");
        }
    }

    /// Stage the given paths.
    pub async fn add(
        &self,
        cancel: &CancellationToken,
        dir: &Path,
        paths: &[String],
    ) -> Result<()> {
        let mut arguments = vec!["add", "--"];
        arguments.extend(paths.iter().map(String::as_str));
        self.git_ok(cancel, dir, &arguments).await?;
        Ok(())
    }

    /// Complete an in-progress merge commit with the default message.
    pub async fn commit_no_edit(&self, cancel: &CancellationToken, dir: &Path) -> Result<()> {
        self.git_ok(cancel, dir, &["commit", "--no-edit"]).await?;
        Ok(())
    }

    /// Create a worktree at `path` for `branch`, creating the branch from
    /// `base` when missing.
    pub async fn worktree_add(
        &self,
        cancel: &CancellationToken,
        repo: &Path,
        path: &Path,
        branch: &str,
        base: &str,
    ) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| GitError::Launch(format!("create worktree parent: {e}")))?;
        }
        // Drop stale registrations left by manually deleted worktrees, or
        // the add below refuses branches they still claim.
        let _ = self.git(cancel, repo, &["worktree", "prune"]).await;
        if !self.branch_exists(cancel, repo, branch).await? {
            self.create_branch(cancel, repo, branch, base).await?;
        }
        let path_str = path.to_string_lossy();
        self.git_ok(cancel, repo, &["worktree", "add", path_str.as_ref(), branch])
            .await?;
        Ok(())
    }

    /// Remove a worktree.
    pub async fn worktree_remove(
        &self,
        cancel: &CancellationToken,
        repo: &Path,
        path: &Path,
        force: bool,
    ) -> Result<()> {
        let path_str = path.to_string_lossy();
        let mut arguments = vec!["worktree", "remove"];
        if force {
            arguments.push("--force");
        }
        arguments.push(path_str.as_ref());
        self.git_ok(cancel, repo, &arguments).await?;
        Ok(())
    }
}

/// Whether text still contains merge conflict markers.
pub fn contains_conflict_markers(text: &str) -> bool {
    text.lines()
        .any(|l| l.starts_with("<<<<<<<") || l.starts_with(">>>>>>>"))
}

/// Extract every conflict block with its 1-based line span.
pub fn extract_conflict_hunks(text: &str) -> Vec<ConflictHunk> {
    let mut hunks = Vec::new();
    let mut current: Option<(usize, Vec<&str>)> = None;

    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        if line.starts_with("<<<<<<<") && current.is_none() {
            current = Some((line_no, vec![line]));
        } else if let Some((start, lines)) = current.as_mut() {
            lines.push(line);
            if line.starts_with(">>>>>>>") {
                hunks.push(ConflictHunk {
                    start_line: *start,
                    end_line: line_no,
                    text: lines.join("\n"),
                });
                current = None;
            }
        }
    }
    hunks
}
