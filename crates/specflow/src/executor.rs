//! Per-spec execution pipeline.
//!
//! Drives one spec from pending to a terminal status: spec lock with
//! heartbeat, working-copy lifecycle with deterministic branch naming and
//! collision suffixing, agent invocation streamed through the output
//! writer, commit verification, and stage-attributed failure reporting.
//! Every transition is persisted; working copies are never removed on
//! failure.

use crate::agent::{Agent, AgentError};
use crate::commit::{CommitRequest, CommitVerifier};
use crate::locks::LockManager;
use crate::output::{flush_handle, Clock, OutputHandle, SharedSink, SpecOutput};
use crate::store::StateStore;
use crate::worktree::WorktreeProvider;
use specflow_core::config::FlowConfig;
use specflow_core::ident::{branch_collision_suffix, spec_branch, spec_log_path, worktree_name};
use specflow_core::state::{CommitStatus, DagRun, SpecStatus};
use specflow_core::workflow::{parse_duration, Feature};
use chrono::Utc;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Exit code reported when the agent exceeds the feature timeout.
const TIMEOUT_EXIT_CODE: i32 = 124;

pub const STAGE_LOCK: &str = "lock";
pub const STAGE_WORKTREE: &str = "worktree";
pub const STAGE_AGENT: &str = "agent";
pub const STAGE_COMMIT: &str = "commit";

/// A run shared between the scheduler and its worker tasks.
pub type SharedRun = Arc<Mutex<DagRun>>;

/// Lock the shared run, riding through poisoning.
pub fn lock_run(run: &SharedRun) -> MutexGuard<'_, DagRun> {
    match run.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A spec failure attributed to its pipeline stage.
#[derive(Debug, Clone, Error)]
#[error("[{stage}] {message}")]
pub struct ExecutorError {
    pub stage: &'static str,
    pub message: String,
}

impl ExecutorError {
    fn new(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
        }
    }

    /// Whether this failure is a cooperative cancellation, not a defect.
    pub fn is_cancelled(&self) -> bool {
        self.message == "cancelled"
    }
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Executes individual specs.
pub struct SpecExecutor {
    agent: Arc<dyn Agent>,
    worktrees: Arc<dyn WorktreeProvider>,
    store: Arc<StateStore>,
    locks: Arc<LockManager>,
    verifier: CommitVerifier,
    clock: Arc<dyn Clock>,
    term: SharedSink,
    config: FlowConfig,
    workflow_path: PathBuf,
    force_recreate: bool,
}

impl std::fmt::Debug for SpecExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpecExecutor")
            .field("workflow_path", &self.workflow_path)
            .field("force_recreate", &self.force_recreate)
            .finish_non_exhaustive()
    }
}

impl SpecExecutor {
    pub fn new(
        agent: Arc<dyn Agent>,
        worktrees: Arc<dyn WorktreeProvider>,
        store: Arc<StateStore>,
        locks: Arc<LockManager>,
        verifier: CommitVerifier,
        clock: Arc<dyn Clock>,
        term: SharedSink,
        config: FlowConfig,
        workflow_path: PathBuf,
        force_recreate: bool,
    ) -> Self {
        Self {
            agent,
            worktrees,
            store,
            locks,
            verifier,
            clock,
            term,
            config,
            workflow_path,
            force_recreate,
        }
    }

    /// Run one spec to a terminal status.
    ///
    /// Already-completed specs are skipped, which makes resume
    /// idempotent. On success the spec is `completed` with a verified
    /// commit; on failure the spec is `failed` with a stage-attributed
    /// reason and its working copy preserved for debugging.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        run: &SharedRun,
        feature: &Feature,
    ) -> Result<()> {
        let spec_id = feature.id.clone();

        let (run_id, dag_id, log_base) = {
            let guard = lock_run(run);
            let Some(spec) = guard.spec(&spec_id) else {
                return Err(ExecutorError::new(STAGE_LOCK, "spec not found in run state"));
            };
            if spec.status == SpecStatus::Completed {
                tracing::info!(spec_id, "already completed, skipping");
                return Ok(());
            }
            (
                guard.run_id.clone(),
                guard.dag_id.clone(),
                guard.log_base.clone(),
            )
        };

        let lock_guard = match self.locks.acquire_spec_lock(&run_id, &spec_id) {
            Ok(guard) => guard,
            Err(err) => return Err(self.fail(run, &spec_id, STAGE_LOCK, err.to_string())),
        };

        let result = self
            .run_pipeline(cancel, run, feature, &dag_id, &log_base)
            .await;
        lock_guard.release().await;
        result
    }

    async fn run_pipeline(
        &self,
        cancel: &CancellationToken,
        run: &SharedRun,
        feature: &Feature,
        dag_id: &str,
        log_base: &std::path::Path,
    ) -> Result<()> {
        let spec_id = feature.id.clone();

        self.update(run, &spec_id, |spec| {
            spec.status = SpecStatus::Running;
            spec.started_at = Some(Utc::now());
            spec.failure_reason = None;
            spec.current_stage = STAGE_WORKTREE.to_string();
        });
        self.persist(run);

        // --- Working copy ---
        let branch = match self.resolve_branch(cancel, run, &spec_id, dag_id).await {
            Ok(branch) => branch,
            Err(message) => return Err(self.fail(run, &spec_id, STAGE_WORKTREE, message)),
        };
        self.update(run, &spec_id, |spec| spec.branch = Some(branch.clone()));
        self.persist(run);

        let worktree = match self.prepare_worktree(cancel, run, &spec_id, dag_id, &branch).await {
            Ok(path) => path,
            Err(message) => return Err(self.fail(run, &spec_id, STAGE_WORKTREE, message)),
        };
        let log_file = spec_log_path(log_base, &spec_id);
        self.update(run, &spec_id, |spec| {
            spec.worktree_path = Some(worktree.clone());
            spec.log_file = Some(log_file.clone());
        });
        self.persist(run);

        if cancel.is_cancelled() {
            return Err(self.cancelled(run, &spec_id));
        }

        // --- Agent ---
        self.update(run, &spec_id, |spec| {
            spec.current_stage = STAGE_AGENT.to_string();
            spec.current_task = feature.description.clone();
        });
        self.persist(run);

        let output = match SpecOutput::create(
            &spec_id,
            SharedSink::clone(&self.term),
            &log_file,
            self.config.max_log_size_bytes(),
            Arc::clone(&self.clock),
        ) {
            Ok(output) => output.into_handle(),
            Err(err) => {
                return Err(self.fail(
                    run,
                    &spec_id,
                    STAGE_AGENT,
                    format!("failed to open log file: {err}"),
                ))
            }
        };

        let exit_code = self
            .run_agent(cancel, run, feature, &worktree, &branch, &output)
            .await?;
        flush_handle(&output);
        self.update(run, &spec_id, |spec| spec.exit_code = Some(exit_code));
        self.persist(run);
        if exit_code != 0 {
            let message = if exit_code == TIMEOUT_EXIT_CODE {
                "agent timed out".to_string()
            } else {
                format!("agent exited with status {exit_code}")
            };
            return Err(self.fail(run, &spec_id, STAGE_AGENT, message));
        }

        // --- Commit verification ---
        self.update(run, &spec_id, |spec| {
            spec.current_stage = STAGE_COMMIT.to_string();
        });
        self.persist(run);

        let request = CommitRequest {
            spec_id: &spec_id,
            worktree: &worktree,
            branch: &branch,
            base_branch: self.config.target_branch(),
            dag_id,
        };
        let outcome = match self
            .verifier
            .verify(cancel, &request, OutputHandle::clone(&output))
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => return Err(self.fail(run, &spec_id, STAGE_COMMIT, err.to_string())),
        };
        self.update(run, &spec_id, |spec| {
            spec.commit_status = outcome.status;
            spec.commit_sha = outcome.sha.clone();
            spec.commit_attempts = outcome.attempts;
        });
        self.persist(run);

        let commit_failed =
            outcome.status == CommitStatus::Failed || outcome.error.is_some();
        if commit_failed && self.config.autocommit_enabled() {
            let message = outcome
                .error
                .unwrap_or_else(|| "commit verification failed".to_string());
            return Err(self.fail(run, &spec_id, STAGE_COMMIT, message));
        }

        // --- Completion ---
        self.update(run, &spec_id, |spec| {
            spec.current_stage = String::new();
            spec.current_task = String::new();
            spec.status = SpecStatus::Completed;
            spec.completed_at = Some(Utc::now());
        });
        self.persist(run);
        tracing::info!(spec_id, "spec completed");
        Ok(())
    }

    /// Resolve the spec's branch name.
    ///
    /// A branch persisted by a previous run of this workflow is reused
    /// exactly. Otherwise the deterministic `dag/<dag-id>/<spec-id>` name
    /// is used, suffixed with four hex characters of the workflow-path
    /// hash when a branch of that name already exists but was not
    /// recorded by this run (it belongs to some other DAG).
    async fn resolve_branch(
        &self,
        cancel: &CancellationToken,
        run: &SharedRun,
        spec_id: &str,
        dag_id: &str,
    ) -> std::result::Result<String, String> {
        if let Some(branch) = lock_run(run).spec(spec_id).and_then(|s| s.branch.clone()) {
            return Ok(branch);
        }
        let candidate = spec_branch(dag_id, spec_id);
        let branches = self
            .worktrees
            .branches(cancel)
            .await
            .map_err(|e| e.to_string())?;
        if branches.iter().any(|b| *b == candidate) {
            let suffixed = format!(
                "{candidate}-{}",
                branch_collision_suffix(&self.workflow_path)
            );
            tracing::warn!(
                spec_id,
                existing = %candidate,
                branch = %suffixed,
                "branch exists from another DAG, using suffixed name"
            );
            Ok(suffixed)
        } else {
            Ok(candidate)
        }
    }

    async fn prepare_worktree(
        &self,
        cancel: &CancellationToken,
        run: &SharedRun,
        spec_id: &str,
        dag_id: &str,
        branch: &str,
    ) -> std::result::Result<PathBuf, String> {
        let name = worktree_name(dag_id, spec_id);
        let prior = lock_run(run)
            .spec(spec_id)
            .and_then(|s| s.worktree_path.clone());

        if let Some(path) = prior {
            if path.exists() {
                if !self.force_recreate {
                    return Err(format!(
                        "worktree exists from previous failed run at {} (use --force-recreate to recreate)",
                        path.display()
                    ));
                }
                self.worktrees
                    .remove(cancel, &name, true)
                    .await
                    .map_err(|e| format!("failed to remove old worktree: {e}"))?;
            }
        }

        self.worktrees
            .create(cancel, &name, branch, self.config.target_branch())
            .await
            .map_err(|e| e.to_string())
    }

    async fn run_agent(
        &self,
        cancel: &CancellationToken,
        run: &SharedRun,
        feature: &Feature,
        worktree: &std::path::Path,
        branch: &str,
        output: &OutputHandle,
    ) -> Result<i32> {
        let spec_id = &feature.id;
        let prompt = self.build_prompt(feature, branch);
        let timeout = feature
            .timeout
            .as_deref()
            .and_then(|t| parse_duration(t).ok());

        let attempts = 1 + self.config.max_spec_retries;
        let mut exit_code = 0;
        for attempt in 1..=attempts {
            tracing::info!(spec_id, attempt, attempts, "invoking agent");
            let child_cancel = cancel.child_token();
            let invocation =
                self.agent
                    .run(&child_cancel, &prompt, worktree, true, OutputHandle::clone(output));

            let result = match timeout {
                Some(limit) => match tokio::time::timeout(limit, invocation).await {
                    Ok(result) => result,
                    Err(_) => {
                        // Dropping the invocation kills the child.
                        child_cancel.cancel();
                        tracing::warn!(spec_id, ?limit, "agent timed out");
                        Ok(TIMEOUT_EXIT_CODE)
                    }
                },
                None => invocation.await,
            };

            exit_code = match result {
                Ok(code) => code,
                Err(AgentError::Cancelled) => return Err(self.cancelled(run, spec_id)),
                Err(err) => return Err(self.fail(run, spec_id, STAGE_AGENT, err.to_string())),
            };
            if exit_code == 0 {
                break;
            }
            if attempt < attempts {
                tracing::warn!(spec_id, exit_code, attempt, "agent failed, retrying");
            }
        }
        Ok(exit_code)
    }

    fn build_prompt(&self, feature: &Feature, branch: &str) -> String {
        let spec_dir = self.config.specs_dir.join(&feature.id);
        format!(
            "Implement spec '{id}': {description}\n\n\
             You are in an isolated working copy on branch '{branch}'. \
             The full specification is in {spec_dir}. Implement it \
             completely, run the relevant checks, then stage and commit \
             every change with a descriptive message.",
            id = feature.id,
            description = feature.description,
            spec_dir = spec_dir.display(),
        )
    }

    fn update<F: FnOnce(&mut specflow_core::state::SpecState)>(
        &self,
        run: &SharedRun,
        spec_id: &str,
        f: F,
    ) {
        let mut guard = lock_run(run);
        if let Some(spec) = guard.spec_mut(spec_id) {
            f(spec);
        }
    }

    fn persist(&self, run: &SharedRun) {
        let snapshot = lock_run(run).clone();
        if let Err(err) = self.store.save(&snapshot) {
            tracing::error!(%err, "failed to persist run state");
        }
    }

    /// Mark a spec failed, persist, and print the operator summary.
    fn fail(
        &self,
        run: &SharedRun,
        spec_id: &str,
        stage: &'static str,
        message: impl Into<String>,
    ) -> ExecutorError {
        let message = message.into();
        let worktree = {
            let mut guard = lock_run(run);
            let mut worktree = None;
            if let Some(spec) = guard.spec_mut(spec_id) {
                spec.status = SpecStatus::Failed;
                spec.failure_reason = Some(format!("[{stage}] {message}"));
                spec.completed_at = Some(Utc::now());
                worktree = spec.worktree_path.clone();
            }
            worktree
        };
        self.persist(run);
        self.print_failure(spec_id, stage, &message, worktree.as_deref());
        ExecutorError::new(stage, message)
    }

    /// Cooperative cancellation: put the spec back to pending so a
    /// resume re-executes it, and keep the working copy.
    fn cancelled(&self, run: &SharedRun, spec_id: &str) -> ExecutorError {
        self.update(run, spec_id, |spec| {
            spec.status = SpecStatus::Pending;
            spec.current_stage = String::new();
            spec.current_task = String::new();
        });
        self.persist(run);
        tracing::info!(spec_id, "spec cancelled");
        ExecutorError::new(STAGE_AGENT, "cancelled")
    }

    fn print_failure(
        &self,
        spec_id: &str,
        stage: &str,
        message: &str,
        worktree: Option<&std::path::Path>,
    ) {
        let workflow = self.workflow_path.display();
        let mut block = format!("\nspec '{spec_id}' failed at stage [{stage}]: {message}\n");
        if let Some(path) = worktree {
            block.push_str(&format!(
                "  working copy preserved at: {}\n",
                path.display()
            ));
        }
        block.push_str(&format!("  resume:      specflow resume {workflow}\n"));
        block.push_str(&format!(
            "  rerun clean: specflow run {workflow} --only {spec_id} --force-recreate\n"
        ));
        if let Ok(mut term) = self.term.lock() {
            let _ = term.write_all(block.as_bytes());
            let _ = term.flush();
        }
    }
}
