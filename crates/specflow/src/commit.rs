//! Post-execution commit verification.
//!
//! Guarantees that an agent's file changes end as commits on the spec
//! branch. A clean tree with commits ahead of the base branch is already
//! committed; uncommitted changes trigger autocommit, either through a
//! templated command or by sending the agent back in with the list of
//! dirty files.

use crate::agent::{Agent, AgentError};
use crate::git::{GitError, GitTool};
use crate::output::OutputHandle;
use crate::runner::{args, CommandRunner, RunnerError};
use specflow_core::config::FlowConfig;
use specflow_core::state::CommitStatus;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum CommitError {
    #[error(transparent)]
    Git(#[from] GitError),
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error("undefined template variable: {{{name}}}")]
    UndefinedVariable { name: String },
    #[error("unterminated template variable in `{template}`")]
    UnterminatedVariable { template: String },
}

pub type Result<T> = std::result::Result<T, CommitError>;

/// Verifier configuration, cut down from the full config.
#[derive(Debug, Clone)]
pub struct CommitConfig {
    pub autocommit: bool,
    pub retries: u32,
    pub custom_cmd: Option<String>,
}

impl CommitConfig {
    pub fn from_flow(config: &FlowConfig) -> Self {
        Self {
            autocommit: config.autocommit_enabled(),
            retries: config.autocommit_retries,
            custom_cmd: config.autocommit_cmd.clone(),
        }
    }
}

/// Everything the verifier needs to know about one spec.
#[derive(Debug, Clone, Copy)]
pub struct CommitRequest<'a> {
    pub spec_id: &'a str,
    pub worktree: &'a Path,
    pub branch: &'a str,
    pub base_branch: &'a str,
    pub dag_id: &'a str,
}

/// Verifier verdict.
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    pub status: CommitStatus,
    pub sha: Option<String>,
    pub attempts: u32,
    pub error: Option<String>,
}

impl CommitOutcome {
    fn pending(error: Option<String>) -> Self {
        Self {
            status: CommitStatus::Pending,
            sha: None,
            attempts: 0,
            error,
        }
    }
}

/// Post-execution commit verifier.
pub struct CommitVerifier {
    git: GitTool,
    runner: Arc<dyn CommandRunner>,
    agent: Arc<dyn Agent>,
    config: CommitConfig,
}

impl std::fmt::Debug for CommitVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitVerifier")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CommitVerifier {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        agent: Arc<dyn Agent>,
        config: CommitConfig,
    ) -> Self {
        Self {
            git: GitTool::new(Arc::clone(&runner)),
            runner,
            agent,
            config,
        }
    }

    /// Verify (and if configured, repair) the committed state of a spec.
    pub async fn verify(
        &self,
        cancel: &CancellationToken,
        req: &CommitRequest<'_>,
        output: OutputHandle,
    ) -> Result<CommitOutcome> {
        if !self.git.has_uncommitted(cancel, req.worktree).await? {
            return self.check_commits_ahead(cancel, req, 0).await;
        }

        if !self.config.autocommit {
            // Uncommitted changes, autocommit disabled: not an error,
            // the operator opted out.
            return Ok(CommitOutcome::pending(None));
        }

        for attempt in 1..=self.config.retries {
            tracing::info!(
                spec_id = req.spec_id,
                attempt,
                retries = self.config.retries,
                "attempting autocommit"
            );
            let attempt_ok = if let Some(template) = &self.config.custom_cmd {
                self.run_custom_cmd(cancel, req, template).await?
            } else {
                self.run_agent_autocommit(cancel, req, OutputHandle::clone(&output))
                    .await?;
                true
            };

            // Success needs the command to have succeeded and the tree to
            // end up clean with commits ahead of the base.
            if attempt_ok && !self.git.has_uncommitted(cancel, req.worktree).await? {
                let outcome = self.check_commits_ahead(cancel, req, attempt).await?;
                if outcome.status == CommitStatus::Committed {
                    return Ok(outcome);
                }
            }
        }

        Ok(CommitOutcome {
            status: CommitStatus::Failed,
            sha: None,
            attempts: self.config.retries,
            error: Some(format!(
                "autocommit failed after {} attempts",
                self.config.retries
            )),
        })
    }

    async fn check_commits_ahead(
        &self,
        cancel: &CancellationToken,
        req: &CommitRequest<'_>,
        attempts: u32,
    ) -> Result<CommitOutcome> {
        let ahead = self
            .git
            .commits_ahead(cancel, req.worktree, req.base_branch)
            .await?;
        if ahead >= 1 {
            let sha = self.git.head_sha(cancel, req.worktree).await?;
            Ok(CommitOutcome {
                status: CommitStatus::Committed,
                sha: Some(sha),
                attempts,
                error: None,
            })
        } else {
            Ok(CommitOutcome {
                status: CommitStatus::Pending,
                sha: None,
                attempts,
                error: Some(format!("no commits ahead of {}", req.base_branch)),
            })
        }
    }

    async fn run_custom_cmd(
        &self,
        cancel: &CancellationToken,
        req: &CommitRequest<'_>,
        template: &str,
    ) -> Result<bool> {
        let cmd = expand_template(template, req)?;
        tracing::debug!(spec_id = req.spec_id, %cmd, "running autocommit command");
        let out = self
            .runner
            .run(cancel, req.worktree, "sh", &args(&["-c", &cmd]))
            .await?;
        if !out.success() {
            tracing::warn!(
                spec_id = req.spec_id,
                exit_code = out.exit_code,
                "autocommit command failed"
            );
        }
        Ok(out.success())
    }

    async fn run_agent_autocommit(
        &self,
        cancel: &CancellationToken,
        req: &CommitRequest<'_>,
        output: OutputHandle,
    ) -> Result<()> {
        let files = self.git.uncommitted_files(cancel, req.worktree).await?;
        let prompt = autocommit_prompt(req.spec_id, &files);
        let code = self
            .agent
            .run(cancel, &prompt, req.worktree, true, output)
            .await?;
        if code != 0 {
            tracing::warn!(
                spec_id = req.spec_id,
                exit_code = code,
                "autocommit agent exited nonzero"
            );
        }
        Ok(())
    }
}

/// Prompt sent to the agent when it left uncommitted changes behind.
fn autocommit_prompt(spec_id: &str, files: &[String]) -> String {
    let mut prompt = format!(
        "The working copy for spec '{spec_id}' has uncommitted changes. \
         Stage and commit all of them with a concise commit message \
         describing the work. Do not modify any file contents.\n\nUncommitted files:\n"
    );
    for file in files {
        prompt.push_str("  - ");
        prompt.push_str(file);
        prompt.push('\n');
    }
    prompt
}

/// Expand `{Var}` placeholders in an autocommit command template.
///
/// Known variables: `SpecID`, `Worktree`, `Branch`, `BaseBranch`,
/// `DagID`. Undefined variables are an error. No shell quoting is
/// applied; the template author is responsible for safe commands.
pub fn expand_template(template: &str, req: &CommitRequest<'_>) -> Result<String> {
    let worktree = req.worktree.to_string_lossy();
    let lookup = |name: &str| -> Option<&str> {
        match name {
            "SpecID" => Some(req.spec_id),
            "Worktree" => Some(worktree.as_ref()),
            "Branch" => Some(req.branch),
            "BaseBranch" => Some(req.base_branch),
            "DagID" => Some(req.dag_id),
            _ => None,
        }
    };

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            return Err(CommitError::UnterminatedVariable {
                template: template.to_string(),
            });
        };
        let name = &after[..close];
        let value = lookup(name).ok_or_else(|| CommitError::UndefinedVariable {
            name: name.to_string(),
        })?;
        out.push_str(value);
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
