//! Command-runner capability.
//!
//! The one seam through which the engine shells out: source-control
//! commands, setup scripts, and custom autocommit commands all go through
//! [`CommandRunner`]. The default implementation spawns subprocesses via
//! tokio and is cancellation-aware.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Exit code reported when a command could not be launched at all.
pub const EXIT_LAUNCH_FAILED: i32 = -1;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("command cancelled")]
    Cancelled,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RunnerError>;

/// Captured result of a command run.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Whether the command never launched (exit code -1 by convention).
    pub fn launch_failed(&self) -> bool {
        self.exit_code == EXIT_LAUNCH_FAILED
    }
}

/// Capability for running external commands.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command in `dir`, capturing output.
    ///
    /// A command that cannot be launched yields exit code -1 with the
    /// launch error in stderr rather than an `Err`; `Err` is reserved for
    /// cancellation and I/O failures while the command is running.
    async fn run(
        &self,
        cancel: &CancellationToken,
        dir: &Path,
        cmd: &str,
        args: &[String],
    ) -> Result<RunOutput>;
}

/// Default subprocess-backed runner.
#[derive(Debug, Default, Clone, Copy)]
pub struct SubprocessRunner;

#[async_trait]
impl CommandRunner for SubprocessRunner {
    async fn run(
        &self,
        cancel: &CancellationToken,
        dir: &Path,
        cmd: &str,
        args: &[String],
    ) -> Result<RunOutput> {
        let mut command = tokio::process::Command::new(cmd);
        command
            .args(args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                return Ok(RunOutput {
                    exit_code: EXIT_LAUNCH_FAILED,
                    stdout: String::new(),
                    stderr: format!("failed to launch {cmd}: {err}"),
                });
            }
        };

        tokio::select! {
            output = child.wait_with_output() => {
                let output = output?;
                Ok(RunOutput {
                    exit_code: output.status.code().unwrap_or(EXIT_LAUNCH_FAILED),
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                })
            }
            () = cancel.cancelled() => {
                // kill_on_drop reaps the child.
                Err(RunnerError::Cancelled)
            }
        }
    }
}

/// Convenience for building owned argument lists.
pub fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(ToString::to_string).collect()
}
