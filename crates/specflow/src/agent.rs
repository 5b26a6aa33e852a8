//! Code-generation agent capability.
//!
//! The agent is an external command given a prompt and a working
//! directory; its stdout/stderr stream line-by-line into the spec's
//! output writer and its exit code decides the stage outcome. The
//! default implementation shells out to the `claude` CLI but any
//! command can be substituted via `agent_cmd`.

use crate::output::OutputHandle;
use async_trait::async_trait;
use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent cancelled")]
    Cancelled,
    #[error("failed to launch agent `{program}`: {message}")]
    Launch { program: String, message: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;

/// Capability for invoking the external code-generation agent.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Run the agent with `prompt` inside `dir`, streaming output.
    ///
    /// `autonomous` asks the agent to proceed without interactive
    /// permission prompts. Returns the agent's exit code.
    async fn run(
        &self,
        cancel: &CancellationToken,
        prompt: &str,
        dir: &Path,
        autonomous: bool,
        output: OutputHandle,
    ) -> Result<i32>;
}

/// Subprocess-backed agent.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    program: String,
    base_args: Vec<String>,
}

impl CommandAgent {
    pub fn new(program: impl Into<String>, base_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            base_args,
        }
    }

    /// Build from the `agent_cmd` config value, falling back to the
    /// default `claude -p` invocation.
    pub fn from_config(agent_cmd: Option<&str>) -> Self {
        match agent_cmd {
            Some(cmd) if !cmd.trim().is_empty() => {
                let mut parts = cmd.split_whitespace().map(ToString::to_string);
                let program = parts.next().unwrap_or_else(|| "claude".to_string());
                Self::new(program, parts.collect())
            }
            _ => Self::new("claude", vec!["-p".to_string()]),
        }
    }
}

#[async_trait]
impl Agent for CommandAgent {
    async fn run(
        &self,
        cancel: &CancellationToken,
        prompt: &str,
        dir: &Path,
        autonomous: bool,
        output: OutputHandle,
    ) -> Result<i32> {
        let mut command = tokio::process::Command::new(&self.program);
        command.args(&self.base_args);
        if autonomous && self.program == "claude" {
            command.arg("--dangerously-skip-permissions");
        }
        command
            .arg(prompt)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(
            program = %self.program,
            dir = %dir.display(),
            "spawning agent process"
        );

        let mut child = command.spawn().map_err(|e| AgentError::Launch {
            program: self.program.clone(),
            message: e.to_string(),
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let out_task = stdout.map(|stream| {
            let handle = OutputHandle::clone(&output);
            tokio::spawn(async move { stream_lines(stream, &handle).await })
        });
        let err_task = stderr.map(|stream| {
            let handle = OutputHandle::clone(&output);
            tokio::spawn(async move { stream_lines(stream, &handle).await })
        });

        let status = tokio::select! {
            status = child.wait() => status?,
            () = cancel.cancelled() => {
                if let Err(err) = child.start_kill() {
                    tracing::warn!(%err, "failed to kill agent process");
                }
                let _ = child.wait().await;
                return Err(AgentError::Cancelled);
            }
        };

        // Drain the readers so every produced line reaches the sinks.
        if let Some(task) = out_task {
            let _ = task.await;
        }
        if let Some(task) = err_task {
            let _ = task.await;
        }

        Ok(status.code().unwrap_or(-1))
    }
}

async fn stream_lines<R>(stream: R, output: &OutputHandle)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Ok(mut writer) = output.lock() {
            if let Err(err) = writeln!(&mut *writer, "{line}") {
                tracing::warn!(%err, "failed to write agent output");
                break;
            }
        }
    }
}
