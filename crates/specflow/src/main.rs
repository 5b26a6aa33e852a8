//! specflow - DAG orchestrator CLI.
//!
//! Wires the engine together: loads configuration, parses and validates
//! the workflow, derives project and DAG identifiers, then dispatches to
//! the scheduler, merge engine, or cleanup.

use clap::{Parser, Subcommand};
use specflow::agent::CommandAgent;
use specflow::cleanup::cleanup_run;
use specflow::commit::{CommitConfig, CommitVerifier};
use specflow::executor::{SharedRun, SpecExecutor};
use specflow::git::GitTool;
use specflow::locks::LockManager;
use specflow::merge::{MergeEngine, MergeOptions};
use specflow::output::{stdout_sink, SharedSink, SystemClock};
use specflow::runner::{CommandRunner, SubprocessRunner};
use specflow::scheduler::{Scheduler, SchedulerOptions};
use specflow::store::StateStore;
use specflow::worktree::{GitWorktreeProvider, WorktreeProvider};
use specflow::AppResult;
use specflow_core::config::FlowConfig;
use specflow_core::ident::{
    cache_base, log_dir, project_id_from_path, project_id_from_remote, resolve_dag_id, state_dir,
    PROJECT_ID_UNKNOWN,
};
use specflow_core::state::{DagRun, RunStatus};
use specflow_core::validate::{validate, ValidateOptions};
use specflow_core::workflow::{parse_file, ParseResult};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

/// Exit code for workflow validation failures.
const EXIT_VALIDATION: u8 = 2;
/// Exit code for run, merge, or cleanup failures.
const EXIT_FAILURE: u8 = 1;

#[derive(Parser)]
#[command(name = "specflow")]
#[command(about = "Orchestrates a DAG of agent-driven specs across isolated working copies")]
#[command(version)]
struct Cli {
    /// Config file path (default: .specflow/config)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Parse and validate a workflow, printing every diagnostic
    Validate {
        /// Path to the workflow file
        workflow: PathBuf,
    },

    /// Execute a workflow
    Run {
        /// Path to the workflow file
        workflow: PathBuf,

        /// Concurrency ceiling (minimum 1)
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Run specs one at a time in layer order
        #[arg(long)]
        sequential: bool,

        /// Only execute these spec ids (comma-separated)
        #[arg(long, value_delimiter = ',')]
        only: Vec<String>,

        /// Recreate working copies left over from failed runs
        #[arg(long)]
        force_recreate: bool,

        /// Stop dispatching new specs after the first failure
        #[arg(long)]
        fail_fast: bool,
    },

    /// Resume a previous run of a workflow
    Resume {
        /// Path to the workflow file
        workflow: PathBuf,

        /// Recreate working copies left over from failed runs
        #[arg(long)]
        force_recreate: bool,
    },

    /// List stored runs, newest first
    List,

    /// Merge completed specs into the target branch in dependency order
    Merge {
        /// Path to the workflow file
        workflow: PathBuf,

        /// Target branch (default: configured base branch, then main)
        #[arg(long)]
        target: Option<String>,

        /// Skip specs merged or skipped by a previous pass
        #[arg(long = "continue")]
        continue_run: bool,

        /// Additionally skip specs whose previous merge failed
        #[arg(long)]
        skip_failed: bool,
    },

    /// Remove working copies of merged specs
    Cleanup {
        /// Path to the workflow file
        workflow: PathBuf,

        /// Remove working copies regardless of merge status
        #[arg(long)]
        force: bool,

        /// Clean up every stored run, not just this workflow's
        #[arg(long)]
        all_runs: bool,
    },
}

fn main() -> ExitCode {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to create runtime: {err}");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    match runtime.block_on(dispatch(cli)) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

async fn dispatch(cli: Cli) -> AppResult<ExitCode> {
    let app = App::new(cli.config.as_deref()).await?;
    match cli.command {
        Command::Validate { workflow } => app.validate(&workflow),
        Command::Run {
            workflow,
            max_parallel,
            sequential,
            only,
            force_recreate,
            fail_fast,
        } => {
            app.run(&workflow, RunArgs {
                max_parallel,
                sequential,
                only,
                force_recreate,
                fail_fast,
                resume_only: false,
            })
            .await
        }
        Command::Resume {
            workflow,
            force_recreate,
        } => {
            app.run(&workflow, RunArgs {
                max_parallel: None,
                sequential: false,
                only: Vec::new(),
                force_recreate,
                fail_fast: false,
                resume_only: true,
            })
            .await
        }
        Command::List => app.list(),
        Command::Merge {
            workflow,
            target,
            continue_run,
            skip_failed,
        } => {
            app.merge(&workflow, MergeOptions {
                target,
                continue_run,
                skip_failed,
            })
            .await
        }
        Command::Cleanup {
            workflow,
            force,
            all_runs,
        } => app.cleanup(&workflow, force, all_runs).await,
    }
}

struct RunArgs {
    max_parallel: Option<usize>,
    sequential: bool,
    only: Vec<String>,
    force_recreate: bool,
    fail_fast: bool,
    resume_only: bool,
}

/// Shared wiring for every subcommand.
struct App {
    config: FlowConfig,
    repo_root: PathBuf,
    project_id: String,
    store: Arc<StateStore>,
    locks: Arc<LockManager>,
    runner: Arc<dyn CommandRunner>,
    git: GitTool,
    term: SharedSink,
}

impl App {
    async fn new(config_path: Option<&Path>) -> AppResult<Self> {
        let default_config = PathBuf::from(".specflow/config");
        let config = FlowConfig::load(Some(config_path.unwrap_or(&default_config)))?;

        let runner: Arc<dyn CommandRunner> = Arc::new(SubprocessRunner);
        let git = GitTool::new(Arc::clone(&runner));
        let cancel = CancellationToken::new();

        let cwd = std::env::current_dir()?;
        let repo_root = git
            .toplevel(&cancel, &cwd)
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| cwd.clone());

        let project_id = match git.remote_url(&cancel, &repo_root).await {
            Ok(Some(url)) => project_id_from_remote(&url)
                .unwrap_or_else(|| project_id_from_path(&repo_root)),
            Ok(None) => project_id_from_path(&repo_root),
            Err(_) => PROJECT_ID_UNKNOWN.to_string(),
        };

        let cache = cache_base();
        let store = Arc::new(StateStore::open(state_dir(&cache, &project_id))?);
        let locks = Arc::new(LockManager::new(store.dir().to_path_buf()));

        Ok(Self {
            config,
            repo_root,
            project_id,
            store,
            locks,
            runner,
            git,
            term: stdout_sink(),
        })
    }

    /// Parse + validate; prints diagnostics and returns the parse result.
    fn load_workflow(&self, workflow: &Path) -> AppResult<Result<ParseResult, ExitCode>> {
        let parsed = match parse_file(workflow) {
            Ok(parsed) => parsed,
            Err(err) => {
                eprintln!("{}: {err}", workflow.display());
                return Ok(Err(ExitCode::from(EXIT_VALIDATION)));
            }
        };

        let specs_dir = if self.config.specs_dir.is_absolute() {
            self.config.specs_dir.clone()
        } else {
            self.repo_root.join(&self.config.specs_dir)
        };
        let errors = validate(&parsed, &ValidateOptions {
            specs_dir: Some(specs_dir),
        });
        if !errors.is_empty() {
            for error in &errors {
                eprintln!("{}: {error}", workflow.display());
            }
            eprintln!("{} validation error(s)", errors.len());
            return Ok(Err(ExitCode::from(EXIT_VALIDATION)));
        }
        Ok(Ok(parsed))
    }

    fn validate(&self, workflow: &Path) -> AppResult<ExitCode> {
        match self.load_workflow(workflow)? {
            Ok(_) => {
                println!("{}: ok", workflow.display());
                Ok(ExitCode::SUCCESS)
            }
            Err(code) => Ok(code),
        }
    }

    async fn run(&self, workflow_path: &Path, args: RunArgs) -> AppResult<ExitCode> {
        let parsed = match self.load_workflow(workflow_path)? {
            Ok(parsed) => parsed,
            Err(code) => return Ok(code),
        };
        let workflow = &parsed.workflow;

        let workflow_key = workflow_path.to_string_lossy().to_string();
        let dag_id = resolve_dag_id(
            workflow.dag.id.as_deref(),
            &workflow.dag.name,
            workflow_path,
        );
        let log_base = self
            .config
            .log_dir
            .clone()
            .unwrap_or_else(|| log_dir(&cache_base(), &self.project_id, &dag_id));

        let max_parallel = args
            .max_parallel
            .unwrap_or(self.config.max_parallel)
            .max(1);

        let existing = self.store.load_by_workflow_path(&workflow_key)?;
        if args.resume_only && existing.is_none() {
            eprintln!(
                "no saved state for {} (nothing to resume)",
                workflow_path.display()
            );
            return Ok(ExitCode::from(EXIT_FAILURE));
        }
        let mut run = existing.unwrap_or_else(|| {
            DagRun::new(
                &workflow_key,
                &dag_id,
                &self.project_id,
                max_parallel,
                log_base.clone(),
            )
        });
        run.max_parallel = max_parallel;
        tracing::info!(
            run_id = %run.run_id,
            dag_id = %dag_id,
            project_id = %self.project_id,
            "starting run"
        );

        let agent = Arc::new(CommandAgent::from_config(self.config.agent_cmd.as_deref()));
        let worktrees: Arc<dyn WorktreeProvider> = Arc::new(GitWorktreeProvider::new(
            self.repo_root.clone(),
            self.config.worktree.clone(),
            Arc::clone(&self.runner),
        ));
        let verifier = CommitVerifier::new(
            Arc::clone(&self.runner),
            Arc::clone(&agent) as _,
            CommitConfig::from_flow(&self.config),
        );
        let executor = Arc::new(SpecExecutor::new(
            agent,
            worktrees,
            Arc::clone(&self.store),
            Arc::clone(&self.locks),
            verifier,
            Arc::new(SystemClock),
            SharedSink::clone(&self.term),
            self.config.clone(),
            workflow_path.to_path_buf(),
            args.force_recreate,
        ));

        let only: Option<BTreeSet<String>> = if args.only.is_empty() {
            None
        } else {
            Some(args.only.iter().cloned().collect())
        };
        let scheduler = Scheduler::new(
            executor,
            Arc::clone(&self.store),
            Arc::clone(&self.locks),
            SharedSink::clone(&self.term),
            SchedulerOptions {
                sequential: args.sequential,
                fail_fast: args.fail_fast || self.config.fail_fast,
                only,
            },
        );

        let cancel = CancellationToken::new();
        let signal_cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("received SIGINT, interrupting run");
                signal_cancel.cancel();
            }
        });

        let shared: SharedRun = Arc::new(Mutex::new(run));
        let status = scheduler.run(&cancel, workflow, &shared).await?;

        let final_run = {
            let guard = shared.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            guard.clone()
        };
        print_run_summary(&final_run, status);

        Ok(match status {
            RunStatus::Completed => ExitCode::SUCCESS,
            _ => ExitCode::from(EXIT_FAILURE),
        })
    }

    fn list(&self) -> AppResult<ExitCode> {
        let (runs, errors) = self.store.list();
        for error in &errors {
            tracing::warn!(%error, "unreadable state file");
        }
        if runs.is_empty() {
            println!("no stored runs for project {}", self.project_id);
            return Ok(ExitCode::SUCCESS);
        }
        for run in runs {
            println!(
                "{}  {}  {:<11}  {}  ({}/{} specs completed)",
                run.started_at.format("%Y-%m-%d %H:%M:%S"),
                run.run_id,
                run.status.as_str(),
                run.dag_id,
                run.count_status(specflow_core::state::SpecStatus::Completed),
                run.specs.len(),
            );
        }
        Ok(ExitCode::SUCCESS)
    }

    async fn merge(&self, workflow_path: &Path, options: MergeOptions) -> AppResult<ExitCode> {
        let parsed = match self.load_workflow(workflow_path)? {
            Ok(parsed) => parsed,
            Err(code) => return Ok(code),
        };
        let workflow_key = workflow_path.to_string_lossy().to_string();
        let Some(mut run) = self.store.load_by_workflow_path(&workflow_key)? else {
            eprintln!("no saved state for {}", workflow_path.display());
            return Ok(ExitCode::from(EXIT_FAILURE));
        };

        let agent = Arc::new(CommandAgent::from_config(self.config.agent_cmd.as_deref()));
        let engine = MergeEngine::new(
            self.git.clone(),
            agent,
            Arc::clone(&self.store),
            self.config.clone(),
            self.repo_root.clone(),
            SharedSink::clone(&self.term),
        );

        let cancel = CancellationToken::new();
        match engine
            .merge_run(&cancel, &parsed.workflow, &mut run, &options)
            .await
        {
            Ok(report) => {
                println!(
                    "merge finished: {} merged, {} skipped, {} failed",
                    report.merged.len(),
                    report.skipped.len(),
                    report.failed.len()
                );
                let code = if report.failed.is_empty() {
                    ExitCode::SUCCESS
                } else {
                    ExitCode::from(EXIT_FAILURE)
                };
                Ok(code)
            }
            Err(err) => {
                eprintln!("merge stopped: {err}");
                Ok(ExitCode::from(EXIT_FAILURE))
            }
        }
    }

    async fn cleanup(&self, workflow_path: &Path, force: bool, all_runs: bool) -> AppResult<ExitCode> {
        let provider = GitWorktreeProvider::new(
            self.repo_root.clone(),
            self.config.worktree.clone(),
            Arc::clone(&self.runner),
        );
        let cancel = CancellationToken::new();

        let mut targets: Vec<DagRun> = if all_runs {
            let (runs, errors) = self.store.list();
            for error in &errors {
                tracing::warn!(%error, "unreadable state file");
            }
            runs
        } else {
            let workflow_key = workflow_path.to_string_lossy().to_string();
            match self.store.load_by_workflow_path(&workflow_key)? {
                Some(run) => vec![run],
                None => {
                    eprintln!("no saved state for {}", workflow_path.display());
                    return Ok(ExitCode::from(EXIT_FAILURE));
                }
            }
        };

        let mut had_errors = false;
        for run in &mut targets {
            let report = cleanup_run(&cancel, run, &provider, force).await;
            self.store.save(run)?;
            println!(
                "run {}: cleaned {}, kept {}, errors {}",
                run.run_id,
                report.cleaned.len(),
                report.kept.len(),
                report.errors.len()
            );
            for kept in &report.kept {
                println!("  kept {} ({})", kept.spec_id, kept.reason);
            }
            for error in &report.errors {
                eprintln!("  error: {error}");
                had_errors = true;
            }
        }
        let code = if had_errors {
            ExitCode::from(EXIT_FAILURE)
        } else {
            ExitCode::SUCCESS
        };
        Ok(code)
    }
}

fn print_run_summary(run: &DagRun, status: RunStatus) {
    use specflow_core::state::SpecStatus;

    println!("\nrun {} finished: {}", run.run_id, status.as_str());
    println!(
        "  {} completed, {} failed, {} blocked, {} pending",
        run.count_status(SpecStatus::Completed),
        run.count_status(SpecStatus::Failed),
        run.count_status(SpecStatus::Blocked),
        run.count_status(SpecStatus::Pending),
    );
    for spec in run.specs.values() {
        if let Some(reason) = &spec.failure_reason {
            println!("  {}: {}", spec.spec_id, reason);
        }
    }
}
