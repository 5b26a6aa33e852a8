//! End-to-end pipeline scenarios against real git repositories.
//!
//! The external agent is replaced with scripted stand-ins: shell one-liners
//! that commit like a well-behaved agent, plus custom implementations that
//! count concurrency or fail on demand.

use async_trait::async_trait;
use specflow::agent::{Agent, CommandAgent};
use specflow::commit::{CommitConfig, CommitVerifier};
use specflow::executor::{lock_run, SharedRun, SpecExecutor};
use specflow::git::GitTool;
use specflow::locks::LockManager;
use specflow::merge::{MergeEngine, MergeError, MergeOptions};
use specflow::output::{shared_sink, OutputHandle, SharedSink, SystemClock};
use specflow::runner::{CommandRunner, SubprocessRunner};
use specflow::scheduler::{Scheduler, SchedulerOptions};
use specflow::store::StateStore;
use specflow::worktree::{GitWorktreeProvider, WorktreeProvider};
use specflow_core::config::{ConflictStrategy, FlowConfig};
use specflow_core::ident::{branch_collision_suffix, resolve_dag_id, spec_log_path};
use specflow_core::state::{
    CommitStatus, DagRun, MergeStatus, ResolutionMethod, RunStatus, SpecStatus,
};
use specflow_core::workflow::{parse_str, Workflow};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn run_cmd(dir: &Path, cmd: &str, arguments: &[&str]) {
    let out = Command::new(cmd)
        .args(arguments)
        .current_dir(dir)
        .output()
        .unwrap();
    assert!(
        out.status.success(),
        "{cmd} {arguments:?} failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
}

fn git_stdout(dir: &Path, arguments: &[&str]) -> String {
    let out = Command::new("git")
        .args(arguments)
        .current_dir(dir)
        .output()
        .unwrap();
    assert!(
        out.status.success(),
        "git {arguments:?} failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).to_string()
}

struct BufSink(Arc<Mutex<Vec<u8>>>);

impl Write for BufSink {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

struct Harness {
    _temp: TempDir,
    repo: PathBuf,
    workflow_path: PathBuf,
    workflow: Workflow,
    config: FlowConfig,
    store: Arc<StateStore>,
    locks: Arc<LockManager>,
    term: SharedSink,
    term_buf: Arc<Mutex<Vec<u8>>>,
    log_base: PathBuf,
}

impl Harness {
    fn new(workflow_yaml: &str) -> Self {
        let temp = TempDir::new().unwrap();
        let repo = temp.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        run_cmd(&repo, "git", &["init", "-b", "main"]);
        run_cmd(&repo, "git", &["config", "user.email", "t@t.com"]);
        run_cmd(&repo, "git", &["config", "user.name", "T"]);
        std::fs::write(repo.join("README.md"), "# T\n").unwrap();
        run_cmd(&repo, "git", &["add", "."]);
        run_cmd(&repo, "git", &["commit", "-m", "initial"]);

        let workflow_path = temp.path().join("workflow.yaml");
        std::fs::write(&workflow_path, workflow_yaml).unwrap();
        let workflow = parse_str(workflow_yaml).unwrap().workflow;

        let mut config = FlowConfig::default();
        config.specs_dir = repo.join("specs");
        config.worktree.base_dir = Some(temp.path().join("worktrees"));
        for feature in workflow.features() {
            std::fs::create_dir_all(config.specs_dir.join(&feature.id)).unwrap();
        }

        let store = Arc::new(StateStore::open(temp.path().join("state")).unwrap());
        let locks = Arc::new(LockManager::new(store.dir().to_path_buf()));
        let term_buf = Arc::new(Mutex::new(Vec::new()));
        let term = shared_sink(BufSink(Arc::clone(&term_buf)));
        let log_base = temp.path().join("logs");

        Self {
            _temp: temp,
            repo,
            workflow_path,
            workflow,
            config,
            store,
            locks,
            term,
            term_buf,
            log_base,
        }
    }

    fn dag_id(&self) -> String {
        resolve_dag_id(
            self.workflow.dag.id.as_deref(),
            &self.workflow.dag.name,
            &self.workflow_path,
        )
    }

    fn new_run(&self, max_parallel: usize) -> SharedRun {
        let run = DagRun::new(
            self.workflow_path.to_string_lossy().as_ref(),
            &self.dag_id(),
            "proj",
            max_parallel,
            self.log_base.clone(),
        );
        Arc::new(Mutex::new(run))
    }

    fn provider(&self) -> Arc<dyn WorktreeProvider> {
        Arc::new(GitWorktreeProvider::new(
            self.repo.clone(),
            self.config.worktree.clone(),
            Arc::new(SubprocessRunner),
        ))
    }

    fn scheduler(
        &self,
        agent: Arc<dyn Agent>,
        options: SchedulerOptions,
        force_recreate: bool,
    ) -> Scheduler {
        let runner: Arc<dyn CommandRunner> = Arc::new(SubprocessRunner);
        let verifier = CommitVerifier::new(
            Arc::clone(&runner),
            Arc::clone(&agent),
            CommitConfig::from_flow(&self.config),
        );
        let executor = Arc::new(SpecExecutor::new(
            agent,
            self.provider(),
            Arc::clone(&self.store),
            Arc::clone(&self.locks),
            verifier,
            Arc::new(SystemClock),
            SharedSink::clone(&self.term),
            self.config.clone(),
            self.workflow_path.clone(),
            force_recreate,
        ));
        Scheduler::new(
            executor,
            Arc::clone(&self.store),
            Arc::clone(&self.locks),
            SharedSink::clone(&self.term),
            options,
        )
    }

    fn merge_engine(&self, agent: Arc<dyn Agent>) -> MergeEngine {
        MergeEngine::new(
            GitTool::new(Arc::new(SubprocessRunner)),
            agent,
            Arc::clone(&self.store),
            self.config.clone(),
            self.repo.clone(),
            SharedSink::clone(&self.term),
        )
    }

    fn term_text(&self) -> String {
        String::from_utf8(self.term_buf.lock().unwrap().clone()).unwrap()
    }
}

/// Agent that derives the spec id from its branch, writes a file named
/// after it, and commits: the well-behaved case.
fn committing_agent() -> Arc<dyn Agent> {
    Arc::new(CommandAgent::new(
        "sh",
        vec![
            "-c".to_string(),
            "id=$(basename \"$(git branch --show-current)\"); \
             echo working on $id; \
             echo $id > \"$id.txt\"; \
             git add -A && git commit -q -m \"implement $id\""
                .to_string(),
        ],
    ))
}

/// Agent writing the same file on every branch, for conflict scenarios.
fn conflicting_agent() -> Arc<dyn Agent> {
    Arc::new(CommandAgent::new(
        "sh",
        vec![
            "-c".to_string(),
            "id=$(basename \"$(git branch --show-current)\"); \
             echo $id > shared.txt; \
             git add -A && git commit -q -m \"implement $id\""
                .to_string(),
        ],
    ))
}

fn spec_id_from_prompt(prompt: &str) -> String {
    let start = prompt.find('\'').unwrap() + 1;
    let end = prompt[start..].find('\'').unwrap() + start;
    prompt[start..end].to_string()
}

fn commit_all(dir: &Path, message: &str) {
    run_cmd(dir, "git", &["add", "-A"]);
    run_cmd(dir, "git", &["commit", "-q", "-m", message]);
}

/// Agent tracking concurrency and event order; commits like the script.
struct CountingAgent {
    current: AtomicUsize,
    max_seen: AtomicUsize,
    events: Mutex<Vec<String>>,
}

impl CountingAgent {
    fn new() -> Self {
        Self {
            current: AtomicUsize::new(0),
            max_seen: AtomicUsize::new(0),
            events: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Agent for CountingAgent {
    async fn run(
        &self,
        _cancel: &CancellationToken,
        prompt: &str,
        dir: &Path,
        _autonomous: bool,
        _output: OutputHandle,
    ) -> specflow::agent::Result<i32> {
        let spec_id = spec_id_from_prompt(prompt);
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);
        self.events.lock().unwrap().push(format!("start {spec_id}"));

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        std::fs::write(dir.join(format!("{spec_id}.txt")), &spec_id).unwrap();
        commit_all(dir, &format!("implement {spec_id}"));

        self.events.lock().unwrap().push(format!("end {spec_id}"));
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(0)
    }
}

/// Agent failing for a configurable set of spec ids.
struct SelectiveAgent {
    fail_ids: Mutex<Vec<String>>,
}

impl SelectiveAgent {
    fn failing(ids: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            fail_ids: Mutex::new(ids.iter().map(ToString::to_string).collect()),
        })
    }

    fn set_failing(&self, ids: &[&str]) {
        *self.fail_ids.lock().unwrap() = ids.iter().map(ToString::to_string).collect();
    }
}

#[async_trait]
impl Agent for SelectiveAgent {
    async fn run(
        &self,
        _cancel: &CancellationToken,
        prompt: &str,
        dir: &Path,
        _autonomous: bool,
        _output: OutputHandle,
    ) -> specflow::agent::Result<i32> {
        let spec_id = spec_id_from_prompt(prompt);
        if self.fail_ids.lock().unwrap().contains(&spec_id) {
            return Ok(1);
        }
        std::fs::write(dir.join(format!("{spec_id}.txt")), &spec_id).unwrap();
        commit_all(dir, &format!("implement {spec_id}"));
        Ok(0)
    }
}

const SINGLE_SPEC: &str = r#"schema_version: "1.0"
dag:
  name: X
layers:
  - id: L0
    features:
      - id: f
        description: single feature
"#;

const DIAMOND: &str = r#"schema_version: "1.0"
dag:
  name: Diamond
layers:
  - id: L0
    features:
      - id: a
        description: A
      - id: b
        description: B
      - id: c
        description: C
        depends_on: [a, b]
"#;

const PAIR: &str = r#"schema_version: "1.0"
dag:
  name: Pair
layers:
  - id: L0
    features:
      - id: alpha
        description: first
      - id: beta
        description: second
"#;

// Spec ids chosen so the feature-level topological order (lexicographic:
// b, c, d) interleaves the two layers.
const STAGED: &str = r#"schema_version: "1.0"
dag:
  name: Staged
layers:
  - id: L0
    features:
      - id: b
        description: B
      - id: d
        description: D
  - id: L1
    depends_on: [L0]
    features:
      - id: c
        description: C
"#;

#[tokio::test]
async fn single_spec_happy_path() {
    let harness = Harness::new(SINGLE_SPEC);
    let scheduler = harness.scheduler(
        committing_agent(),
        SchedulerOptions::default(),
        false,
    );
    let run = harness.new_run(4);
    let cancel = CancellationToken::new();

    let status = scheduler
        .run(&cancel, &harness.workflow, &run)
        .await
        .unwrap();
    assert_eq!(status, RunStatus::Completed);

    let guard = lock_run(&run);
    let spec = guard.spec("f").unwrap();
    assert_eq!(spec.status, SpecStatus::Completed);
    assert_eq!(spec.commit_status, CommitStatus::Committed);
    assert_eq!(spec.commit_sha.as_ref().unwrap().len(), 40);
    assert_eq!(spec.branch.as_deref(), Some("dag/x/f"));
    assert_eq!(spec.exit_code, Some(0));
    assert!(spec.failure_reason.is_none());

    // The log file exists, is non-empty, and is timestamped.
    let log = spec_log_path(&harness.log_base, "f");
    let text = std::fs::read_to_string(&log).unwrap();
    assert!(text.contains("working on f"), "{text}");
    assert!(text.starts_with('['));

    // Terminal output carries the spec prefix.
    drop(guard);
    assert!(harness.term_text().contains("[f] working on f"));

    // Durable state is loadable by workflow path.
    let stored = harness
        .store
        .load_by_workflow_path(harness.workflow_path.to_string_lossy().as_ref())
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, RunStatus::Completed);
}

#[tokio::test]
async fn dependency_ordering_with_parallel_cap() {
    let harness = Harness::new(DIAMOND);
    let agent = Arc::new(CountingAgent::new());
    let scheduler = harness.scheduler(
        Arc::clone(&agent) as Arc<dyn Agent>,
        SchedulerOptions::default(),
        false,
    );
    let run = harness.new_run(2);
    let cancel = CancellationToken::new();

    let status = scheduler
        .run(&cancel, &harness.workflow, &run)
        .await
        .unwrap();
    assert_eq!(status, RunStatus::Completed);

    let guard = lock_run(&run);
    for id in ["a", "b", "c"] {
        assert_eq!(guard.spec(id).unwrap().status, SpecStatus::Completed, "{id}");
    }

    // Never more than two agents at once.
    assert!(agent.max_seen.load(Ordering::SeqCst) <= 2);

    // c starts only after both a and b ended.
    let events = agent.events.lock().unwrap().clone();
    let index = |needle: &str| events.iter().position(|e| e == needle).unwrap();
    assert!(index("start c") > index("end a"));
    assert!(index("start c") > index("end b"));
}

#[tokio::test]
async fn failed_dependency_blocks_dependents() {
    let harness = Harness::new(DIAMOND);
    let agent = SelectiveAgent::failing(&["a"]);
    let scheduler = harness.scheduler(
        Arc::clone(&agent) as Arc<dyn Agent>,
        SchedulerOptions::default(),
        false,
    );
    let run = harness.new_run(2);
    let cancel = CancellationToken::new();

    let status = scheduler
        .run(&cancel, &harness.workflow, &run)
        .await
        .unwrap();
    assert_eq!(status, RunStatus::Failed);

    let guard = lock_run(&run);
    let a = guard.spec("a").unwrap();
    assert_eq!(a.status, SpecStatus::Failed);
    assert_eq!(a.failure_reason.as_deref(), Some("[agent] agent exited with status 1"));
    assert_eq!(guard.spec("b").unwrap().status, SpecStatus::Completed);
    let c = guard.spec("c").unwrap();
    assert_eq!(c.status, SpecStatus::Blocked);
    assert_eq!(c.blocked_by, vec!["a"]);

    // The failure summary offers resume commands.
    drop(guard);
    let text = harness.term_text();
    assert!(text.contains("failed at stage [agent]"), "{text}");
    assert!(text.contains("specflow resume"));
    assert!(text.contains("--force-recreate"));
}

#[tokio::test]
async fn resume_skips_completed_and_reruns_failed() {
    let harness = Harness::new(DIAMOND);
    let agent = SelectiveAgent::failing(&["b"]);

    let scheduler = harness.scheduler(
        Arc::clone(&agent) as Arc<dyn Agent>,
        SchedulerOptions::default(),
        false,
    );
    let run = harness.new_run(2);
    let cancel = CancellationToken::new();
    let status = scheduler
        .run(&cancel, &harness.workflow, &run)
        .await
        .unwrap();
    assert_eq!(status, RunStatus::Failed);

    // Simulate a resume: reload state from disk, clear the failure, and
    // rerun with the worktree recreated.
    agent.set_failing(&[]);
    let mut stored = harness
        .store
        .load_by_workflow_path(harness.workflow_path.to_string_lossy().as_ref())
        .unwrap()
        .unwrap();
    let a_completed_at = stored.spec("a").unwrap().completed_at;
    stored.spec_mut("b").unwrap().status = SpecStatus::Pending;
    stored.spec_mut("c").unwrap().status = SpecStatus::Pending;

    let resumed: SharedRun = Arc::new(Mutex::new(stored));
    let scheduler = harness.scheduler(
        Arc::clone(&agent) as Arc<dyn Agent>,
        SchedulerOptions::default(),
        true,
    );
    let status = scheduler
        .run(&cancel, &harness.workflow, &resumed)
        .await
        .unwrap();
    assert_eq!(status, RunStatus::Completed);

    let guard = lock_run(&resumed);
    // a was not re-executed: its completion timestamp is untouched.
    assert_eq!(guard.spec("a").unwrap().completed_at, a_completed_at);
    assert_eq!(guard.spec("b").unwrap().status, SpecStatus::Completed);
    assert_eq!(guard.spec("c").unwrap().status, SpecStatus::Completed);
}

#[tokio::test]
async fn branch_collision_gets_hash_suffix() {
    let harness = Harness::new(SINGLE_SPEC);
    // A branch with this spec's deterministic name already exists,
    // created by some other DAG.
    run_cmd(&harness.repo, "git", &["branch", "dag/x/f", "main"]);

    let scheduler = harness.scheduler(
        committing_agent(),
        SchedulerOptions::default(),
        false,
    );
    let run = harness.new_run(1);
    let cancel = CancellationToken::new();
    let status = scheduler
        .run(&cancel, &harness.workflow, &run)
        .await
        .unwrap();
    assert_eq!(status, RunStatus::Completed);

    let expected = format!(
        "dag/x/f-{}",
        branch_collision_suffix(&harness.workflow_path)
    );
    let guard = lock_run(&run);
    assert_eq!(guard.spec("f").unwrap().branch.as_deref(), Some(expected.as_str()));

    // Persisted for resume.
    let stored = harness
        .store
        .load_by_workflow_path(harness.workflow_path.to_string_lossy().as_ref())
        .unwrap()
        .unwrap();
    assert_eq!(stored.spec("f").unwrap().branch.as_deref(), Some(expected.as_str()));
}

#[tokio::test]
async fn merge_applies_completed_specs_in_order() {
    let harness = Harness::new(PAIR);
    let scheduler = harness.scheduler(
        committing_agent(),
        SchedulerOptions::default(),
        false,
    );
    let run = harness.new_run(2);
    let cancel = CancellationToken::new();
    let status = scheduler
        .run(&cancel, &harness.workflow, &run)
        .await
        .unwrap();
    assert_eq!(status, RunStatus::Completed);

    let mut state = lock_run(&run).clone();
    let engine = harness.merge_engine(committing_agent());
    let report = engine
        .merge_run(&cancel, &harness.workflow, &mut state, &MergeOptions::default())
        .await
        .unwrap();

    assert_eq!(report.merged, vec!["alpha", "beta"]);
    assert!(report.failed.is_empty());
    assert!(harness.repo.join("alpha.txt").exists());
    assert!(harness.repo.join("beta.txt").exists());
    for id in ["alpha", "beta"] {
        let merge = state.spec(id).unwrap().merge.as_ref().unwrap();
        assert_eq!(merge.status, MergeStatus::Merged);
        assert_eq!(merge.resolution_method, ResolutionMethod::None);
        assert!(merge.merged_at.is_some());
    }

    // Re-running in continue mode skips everything.
    let report = engine
        .merge_run(
            &cancel,
            &harness.workflow,
            &mut state,
            &MergeOptions {
                continue_run: true,
                ..MergeOptions::default()
            },
        )
        .await
        .unwrap();
    assert!(report.merged.is_empty());
    assert_eq!(report.skipped.len(), 2);
}

#[tokio::test]
async fn conflicting_merge_pauses_with_manual_guidance() {
    let harness = Harness::new(PAIR);
    let scheduler = harness.scheduler(
        conflicting_agent(),
        SchedulerOptions::default(),
        false,
    );
    let run = harness.new_run(2);
    let cancel = CancellationToken::new();
    scheduler
        .run(&cancel, &harness.workflow, &run)
        .await
        .unwrap();

    let mut state = lock_run(&run).clone();
    let engine = harness.merge_engine(conflicting_agent());
    let err = engine
        .merge_run(&cancel, &harness.workflow, &mut state, &MergeOptions::default())
        .await
        .unwrap_err();

    match err {
        MergeError::Paused { spec_id, conflicts } => {
            assert_eq!(spec_id, "beta");
            assert_eq!(conflicts, vec!["shared.txt"]);
        }
        other => panic!("unexpected error: {other}"),
    }

    let merge = state.spec("beta").unwrap().merge.as_ref().unwrap();
    assert_eq!(merge.status, MergeStatus::MergeFailed);
    assert_eq!(merge.conflicts, vec!["shared.txt"]);
    assert_eq!(merge.resolution_method, ResolutionMethod::Manual);

    let text = harness.term_text();
    assert!(text.contains("MERGE CONFLICT"), "{text}");
    assert!(text.contains("shared.txt"));
    assert!(text.contains("--continue"));
}

#[tokio::test]
async fn staging_merges_whole_layers_and_promotes_in_order() {
    let mut harness = Harness::new(STAGED);
    harness.config.use_staging = true;

    let scheduler = harness.scheduler(
        committing_agent(),
        SchedulerOptions::default(),
        false,
    );
    let run = harness.new_run(2);
    let cancel = CancellationToken::new();
    let status = scheduler
        .run(&cancel, &harness.workflow, &run)
        .await
        .unwrap();
    assert_eq!(status, RunStatus::Completed);

    let mut state = lock_run(&run).clone();
    let engine = harness.merge_engine(committing_agent());
    let report = engine
        .merge_run(&cancel, &harness.workflow, &mut state, &MergeOptions::default())
        .await
        .unwrap();

    // All of L0 merges before any of L1, even though the feature-level
    // order interleaves them (b, c, d).
    assert_eq!(report.merged, vec!["b", "d", "c"]);
    assert!(report.failed.is_empty());
    for id in ["b", "d", "c"] {
        assert_eq!(
            state.spec(id).unwrap().merge.as_ref().unwrap().status,
            MergeStatus::Merged,
            "{id}"
        );
    }
    assert!(harness.repo.join("b.txt").exists());
    assert!(harness.repo.join("c.txt").exists());
    assert!(harness.repo.join("d.txt").exists());

    // One staging record per layer, each with the layer's full spec list.
    let staging = state.staging.as_ref().unwrap();
    assert_eq!(staging.keys().collect::<Vec<_>>(), vec!["L0", "L1"]);
    let l0 = &staging["L0"];
    assert_eq!(l0.branch, "dag/staged/stage-L0");
    assert_eq!(l0.merged_specs, vec!["b", "d"]);
    let l1 = &staging["L1"];
    assert_eq!(l1.branch, "dag/staged/stage-L1");
    assert_eq!(l1.merged_specs, vec!["c"]);

    // L0 was promoted before L1's staging branch was cut: the L1 stage
    // contains L0's files.
    let l1_tree = git_stdout(
        &harness.repo,
        &["ls-tree", "--name-only", "dag/staged/stage-L1"],
    );
    assert!(l1_tree.contains("b.txt"), "{l1_tree}");
    assert!(l1_tree.contains("d.txt"), "{l1_tree}");
    assert!(l1_tree.contains("c.txt"), "{l1_tree}");
}

/// Resolution agent that rewrites the conflicted file named in the
/// prompt and leaves no markers behind.
struct ResolvingAgent;

#[async_trait]
impl Agent for ResolvingAgent {
    async fn run(
        &self,
        _cancel: &CancellationToken,
        prompt: &str,
        dir: &Path,
        _autonomous: bool,
        _output: OutputHandle,
    ) -> specflow::agent::Result<i32> {
        let start = prompt.find('`').unwrap() + 1;
        let end = prompt[start..].find('`').unwrap() + start;
        let file = &prompt[start..end];
        std::fs::write(dir.join(file), "resolved\n").unwrap();
        Ok(0)
    }
}

#[tokio::test]
async fn agent_strategy_resolves_conflicts() {
    let mut harness = Harness::new(PAIR);
    harness.config.on_conflict = ConflictStrategy::Agent;

    let scheduler = harness.scheduler(
        conflicting_agent(),
        SchedulerOptions::default(),
        false,
    );
    let run = harness.new_run(2);
    let cancel = CancellationToken::new();
    scheduler
        .run(&cancel, &harness.workflow, &run)
        .await
        .unwrap();

    let mut state = lock_run(&run).clone();
    let engine = harness.merge_engine(Arc::new(ResolvingAgent));
    let report = engine
        .merge_run(&cancel, &harness.workflow, &mut state, &MergeOptions::default())
        .await
        .unwrap();

    assert_eq!(report.merged, vec!["alpha", "beta"]);
    let merge = state.spec("beta").unwrap().merge.as_ref().unwrap();
    assert_eq!(merge.status, MergeStatus::Merged);
    assert_eq!(merge.resolution_method, ResolutionMethod::Agent);
    assert_eq!(merge.conflicts, vec!["shared.txt"]);

    let text = std::fs::read_to_string(harness.repo.join("shared.txt")).unwrap();
    assert_eq!(text, "resolved\n");
}
