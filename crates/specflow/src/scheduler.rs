//! DAG scheduling: sequential and dependency-aware parallel dispatch.
//!
//! Both modes share the same state model. Sequential mode walks layers in
//! stable topological order and runs each layer's specs in declaration
//! order. Parallel mode runs a single cooperative loop: compute the ready
//! set, dispatch up to the concurrency ceiling, then block on the
//! completion channel (or cancellation) and rescan. Specs that can no
//! longer run because a dependency failed are marked blocked.

use crate::executor::{lock_run, ExecutorError, SharedRun, SpecExecutor};
use crate::locks::{LockError, LockManager};
use crate::output::SharedSink;
use crate::store::StateStore;
use specflow_core::graph::{layer_order, GraphError};
use specflow_core::state::{DagRun, RunStatus, SpecState, SpecStatus};
use specflow_core::workflow::{Feature, Workflow};
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Graph(#[from] GraphError),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

type DepsMap = BTreeMap<String, Vec<String>>;

/// Atomically updated scheduling snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub total: usize,
    pub completed: usize,
    pub running: usize,
    pub failed: usize,
    pub blocked: usize,
    pub pending: usize,
}

impl Progress {
    pub fn from_run(run: &DagRun) -> Self {
        Self {
            total: run.specs.len(),
            completed: run.count_status(SpecStatus::Completed),
            running: run.count_status(SpecStatus::Running),
            failed: run.count_status(SpecStatus::Failed),
            blocked: run.count_status(SpecStatus::Blocked),
            pending: run.count_status(SpecStatus::Pending),
        }
    }

    pub fn one_line(&self) -> String {
        format!(
            "progress: {}/{} completed | {} running | {} pending | {} failed | {} blocked",
            self.completed, self.total, self.running, self.pending, self.failed, self.blocked
        )
    }
}

/// Observer invoked on every progress transition.
pub type ProgressObserver = Box<dyn Fn(&Progress) + Send + Sync>;

/// Read/write-locked progress snapshot with registered observers.
#[derive(Default)]
pub struct ProgressTracker {
    snapshot: RwLock<Progress>,
    observers: Mutex<Vec<ProgressObserver>>,
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("snapshot", &self.snapshot())
            .finish_non_exhaustive()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Progress {
        self.snapshot.read().map(|p| *p).unwrap_or_default()
    }

    pub fn register(&self, observer: ProgressObserver) {
        if let Ok(mut observers) = self.observers.lock() {
            observers.push(observer);
        }
    }

    fn update(&self, progress: Progress) {
        if let Ok(mut snapshot) = self.snapshot.write() {
            *snapshot = progress;
        }
        if let Ok(observers) = self.observers.lock() {
            for observer in observers.iter() {
                observer(&progress);
            }
        }
    }
}

/// Scheduling options beyond what the run record carries.
#[derive(Debug, Clone, Default)]
pub struct SchedulerOptions {
    pub sequential: bool,
    pub fail_fast: bool,
    /// Optional allow-list of spec ids to execute.
    pub only: Option<BTreeSet<String>>,
}

/// Drives a run to a terminal status.
pub struct Scheduler {
    executor: Arc<SpecExecutor>,
    store: Arc<StateStore>,
    locks: Arc<LockManager>,
    progress: Arc<ProgressTracker>,
    term: SharedSink,
    options: SchedulerOptions,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn new(
        executor: Arc<SpecExecutor>,
        store: Arc<StateStore>,
        locks: Arc<LockManager>,
        term: SharedSink,
        options: SchedulerOptions,
    ) -> Self {
        Self {
            executor,
            store,
            locks,
            progress: Arc::new(ProgressTracker::new()),
            term,
            options,
        }
    }

    pub fn progress(&self) -> Arc<ProgressTracker> {
        Arc::clone(&self.progress)
    }

    /// Execute the workflow, honouring dependencies, and return the
    /// terminal run status.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        workflow: &Workflow,
        run: &SharedRun,
    ) -> Result<RunStatus> {
        let deps = dependency_map(workflow);
        let features: BTreeMap<String, Feature> = workflow
            .features()
            .map(|f| (f.id.clone(), f.clone()))
            .collect();

        let (run_id, spec_ids) = {
            let mut guard = lock_run(run);
            init_specs(workflow, &mut guard);
            guard.status = RunStatus::Running;
            guard.completed_at = None;
            let ids: Vec<String> = guard.specs.keys().cloned().collect();
            (guard.run_id.clone(), ids)
        };
        self.persist(run);

        let run_lock = self.locks.acquire_run_lock(&run_id, &spec_ids)?;

        let status = if self.options.sequential {
            self.run_sequential(cancel, workflow, run, &deps, &features)
                .await?
        } else {
            self.run_parallel(cancel, run, &deps, &features).await?
        };

        {
            let mut guard = lock_run(run);
            guard.status = status;
            guard.running_count = 0;
            guard.completed_at = Some(Utc::now());
        }
        self.persist(run);
        self.publish_progress(run);
        run_lock.release();
        Ok(status)
    }

    /// Dependency-aware parallel dispatch with bounded concurrency.
    async fn run_parallel(
        &self,
        cancel: &CancellationToken,
        run: &SharedRun,
        deps: &DepsMap,
        features: &BTreeMap<String, Feature>,
    ) -> Result<RunStatus> {
        let max_parallel = lock_run(run).max_parallel.max(1);
        let (tx, mut rx) = mpsc::channel::<(String, std::result::Result<(), ExecutorError>)>(
            features.len().max(1),
        );
        let work_cancel = cancel.child_token();
        let mut outstanding = 0usize;

        loop {
            let (ready, pending) = {
                let guard = lock_run(run);
                (
                    self.ready_specs(&guard, deps),
                    self.pending_count(&guard),
                )
            };

            if pending == 0 && outstanding == 0 {
                break;
            }
            if work_cancel.is_cancelled() && outstanding == 0 {
                // Fail-fast tripped; remaining pending specs stay pending.
                break;
            }
            if ready.is_empty() && outstanding == 0 {
                // Nothing can ever become ready again.
                {
                    let mut guard = lock_run(run);
                    mark_blocked(&mut guard, deps);
                }
                self.persist(run);
                self.publish_progress(run);
                break;
            }

            if !work_cancel.is_cancelled() {
                let slots = max_parallel.saturating_sub(outstanding);
                for spec_id in ready.into_iter().take(slots) {
                    let Some(feature) = features.get(&spec_id) else {
                        continue;
                    };
                    {
                        let mut guard = lock_run(run);
                        if let Some(spec) = guard.spec_mut(&spec_id) {
                            spec.status = SpecStatus::Running;
                            spec.blocked_by.clear();
                        }
                        guard.running_count += 1;
                    }
                    outstanding += 1;

                    let executor = Arc::clone(&self.executor);
                    let task_run = SharedRun::clone(run);
                    let task_cancel = work_cancel.clone();
                    let task_tx = tx.clone();
                    let task_feature = feature.clone();
                    tokio::spawn(async move {
                        let result = executor
                            .execute(&task_cancel, &task_run, &task_feature)
                            .await;
                        let _ = task_tx.send((task_feature.id.clone(), result)).await;
                    });
                }
            }
            self.persist(run);
            self.publish_progress(run);

            tokio::select! {
                received = rx.recv() => {
                    let Some((spec_id, result)) = received else { break };
                    outstanding -= 1;
                    {
                        let mut guard = lock_run(run);
                        guard.running_count = guard.running_count.saturating_sub(1);
                    }
                    match result {
                        Ok(()) => tracing::info!(spec_id, "spec finished"),
                        Err(err) if err.is_cancelled() => {
                            tracing::info!(spec_id, "spec cancelled");
                        }
                        Err(err) => {
                            tracing::warn!(spec_id, %err, "spec failed");
                            if self.options.fail_fast {
                                work_cancel.cancel();
                            }
                        }
                    }
                    self.publish_progress(run);
                }
                () = cancel.cancelled() => {
                    work_cancel.cancel();
                    while outstanding > 0 {
                        if rx.recv().await.is_some() {
                            outstanding -= 1;
                        } else {
                            break;
                        }
                    }
                    self.publish_progress(run);
                    return Ok(RunStatus::Interrupted);
                }
            }
        }

        Ok(self.terminal_status(run))
    }

    /// Sequential mode: topologically ordered layers, declaration order
    /// within each layer, one spec at a time.
    async fn run_sequential(
        &self,
        cancel: &CancellationToken,
        workflow: &Workflow,
        run: &SharedRun,
        deps: &DepsMap,
        features: &BTreeMap<String, Feature>,
    ) -> Result<RunStatus> {
        let order = layer_order(workflow)?;

        for layer_id in order {
            let Some(layer) = workflow.layers.iter().find(|l| l.id == layer_id) else {
                continue;
            };
            for feature in &layer.features {
                if !self.eligible(&feature.id) {
                    continue;
                }
                if cancel.is_cancelled() {
                    return Ok(RunStatus::Interrupted);
                }
                let status = lock_run(run).spec(&feature.id).map(|s| s.status);
                if status == Some(SpecStatus::Completed) {
                    continue;
                }

                // Every predecessor must already be completed.
                let unmet = unmet_deps(&lock_run(run), deps, &feature.id);
                if !unmet.is_empty() {
                    let mut guard = lock_run(run);
                    if let Some(spec) = guard.spec_mut(&feature.id) {
                        spec.status = SpecStatus::Blocked;
                        spec.blocked_by = unmet;
                    }
                    drop(guard);
                    self.persist(run);
                    self.publish_progress(run);
                    continue;
                }

                let Some(feature) = features.get(&feature.id) else {
                    continue;
                };
                let result = self.executor.execute(cancel, run, feature).await;
                self.publish_progress(run);
                match result {
                    Ok(()) => {}
                    Err(err) if err.is_cancelled() => return Ok(RunStatus::Interrupted),
                    Err(err) => {
                        tracing::warn!(spec_id = %feature.id, %err, "spec failed");
                        if self.options.fail_fast {
                            return Ok(self.terminal_status(run));
                        }
                    }
                }
            }
        }

        {
            let mut guard = lock_run(run);
            mark_blocked(&mut guard, deps);
        }
        self.persist(run);
        Ok(self.terminal_status(run))
    }

    fn eligible(&self, spec_id: &str) -> bool {
        self.options
            .only
            .as_ref()
            .map_or(true, |only| only.contains(spec_id))
    }

    fn ready_specs(&self, run: &DagRun, deps: &DepsMap) -> Vec<String> {
        run.specs
            .values()
            .filter(|spec| spec.status == SpecStatus::Pending && self.eligible(&spec.spec_id))
            .filter(|spec| {
                let spec_deps = deps.get(&spec.spec_id).map_or(&[][..], Vec::as_slice);
                spec_deps.iter().all(|dep| {
                    run.spec(dep).map(|d| d.status) == Some(SpecStatus::Completed)
                })
            })
            .map(|spec| spec.spec_id.clone())
            .collect()
    }

    fn pending_count(&self, run: &DagRun) -> usize {
        run.specs
            .values()
            .filter(|s| s.status == SpecStatus::Pending && self.eligible(&s.spec_id))
            .count()
    }

    fn terminal_status(&self, run: &SharedRun) -> RunStatus {
        let guard = lock_run(run);
        let any_bad = guard
            .specs
            .values()
            .any(|s| matches!(s.status, SpecStatus::Failed | SpecStatus::Blocked));
        if any_bad {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        }
    }

    fn persist(&self, run: &SharedRun) {
        let snapshot = lock_run(run).clone();
        if let Err(err) = self.store.save(&snapshot) {
            tracing::error!(%err, "failed to persist run state");
        }
    }

    fn publish_progress(&self, run: &SharedRun) {
        let progress = Progress::from_run(&lock_run(run));
        self.progress.update(progress);
        if let Ok(mut term) = self.term.lock() {
            let _ = writeln!(term, "{}", progress.one_line());
        }
    }
}

/// Initialise spec records for every declared feature and reset specs
/// left `running` by an interrupted process back to `pending`.
fn init_specs(workflow: &Workflow, run: &mut DagRun) {
    for layer in &workflow.layers {
        for feature in &layer.features {
            run.specs
                .entry(feature.id.clone())
                .or_insert_with(|| {
                    SpecState::pending(&feature.id, &layer.id, &feature.depends_on)
                });
        }
    }
    for spec in run.specs.values_mut() {
        if spec.status == SpecStatus::Running {
            spec.status = SpecStatus::Pending;
            spec.current_stage = String::new();
            spec.current_task = String::new();
        }
    }
}

/// Declared feature dependencies keyed by feature id.
fn dependency_map(workflow: &Workflow) -> DepsMap {
    workflow
        .features()
        .map(|f| (f.id.clone(), f.depends_on.clone()))
        .collect()
}

/// Direct dependencies of `spec_id` that are not completed.
fn unmet_deps(run: &DagRun, deps: &DepsMap, spec_id: &str) -> Vec<String> {
    deps.get(spec_id)
        .map(Vec::as_slice)
        .unwrap_or_default()
        .iter()
        .filter(|dep| run.spec(dep).map(|d| d.status) != Some(SpecStatus::Completed))
        .cloned()
        .collect()
}

/// Mark every pending spec that can no longer run as blocked, recording
/// the dependencies that hold it back. Blockage propagates: a spec whose
/// dependency became blocked is itself blocked.
fn mark_blocked(run: &mut DagRun, deps: &DepsMap) {
    loop {
        let statuses: BTreeMap<String, SpecStatus> = run
            .specs
            .values()
            .map(|s| (s.spec_id.clone(), s.status))
            .collect();
        let mut changed = false;

        for spec in run.specs.values_mut() {
            if spec.status != SpecStatus::Pending {
                continue;
            }
            let spec_deps = deps.get(&spec.spec_id).map_or(&[][..], Vec::as_slice);
            let has_dead_dep = spec_deps.iter().any(|dep| {
                matches!(
                    statuses.get(dep),
                    Some(SpecStatus::Failed | SpecStatus::Blocked)
                )
            });
            if has_dead_dep {
                spec.status = SpecStatus::Blocked;
                spec.blocked_by = spec_deps
                    .iter()
                    .filter(|dep| statuses.get(*dep) != Some(&SpecStatus::Completed))
                    .cloned()
                    .collect();
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    // Anything still pending is held back by a dependency that will never
    // finish (filtered out or itself pending forever); record it.
    let statuses: BTreeMap<String, SpecStatus> = run
        .specs
        .values()
        .map(|s| (s.spec_id.clone(), s.status))
        .collect();
    for spec in run.specs.values_mut() {
        if spec.status != SpecStatus::Pending {
            continue;
        }
        let spec_deps = deps.get(&spec.spec_id).map_or(&[][..], Vec::as_slice);
        let unmet: Vec<String> = spec_deps
            .iter()
            .filter(|dep| statuses.get(*dep) != Some(&SpecStatus::Completed))
            .cloned()
            .collect();
        if !unmet.is_empty() {
            spec.status = SpecStatus::Blocked;
            spec.blocked_by = unmet;
        }
    }
}
