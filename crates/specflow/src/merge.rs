//! Dependency-ordered merge engine.
//!
//! Merges completed spec branches into the target branch in topological
//! order (Kahn's algorithm, lexicographic tie-breaking). Conflicts are
//! collected per merge; resolution is either delegated to the agent,
//! file by file with the extracted conflict hunks, or handed to the
//! operator via a guidance block that pauses the merge. With staging
//! enabled, each layer's specs merge onto `dag/<dag-id>/stage-<layer>`
//! first and the staging branch is then promoted to the target.

use crate::agent::{Agent, AgentError};
use crate::git::{
    contains_conflict_markers, extract_conflict_hunks, GitError, GitTool, MergeOutcome,
};
use crate::output::{OutputHandle, SharedSink};
use crate::store::{StateStore, StoreError};
use specflow_core::config::{ConflictStrategy, FlowConfig};
use specflow_core::graph::{layer_order, DepGraph, GraphError};
use specflow_core::ident::staging_branch;
use specflow_core::state::{
    DagRun, MergeState, MergeStatus, ResolutionMethod, SpecStatus, StagingBranchInfo,
};
use specflow_core::workflow::{Feature, Workflow};
use chrono::Utc;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Whole-pass retries for agent conflict resolution.
const AGENT_RESOLUTION_PASSES: u32 = 3;

#[derive(Debug, Error)]
pub enum MergeError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Git(#[from] GitError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error("merge paused on spec `{spec_id}` with {} conflicted file(s); resolve and rerun with --continue", .conflicts.len())]
    Paused {
        spec_id: String,
        conflicts: Vec<String>,
    },
    #[error("spec `{spec_id}` has no recorded branch to merge")]
    MissingBranch { spec_id: String },
}

pub type Result<T> = std::result::Result<T, MergeError>;

/// Caller-facing merge options.
#[derive(Debug, Clone, Default)]
pub struct MergeOptions {
    /// Target branch; defaults to the configured base branch, then `main`.
    pub target: Option<String>,
    /// Skip specs already merged or skipped in a previous pass.
    pub continue_run: bool,
    /// Additionally skip specs whose previous merge failed.
    pub skip_failed: bool,
}

/// Summary of one merge invocation.
#[derive(Debug, Clone, Default)]
pub struct MergeReport {
    pub merged: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
}

/// Merges a completed run back into the integration branch.
pub struct MergeEngine {
    git: GitTool,
    agent: Arc<dyn Agent>,
    store: Arc<StateStore>,
    config: FlowConfig,
    repo_root: PathBuf,
    term: SharedSink,
}

impl std::fmt::Debug for MergeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeEngine")
            .field("repo_root", &self.repo_root)
            .finish_non_exhaustive()
    }
}

impl MergeEngine {
    pub fn new(
        git: GitTool,
        agent: Arc<dyn Agent>,
        store: Arc<StateStore>,
        config: FlowConfig,
        repo_root: PathBuf,
        term: SharedSink,
    ) -> Self {
        Self {
            git,
            agent,
            store,
            config,
            repo_root,
            term,
        }
    }

    /// Merge every completed spec of the run in dependency order.
    pub async fn merge_run(
        &self,
        cancel: &CancellationToken,
        workflow: &Workflow,
        run: &mut DagRun,
        options: &MergeOptions,
    ) -> Result<MergeReport> {
        let target = options
            .target
            .clone()
            .unwrap_or_else(|| self.config.target_branch().to_string());

        // Defensive cycle check before ordering.
        let graph = DepGraph::from_workflow(workflow);
        if let Some(path) = graph.find_cycle() {
            return Err(GraphError::Cycle { path }.into());
        }
        let order: Vec<String> = graph
            .topo_sort()?
            .into_iter()
            .filter(|id| run.spec(id).map(|s| s.status) == Some(SpecStatus::Completed))
            .collect();

        let features: BTreeMap<String, Feature> = workflow
            .features()
            .map(|f| (f.id.clone(), f.clone()))
            .collect();

        let mut report = MergeReport::default();
        if self.config.use_staging {
            self.merge_with_staging(
                cancel, workflow, run, &order, &features, &target, options, &mut report,
            )
            .await?;
        } else {
            for spec_id in &order {
                self.merge_one(cancel, run, &features, spec_id, &target, options, &mut report)
                    .await?;
            }
        }
        Ok(report)
    }

    /// Merge one spec into `target`, honouring the skip policy.
    async fn merge_one(
        &self,
        cancel: &CancellationToken,
        run: &mut DagRun,
        features: &BTreeMap<String, Feature>,
        spec_id: &str,
        target: &str,
        options: &MergeOptions,
        report: &mut MergeReport,
    ) -> Result<()> {
        let prior = run.spec(spec_id).map(|s| s.merge_status());
        if options.continue_run
            && matches!(prior, Some(MergeStatus::Merged | MergeStatus::Skipped))
        {
            report.skipped.push(spec_id.to_string());
            return Ok(());
        }
        if options.skip_failed && prior == Some(MergeStatus::MergeFailed) {
            self.record_merge(run, spec_id, |m| {
                m.status = MergeStatus::Skipped;
            });
            report.skipped.push(spec_id.to_string());
            return Ok(());
        }

        let Some(source) = run.spec(spec_id).and_then(|s| s.branch.clone()) else {
            self.record_merge(run, spec_id, |m| {
                m.status = MergeStatus::MergeFailed;
                m.error = Some("no recorded branch".to_string());
            });
            report.failed.push(spec_id.to_string());
            return Err(MergeError::MissingBranch {
                spec_id: spec_id.to_string(),
            });
        };

        tracing::info!(spec_id, %source, %target, "merging spec");
        self.git.checkout(cancel, &self.repo_root, target).await?;

        match self.git.merge(cancel, &self.repo_root, &source).await? {
            MergeOutcome::Clean => {
                self.record_merge(run, spec_id, |m| {
                    m.status = MergeStatus::Merged;
                    m.merged_at = Some(Utc::now());
                    m.conflicts = Vec::new();
                    m.error = None;
                    m.resolution_method = ResolutionMethod::None;
                });
                report.merged.push(spec_id.to_string());
                Ok(())
            }
            MergeOutcome::Conflicts(conflicts) => {
                self.resolve_conflicts(
                    cancel, run, features, spec_id, &source, target, conflicts, report,
                )
                .await
            }
        }
    }

    async fn resolve_conflicts(
        &self,
        cancel: &CancellationToken,
        run: &mut DagRun,
        features: &BTreeMap<String, Feature>,
        spec_id: &str,
        source: &str,
        target: &str,
        conflicts: Vec<String>,
        report: &mut MergeReport,
    ) -> Result<()> {
        tracing::warn!(
            spec_id,
            files = conflicts.len(),
            "merge conflicts detected"
        );

        if self.config.on_conflict == ConflictStrategy::Agent {
            let resolved = self
                .agent_resolution(cancel, features, spec_id, source, target, &conflicts)
                .await?;
            if resolved {
                self.git.add(cancel, &self.repo_root, &conflicts).await?;
                self.git.commit_no_edit(cancel, &self.repo_root).await?;
                self.record_merge(run, spec_id, |m| {
                    m.status = MergeStatus::Merged;
                    m.merged_at = Some(Utc::now());
                    m.conflicts = conflicts.clone();
                    m.error = None;
                    m.resolution_method = ResolutionMethod::Agent;
                });
                report.merged.push(spec_id.to_string());
                return Ok(());
            }
            tracing::warn!(spec_id, "agent resolution exhausted, falling back to manual");
        }

        // Manual fallback: describe the situation and pause.
        self.print_manual_guidance(spec_id, source, target, &conflicts);
        self.record_merge(run, spec_id, |m| {
            m.status = MergeStatus::MergeFailed;
            m.conflicts = conflicts.clone();
            m.error = Some(format!("merge of {source} into {target} has conflicts"));
            m.resolution_method = ResolutionMethod::Manual;
        });
        self.persist(run);
        report.failed.push(spec_id.to_string());
        Err(MergeError::Paused {
            spec_id: spec_id.to_string(),
            conflicts,
        })
    }

    /// Run the agent over each conflicted file, re-verifying that no
    /// markers remain. The whole pass retries up to three times.
    async fn agent_resolution(
        &self,
        cancel: &CancellationToken,
        features: &BTreeMap<String, Feature>,
        spec_id: &str,
        source: &str,
        target: &str,
        conflicts: &[String],
    ) -> Result<bool> {
        let feature = features.get(spec_id);
        for pass in 1..=AGENT_RESOLUTION_PASSES {
            tracing::info!(spec_id, pass, "agent conflict resolution pass");
            let mut all_resolved = true;

            for file in conflicts {
                let path = self.repo_root.join(file);
                let text = std::fs::read_to_string(&path).unwrap_or_default();
                if !contains_conflict_markers(&text) {
                    continue;
                }
                let prompt = conflict_prompt(spec_id, feature, source, target, file, &text);
                let output: OutputHandle =
                    Arc::new(std::sync::Mutex::new(TermForward::new(SharedSink::clone(
                        &self.term,
                    ))));
                let code = self
                    .agent
                    .run(cancel, &prompt, &self.repo_root, true, output)
                    .await?;
                if code != 0 {
                    tracing::warn!(spec_id, file = %file, code, "resolution agent exited nonzero");
                }

                let after = std::fs::read_to_string(&path).unwrap_or_default();
                if contains_conflict_markers(&after) {
                    all_resolved = false;
                }
            }

            if all_resolved {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Staging mode: per layer, merge the layer's specs onto the staging
    /// branch, then promote the staging branch to the target.
    ///
    /// Layers are partitioned by membership, not by adjacency in the
    /// topological order: the feature-level sort interleaves layers
    /// freely, and a layer must be staged and promoted exactly once with
    /// all of its specs before the next layer starts.
    async fn merge_with_staging(
        &self,
        cancel: &CancellationToken,
        workflow: &Workflow,
        run: &mut DagRun,
        order: &[String],
        features: &BTreeMap<String, Feature>,
        target: &str,
        options: &MergeOptions,
        report: &mut MergeReport,
    ) -> Result<()> {
        let mut layers: Vec<(String, Vec<String>)> = Vec::new();
        for layer_id in layer_order(workflow)? {
            let specs: Vec<String> = order
                .iter()
                .filter(|id| {
                    run.spec(id.as_str()).map(|s| s.layer_id.as_str()) == Some(layer_id.as_str())
                })
                .cloned()
                .collect();
            if !specs.is_empty() {
                layers.push((layer_id, specs));
            }
        }

        let dag_id = run.dag_id.clone();
        for (layer_id, specs) in layers {
            let stage = staging_branch(&dag_id, &layer_id);
            if !self
                .git
                .branch_exists(cancel, &self.repo_root, &stage)
                .await?
            {
                self.git
                    .create_branch(cancel, &self.repo_root, &stage, target)
                    .await?;
            }

            for spec_id in &specs {
                self.merge_one(cancel, run, features, spec_id, &stage, options, report)
                    .await?;
            }
            // Record the specs that actually landed on the staging branch
            // (merged now or by a previous pass).
            let merged_specs: Vec<String> = specs
                .iter()
                .filter(|id| {
                    run.spec(id.as_str()).map(|s| s.merge_status()) == Some(MergeStatus::Merged)
                })
                .cloned()
                .collect();

            // Promote the staging branch.
            self.git.checkout(cancel, &self.repo_root, target).await?;
            match self.git.merge(cancel, &self.repo_root, &stage).await? {
                MergeOutcome::Clean => {}
                MergeOutcome::Conflicts(conflicts) => {
                    self.print_manual_guidance(&layer_id, &stage, target, &conflicts);
                    return Err(MergeError::Paused {
                        spec_id: format!("stage-{layer_id}"),
                        conflicts,
                    });
                }
            }

            let staging = run.staging.get_or_insert_with(BTreeMap::new);
            let info = staging
                .entry(layer_id.clone())
                .or_insert_with(|| StagingBranchInfo {
                    layer_id: layer_id.clone(),
                    branch: stage.clone(),
                    created_at: Utc::now(),
                    merged_specs: Vec::new(),
                });
            for spec_id in merged_specs {
                if !info.merged_specs.contains(&spec_id) {
                    info.merged_specs.push(spec_id);
                }
            }
            self.persist(run);
        }
        Ok(())
    }

    fn record_merge<F: FnOnce(&mut MergeState)>(&self, run: &mut DagRun, spec_id: &str, f: F) {
        if let Some(spec) = run.spec_mut(spec_id) {
            let merge = spec.merge.get_or_insert_with(MergeState::default);
            f(merge);
        }
        self.persist(run);
    }

    fn persist(&self, run: &DagRun) {
        if let Err(err) = self.store.save(run) {
            tracing::error!(%err, "failed to persist merge state");
        }
    }

    fn print_manual_guidance(
        &self,
        spec_id: &str,
        source: &str,
        target: &str,
        conflicts: &[String],
    ) {
        let mut block = String::new();
        block.push_str("\n============================================================\n");
        block.push_str(&format!("MERGE CONFLICT while merging '{spec_id}'\n"));
        block.push_str(&format!("  source branch: {source}\n"));
        block.push_str(&format!("  target branch: {target}\n"));
        block.push_str("  conflicted files:\n");
        for file in conflicts {
            block.push_str(&format!("    - {file}\n"));
        }
        block.push_str(
            "\nThe merge is paused with conflict markers left in the files\n\
             above. Edit each file to resolve the markers, stage the\n\
             results, and commit the merge:\n\n\
             git add <files> && git commit --no-edit\n\n\
             Then continue the remaining merges with:\n\n",
        );
        block.push_str("  specflow merge <workflow> --continue\n");
        block.push_str("============================================================\n");
        if let Ok(mut term) = self.term.lock() {
            let _ = term.write_all(block.as_bytes());
            let _ = term.flush();
        }
    }
}

/// Forwards resolution-agent output to the shared terminal.
struct TermForward {
    term: SharedSink,
}

impl TermForward {
    fn new(term: SharedSink) -> Self {
        Self { term }
    }
}

impl Write for TermForward {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        if let Ok(mut term) = self.term.lock() {
            term.write_all(data)?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if let Ok(mut term) = self.term.lock() {
            term.flush()?;
        }
        Ok(())
    }
}

/// Prompt for resolving one conflicted file.
fn conflict_prompt(
    spec_id: &str,
    feature: Option<&Feature>,
    source: &str,
    target: &str,
    file: &str,
    text: &str,
) -> String {
    let description = feature.map_or("", |f| f.description.as_str());
    let hunks = extract_conflict_hunks(text);
    let mut prompt = format!(
        "Resolve the merge conflicts in `{file}`.\n\n\
         Context: branch '{source}' (spec '{spec_id}': {description}) is \
         being merged into '{target}'. Edit the file in place so that no \
         conflict markers remain and both sides' intent is preserved. Do \
         not commit; only fix the file.\n\nConflict blocks:\n"
    );
    for hunk in hunks {
        prompt.push_str(&format!(
            "\n--- lines {}-{} ---\n{}\n",
            hunk.start_line, hunk.end_line, hunk.text
        ));
    }
    prompt
}
