//! Working-copy disposal after merge.
//!
//! Only merged specs lose their working copies; everything else is kept
//! with a recorded reason so operators can inspect failures. Force mode
//! bypasses the merged-only policy.

use crate::worktree::WorktreeProvider;
use specflow_core::ident::worktree_name;
use specflow_core::state::{DagRun, MergeStatus};
use tokio_util::sync::CancellationToken;

/// A working copy that was intentionally preserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeptWorktree {
    pub spec_id: String,
    pub reason: String,
}

/// Accounting for one cleanup pass.
#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    pub cleaned: Vec<String>,
    pub kept: Vec<KeptWorktree>,
    pub errors: Vec<String>,
}

/// Dispose of a run's working copies according to the merge policy.
///
/// Cleared worktree paths are removed from the run state; the caller is
/// responsible for persisting the updated run.
pub async fn cleanup_run(
    cancel: &CancellationToken,
    run: &mut DagRun,
    provider: &dyn WorktreeProvider,
    force: bool,
) -> CleanupReport {
    let mut report = CleanupReport::default();
    let dag_id = run.dag_id.clone();

    for spec in run.specs.values_mut() {
        let Some(path) = spec.worktree_path.clone() else {
            continue;
        };

        let merge_status = spec.merge_status();
        if !force && merge_status != MergeStatus::Merged {
            let reason = match merge_status {
                MergeStatus::MergeFailed => "merge failed",
                MergeStatus::Skipped => "merge skipped",
                _ => "merge pending",
            };
            report.kept.push(KeptWorktree {
                spec_id: spec.spec_id.clone(),
                reason: reason.to_string(),
            });
            continue;
        }

        if !path.exists() {
            tracing::warn!(
                spec_id = %spec.spec_id,
                path = %path.display(),
                "recorded working copy no longer exists"
            );
            spec.worktree_path = None;
            continue;
        }

        let name = worktree_name(&dag_id, &spec.spec_id);
        match provider.remove(cancel, &name, force).await {
            Ok(()) => {
                spec.worktree_path = None;
                report.cleaned.push(spec.spec_id.clone());
            }
            Err(err) => {
                report
                    .errors
                    .push(format!("{}: {err}", spec.spec_id));
            }
        }
    }

    report
}
