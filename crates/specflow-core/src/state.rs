//! Durable run-state data model.
//!
//! These types are the on-disk contract: the run state file, the per-spec
//! records inside it, and the run/spec lock files. Optional fields must
//! round-trip as absent so state written by older builds keeps loading.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

/// Heartbeat refresh cadence for spec locks.
pub const HEARTBEAT_INTERVAL_SECS: i64 = 30;

/// A spec lock is stale once its heartbeat is older than this.
pub const LOCK_STALE_AFTER_SECS: i64 = 120;

/// Run lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Interrupted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Interrupted => "interrupted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Per-spec execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Blocked,
}

impl SpecStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Blocked)
    }
}

/// Commit verification status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitStatus {
    #[default]
    Pending,
    Committed,
    Failed,
}

impl CommitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Committed => "committed",
            Self::Failed => "failed",
        }
    }
}

/// Merge status for a spec branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    #[default]
    Pending,
    Merged,
    MergeFailed,
    Skipped,
}

impl MergeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Merged => "merged",
            Self::MergeFailed => "merge_failed",
            Self::Skipped => "skipped",
        }
    }
}

/// How a merge conflict was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMethod {
    #[default]
    None,
    Agent,
    Manual,
}

impl ResolutionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Agent => "agent",
            Self::Manual => "manual",
        }
    }
}

/// Merge bookkeeping for a spec, present only once the merge engine has
/// touched the spec.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergeState {
    pub status: MergeStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub merged_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub conflicts: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    pub resolution_method: ResolutionMethod,
}

/// A per-layer staging branch used by the merge engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingBranchInfo {
    pub layer_id: String,
    pub branch: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub merged_specs: Vec<String>,
}

/// Durable record for a single spec within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecState {
    pub spec_id: String,
    pub layer_id: String,
    pub status: SpecStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub worktree_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub current_stage: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub current_task: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub failure_reason: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub blocked_by: Vec<String>,
    #[serde(default)]
    pub commit_status: CommitStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub commit_sha: Option<String>,
    #[serde(default)]
    pub commit_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub merge: Option<MergeState>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub log_file: Option<PathBuf>,
}

impl SpecState {
    /// Initial pending record for a declared feature. `blocked_by` starts
    /// as the declared dependency list and is rewritten as execution
    /// proceeds.
    pub fn pending(spec_id: &str, layer_id: &str, depends_on: &[String]) -> Self {
        Self {
            spec_id: spec_id.to_string(),
            layer_id: layer_id.to_string(),
            status: SpecStatus::Pending,
            worktree_path: None,
            branch: None,
            started_at: None,
            completed_at: None,
            current_stage: String::new(),
            current_task: String::new(),
            exit_code: None,
            failure_reason: None,
            blocked_by: depends_on.to_vec(),
            commit_status: CommitStatus::Pending,
            commit_sha: None,
            commit_attempts: 0,
            merge: None,
            log_file: None,
        }
    }

    pub fn merge_status(&self) -> MergeStatus {
        self.merge.as_ref().map_or(MergeStatus::Pending, |m| m.status)
    }
}

/// Durable record for a whole run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagRun {
    pub run_id: String,
    pub workflow_path: String,
    pub dag_id: String,
    pub project_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub running_count: usize,
    pub max_parallel: usize,
    pub specs: BTreeMap<String, SpecState>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub staging: Option<BTreeMap<String, StagingBranchInfo>>,
    pub log_base: PathBuf,
}

impl DagRun {
    pub fn new(
        workflow_path: &str,
        dag_id: &str,
        project_id: &str,
        max_parallel: usize,
        log_base: PathBuf,
    ) -> Self {
        Self {
            run_id: Uuid::now_v7().to_string(),
            workflow_path: workflow_path.to_string(),
            dag_id: dag_id.to_string(),
            project_id: project_id.to_string(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            running_count: 0,
            max_parallel,
            specs: BTreeMap::new(),
            staging: None,
            log_base,
        }
    }

    /// Spec ids still to execute (everything not completed).
    pub fn pending_spec_ids(&self) -> Vec<String> {
        self.specs
            .values()
            .filter(|s| s.status != SpecStatus::Completed)
            .map(|s| s.spec_id.clone())
            .collect()
    }

    pub fn spec(&self, spec_id: &str) -> Option<&SpecState> {
        self.specs.get(spec_id)
    }

    pub fn spec_mut(&mut self, spec_id: &str) -> Option<&mut SpecState> {
        self.specs.get_mut(spec_id)
    }

    /// Count specs currently in a given status.
    pub fn count_status(&self, status: SpecStatus) -> usize {
        self.specs.values().filter(|s| s.status == status).count()
    }
}

/// Coarse run-level lock file guarding against overlapping runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLockFile {
    pub run_id: String,
    pub pid: u32,
    pub specs: Vec<String>,
    pub started_at: DateTime<Utc>,
}

impl RunLockFile {
    /// Whether this lock claims any of the given spec ids.
    pub fn overlaps(&self, spec_ids: &[String]) -> bool {
        self.specs.iter().any(|s| spec_ids.contains(s))
    }
}

/// Fine-grained per-spec lock with heartbeat-based liveness.
///
/// The PID is informational only; PIDs are recycled, so the heartbeat is
/// the liveness signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecLockFile {
    pub spec_id: String,
    pub run_id: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub heartbeat: DateTime<Utc>,
}

impl SpecLockFile {
    pub fn new(spec_id: &str, run_id: &str) -> Self {
        let now = Utc::now();
        Self {
            spec_id: spec_id.to_string(),
            run_id: run_id.to_string(),
            pid: std::process::id(),
            started_at: now,
            heartbeat: now,
        }
    }

    /// A lock is stale when its heartbeat is older than
    /// [`LOCK_STALE_AFTER_SECS`]. A missing lock is not stale.
    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.heartbeat) > Duration::seconds(LOCK_STALE_AFTER_SECS)
    }

    pub fn is_stale(&self) -> bool {
        self.is_stale_at(Utc::now())
    }
}

/// Staleness check that treats an absent lock as not stale.
pub fn lock_is_stale(lock: Option<&SpecLockFile>, now: DateTime<Utc>) -> bool {
    lock.is_some_and(|l| l.is_stale_at(now))
}
