//! specflow-core - data model and algorithms for the specflow orchestrator.
//!
//! Pure library half of the workspace: workflow schema and parsing,
//! validation, dependency graphs, identifier derivation, size parsing,
//! configuration, and the durable run-state model. Anything that spawns a
//! process lives in the `specflow` crate.

pub mod config;
pub mod graph;
pub mod ident;
pub mod size;
pub mod state;
pub mod validate;
pub mod workflow;

pub use config::{ConflictStrategy, FlowConfig, WorktreeConfig};
pub use graph::DepGraph;
pub use state::{
    CommitStatus, DagRun, MergeState, MergeStatus, ResolutionMethod, RunLockFile, RunStatus,
    SpecLockFile, SpecState, SpecStatus, StagingBranchInfo,
};
pub use validate::ValidationError;
pub use workflow::{Feature, Layer, NodeInfo, ParseError, ParseResult, Workflow};
