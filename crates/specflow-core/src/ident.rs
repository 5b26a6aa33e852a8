//! Identifier and path derivation.
//!
//! Slugification, DAG-id resolution, workflow-path normalisation for
//! state-file keys, project-id derivation, and the cache/log/state
//! directory layout.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Maximum length for slugified identifiers.
pub const MAX_SLUG_LENGTH: usize = 50;

/// Branch namespace prefix for all specflow-managed branches.
pub const BRANCH_NAMESPACE: &str = "dag";

/// Product directory name under the cache base.
pub const PRODUCT_DIR: &str = "specflow";

/// Slugify a free-form name into `[a-z0-9-]*`.
///
/// Lowercases, maps runs of non-alphanumerics to a single `-`, trims
/// leading/trailing `-`, and caps the result at [`MAX_SLUG_LENGTH`].
/// Idempotent: `slugify(slugify(s)) == slugify(s)`.
pub fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len().min(MAX_SLUG_LENGTH));
    let mut pending_dash = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    out.truncate(MAX_SLUG_LENGTH);
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// Resolve the DAG identifier from workflow metadata and the file path.
///
/// Priority: explicit `dag.id`, then `dag.name`, then the workflow
/// filename stem. Each candidate is slugified; candidates that slugify to
/// empty cascade to the next.
pub fn resolve_dag_id(id: Option<&str>, name: &str, workflow_path: &Path) -> String {
    if let Some(id) = id {
        let slug = slugify(id);
        if !slug.is_empty() {
            return slug;
        }
    }
    let slug = slugify(name);
    if !slug.is_empty() {
        return slug;
    }
    let stem = workflow_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("");
    let slug = slugify(stem);
    if !slug.is_empty() {
        return slug;
    }
    "dag".to_string()
}

/// Normalise a workflow path into a state-file key.
///
/// Absolute paths reduce to their basename; relative paths have their
/// separators replaced with `-`. A `.state` suffix is appended so the key
/// is recognisable in the state directory.
pub fn normalize_workflow_path(path: &Path) -> String {
    let name = if path.is_absolute() {
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("workflow")
            .to_string()
    } else {
        path.to_string_lossy().replace(['/', '\\'], "-")
    };
    format!("{name}.state")
}

/// Derive a project id from a source-control remote URL.
///
/// Strips the protocol and a trailing `.git`, maps runs of
/// non-alphanumerics to `-`, and lowercases. Returns `None` when nothing
/// identifiable remains.
pub fn project_id_from_remote(url: &str) -> Option<String> {
    let trimmed = url.trim();
    let without_scheme = match trimmed.find("://") {
        Some(pos) => &trimmed[pos + 3..],
        None => trimmed,
    };
    let without_suffix = without_scheme.strip_suffix(".git").unwrap_or(without_scheme);

    let mut out = String::with_capacity(without_suffix.len());
    let mut pending_dash = false;
    for c in without_suffix.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Derive a project id from the absolute working directory path.
///
/// First 12 hex characters of the SHA-256 of the path string.
pub fn project_id_from_path(workdir: &Path) -> String {
    let digest = Sha256::digest(workdir.to_string_lossy().as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..12].to_string()
}

/// Last-resort project id when neither a remote nor a path is usable.
pub const PROJECT_ID_UNKNOWN: &str = "unknown";

/// Four-hex-character branch collision suffix derived from the workflow path.
pub fn branch_collision_suffix(workflow_path: &Path) -> String {
    let digest = Sha256::digest(workflow_path.to_string_lossy().as_bytes());
    format!("{:02x}{:02x}", digest[0], digest[1])
}

/// Branch name for a spec: `dag/<dag-id>/<spec-id>`.
pub fn spec_branch(dag_id: &str, spec_id: &str) -> String {
    format!("{BRANCH_NAMESPACE}/{dag_id}/{spec_id}")
}

/// Branch prefix owned by a DAG: `dag/<dag-id>/`.
pub fn dag_branch_prefix(dag_id: &str) -> String {
    format!("{BRANCH_NAMESPACE}/{dag_id}/")
}

/// Staging branch for a layer: `dag/<dag-id>/stage-<layer-id>`.
pub fn staging_branch(dag_id: &str, layer_id: &str) -> String {
    format!("{BRANCH_NAMESPACE}/{dag_id}/stage-{layer_id}")
}

/// Worktree directory name for a spec: `dag-<dag-id>-<spec-id>`.
pub fn worktree_name(dag_id: &str, spec_id: &str) -> String {
    format!("{BRANCH_NAMESPACE}-{dag_id}-{spec_id}")
}

/// Resolve the cache base directory.
///
/// `SPECFLOW_CACHE_DIR` override, then the OS user cache directory, then
/// `~/.cache`.
pub fn cache_base() -> PathBuf {
    if let Some(dir) = std::env::var_os("SPECFLOW_CACHE_DIR") {
        return PathBuf::from(dir);
    }
    dirs::cache_dir().unwrap_or_else(|| PathBuf::from(".cache"))
}

/// Log directory for a DAG: `<cache>/specflow/dag-logs/<project>/<dag>`.
pub fn log_dir(cache_base: &Path, project_id: &str, dag_id: &str) -> PathBuf {
    cache_base
        .join(PRODUCT_DIR)
        .join("dag-logs")
        .join(project_id)
        .join(dag_id)
}

/// Log file for a spec within a log directory.
pub fn spec_log_path(log_base: &Path, spec_id: &str) -> PathBuf {
    log_base.join(format!("{spec_id}.log"))
}

/// State directory for a project: `<cache>/specflow/state/<project>`.
pub fn state_dir(cache_base: &Path, project_id: &str) -> PathBuf {
    cache_base.join(PRODUCT_DIR).join("state").join(project_id)
}

/// Minimal user-directory resolution.
mod dirs {
    use std::path::PathBuf;

    pub fn cache_dir() -> Option<PathBuf> {
        std::env::var_os("XDG_CACHE_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".cache")))
    }
}
