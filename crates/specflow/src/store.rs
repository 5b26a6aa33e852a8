//! Durable state store.
//!
//! Run state is a JSON document written atomically (temp file in the
//! same directory, then rename). Every run is stored twice: under its
//! run id for listing, and under the normalised workflow path so a
//! resume needs nothing but the workflow file. The run's directory of
//! spec locks is co-located here as well.

use serde::Serialize;
use specflow_core::ident::normalize_workflow_path;
use specflow_core::state::DagRun;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt state file {path}: {message}")]
    Corrupt { path: PathBuf, message: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Write a file atomically: temp file in the same directory, then rename.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let tmp = tmp_path(path);
    std::fs::write(&tmp, bytes).map_err(|source| StoreError::Io {
        path: tmp.clone(),
        source,
    })?;
    std::fs::rename(&tmp, path).map_err(io_err)?;
    Ok(())
}

/// Serialize to pretty JSON and write atomically.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value).map_err(|e| StoreError::Corrupt {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    atomic_write(path, &json)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map_or_else(|| "state".to_string(), |n| n.to_string_lossy().to_string());
    name.push_str(".tmp");
    path.with_file_name(name)
}

/// File-backed store for run state.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Create the store, ensuring the state directory exists.
    pub fn open(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Directory co-locating a run's spec lock files.
    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.dir.join(run_id)
    }

    fn run_path(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{run_id}.json"))
    }

    fn keyed_path(&self, workflow_path: &str) -> PathBuf {
        self.dir
            .join(normalize_workflow_path(Path::new(workflow_path)))
    }

    /// Persist a run atomically under both of its keys.
    pub fn save(&self, run: &DagRun) -> Result<()> {
        atomic_write_json(&self.run_path(&run.run_id), run)?;
        atomic_write_json(&self.keyed_path(&run.workflow_path), run)
    }

    fn load_file(&self, path: &Path) -> Result<Option<DagRun>> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let run = serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Ok(Some(run))
    }

    /// Load a run by id.
    pub fn load_by_run_id(&self, run_id: &str) -> Result<Option<DagRun>> {
        self.load_file(&self.run_path(run_id))
    }

    /// Load a run by its workflow path (the resume key).
    pub fn load_by_workflow_path(&self, workflow_path: &str) -> Result<Option<DagRun>> {
        self.load_file(&self.keyed_path(workflow_path))
    }

    /// Enumerate all stored runs, newest first by `started_at`.
    ///
    /// Corrupt or unreadable files are reported alongside the readable
    /// runs instead of aborting the listing.
    pub fn list(&self) -> (Vec<DagRun>, Vec<StoreError>) {
        let mut by_id: BTreeMap<String, DagRun> = BTreeMap::new();
        let mut errors = Vec::new();

        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(source) => {
                errors.push(StoreError::Io {
                    path: self.dir.clone(),
                    source,
                });
                return (Vec::new(), errors);
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let is_state_file = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("json" | "state")
            );
            if !path.is_file() || !is_state_file {
                continue;
            }
            match self.load_file(&path) {
                Ok(Some(run)) => {
                    // A run stored under both keys appears once.
                    by_id.entry(run.run_id.clone()).or_insert(run);
                }
                Ok(None) => {}
                Err(err) => errors.push(err),
            }
        }

        let mut runs: Vec<DagRun> = by_id.into_values().collect();
        runs.sort_by_key(|r| std::cmp::Reverse(r.started_at));
        (runs, errors)
    }

    /// Remove a run's state files and lock directory.
    pub fn delete(&self, run: &DagRun) -> Result<()> {
        for path in [
            self.run_path(&run.run_id),
            self.keyed_path(&run.workflow_path),
        ] {
            if let Err(source) = std::fs::remove_file(&path) {
                if source.kind() != std::io::ErrorKind::NotFound {
                    return Err(StoreError::Io { path, source });
                }
            }
        }
        let run_dir = self.run_dir(&run.run_id);
        if run_dir.is_dir() {
            if let Err(source) = std::fs::remove_dir_all(&run_dir) {
                return Err(StoreError::Io {
                    path: run_dir,
                    source,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use specflow_core::state::{SpecState, SpecStatus};
    use tempfile::TempDir;

    fn store() -> (TempDir, StateStore) {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path().join("state")).unwrap();
        (dir, store)
    }

    fn sample_run(workflow_path: &str) -> DagRun {
        let mut run = DagRun::new(workflow_path, "demo", "proj", 4, PathBuf::from("/logs"));
        run.specs
            .insert("a".to_string(), SpecState::pending("a", "L0", &[]));
        run
    }

    #[test]
    fn save_and_load_round_trip() {
        let (_dir, store) = store();
        let run = sample_run("wf/build.yaml");
        store.save(&run).unwrap();

        let by_id = store.load_by_run_id(&run.run_id).unwrap().unwrap();
        assert_eq!(by_id.run_id, run.run_id);

        let by_path = store
            .load_by_workflow_path("wf/build.yaml")
            .unwrap()
            .unwrap();
        assert_eq!(by_path.run_id, run.run_id);
        assert_eq!(by_path.spec("a").unwrap().status, SpecStatus::Pending);
    }

    #[test]
    fn load_missing_returns_none() {
        let (_dir, store) = store();
        assert!(store.load_by_run_id("nope").unwrap().is_none());
        assert!(store.load_by_workflow_path("nope.yaml").unwrap().is_none());
    }

    #[test]
    fn atomic_write_leaves_no_tmp_files() {
        let (_dir, store) = store();
        let run = sample_run("wf.yaml");
        store.save(&run).unwrap();
        // Overwrite to exercise the rename-over path.
        store.save(&run).unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(store.dir())
            .unwrap()
            .flatten()
            .filter(|e| e.path().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    #[test]
    fn list_is_newest_first_and_tolerates_corruption() {
        let (_dir, store) = store();

        let mut older = sample_run("a.yaml");
        older.started_at = Utc::now() - chrono::Duration::minutes(5);
        store.save(&older).unwrap();

        let newer = sample_run("b.yaml");
        store.save(&newer).unwrap();

        // A corrupt state file must not abort the listing.
        std::fs::write(store.dir().join("broken.json"), "{not json").unwrap();

        let (runs, errors) = store.list();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].run_id, newer.run_id);
        assert_eq!(runs[1].run_id, older.run_id);
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], StoreError::Corrupt { .. }));
    }

    #[test]
    fn delete_removes_both_keys_and_lock_dir() {
        let (_dir, store) = store();
        let run = sample_run("wf.yaml");
        store.save(&run).unwrap();
        std::fs::create_dir_all(store.run_dir(&run.run_id)).unwrap();

        store.delete(&run).unwrap();
        assert!(store.load_by_run_id(&run.run_id).unwrap().is_none());
        assert!(store.load_by_workflow_path("wf.yaml").unwrap().is_none());
        assert!(!store.run_dir(&run.run_id).exists());

        let (runs, _errors) = store.list();
        assert!(runs.is_empty());
    }

    #[test]
    fn keyed_file_uses_normalized_name() {
        let (_dir, store) = store();
        let run = sample_run("workflows/build.yaml");
        store.save(&run).unwrap();
        assert!(store.dir().join("workflows-build.yaml.state").exists());
    }
}
