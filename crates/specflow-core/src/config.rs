//! Orchestrator configuration.
//!
//! Layering: built-in defaults, then a key=value config file, then
//! `SPECFLOW_*` environment variables, with the environment winning.
//! File parse errors are hard errors; invalid environment values are
//! discarded with a warning so old binaries keep working against newer
//! environments.

use crate::size::parse_size;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("invalid size value for {key}: {value}")]
    InvalidSize { key: String, value: String },
}

/// Merge conflict handling strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    #[default]
    Manual,
    Agent,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Agent => "agent",
        }
    }
}

/// Working-copy provider configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct WorktreeConfig {
    /// Directory that receives worktrees; defaults to a sibling of the
    /// repository root.
    pub base_dir: Option<PathBuf>,
    /// Prefix prepended to every worktree directory name.
    pub prefix: String,
    /// Shell script run inside a freshly created worktree.
    pub setup_script: Option<String>,
    /// Run the setup script automatically on creation.
    pub auto_setup: bool,
    /// Track worktree status in the run state.
    pub track_status: bool,
    /// Directories copied from the main working copy into new worktrees
    /// (build caches, vendored deps).
    pub copy_dirs: Vec<String>,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            base_dir: None,
            prefix: String::new(),
            setup_script: None,
            auto_setup: false,
            track_status: true,
            copy_dirs: Vec::new(),
        }
    }
}

/// Full orchestrator configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Conflict resolution strategy for the merge engine.
    pub on_conflict: ConflictStrategy,
    /// Merge target branch; empty means `main`.
    pub base_branch: String,
    /// Agent re-invocations per spec before the spec is failed.
    pub max_spec_retries: u32,
    /// Per-spec log size cap, e.g. `50MB`.
    pub max_log_size: String,
    /// Autocommit uncommitted agent changes; `None` means enabled.
    pub autocommit: Option<bool>,
    /// Autocommit attempts before giving up.
    pub autocommit_retries: u32,
    /// Command template for autocommit; falls back to the agent when unset.
    pub autocommit_cmd: Option<String>,
    /// Log base override; defaults to the cache layout.
    pub log_dir: Option<PathBuf>,
    /// Directory holding one spec folder per feature id.
    pub specs_dir: PathBuf,
    /// Concurrency ceiling for the parallel scheduler.
    pub max_parallel: usize,
    /// Stop dispatching after the first spec failure.
    pub fail_fast: bool,
    /// Agent command override (program plus leading args).
    pub agent_cmd: Option<String>,
    /// Merge each layer onto a staging branch before the target.
    pub use_staging: bool,
    /// Working-copy provider settings.
    pub worktree: WorktreeConfig,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            on_conflict: ConflictStrategy::Manual,
            base_branch: String::new(),
            max_spec_retries: 0,
            max_log_size: "50MB".to_string(),
            autocommit: None,
            autocommit_retries: 2,
            autocommit_cmd: None,
            log_dir: None,
            specs_dir: PathBuf::from("specs"),
            max_parallel: 4,
            fail_fast: false,
            agent_cmd: None,
            use_staging: false,
            worktree: WorktreeConfig::default(),
        }
    }
}

impl FlowConfig {
    /// Load configuration: defaults, then the file (if present), then the
    /// process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(path) = path {
            if path.exists() {
                config.load_file(path)?;
            }
        }
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load and merge values from a key=value config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Parse key=value content. Blank lines and `#` comments are skipped.
    pub fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };
            self.apply_value(key.trim(), &Self::unquote(value.trim()))?;
        }
        Ok(())
    }

    /// Overlay environment variables. Keys map 1:1 to config keys in
    /// upper snake case with a `SPECFLOW_` prefix. Invalid values are
    /// ignored so the file value survives.
    pub fn apply_env<F>(&mut self, get: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for key in CONFIG_KEYS {
            let env_key = format!("SPECFLOW_{}", key.to_ascii_uppercase());
            if let Some(value) = get(&env_key) {
                if let Err(err) = self.apply_value(key, &value) {
                    tracing::warn!(%env_key, %value, %err, "ignoring invalid environment value");
                }
            }
        }
    }

    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "on_conflict" => {
                self.on_conflict = match value {
                    "manual" => ConflictStrategy::Manual,
                    "agent" => ConflictStrategy::Agent,
                    _ => {
                        return Err(ConfigError::InvalidLine(format!(
                            "on_conflict must be 'manual' or 'agent', got '{value}'"
                        )))
                    }
                }
            }
            "base_branch" => self.base_branch = value.to_string(),
            "max_spec_retries" => self.max_spec_retries = Self::parse_int(key, value)?,
            "max_log_size" => {
                parse_size(value).map_err(|_| ConfigError::InvalidSize {
                    key: key.to_string(),
                    value: value.to_string(),
                })?;
                self.max_log_size = value.to_string();
            }
            "autocommit" => self.autocommit = Some(Self::parse_bool(key, value)?),
            "autocommit_retries" => self.autocommit_retries = Self::parse_int(key, value)?,
            "autocommit_cmd" => {
                self.autocommit_cmd = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            }
            "log_dir" => {
                self.log_dir = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                }
            }
            "specs_dir" => self.specs_dir = PathBuf::from(value),
            "max_parallel" => {
                let parsed: usize = value.parse().map_err(|_| ConfigError::InvalidInt {
                    key: key.to_string(),
                    value: value.to_string(),
                })?;
                self.max_parallel = parsed.max(1);
            }
            "fail_fast" => self.fail_fast = Self::parse_bool(key, value)?,
            "agent_cmd" => {
                self.agent_cmd = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            }
            "use_staging" => self.use_staging = Self::parse_bool(key, value)?,
            "worktree_base_dir" => {
                self.worktree.base_dir = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                }
            }
            "worktree_prefix" => self.worktree.prefix = value.to_string(),
            "worktree_setup_script" => {
                self.worktree.setup_script = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            }
            "worktree_auto_setup" => self.worktree.auto_setup = Self::parse_bool(key, value)?,
            "worktree_track_status" => self.worktree.track_status = Self::parse_bool(key, value)?,
            "worktree_copy_dirs" => {
                self.worktree.copy_dirs = value
                    .split_whitespace()
                    .map(ToString::to_string)
                    .collect();
            }
            _ => {
                tracing::warn!(key, "unknown config key");
            }
        }
        Ok(())
    }

    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    fn parse_int(key: &str, value: &str) -> Result<u32, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Effective merge target branch.
    pub fn target_branch(&self) -> &str {
        if self.base_branch.is_empty() {
            "main"
        } else {
            &self.base_branch
        }
    }

    /// Whether autocommit is enabled (`None` means enabled).
    pub fn autocommit_enabled(&self) -> bool {
        self.autocommit.unwrap_or(true)
    }

    /// Log size cap in bytes. The string is validated on the way in, so
    /// this falls back to the default only for hand-built configs.
    pub fn max_log_size_bytes(&self) -> u64 {
        parse_size(&self.max_log_size).unwrap_or(50 * 1024 * 1024)
    }
}

/// All recognised config keys, used for the 1:1 environment mapping.
const CONFIG_KEYS: &[&str] = &[
    "on_conflict",
    "base_branch",
    "max_spec_retries",
    "max_log_size",
    "autocommit",
    "autocommit_retries",
    "autocommit_cmd",
    "log_dir",
    "specs_dir",
    "max_parallel",
    "fail_fast",
    "agent_cmd",
    "use_staging",
    "worktree_base_dir",
    "worktree_prefix",
    "worktree_setup_script",
    "worktree_auto_setup",
    "worktree_track_status",
    "worktree_copy_dirs",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = FlowConfig::default();
        assert_eq!(config.on_conflict, ConflictStrategy::Manual);
        assert_eq!(config.target_branch(), "main");
        assert_eq!(config.max_spec_retries, 0);
        assert_eq!(config.max_log_size, "50MB");
        assert_eq!(config.max_log_size_bytes(), 50 * 1024 * 1024);
        assert!(config.autocommit_enabled());
        assert_eq!(config.max_parallel, 4);
        assert!(!config.fail_fast);
        assert!(!config.use_staging);
        assert_eq!(config.specs_dir, PathBuf::from("specs"));
    }

    #[test]
    fn parse_simple_file_content() {
        let mut config = FlowConfig::default();
        config
            .parse_content(
                r#"
# comment
on_conflict=agent
base_branch="develop"
max_spec_retries=2
max_log_size=10MB
autocommit=false
worktree_copy_dirs=node_modules target
"#,
            )
            .unwrap();
        assert_eq!(config.on_conflict, ConflictStrategy::Agent);
        assert_eq!(config.target_branch(), "develop");
        assert_eq!(config.max_spec_retries, 2);
        assert_eq!(config.max_log_size_bytes(), 10 * 1024 * 1024);
        assert!(!config.autocommit_enabled());
        assert_eq!(config.worktree.copy_dirs, vec!["node_modules", "target"]);
    }

    #[test]
    fn file_errors_are_hard() {
        let mut config = FlowConfig::default();
        assert!(config.parse_content("max_parallel=lots").is_err());
        assert!(config.parse_content("not a key value line").is_err());
        assert!(config.parse_content("on_conflict=maybe").is_err());
        assert!(config.parse_content("max_log_size=50").is_err());
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = FlowConfig::default();
        config.parse_content("base_branch=develop\nmax_parallel=2").unwrap();
        config.apply_env(|key| match key {
            "SPECFLOW_BASE_BRANCH" => Some("release".to_string()),
            "SPECFLOW_MAX_PARALLEL" => Some("8".to_string()),
            _ => None,
        });
        assert_eq!(config.target_branch(), "release");
        assert_eq!(config.max_parallel, 8);
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let mut config = FlowConfig::default();
        config.parse_content("max_parallel=2").unwrap();
        config.apply_env(|key| match key {
            "SPECFLOW_MAX_PARALLEL" => Some("not-a-number".to_string()),
            "SPECFLOW_AUTOCOMMIT" => Some("perhaps".to_string()),
            _ => None,
        });
        // File values retained.
        assert_eq!(config.max_parallel, 2);
        assert!(config.autocommit_enabled());
        assert_eq!(config.autocommit, None);
    }

    #[test]
    fn max_parallel_has_a_floor_of_one() {
        let mut config = FlowConfig::default();
        config.parse_content("max_parallel=0").unwrap();
        assert_eq!(config.max_parallel, 1);
    }

    #[test]
    fn unknown_keys_are_tolerated() {
        let mut config = FlowConfig::default();
        config.parse_content("future_option=42").unwrap();
        assert_eq!(config.max_parallel, 4);
    }

    #[test]
    fn unquote_removes_matching_quotes() {
        assert_eq!(FlowConfig::unquote("\"hello\""), "hello");
        assert_eq!(FlowConfig::unquote("'world'"), "world");
        assert_eq!(FlowConfig::unquote("plain"), "plain");
    }

    #[test]
    fn worktree_subconfig_parses() {
        let mut config = FlowConfig::default();
        config
            .parse_content(
                r#"
worktree_base_dir=/tmp/worktrees
worktree_prefix=sf-
worktree_setup_script=./setup.sh
worktree_auto_setup=true
worktree_track_status=false
"#,
            )
            .unwrap();
        assert_eq!(config.worktree.base_dir, Some(PathBuf::from("/tmp/worktrees")));
        assert_eq!(config.worktree.prefix, "sf-");
        assert_eq!(config.worktree.setup_script.as_deref(), Some("./setup.sh"));
        assert!(config.worktree.auto_setup);
        assert!(!config.worktree.track_status);
    }
}
