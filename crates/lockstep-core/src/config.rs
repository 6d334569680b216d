//! Project configuration loaded from `.lockstep/config.toml`.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, StateError};

/// Location of the project config file relative to the working tree root.
pub const CONFIG_PATH: &str = ".lockstep/config.toml";

/// Environment override for the git binary.
pub const GIT_BINARY_ENV: &str = "LOCKSTEP_GIT";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub layout: LayoutConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub migration: MigrationConfig,
    #[serde(default)]
    pub git: GitConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store file path, relative to the working tree root.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    #[serde(default = "default_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub lock_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            busy_timeout_ms: default_timeout_ms(),
            lock_timeout_ms: default_timeout_ms(),
        }
    }
}

impl StoreConfig {
    #[must_use]
    pub const fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// Top-level directories of the artifact tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutConfig {
    #[serde(default = "default_epics_dir")]
    pub epics: String,
    #[serde(default = "default_stories_dir")]
    pub stories: String,
    #[serde(default = "default_ceremonies_dir")]
    pub ceremonies: String,
    #[serde(default = "default_extension")]
    pub extension: String,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            epics: default_epics_dir(),
            stories: default_stories_dir(),
            ceremonies: default_ceremonies_dir(),
            extension: default_extension(),
        }
    }
}

/// Caps applied to each sub-list of the fast context read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default = "default_action_item_cap")]
    pub action_items: u32,
    #[serde(default = "default_learning_cap")]
    pub learnings: u32,
    #[serde(default = "default_ceremony_cap")]
    pub ceremonies: u32,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            action_items: default_action_item_cap(),
            learnings: default_learning_cap(),
            ceremonies: default_ceremony_cap(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Story artifacts untouched for at least this many days are inferred done.
    #[serde(default = "default_stale_after_days")]
    pub stale_after_days: u32,
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            stale_after_days: default_stale_after_days(),
            branch_prefix: default_branch_prefix(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitConfig {
    #[serde(default = "default_git_binary")]
    pub binary: String,
    #[serde(default)]
    pub author_name: Option<String>,
    #[serde(default)]
    pub author_email: Option<String>,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            binary: default_git_binary(),
            author_name: None,
            author_email: None,
        }
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from(".lockstep/state.sqlite3")
}

const fn default_timeout_ms() -> u64 {
    5_000
}

fn default_epics_dir() -> String {
    "epics".to_string()
}

fn default_stories_dir() -> String {
    "stories".to_string()
}

fn default_ceremonies_dir() -> String {
    "ceremonies".to_string()
}

fn default_extension() -> String {
    "md".to_string()
}

const fn default_action_item_cap() -> u32 {
    20
}

const fn default_learning_cap() -> u32 {
    10
}

const fn default_ceremony_cap() -> u32 {
    5
}

const fn default_queue_capacity() -> usize {
    64
}

const fn default_stale_after_days() -> u32 {
    30
}

fn default_branch_prefix() -> String {
    "lockstep/migrate".to_string()
}

fn default_git_binary() -> String {
    "git".to_string()
}

/// Load the project config for `project_root`, falling back to defaults when
/// the file is absent. `LOCKSTEP_GIT` overrides the configured git binary.
///
/// # Errors
///
/// Returns [`StateError::Config`] if the file exists but cannot be read or
/// parsed.
pub fn load_project_config(project_root: &Path) -> Result<ProjectConfig> {
    let path = project_root.join(CONFIG_PATH);
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(&path).map_err(|err| StateError::Config {
            path: path.clone(),
            message: err.to_string(),
        })?;
        parse_config(&path, &content)?
    } else {
        ProjectConfig::default()
    };

    if let Ok(binary) = env::var(GIT_BINARY_ENV) {
        if !binary.trim().is_empty() {
            config.git.binary = binary;
        }
    }

    Ok(config)
}

fn parse_config(path: &Path, content: &str) -> Result<ProjectConfig> {
    let config = toml::from_str::<ProjectConfig>(content).map_err(|err| StateError::Config {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;

    if config.store.path.is_absolute() {
        return Err(StateError::Config {
            path: path.to_path_buf(),
            message: "store.path must be relative to the working tree".to_string(),
        });
    }
    if config.queue.capacity == 0 {
        return Err(StateError::Config {
            path: path.to_path_buf(),
            message: "queue.capacity must be > 0".to_string(),
        });
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ProjectConfig::default();
        assert_eq!(config.store.path, PathBuf::from(".lockstep/state.sqlite3"));
        assert_eq!(config.context.action_items, 20);
        assert_eq!(config.context.learnings, 10);
        assert_eq!(config.context.ceremonies, 5);
        assert_eq!(config.migration.stale_after_days, 30);
        assert_eq!(config.layout.stories, "stories");
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = load_project_config(dir.path()).expect("load");
        assert_eq!(config.store, StoreConfig::default());
    }

    #[test]
    fn partial_file_overrides_only_given_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join(".lockstep")).expect("mkdir");
        std::fs::write(
            dir.path().join(CONFIG_PATH),
            "[context]\naction_items = 3\n\n[migration]\nstale_after_days = 7\n",
        )
        .expect("write config");

        let config = load_project_config(dir.path()).expect("load");
        assert_eq!(config.context.action_items, 3);
        assert_eq!(config.context.learnings, 10);
        assert_eq!(config.migration.stale_after_days, 7);
        assert_eq!(config.migration.branch_prefix, "lockstep/migrate");
    }

    #[test]
    fn malformed_file_reports_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join(".lockstep")).expect("mkdir");
        std::fs::write(dir.path().join(CONFIG_PATH), "[context\n").expect("write config");

        let err = load_project_config(dir.path()).unwrap_err();
        assert!(matches!(err, StateError::Config { ref path, .. } if path.ends_with("config.toml")));
    }

    #[test]
    fn zero_queue_capacity_is_rejected() {
        let err = parse_config(Path::new("config.toml"), "[queue]\ncapacity = 0\n").unwrap_err();
        assert!(err.to_string().contains("queue.capacity"));
    }
}
