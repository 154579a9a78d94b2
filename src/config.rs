use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::registry::AgentType;
use crate::{clog_debug, Error, Result};

/// Default global ceiling on concurrently executing tasks.
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;

/// Default per-task worker deadline (5 minutes).
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 300;

pub const DEFAULT_BRANCH_PREFIX: &str = "conductor/task/";

/// What the pool does when no registered worker type scores above zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy")]
pub enum FallbackPolicy {
    /// Route to a designated generic worker type. If that type is not in the
    /// registry the task keeps the type the decomposer gave it.
    Generic { agent_type: String },
    /// Always keep the task's declared type.
    Declared,
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self::Generic {
            agent_type: "general-purpose".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    pub worktree_dir: Option<String>,
    pub database_path: Option<String>,
    pub command: Option<String>,
    /// Branch tasks fork from and merge into. Defaults to the repo's current branch.
    pub main_branch: Option<String>,
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    #[serde(default)]
    pub fallback: FallbackPolicy,
    /// Worker type catalogue. Empty means the built-in catalogue.
    #[serde(default)]
    pub agents: Vec<AgentType>,
}

fn default_max_concurrency() -> usize {
    DEFAULT_MAX_CONCURRENCY
}

fn default_task_timeout_secs() -> u64 {
    DEFAULT_TASK_TIMEOUT_SECS
}

fn default_branch_prefix() -> String {
    DEFAULT_BRANCH_PREFIX.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            task_timeout_secs: DEFAULT_TASK_TIMEOUT_SECS,
            worktree_dir: None,
            database_path: None,
            command: None,
            main_branch: None,
            branch_prefix: default_branch_prefix(),
            fallback: FallbackPolicy::default(),
            agents: Vec::new(),
        }
    }
}

impl Config {
    pub fn conductor_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".conductor"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::conductor_dir()?.join("conductor.toml"))
    }

    pub fn effective_command(&self) -> &str {
        self.command.as_deref().unwrap_or("claude")
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    /// A ceiling of zero would deadlock the pool, so it is clamped to one.
    pub fn effective_concurrency(&self) -> usize {
        self.max_concurrency.max(1)
    }

    pub fn worktrees_dir(&self) -> Result<PathBuf> {
        match &self.worktree_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::conductor_dir()?.join("worktrees")),
        }
    }

    pub fn database_file(&self) -> Result<PathBuf> {
        match &self.database_path {
            Some(path) => Ok(expand_tilde(path)),
            None => Ok(Self::conductor_dir()?.join("conductor.db")),
        }
    }

    /// Load from ~/.conductor/conductor.toml, falling back to defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        clog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            clog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        clog_debug!(
            "Config loaded: max_concurrency={}, timeout={}s, agents={}",
            config.max_concurrency,
            config.task_timeout_secs,
            config.agents.len()
        );
        Ok(config)
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        let worktrees = self.worktrees_dir()?;
        if !worktrees.exists() {
            clog_debug!("Creating worktrees directory: {}", worktrees.display());
            fs::create_dir_all(&worktrees)?;
        }
        if let Some(parent) = self.database_file()?.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
