//! Agent and store configuration (TOML).
//!
//! Files are intended to be edited by humans. Missing fields default to values
//! that work for a single local agent and store; a missing file means "all
//! defaults".

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::core::ledger::DEFAULT_MAX_ATTEMPTS;
use crate::core::types::{DEFAULT_BASE_BRANCH, DEFAULT_MAX_ITERATIONS};
use crate::io::git::Identity;
use crate::io::http::RetryPolicy;

/// Execution agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub bind: String,
    pub port: u16,

    /// Bearer token required on `/execute`, `/status` and `/cancel` when set.
    pub auth_token: Option<String>,

    /// Root for shared clones, worktrees and prompt files.
    pub workspace_root: PathBuf,

    /// Used when a request does not specify `maxIterations`.
    pub default_max_iterations: u32,

    /// Keep at most this many bytes of execution log, in memory and in the result.
    pub log_limit_bytes: usize,

    /// Finished executions stay queryable through `/status` for this long.
    pub execution_retention_secs: u64,

    /// Worktrees retained after a quality-gate failure are reaped after this long.
    pub worktree_retention_secs: u64,

    /// How much of the progress log (in characters) reaches the prompt.
    pub progress_tail_chars: usize,

    /// `Co-Authored-By` trailer value; omitted when empty.
    pub co_author: Option<String>,

    pub commit_author: CommitAuthor,
    pub agent: AgentCommandConfig,
    pub quality: QualityConfig,
    pub callback_retry: RetryPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CommitAuthor {
    pub name: String,
    pub email: String,
}

impl Default for CommitAuthor {
    fn default() -> Self {
        Self {
            name: "autoship-bot".to_string(),
            email: "autoship-bot@users.noreply.github.com".to_string(),
        }
    }
}

impl From<&CommitAuthor> for Identity {
    fn from(author: &CommitAuthor) -> Self {
        Identity {
            name: author.name.clone(),
            email: author.email.clone(),
        }
    }
}

/// How to launch the coding agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentCommandConfig {
    /// Program and leading arguments; the prompt is piped on stdin.
    pub command: Vec<String>,
    /// Flag introducing the capability allow-list (omitted when the list is empty).
    pub allowed_tools_flag: String,
    pub allowed_tools: Vec<String>,
    /// Hard wall-clock budget for the whole agent run, in seconds.
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for AgentCommandConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "claude".to_string(),
                "--print".to_string(),
                "--dangerously-skip-permissions".to_string(),
            ],
            allowed_tools_flag: "--allowedTools".to_string(),
            allowed_tools: ["Read", "Write", "Edit", "Glob", "Grep", "Bash"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            timeout_secs: 30 * 60,
            output_limit_bytes: 1_000_000,
        }
    }
}

/// Quality gate commands and limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QualityConfig {
    /// Package manager used for `install` and `run <script>`.
    pub package_manager: String,
    /// Command used for typechecking when no `typecheck` script exists.
    pub typecheck_fallback: Vec<String>,
    pub check_timeout_secs: u64,
    pub output_limit_bytes: usize,
    /// Characters of failing output kept in each error message.
    pub error_excerpt_chars: usize,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            package_manager: "npm".to_string(),
            typecheck_fallback: vec![
                "npx".to_string(),
                "tsc".to_string(),
                "--noEmit".to_string(),
            ],
            check_timeout_secs: 10 * 60,
            output_limit_bytes: 200_000,
            error_excerpt_chars: 2_000,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8787,
            auth_token: None,
            workspace_root: PathBuf::from(".autoship/agent"),
            default_max_iterations: DEFAULT_MAX_ITERATIONS,
            log_limit_bytes: 100_000,
            execution_retention_secs: 60 * 60,
            worktree_retention_secs: 24 * 60 * 60,
            progress_tail_chars: 2_000,
            co_author: Some("autoship-bot <autoship-bot@users.noreply.github.com>".to_string()),
            commit_author: CommitAuthor::default(),
            agent: AgentCommandConfig::default(),
            quality: QualityConfig::default(),
            callback_retry: RetryPolicy::default(),
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.agent.command.is_empty() || self.agent.command[0].trim().is_empty() {
            return Err(anyhow!("agent.command must be a non-empty array"));
        }
        if self.agent.timeout_secs == 0 {
            return Err(anyhow!("agent.timeout_secs must be > 0"));
        }
        if self.agent.output_limit_bytes == 0 {
            return Err(anyhow!("agent.output_limit_bytes must be > 0"));
        }
        if self.quality.check_timeout_secs == 0 {
            return Err(anyhow!("quality.check_timeout_secs must be > 0"));
        }
        if self.quality.package_manager.trim().is_empty() {
            return Err(anyhow!("quality.package_manager must not be empty"));
        }
        if self.default_max_iterations == 0 {
            return Err(anyhow!("default_max_iterations must be > 0"));
        }
        if self.log_limit_bytes == 0 {
            return Err(anyhow!("log_limit_bytes must be > 0"));
        }
        if self.commit_author.name.trim().is_empty() || self.commit_author.email.trim().is_empty()
        {
            return Err(anyhow!("commit_author.name and commit_author.email are required"));
        }
        self.callback_retry.validate()
    }
}

/// Task state store configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    pub bind: String,
    pub port: u16,

    /// Ledger documents and progress logs live under `<data_dir>/<project>/`.
    pub data_dir: PathBuf,

    /// Externally reachable base URL of this store (used in callback URLs).
    pub public_url: String,

    /// Base URL of the execution agent.
    pub agent_url: String,
    pub agent_token: Option<String>,

    /// Delay between arming the dispatch timer and its firing.
    pub dispatch_delay_ms: u64,

    /// In-flight dispatches without a callback are released after this long.
    pub dispatch_timeout_secs: u64,

    /// Maximum number of tasks in flight per project.
    pub max_in_flight: usize,

    pub max_attempts: u32,
    pub dispatch_retry: RetryPolicy,
    pub projects: BTreeMap<String, ProjectConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProjectConfig {
    pub repo_url: String,
    pub base_branch: String,
    /// Falls back to the agent's default when unset.
    pub max_iterations: Option<u32>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            repo_url: String::new(),
            base_branch: DEFAULT_BASE_BRANCH.to_string(),
            max_iterations: None,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8788,
            data_dir: PathBuf::from(".autoship/store"),
            public_url: "http://127.0.0.1:8788".to_string(),
            agent_url: "http://127.0.0.1:8787".to_string(),
            agent_token: None,
            dispatch_delay_ms: 1_000,
            dispatch_timeout_secs: 60 * 60,
            max_in_flight: 1,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            dispatch_retry: RetryPolicy::default(),
            projects: BTreeMap::new(),
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_in_flight == 0 {
            return Err(anyhow!("max_in_flight must be > 0"));
        }
        if self.max_attempts == 0 {
            return Err(anyhow!("max_attempts must be > 0"));
        }
        if self.dispatch_timeout_secs == 0 {
            return Err(anyhow!("dispatch_timeout_secs must be > 0"));
        }
        for (name, project) in &self.projects {
            if project.repo_url.trim().is_empty() {
                return Err(anyhow!("projects.{name}.repo_url must not be empty"));
            }
            if project.base_branch.trim().is_empty() {
                return Err(anyhow!("projects.{name}.base_branch must not be empty"));
            }
        }
        self.dispatch_retry.validate()
    }

    /// Callback URL the agent should report to for `project`.
    pub fn callback_url(&self, project: &str) -> String {
        format!(
            "{}/projects/{project}/complete",
            self.public_url.trim_end_matches('/')
        )
    }
}

/// Load agent config from a TOML file.
///
/// If the file is missing, returns `AgentConfig::default()`.
pub fn load_agent_config(path: &Path) -> Result<AgentConfig> {
    let cfg: AgentConfig = load_toml(path)?;
    cfg.validate()?;
    Ok(cfg)
}

/// Load store config from a TOML file.
///
/// If the file is missing, returns `StoreConfig::default()`.
pub fn load_store_config(path: &Path) -> Result<StoreConfig> {
    let cfg: StoreConfig = load_toml(path)?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write agent config to disk (temp file + rename).
pub fn write_agent_config(path: &Path, cfg: &AgentConfig) -> Result<()> {
    cfg.validate()?;
    write_toml(path, cfg)
}

/// Atomically write store config to disk (temp file + rename).
pub fn write_store_config(path: &Path, cfg: &StoreConfig) -> Result<()> {
    cfg.validate()?;
    write_toml(path, cfg)
}

fn load_toml<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

fn write_toml<T: Serialize>(path: &Path, cfg: &T) -> Result<()> {
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    crate::io::ledger_store::write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_agent_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, AgentConfig::default());
        assert_eq!(cfg.agent.timeout_secs, 1800);
        let store = load_store_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(store.max_in_flight, 1);
        assert_eq!(store.max_attempts, 3);
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("store.toml");
        let mut cfg = StoreConfig::default();
        cfg.projects.insert(
            "web".to_string(),
            ProjectConfig {
                repo_url: "https://example.com/acme/web.git".to_string(),
                ..ProjectConfig::default()
            },
        );
        write_store_config(&path, &cfg).expect("write");
        assert_eq!(load_store_config(&path).expect("load"), cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("agent.toml");
        fs::write(
            &path,
            "port = 9000\n[commit_author]\nname = \"ci\"\nemail = \"ci@example.com\"\n",
        )
        .expect("write");
        let cfg = load_agent_config(&path).expect("load");
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.commit_author.name, "ci");
        assert_eq!(cfg.quality, QualityConfig::default());
    }

    #[test]
    fn validate_rejects_empty_agent_command() {
        let cfg = AgentConfig {
            agent: AgentCommandConfig {
                command: Vec::new(),
                ..AgentCommandConfig::default()
            },
            ..AgentConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn callback_url_is_project_scoped() {
        let cfg = StoreConfig {
            public_url: "http://store:8788/".to_string(),
            ..StoreConfig::default()
        };
        assert_eq!(
            cfg.callback_url("web"),
            "http://store:8788/projects/web/complete"
        );
    }
}
