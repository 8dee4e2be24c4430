//! Configuration for the review loop.
//!
//! Plain `key=value` files with `#` comments and optional quotes.
//! Precedence: CLI flags > `--config` file > `<repo>/.revloop/config` > defaults.

use crate::types::StageRole;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Repo-relative location of the implicit config file.
pub const REPO_CONFIG_PATH: &str = ".revloop/config";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Loop and agent configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    // Budget
    pub max_iterations: u32,
    pub agent_timeout_sec: u64,

    // Prompt delivery
    /// Prompts longer than this many characters go through a temp file.
    pub prompt_threshold: usize,
    /// Directory for temp prompt files; system temp dir when unset.
    pub prompt_dir: Option<PathBuf>,

    // Agent CLI
    pub agent_bin: PathBuf,
    pub agent_args: Vec<String>,
    pub prompt_flag: String,
    pub prompt_file_flag: String,
    /// Per-role arguments appended after `agent_args`. Only the developer
    /// gets write tools by default.
    pub reviewer_args: Vec<String>,
    pub developer_args: Vec<String>,
    pub validator_args: Vec<String>,
    pub finalizer_args: Vec<String>,

    // Repository
    pub base_branch: String,
    /// Review only the target's last commit instead of everything since
    /// `base_branch`.
    pub latest: bool,
    pub result_branch_prefix: String,

    // Directories
    pub runs_dir: PathBuf,
    pub workspaces_dir: PathBuf,

    pub retain_failed_workspaces: bool,
    /// Run a finalizer-role agent before the summary is written.
    pub finalize_agent: bool,
}

/// Tools every role may use.
const READ_ONLY_TOOLS: &str = "Bash,Grep,Read,LS,Glob,Task";
/// Tools for the developer, who edits the checkout.
const WRITE_TOOLS: &str = "Bash,Grep,Read,LS,Glob,Task,Edit,MultiEdit,Write,TodoRead,TodoWrite";

fn allowed_tools(tools: &str) -> Vec<String> {
    vec!["--allowedTools".to_string(), tools.to_string()]
}

fn split_args(value: &str) -> Vec<String> {
    value.split_whitespace().map(str::to_string).collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            agent_timeout_sec: 600,
            prompt_threshold: 8000,
            prompt_dir: None,
            agent_bin: PathBuf::from("claude"),
            agent_args: vec!["--output-format".to_string(), "text".to_string()],
            prompt_flag: "-p".to_string(),
            prompt_file_flag: "-f".to_string(),
            reviewer_args: allowed_tools(READ_ONLY_TOOLS),
            developer_args: allowed_tools(WRITE_TOOLS),
            validator_args: allowed_tools(READ_ONLY_TOOLS),
            finalizer_args: allowed_tools(READ_ONLY_TOOLS),
            base_branch: "main".to_string(),
            latest: false,
            result_branch_prefix: "revloop/".to_string(),
            runs_dir: PathBuf::from("tmp/revloop"),
            workspaces_dir: std::env::temp_dir().join("revloop-workspaces"),
            retain_failed_workspaces: false,
            finalize_agent: false,
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content, &path.display().to_string())
    }

    /// Merge `<repo>/.revloop/config` if it exists. Returns whether it did.
    pub fn load_repo_file(&mut self, repo: &Path) -> Result<bool> {
        let path = repo.join(REPO_CONFIG_PATH);
        if !path.is_file() {
            return Ok(false);
        }
        self.load_file(&path)?;
        Ok(true)
    }

    /// Parse config content (key=value format).
    pub fn parse_content(&mut self, content: &str, source: &str) -> Result<()> {
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());
            self.apply_value(key, &value, source)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    fn apply_value(&mut self, key: &str, value: &str, source: &str) -> Result<()> {
        match key {
            "max_iterations" => self.max_iterations = Self::parse_int(key, value)?,
            "agent_timeout_sec" => self.agent_timeout_sec = Self::parse_int(key, value)?,
            "prompt_threshold" => self.prompt_threshold = Self::parse_int(key, value)?,
            "prompt_dir" => {
                self.prompt_dir = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                }
            }
            "agent_bin" => self.agent_bin = PathBuf::from(value),
            "agent_args" => self.agent_args = split_args(value),
            "reviewer_args" => self.reviewer_args = split_args(value),
            "developer_args" => self.developer_args = split_args(value),
            "validator_args" => self.validator_args = split_args(value),
            "finalizer_args" => self.finalizer_args = split_args(value),
            "prompt_flag" => self.prompt_flag = value.to_string(),
            "prompt_file_flag" => self.prompt_file_flag = value.to_string(),
            "base_branch" => self.base_branch = value.to_string(),
            "latest" => self.latest = Self::parse_bool(key, value)?,
            "result_branch_prefix" => self.result_branch_prefix = value.to_string(),
            "runs_dir" => self.runs_dir = PathBuf::from(value),
            "workspaces_dir" => self.workspaces_dir = PathBuf::from(value),
            "retain_failed_workspaces" => {
                self.retain_failed_workspaces = Self::parse_bool(key, value)?;
            }
            "finalize_agent" => self.finalize_agent = Self::parse_bool(key, value)?,
            _ => {
                tracing::warn!(key, source, "unknown config key");
            }
        }
        Ok(())
    }

    /// Arguments that apply only to `role`.
    pub fn role_args(&self, role: StageRole) -> &[String] {
        match role {
            StageRole::Reviewer => &self.reviewer_args,
            StageRole::Developer => &self.developer_args,
            StageRole::Validator => &self.validator_args,
            StageRole::Finalizer => &self.finalizer_args,
        }
    }

    fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    fn parse_bool(key: &str, value: &str) -> Result<bool> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// Reject values the loop cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(ConfigError::Invalid(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        if self.agent_timeout_sec == 0 {
            return Err(ConfigError::Invalid(
                "agent_timeout_sec must be greater than zero".to_string(),
            ));
        }
        if self.prompt_threshold == 0 {
            return Err(ConfigError::Invalid(
                "prompt_threshold must be greater than zero".to_string(),
            ));
        }
        if self.prompt_flag.is_empty() || self.prompt_file_flag.is_empty() {
            return Err(ConfigError::Invalid(
                "prompt_flag and prompt_file_flag must not be empty".to_string(),
            ));
        }
        if self.agent_bin.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("agent_bin must not be empty".to_string()));
        }
        Ok(())
    }

    /// Resolve relative directories against the base repository.
    pub fn resolve_paths(&mut self, repo_root: &Path) {
        if self.runs_dir.is_relative() {
            self.runs_dir = repo_root.join(&self.runs_dir);
        }
        if self.workspaces_dir.is_relative() {
            self.workspaces_dir = repo_root.join(&self.workspaces_dir);
        }
        if let Some(ref prompt_dir) = self.prompt_dir {
            if prompt_dir.is_relative() {
                self.prompt_dir = Some(repo_root.join(prompt_dir));
            }
        }
    }
}
