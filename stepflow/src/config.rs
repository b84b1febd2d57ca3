//! Configuration loading
//!
//! Settings come from `.stepflow.toml`, found by walking up from the working
//! directory, with `<config_dir>/stepflow/config.toml` as the global fallback.
//! Every field has a default so an empty or missing file is valid.

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::Deserialize;

/// Project-level config file name
pub const CONFIG_FILE: &str = ".stepflow.toml";

/// Find a config file by walking up the directory tree from `start`.
///
/// Search order:
/// 1. `start` and its parent directories (walking up to root)
/// 2. Global config at ~/.config/stepflow/config.toml
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let candidate = current.join(CONFIG_FILE);
        if candidate.exists() {
            return Some(candidate);
        }

        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => break, // Reached filesystem root
        }
    }

    // Fallback: Check global config
    let global_path = dirs::config_dir()?.join("stepflow").join("config.toml");
    global_path.exists().then_some(global_path)
}

/// Top-level configuration (from .stepflow.toml)
#[derive(Debug, Default, Deserialize)]
pub struct StepflowConfig {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub workflows: WorkflowsConfig,
}

/// Agent transport section
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_ollama_url")]
    pub url: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub system_prompt: Option<String>,
}

/// Executor section
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Timeout for bash/python steps without their own `timeout`
    #[serde(default = "default_step_timeout")]
    pub step_timeout_secs: u64,
    /// Upper bound on concurrently running parallel-group members
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default = "default_python")]
    pub python: String,
    /// Root of run directories; relative paths resolve against the working directory
    #[serde(default = "default_runs_dir")]
    pub runs_dir: PathBuf,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

/// Workflow discovery section
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkflowsConfig {
    /// Extra definition directories, searched after the project directory
    #[serde(default)]
    pub dirs: Vec<PathBuf>,
}

// Default value functions
fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_model() -> String {
    "qwen3-coder:30b".to_string()
}

fn default_step_timeout() -> u64 {
    600
}

fn default_max_parallel() -> usize {
    4
}

fn default_shell() -> String {
    "bash".to_string()
}

fn default_python() -> String {
    "python3".to_string()
}

fn default_runs_dir() -> PathBuf {
    PathBuf::from(".stepflow").join("runs")
}

fn default_max_output_bytes() -> usize {
    crate::runner::DEFAULT_MAX_OUTPUT_BYTES
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            url: default_ollama_url(),
            model: default_model(),
            system_prompt: None,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            step_timeout_secs: default_step_timeout(),
            max_parallel: default_max_parallel(),
            shell: default_shell(),
            python: default_python(),
            runs_dir: default_runs_dir(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

impl StepflowConfig {
    /// Load config for the current directory
    ///
    /// Search order:
    /// 1. Walk up directory tree from cwd looking for .stepflow.toml
    /// 2. Check ~/.config/stepflow/config.toml (global fallback)
    /// 3. Fall back to defaults
    pub fn load() -> Result<Self> {
        let cwd = std::env::current_dir()?;
        Self::load_from_dir(&cwd)
    }

    pub fn load_from_dir(start: &Path) -> Result<Self> {
        if let Some(config_path) = find_config_file(start) {
            tracing::debug!("Loading config from: {}", config_path.display());
            return Self::load_from_path(&config_path);
        }

        tracing::debug!("No {} found, using defaults", CONFIG_FILE);
        Ok(Self::default())
    }

    /// Load from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: StepflowConfig = toml::from_str(&content)?;
        Ok(config)
    }
}
