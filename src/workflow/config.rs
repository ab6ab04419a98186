//! Engine configuration
//!
//! Loaded from `engine.yaml`. Every field is optional:
//!
//! ```yaml
//! workflows_dir: workflows
//! max_loop_iterations: 100
//! max_nesting_depth: 16
//! default_step_timeout: 5m
//!
//! git:
//!   repositories_root: /srv/repos
//!
//! azure_devops:
//!   organization_url: https://dev.azure.com/contoso
//!   project: Platform
//!   token_env: AZURE_DEVOPS_PAT
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::duration::StepDuration;

/// File name the registry skips when scanning a workflow tree
pub const CONFIG_FILE_NAME: &str = "engine.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error in {file}: {error}")]
    Yaml {
        file: String,
        error: serde_yaml::Error,
    },
}

/// Settings for the git command-line collaborator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GitConfig {
    /// Directory holding one checkout per repository name
    #[serde(default)]
    pub repositories_root: Option<PathBuf>,

    /// Explicit git binary; looked up on PATH when absent
    #[serde(default)]
    pub binary: Option<PathBuf>,
}

/// Settings for the Azure DevOps work item collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AzureDevopsConfig {
    pub organization_url: String,
    pub project: String,

    /// Environment variable holding the personal access token
    #[serde(default = "default_token_env")]
    pub token_env: String,

    #[serde(default = "default_api_version")]
    pub api_version: String,
}

fn default_token_env() -> String {
    "AZURE_DEVOPS_PAT".to_string()
}

fn default_api_version() -> String {
    "7.0".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_workflows_dir")]
    pub workflows_dir: PathBuf,

    /// Bound for while-loops that do not declare `maxIterations`
    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: u32,

    /// Bound on nested `execute-workflow` depth
    #[serde(default = "default_max_nesting_depth")]
    pub max_nesting_depth: usize,

    /// Timeout for external actions without a step-level `timeout`
    #[serde(default = "default_step_timeout")]
    pub default_step_timeout: StepDuration,

    #[serde(default)]
    pub git: Option<GitConfig>,

    #[serde(default)]
    pub azure_devops: Option<AzureDevopsConfig>,
}

fn default_workflows_dir() -> PathBuf {
    PathBuf::from("workflows")
}

fn default_max_loop_iterations() -> u32 {
    100
}

fn default_max_nesting_depth() -> usize {
    16
}

fn default_step_timeout() -> StepDuration {
    StepDuration(Duration::from_secs(300))
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workflows_dir: default_workflows_dir(),
            max_loop_iterations: default_max_loop_iterations(),
            max_nesting_depth: default_max_nesting_depth(),
            default_step_timeout: default_step_timeout(),
            git: None,
            azure_devops: None,
        }
    }
}

impl EngineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&content).map_err(|e| ConfigError::Yaml {
            file: path.display().to_string(),
            error: e,
        })
    }

    /// Load `engine.yaml` from a directory, falling back to defaults
    pub fn load_from_dir(dir: &Path) -> Result<Self, ConfigError> {
        let path = dir.join(CONFIG_FILE_NAME);
        if path.is_file() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}
