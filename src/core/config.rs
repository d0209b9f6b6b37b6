use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::error::GenerationError;
use crate::services::image::ImageConfig;
use crate::services::llm::LlmConfig;
use crate::services::pipeline::ProjectConfig;
use crate::services::workflow::PipelineConfig;

pub const CONFIG_FILE: &str = "config.yml";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_scripts")]
    pub scripts_folder: String,

    #[serde(default)]
    pub unattended: bool,

    pub llm: LlmConfig,

    #[serde(default)]
    pub image: ImageConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub project: Option<ProjectConfig>,
}

fn default_scripts() -> String {
    "scripts".to_string()
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!("{} not found. Please create one.", path.display());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml_ng::from_str(content)?)
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.scripts_folder)?;
        Ok(())
    }

    pub fn scripts_root(&self) -> PathBuf {
        PathBuf::from(&self.scripts_folder)
    }

    /// Checks credentials and endpoints before any pipeline work begins.
    pub fn validate(&self) -> Result<(), GenerationError> {
        if self.scripts_folder.trim().is_empty() {
            return Err(GenerationError::Configuration(
                "scripts_folder must not be empty".to_string(),
            ));
        }
        self.llm.validate()?;
        self.image.validate()?;
        if self.unattended && self.project.is_none() {
            return Err(GenerationError::Configuration(
                "unattended mode requires a 'project' section".to_string(),
            ));
        }
        Ok(())
    }
}

/// Prefers the configured value and falls back to the named environment variable.
pub fn resolve_secret(configured: Option<&str>, env_var: &str) -> Option<String> {
    configured
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .or_else(|| std::env::var(env_var).ok().filter(|v| !v.trim().is_empty()))
}

pub fn require_secret(
    configured: Option<&str>,
    env_var: &str,
    what: &str,
) -> Result<String, GenerationError> {
    resolve_secret(configured, env_var).ok_or_else(|| {
        GenerationError::Configuration(format!(
            "{} API key missing: set it in {} or export {}",
            what, CONFIG_FILE, env_var
        ))
    })
}

pub fn check_url(field: &str, value: &str) -> Result<(), GenerationError> {
    url::Url::parse(value)
        .map(|_| ())
        .map_err(|e| GenerationError::Configuration(format!("{} '{}' is not a valid URL: {}", field, value, e)))
}
