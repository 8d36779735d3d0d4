//! Application configuration, loaded once from an optional TOML file.
//!
//! ```toml
//! reasoner_budget_ms = 30000
//!
//! [llm]
//! base_url = "http://localhost:11434/v1"
//! model = "qwen2.5:14b"
//!
//! [matcher]
//! window = 2
//!
//! [batch]
//! tier = "C2"
//! runs = 20
//!
//! [prompt]
//! max_entities = 80
//! ```
//!
//! Every section and every field is optional.

use std::path::Path;
use std::time::Duration;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::batch::BatchConfig;
use crate::causal::MatcherConfig;
use crate::hypotheses::PromptLimits;
use crate::llm::LlmConfig;
use crate::runtime::ExperimentConfig;

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read config: {path}")]
    #[diagnostic(
        code(causa::config::read),
        help("Ensure the config file exists and is readable.")
    )]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {path}: {message}")]
    #[diagnostic(
        code(causa::config::parse),
        help("Check the TOML syntax. Known sections are [llm], [matcher], [batch] and [prompt].")
    )]
    Parse { path: String, message: String },

    #[error("failed to write config: {path}")]
    #[diagnostic(
        code(causa::config::write),
        help("Ensure you have write permissions to the target directory.")
    )]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Everything a command needs, passed by reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub matcher: MatcherConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub prompt: PromptLimits,
    /// Budget for one reasoning pass.
    #[serde(default = "default_reasoner_budget_ms")]
    pub reasoner_budget_ms: u64,
}

fn default_reasoner_budget_ms() -> u64 {
    30_000
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            matcher: MatcherConfig::default(),
            batch: BatchConfig::default(),
            prompt: PromptLimits::default(),
            reasoner_budget_ms: default_reasoner_budget_ms(),
        }
    }
}

impl AppConfig {
    /// Parse TOML text.
    pub fn parse(text: &str, origin: &str) -> ConfigResult<Self> {
        toml::from_str(text).map_err(|e| ConfigError::Parse {
            path: origin.to_string(),
            message: e.to_string(),
        })
    }

    /// Load from a TOML file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::parse(&content, &path.display().to_string())
    }

    /// Load `path` if given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> ConfigResult<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    /// Save to a TOML file. The API key is never written.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
        std::fs::write(path, content).map_err(|e| ConfigError::Write {
            path: path.display().to_string(),
            source: e,
        })
    }

    pub fn experiment(&self) -> ExperimentConfig {
        ExperimentConfig {
            matcher: self.matcher.clone(),
            reasoner_budget: Duration::from_millis(self.reasoner_budget_ms),
        }
    }
}
