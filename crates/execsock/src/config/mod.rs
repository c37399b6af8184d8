use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use crate::config::language::{
    CompileConfig, DEFAULT_ENTRY_NAME, FileExtension, Language, RunConfig,
};

pub mod language;
mod loader;

/// Example configuration embedded at compile time.
///
/// Library users can access this to generate a starter config file.
pub const EXAMPLE_CONFIG: &str = include_str!("../../execsock.example.toml");

/// Prefix for environment variable overrides (e.g. `EXECSOCK_LISTEN`)
pub const ENV_PREFIX: &str = "EXECSOCK";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid characters in file extension")]
    InvalidFileExtChars,

    #[error("failed to parse config: {0}")]
    Parse(#[from] config::ConfigError),

    #[error("language '{0}' not found in configuration")]
    LanguageNotFound(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// How output lines are classified as input prompts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PromptDetection {
    /// Lines ending in `:`, `?` or whitespace are prompts
    #[default]
    Heuristic,

    /// Never report prompts
    Disabled,
}

/// Config for execsock
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Address the server listens on
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Root of the scratch directory. Every session gets its own
    /// subdirectory beneath it.
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,

    /// Wall-clock budget for the run step, in seconds
    #[serde(default = "default_run_timeout")]
    pub run_timeout_secs: f64,

    /// Wall-clock budget for the compile step, in seconds
    #[serde(default = "default_compile_timeout")]
    pub compile_timeout_secs: f64,

    /// Maximum number of concurrently open sessions (unlimited if unset)
    #[serde(default)]
    pub max_sessions: Option<usize>,

    /// Prompt detection strategy
    #[serde(default)]
    pub prompt_detection: PromptDetection,

    /// Language used when an execute request does not name one
    #[serde(default = "default_language_id")]
    pub default_language: String,

    /// Language configurations keyed by language ID
    #[serde(default)]
    pub languages: HashMap<String, Language>,
}

impl Config {
    /// Create a new config with embedded default languages
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty config with no languages
    pub fn empty() -> Self {
        Self {
            listen: default_listen(),
            scratch_dir: default_scratch_dir(),
            run_timeout_secs: default_run_timeout(),
            compile_timeout_secs: default_compile_timeout(),
            max_sessions: None,
            prompt_detection: PromptDetection::default(),
            default_language: default_language_id(),
            languages: HashMap::new(),
        }
    }

    /// Get a language by ID
    pub fn get_language(&self, id: &str) -> Result<&Language, ConfigError> {
        self.languages
            .get(id)
            .ok_or_else(|| ConfigError::LanguageNotFound(id.to_string()))
    }

    /// Get the requested language, or the default one when none is named
    pub fn resolve_language(&self, id: Option<&str>) -> Result<&Language, ConfigError> {
        self.get_language(id.unwrap_or(&self.default_language))
    }

    /// Run step budget
    ///
    /// Out-of-range values (rejected when loading) saturate.
    pub fn run_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.run_timeout_secs).unwrap_or(Duration::MAX)
    }

    /// Compile step budget
    pub fn compile_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.compile_timeout_secs).unwrap_or(Duration::MAX)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::parse_toml(EXAMPLE_CONFIG).expect("embedded default config should be valid")
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_owned()
}

fn default_scratch_dir() -> PathBuf {
    std::env::temp_dir().join("execsock")
}

fn default_run_timeout() -> f64 {
    30.0
}

fn default_compile_timeout() -> f64 {
    60.0
}

fn default_language_id() -> String {
    "java".to_owned()
}
