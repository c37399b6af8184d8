//! Configuration file loading for execsock
//!
//! Handles loading and parsing configuration files using the config crate.

use std::path::Path;
use std::time::Duration;

use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use regex::Regex;

use crate::config::{Config, ConfigError, ENV_PREFIX, EXAMPLE_CONFIG};
use crate::workspace::is_safe_name;

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config = ConfigBuilder::builder()
            .add_source(File::from(path))
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config = ConfigBuilder::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration for the server
    ///
    /// Starts from the given file (or the embedded example config) and
    /// layers `EXECSOCK_*` environment variables on top.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let builder = ConfigBuilder::builder();
        let builder = match path {
            Some(path) => builder.add_source(File::from(path)),
            None => builder.add_source(File::from_str(EXAMPLE_CONFIG, FileFormat::Toml)),
        };
        let config = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    fn validate(&self) -> Result<(), ConfigError> {
        check_timeout("run_timeout_secs", self.run_timeout_secs)?;
        check_timeout("compile_timeout_secs", self.compile_timeout_secs)?;
        if self.max_sessions == Some(0) {
            return Err(ConfigError::Invalid(
                "max_sessions must be at least 1".to_owned(),
            ));
        }

        for (id, lang) in &self.languages {
            if lang.name.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "language '{id}' has empty name"
                )));
            }
            if lang.extension.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "language '{id}' has empty extension"
                )));
            }
            if lang.run.command.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "language '{id}' has empty run command"
                )));
            }
            if let Some(ref compile) = lang.compile
                && compile.command.is_empty()
            {
                return Err(ConfigError::Invalid(format!(
                    "language '{id}' has empty compile command"
                )));
            }
            if !is_safe_name(&lang.default_name) {
                return Err(ConfigError::Invalid(format!(
                    "language '{id}' has unsafe default name '{}'",
                    lang.default_name
                )));
            }
            for pattern in &lang.name_patterns {
                let regex = Regex::new(pattern).map_err(|e| {
                    ConfigError::Invalid(format!("language '{id}' has invalid name pattern: {e}"))
                })?;
                if regex.captures_len() < 2 {
                    return Err(ConfigError::Invalid(format!(
                        "language '{id}' name pattern '{pattern}' has no capture group"
                    )));
                }
            }
        }

        if !self.languages.is_empty() && !self.languages.contains_key(&self.default_language) {
            return Err(ConfigError::Invalid(format!(
                "default language '{}' is not configured",
                self.default_language
            )));
        }

        Ok(())
    }
}

/// Timeouts must be positive and fit in a [`Duration`]
fn check_timeout(key: &str, secs: f64) -> Result<(), ConfigError> {
    match Duration::try_from_secs_f64(secs) {
        Ok(timeout) if !timeout.is_zero() => Ok(()),
        _ => Err(ConfigError::Invalid(format!(
            "{key} must be a positive number of seconds, got {secs}"
        ))),
    }
}
