use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize, de};

use crate::config::ConfigError;
use crate::workspace::derive_name;

const INVALID_FILE_EXT_CHARS: [char; 2] = ['/', '.'];

/// Fallback entry-point name when none can be derived from the source
pub const DEFAULT_ENTRY_NAME: &str = "Main";

/// Configuration for a programming language
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Language {
    /// Human-readable name for the language (e.g., "Java")
    pub name: String,

    /// File extension
    pub extension: FileExtension,

    /// Regexes used to derive the entry-point name from the source text.
    ///
    /// Tried in order; the first capture group of the first match wins.
    #[serde(default)]
    pub name_patterns: Vec<String>,

    /// Entry-point name used when no pattern matches
    #[serde(default = "default_entry_name")]
    pub default_name: String,

    /// Compilation configuration (None for interpreted languages)
    #[serde(default)]
    pub compile: Option<CompileConfig>,

    /// Execution configuration
    pub run: RunConfig,
}

impl Language {
    /// Check if the language is compiled
    pub fn is_compiled(&self) -> bool {
        self.compile.is_some()
    }

    /// Derive the entry-point name for the given source text
    pub fn derive_name(&self, source: &str) -> String {
        derive_name(&self.name_patterns, &self.default_name, source)
    }

    /// Expand placeholders in the given command
    ///
    /// Placeholders: `{source}` (source file name), `{name}` (derived name),
    /// `{dir}` (absolute working directory).
    pub fn expand_command(command: &[String], source: &str, name: &str, dir: &Path) -> Vec<String> {
        let dir = dir.to_string_lossy();
        command
            .iter()
            .map(|arg| {
                arg.replace("{source}", source)
                    .replace("{name}", name)
                    .replace("{dir}", &dir)
            })
            .collect()
    }
}

/// File extension without dot (e.g., "java")
#[derive(Debug, Clone, Serialize)]
pub struct FileExtension(String);

impl FileExtension {
    pub fn new(extension: &str) -> Result<Self, ConfigError> {
        let contains_invalid = extension
            .chars()
            .any(|c| INVALID_FILE_EXT_CHARS.contains(&c));
        if contains_invalid {
            return Err(ConfigError::InvalidFileExtChars);
        }
        Ok(Self(extension.to_owned()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for FileExtension {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        FileExtension::new(&s).map_err(|_| {
            de::Error::invalid_value(
                de::Unexpected::Str(&s),
                &"a file extension without '/' or '.' characters",
            )
        })
    }
}

impl std::fmt::Display for FileExtension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Configuration for the compilation step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileConfig {
    /// Command and arguments with placeholders
    pub command: Vec<String>,

    /// Environment variables to set during compilation
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Configuration for the execution step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Command and arguments with placeholders
    pub command: Vec<String>,

    /// Environment variables to set
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_entry_name() -> String {
    DEFAULT_ENTRY_NAME.to_owned()
}
