//! Code runner for execsock
//!
//! Compiles submitted source, runs the result as a child process and
//! supervises it until it exits, is stopped or times out.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;

pub use crate::runner::compile::{CompileResult, compile};
pub use crate::runner::process::ChildProcess;
pub use crate::runner::supervisor::{ExecuteRequest, ExecutionEvent, ExecutionHandle, start};

mod compile;
mod process;
mod supervisor;

use crate::{
    config::{Config, ConfigError},
    types::{ExecutionStatus, SessionId},
    workspace::{ArtifactError, ArtifactStore},
};

/// Errors that occur while starting a process
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("command is empty")]
    EmptyCommand,

    #[error("failed to start '{program}': {source}")]
    Os {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// Errors that occur during compilation
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("compilation failed with exit code {exit_code:?}: {stderr}")]
    Failed {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("compilation timed out after {0:?}")]
    Timeout(Duration),

    #[error("compilation cancelled")]
    Cancelled,

    #[error("language '{0}' does not support compilation")]
    NotCompiled(String),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors that end an execution attempt
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("compilation error: {0}")]
    Compile(CompileError),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("process exited with code {exit_code:?}")]
    Runtime { exit_code: Option<i32> },

    #[error("execution timed out after {0:?}")]
    Timeout(Duration),

    #[error("execution stopped")]
    Stopped,

    #[error("failed to wait for process: {0}")]
    Wait(#[source] io::Error),
}

impl ExecutionError {
    /// Terminal status reported for this error
    pub fn status(&self) -> ExecutionStatus {
        match self {
            ExecutionError::Stopped => ExecutionStatus::Stopped,
            ExecutionError::Timeout(_) => ExecutionStatus::TimedOut,
            _ => ExecutionStatus::Failed,
        }
    }
}

/// High-level runner shared by all sessions
#[derive(Debug, Clone)]
pub struct Runner {
    config: Arc<Config>,
    store: ArtifactStore,
}

impl Runner {
    /// Create a new runner with the given configuration
    pub fn new(config: Config) -> Self {
        let store = ArtifactStore::new(config.scratch_dir.clone());
        Self {
            config: Arc::new(config),
            store,
        }
    }

    /// Create a new runner with default configuration
    pub fn with_defaults() -> Self {
        Self::new(Config::default())
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the artifact store
    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Prepare the scratch directory, removing orphans from earlier runs
    pub async fn prepare(&self) -> Result<usize, ArtifactError> {
        self.store.prepare().await
    }

    /// Start an execution attempt for a session
    ///
    /// `language` falls back to the configured default when `None`. Fails
    /// only when the language is unknown; everything after that is reported
    /// through `events`.
    pub fn start(
        &self,
        session: SessionId,
        source: String,
        language: Option<&str>,
        events: mpsc::Sender<ExecutionEvent>,
    ) -> Result<ExecutionHandle, ConfigError> {
        let language = self.config.resolve_language(language)?.clone();
        let request = ExecuteRequest {
            session,
            source,
            language,
            run_timeout: self.config.run_timeout(),
            compile_timeout: self.config.compile_timeout(),
        };
        Ok(supervisor::start(&self.store, request, events))
    }
}
