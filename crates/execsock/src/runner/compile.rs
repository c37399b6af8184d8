//! Compilation step for code execution
//!
//! Runs the language's compiler inside the attempt's working directory.

use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::config::Language;
use crate::runner::process::build_command;
use crate::runner::{CompileError, SpawnError};
use crate::workspace::ArtifactSet;

/// Result of a successful compilation
#[derive(Debug, Clone)]
pub struct CompileResult {
    /// Compiler output (warnings, usually empty)
    pub output: String,

    /// Wall clock time spent compiling
    pub wall_time: Duration,
}

/// Compile the attempt's source file
///
/// Fails with [`CompileError::Failed`] carrying the compiler's error stream
/// verbatim when it exits non-zero. Cancelling the token kills the
/// compiler and yields [`CompileError::Cancelled`].
#[instrument(skip(language, artifacts, cancel), fields(name = artifacts.name()))]
pub async fn compile(
    language: &Language,
    artifacts: &ArtifactSet,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<CompileResult, CompileError> {
    // Check if language requires compilation
    let compile_config = language
        .compile
        .as_ref()
        .ok_or_else(|| CompileError::NotCompiled(language.name.clone()))?;

    let argv = Language::expand_command(
        &compile_config.command,
        &artifacts.source_file_name(),
        artifacts.name(),
        artifacts.dir(),
    );

    debug!(?argv, "compiling");

    let mut command = build_command(&argv, artifacts.dir(), &compile_config.env)?;
    command.stdin(Stdio::null());
    let child = command.spawn().map_err(|source| SpawnError::Os {
        program: argv[0].clone(),
        source,
    })?;

    let started = Instant::now();

    // Dropping the pending future drops the child, and kill_on_drop reaps it
    let output = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(CompileError::Cancelled),
        result = tokio::time::timeout(timeout, child.wait_with_output()) => match result {
            Ok(output) => output?,
            Err(_) => return Err(CompileError::Timeout(timeout)),
        },
    };

    let wall_time = started.elapsed();
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    debug!(
        success = output.status.success(),
        exit_code = ?output.status.code(),
        ?wall_time,
        "compilation complete"
    );

    if output.status.success() {
        return Ok(CompileResult {
            output: stderr,
            wall_time,
        });
    }

    // Some compilers report diagnostics on stdout
    let diagnostics = if stderr.is_empty() { stdout } else { stderr };
    Err(CompileError::Failed {
        exit_code: output.status.code(),
        stderr: diagnostics,
    })
}
