//! Process supervision for one execution attempt
//!
//! Each attempt runs in its own task. The task owns the artifacts and the
//! child process, forwards output as [`ExecutionEvent`]s, and always ends
//! by purging artifacts and sending exactly one
//! [`ExecutionEvent::Finished`].

use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::ChildStdin;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::config::Language;
use crate::runner::compile::compile;
use crate::runner::process::{ChildProcess, Utf8Decoder};
use crate::runner::{CompileError, ExecutionError};
use crate::types::{ExecutionOutcome, SessionId};
use crate::workspace::{ArtifactSet, ArtifactStore};

/// Time a process gets to exit after SIGTERM before it is killed
const TERMINATE_GRACE: Duration = Duration::from_millis(500);

/// Time to wait for output readers to drain after the process ended
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Capacity of the per-attempt input queue
const STDIN_CAPACITY: usize = 32;

/// Size of a single pipe read
const READ_CHUNK: usize = 4096;

/// Event from a supervised execution
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    /// Status text from the supervisor, shown as plain output
    Notice(String),

    /// Data received on the run process's stdout
    Stdout(String),

    /// Data received on the run process's stderr
    Stderr(String),

    /// Failure diagnostics from the supervisor (compile errors, timeouts)
    Error(String),

    /// The run process was spawned
    Started { pid: Option<u32> },

    /// The attempt ended and its artifacts are gone. Always the last event.
    Finished(ExecutionOutcome),
}

/// Everything the supervisor needs for one attempt
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub session: SessionId,
    pub source: String,
    pub language: Language,
    pub run_timeout: Duration,
    pub compile_timeout: Duration,
}

/// Control handle for a supervised execution
#[derive(Debug)]
pub struct ExecutionHandle {
    cancel: CancellationToken,
    stdin_tx: mpsc::Sender<String>,
    task: JoinHandle<()>,
}

impl ExecutionHandle {
    /// Request termination; repeated calls are no-ops
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Queue a line for the process's stdin without waiting
    ///
    /// Returns false when the line was dropped, either because the queue is
    /// full (the program is not reading) or the process no longer accepts
    /// input.
    pub fn send_input(&self, value: String) -> bool {
        match self.stdin_tx.try_send(value) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("stdin queue full, dropping input");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Wait for the supervising task to exit
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!(error = %e, "execution task failed");
        }
    }
}

/// Start supervising an execution attempt
///
/// Returns immediately; progress is reported on `events`.
pub fn start(
    store: &ArtifactStore,
    request: ExecuteRequest,
    events: mpsc::Sender<ExecutionEvent>,
) -> ExecutionHandle {
    let cancel = CancellationToken::new();
    let (stdin_tx, stdin_rx) = mpsc::channel(STDIN_CAPACITY);

    let span = info_span!("execution", session = %request.session, language = %request.language.name);
    let supervisor = Supervisor {
        store: store.clone(),
        request,
        events,
        cancel: cancel.clone(),
    };
    let task = tokio::spawn(supervisor.run(stdin_rx).instrument(span));

    ExecutionHandle {
        cancel,
        stdin_tx,
        task,
    }
}

struct Supervisor {
    store: ArtifactStore,
    request: ExecuteRequest,
    events: mpsc::Sender<ExecutionEvent>,
    cancel: CancellationToken,
}

impl Supervisor {
    async fn run(self, stdin_rx: mpsc::Receiver<String>) {
        let started = Instant::now();
        let language = &self.request.language;
        let name = language.derive_name(&self.request.source);

        let result = match self
            .store
            .write(
                self.request.session,
                &name,
                language.extension.as_str(),
                &self.request.source,
            )
            .await
        {
            Ok(mut artifacts) => {
                let result = self.execute(&mut artifacts, stdin_rx).await;
                artifacts.purge().await;
                result
            }
            Err(e) => Err(ExecutionError::from(e)),
        };

        let outcome = self.report(result, started.elapsed()).await;
        info!(
            status = ?outcome.status,
            exit_code = ?outcome.exit_code,
            wall_time = ?outcome.wall_time,
            "execution finished"
        );
        self.emit(ExecutionEvent::Finished(outcome)).await;
    }

    /// Compile (if needed) and run; returns once the process is gone
    async fn execute(
        &self,
        artifacts: &mut ArtifactSet,
        stdin_rx: mpsc::Receiver<String>,
    ) -> Result<(), ExecutionError> {
        let language = &self.request.language;
        debug!(source = %artifacts.source_path().display(), "source written");

        if language.is_compiled() {
            self.emit(ExecutionEvent::Notice("Compiling...\n".to_owned()))
                .await;
            let result = compile(language, artifacts, self.request.compile_timeout, &self.cancel)
                .await
                .map_err(|e| match e {
                    CompileError::Cancelled => ExecutionError::Stopped,
                    other => ExecutionError::Compile(other),
                })?;
            artifacts.collect_outputs().await;
            debug!(wall_time = ?result.wall_time, artifacts = ?artifacts.paths(), "compiled");
        }

        // Stop may have arrived between compile and spawn
        if self.cancel.is_cancelled() {
            return Err(ExecutionError::Stopped);
        }

        let argv = Language::expand_command(
            &language.run.command,
            &artifacts.source_file_name(),
            artifacts.name(),
            artifacts.dir(),
        );
        let mut process = ChildProcess::spawn(&argv, artifacts.dir(), &language.run.env)?;
        self.emit(ExecutionEvent::Started { pid: process.id() }).await;

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = process.take_stdout() {
            readers.push(tokio::spawn(pump_output(
                stdout,
                self.events.clone(),
                ExecutionEvent::Stdout,
            )));
        }
        if let Some(stderr) = process.take_stderr() {
            readers.push(tokio::spawn(pump_output(
                stderr,
                self.events.clone(),
                ExecutionEvent::Stderr,
            )));
        }
        let stdin_task = process
            .take_stdin()
            .map(|stdin| tokio::spawn(pump_input(stdin, stdin_rx)));

        // The timer lives only inside this select, so it cannot fire once the
        // process has exited or been stopped.
        let ending = tokio::select! {
            biased;
            status = process.wait() => Ending::Exited(status),
            _ = self.cancel.cancelled() => Ending::Stopped,
            _ = tokio::time::sleep(self.request.run_timeout) => Ending::TimedOut,
        };

        let result = match ending {
            Ending::Exited(Ok(status)) => {
                if status.success() {
                    Ok(())
                } else {
                    Err(ExecutionError::Runtime {
                        exit_code: status.code(),
                    })
                }
            }
            Ending::Exited(Err(e)) => Err(ExecutionError::Wait(e)),
            Ending::Stopped => {
                debug!("stop requested, terminating process");
                self.terminate(&mut process).await;
                Err(ExecutionError::Stopped)
            }
            Ending::TimedOut => {
                warn!(timeout = ?self.request.run_timeout, "execution timed out");
                self.terminate(&mut process).await;
                Err(ExecutionError::Timeout(self.request.run_timeout))
            }
        };

        if let Some(stdin_task) = stdin_task {
            stdin_task.abort();
        }
        drain(readers).await;

        result
    }

    async fn terminate(&self, process: &mut ChildProcess) {
        if let Err(e) = process.terminate(TERMINATE_GRACE).await {
            warn!(error = %e, "failed to terminate process");
        }
    }

    /// Translate the attempt's result into client-visible messages
    async fn report(
        &self,
        result: Result<(), ExecutionError>,
        wall_time: Duration,
    ) -> ExecutionOutcome {
        let error = match result {
            Ok(()) => return ExecutionOutcome::completed(wall_time),
            Err(e) => e,
        };

        let status = error.status();
        let mut outcome = ExecutionOutcome::ended(status, wall_time);

        match error {
            ExecutionError::Compile(CompileError::Failed { stderr, .. }) => {
                self.emit(ExecutionEvent::Error(format!("Compilation Error:\n{stderr}")))
                    .await;
                outcome.compile_output = Some(stderr);
            }
            ExecutionError::Compile(e) => {
                self.emit(ExecutionEvent::Error(format!("Compilation Error:\n{e}\n")))
                    .await;
            }
            ExecutionError::Spawn(e) => {
                self.emit(ExecutionEvent::Error(format!("Execution Error: {e}\n")))
                    .await;
            }
            ExecutionError::Wait(e) => {
                self.emit(ExecutionEvent::Error(format!("Execution Error: {e}\n")))
                    .await;
            }
            ExecutionError::Artifact(e) => {
                self.emit(ExecutionEvent::Error(format!("Server Error: {e}\n")))
                    .await;
            }
            ExecutionError::Runtime { exit_code } => {
                outcome.exit_code = exit_code;
            }
            ExecutionError::Timeout(timeout) => {
                self.emit(ExecutionEvent::Error(format!(
                    "\n[Execution timeout - {} seconds exceeded]\n",
                    timeout.as_secs_f64()
                )))
                .await;
            }
            ExecutionError::Stopped => {
                self.emit(ExecutionEvent::Notice(
                    "\n[Execution stopped by user]\n".to_owned(),
                ))
                .await;
            }
        }

        outcome
    }

    async fn emit(&self, event: ExecutionEvent) {
        if self.events.send(event).await.is_err() {
            debug!("event receiver dropped");
        }
    }
}

enum Ending {
    Exited(std::io::Result<std::process::ExitStatus>),
    Stopped,
    TimedOut,
}

/// Forward a child stream as events until EOF
async fn pump_output<R>(
    mut reader: R,
    events: mpsc::Sender<ExecutionEvent>,
    wrap: fn(String) -> ExecutionEvent,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    let mut decoder = Utf8Decoder::default();

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let text = decoder.decode(&buf[..n]);
                if !text.is_empty() && events.send(wrap(text)).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "output read error");
                break;
            }
        }
    }

    let rest = decoder.finish();
    if !rest.is_empty() {
        let _ = events.send(wrap(rest)).await;
    }
}

/// Write queued input lines to the child's stdin
async fn pump_input(mut stdin: ChildStdin, mut lines: mpsc::Receiver<String>) {
    while let Some(line) = lines.recv().await {
        let mut data = line.into_bytes();
        data.push(b'\n');
        let written = async {
            stdin.write_all(&data).await?;
            stdin.flush().await
        };
        if let Err(e) = written.await {
            warn!(error = %e, "failed to write to stdin");
            break;
        }
        debug!(len = data.len(), "wrote to stdin");
    }
}

/// Wait for output readers to hit EOF, giving up after a grace period
async fn drain(readers: Vec<JoinHandle<()>>) {
    for reader in readers {
        let abort = reader.abort_handle();
        if tokio::time::timeout(OUTPUT_DRAIN_GRACE, reader).await.is_err() {
            warn!("output stream still open after process exit, abandoning it");
            abort.abort();
        }
    }
}
