//! Process spawning and I/O
//!
//! Compiler and program processes are started in their own process group
//! so that termination reaches anything they fork as well.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, instrument, warn};

use crate::runner::SpawnError;

/// Interval between exit checks of a running process
#[cfg(target_os = "linux")]
const EXIT_POLL: Duration = Duration::from_millis(10);

/// Build a command rooted at `dir` with all three standard streams piped
pub(crate) fn build_command(
    argv: &[String],
    dir: &Path,
    env: &HashMap<String, String>,
) -> Result<Command, SpawnError> {
    let (program, args) = argv.split_first().ok_or(SpawnError::EmptyCommand)?;

    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(dir)
        .envs(env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    command.process_group(0);

    Ok(command)
}

/// Handle to a running child process
#[derive(Debug)]
pub struct ChildProcess {
    child: Child,
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
}

impl ChildProcess {
    /// Spawn a process; returns as soon as the OS has started it
    #[instrument(skip(env))]
    pub fn spawn(
        argv: &[String],
        dir: &Path,
        env: &HashMap<String, String>,
    ) -> Result<Self, SpawnError> {
        let mut command = build_command(argv, dir, env)?;
        let mut child = command.spawn().map_err(|source| SpawnError::Os {
            program: argv[0].clone(),
            source,
        })?;

        let pid = child.id();
        debug!(?pid, "spawned process");

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        Ok(Self {
            child,
            pid,
            stdin,
            stdout,
            stderr,
        })
    }

    /// OS process id
    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    /// Take ownership of stdin
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    /// Take ownership of stdout
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Take ownership of stderr
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }

    /// Wait for the process to exit and reap it
    ///
    /// Anything left in the process group is killed while the leader is
    /// still unreaped, so the group id cannot have been reused.
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        if self.exited().await? {
            self.signal_group(Signal::Kill);
        }
        self.child.wait().await
    }

    /// Terminate the process group
    ///
    /// Sends SIGTERM, gives the process `grace` to exit, then kills the
    /// group. Returns once the child has been reaped.
    pub async fn terminate(&mut self, grace: Duration) -> io::Result<()> {
        self.signal_group(Signal::Terminate);

        match tokio::time::timeout(grace, self.wait()).await {
            Ok(result) => {
                let status = result?;
                debug!(?status, "process exited after SIGTERM");
                Ok(())
            }
            Err(_) => {
                warn!(pid = ?self.pid, "process ignored SIGTERM, killing");
                self.signal_group(Signal::Kill);
                self.child.kill().await
            }
        }
    }

    /// Poll until the leader has exited, leaving it unreaped
    ///
    /// Returns false when the leader can no longer be observed (no pid, or
    /// already reaped).
    #[cfg(target_os = "linux")]
    async fn exited(&self) -> io::Result<bool> {
        let Some(pid) = self.pid else {
            return Ok(false);
        };

        loop {
            let leader_exited = {
                // SAFETY: siginfo_t is plain data; waitid only writes into it.
                let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
                let rc = unsafe {
                    libc::waitid(
                        libc::P_PID,
                        libc::id_t::from(pid),
                        &mut info,
                        libc::WEXITED | libc::WNOHANG | libc::WNOWAIT,
                    )
                };
                if rc == -1 {
                    let err = io::Error::last_os_error();
                    match err.raw_os_error() {
                        Some(libc::EINTR) => continue,
                        Some(libc::ECHILD) => return Ok(false),
                        _ => return Err(err),
                    }
                }
                // SAFETY: si_pid is valid for a zeroed or waitid-filled siginfo_t.
                // It stays 0 while the child is still running.
                (unsafe { info.si_pid() }) != 0
            };
            if leader_exited {
                return Ok(true);
            }
            tokio::time::sleep(EXIT_POLL).await;
        }
    }

    #[cfg(not(target_os = "linux"))]
    async fn exited(&self) -> io::Result<bool> {
        Ok(false)
    }

    #[cfg(unix)]
    fn signal_group(&self, signal: Signal) {
        let Some(pid) = self.pid.and_then(|pid| i32::try_from(pid).ok()) else {
            return;
        };
        let signal = match signal {
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        // SAFETY: kill(2) has no memory-safety preconditions; a negative pid
        // addresses the process group created at spawn.
        unsafe {
            let _ = libc::kill(-pid, signal);
        }
    }

    #[cfg(not(unix))]
    fn signal_group(&self, _signal: Signal) {}
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

/// Incremental UTF-8 decoder for chunked pipe reads
///
/// Multi-byte characters split across two reads are held back until the
/// rest arrives. Invalid sequences become U+FFFD.
#[derive(Debug, Default)]
pub(crate) struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub(crate) fn decode(&mut self, data: &[u8]) -> String {
        self.pending.extend_from_slice(data);

        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush whatever is left at end of stream
    pub(crate) fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}
