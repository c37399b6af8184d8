use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of one client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Create a fresh random session identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Lifecycle state of a session
///
/// `Completed`, `Stopped`, `TimedOut` and `Failed` are terminal. A session
/// passes through one of them at the end of every execution attempt and then
/// converges back to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    Compiling,
    Running,
    Completed,
    Stopped,
    TimedOut,
    Failed,
}

impl SessionState {
    /// Check if an execution attempt is in flight
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Compiling | SessionState::Running)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Compiling => "compiling",
            SessionState::Running => "running",
            SessionState::Completed => "completed",
            SessionState::Stopped => "stopped",
            SessionState::TimedOut => "timed_out",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// How an execution attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Run process exited with status 0
    Completed,

    /// Stopped on client request (or disconnect)
    Stopped,

    /// Killed after exceeding the wall-clock budget
    TimedOut,

    /// Compile failure, spawn failure, non-zero exit or internal error
    Failed,
}

impl ExecutionStatus {
    /// The terminal session state matching this status
    pub fn state(self) -> SessionState {
        match self {
            ExecutionStatus::Completed => SessionState::Completed,
            ExecutionStatus::Stopped => SessionState::Stopped,
            ExecutionStatus::TimedOut => SessionState::TimedOut,
            ExecutionStatus::Failed => SessionState::Failed,
        }
    }
}

/// Terminal result of one execution attempt
///
/// Reported once through a `done` message and then discarded.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// How the attempt ended
    pub status: ExecutionStatus,

    /// Exit code of the run process, if it exited on its own
    pub exit_code: Option<i32>,

    /// Captured compiler diagnostics when compilation failed
    pub compile_output: Option<String>,

    /// Wall clock time from request to cleanup
    pub wall_time: Duration,
}

impl ExecutionOutcome {
    /// Successful run with exit status 0
    pub fn completed(wall_time: Duration) -> Self {
        Self {
            status: ExecutionStatus::Completed,
            exit_code: Some(0),
            compile_output: None,
            wall_time,
        }
    }

    /// Attempt that ended with the given status and no exit code
    pub fn ended(status: ExecutionStatus, wall_time: Duration) -> Self {
        Self {
            status,
            exit_code: None,
            compile_output: None,
            wall_time,
        }
    }

    /// Whether the client should be told `success: true`
    ///
    /// True only when the run process actually exited with status 0.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self.status, ExecutionStatus::Completed) && self.exit_code == Some(0)
    }
}
