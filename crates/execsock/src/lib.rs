//! Remote compile-and-run sessions over WebSocket.
//!
//! execsock lets a client submit source code over a persistent connection,
//! have it compiled and executed on the server, and talk to the running
//! program's stdin/stdout as if at a local terminal.
//!
//! # Features
//!
//! - **Per-session state machine**: one execution at a time, exactly one `done` per attempt.
//! - **Process supervision**: wall-clock timeout and process-group kill on stop or disconnect.
//! - **Interactive input**: prompt detection with output held until the client answers.
//! - **Artifact hygiene**: per-session scratch directories, purged after every attempt.
//! - **TOML configuration**: per-language compile and run commands.

pub use config::{Config, ConfigError, EXAMPLE_CONFIG, Language, PromptDetection};
pub use runner::{
    CompileError, CompileResult, ExecutionError, ExecutionEvent, ExecutionHandle, Runner,
    SpawnError,
};
pub use server::{AppState, router, serve};
pub use session::{
    ClientMessage, ProtocolError, RegistryError, ServerMessage, Session, SessionRegistry,
};
pub use types::{ExecutionOutcome, ExecutionStatus, SessionId, SessionState};
pub use workspace::{ArtifactError, ArtifactSet, ArtifactStore};

pub mod config;
pub mod runner;
pub mod server;
pub mod session;
pub mod types;
pub mod workspace;
