//! Session protocol engine
//!
//! A [`Session`] serves one client connection. It reads decoded text frames
//! from an inbound channel, drives at most one execution at a time through
//! the [`Runner`], and writes [`ServerMessage`]s to an outbound channel.
//! Transports (WebSocket, the local CLI) only move frames in and out.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{Instrument, debug, info, info_span, warn};

pub use crate::session::prompt::{
    NoPrompts, OutputGate, PromptDetector, TrailingMarker, detector_for,
};
pub use crate::session::protocol::{ClientMessage, ProtocolError, ServerMessage};
pub use crate::session::registry::{RegistryError, SessionGuard, SessionInfo, SessionRegistry};

mod prompt;
mod protocol;
mod registry;

use crate::runner::{ExecutionEvent, ExecutionHandle, Runner};
use crate::types::{ExecutionOutcome, ExecutionStatus, SessionId, SessionState};

/// Capacity of the per-execution event channel
const EVENT_CAPACITY: usize = 64;

/// An execution in flight
#[derive(Debug)]
struct Active {
    handle: ExecutionHandle,
    events: mpsc::Receiver<ExecutionEvent>,
    /// The run process has been spawned and can take input
    running: bool,
}

/// What woke the session loop
enum Step {
    Frame(String),
    Disconnected,
    Shutdown,
    Event(Option<ExecutionEvent>),
}

/// Per-connection state machine
#[derive(Debug)]
pub struct Session {
    guard: SessionGuard,
    runner: Runner,
    gate: OutputGate,
    outbound: mpsc::Sender<ServerMessage>,
    active: Option<Active>,
}

impl Session {
    pub fn new(
        guard: SessionGuard,
        runner: Runner,
        detector: Arc<dyn PromptDetector>,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> Self {
        Self {
            guard,
            runner,
            gate: OutputGate::new(detector),
            outbound,
            active: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.guard.id()
    }

    /// Serve the connection until the client disconnects or the server
    /// shuts down
    ///
    /// Any execution still in flight at that point is stopped and cleaned up
    /// before this returns. The session deregisters when it is dropped.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<String>) {
        let span = info_span!("session", id = %self.id());
        async move {
            let shutdown = self.guard.shutdown_token().clone();
            loop {
                let step = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => Step::Shutdown,
                    frame = inbound.recv() => match frame {
                        Some(text) => Step::Frame(text),
                        None => Step::Disconnected,
                    },
                    event = next_event(&mut self.active) => Step::Event(event),
                };

                match step {
                    Step::Frame(text) => self.on_frame(&text).await,
                    Step::Event(event) => self.on_event(event).await,
                    Step::Disconnected => {
                        debug!("client disconnected");
                        break;
                    }
                    Step::Shutdown => {
                        info!("server shutting down, closing session");
                        break;
                    }
                }
            }

            self.wind_down().await;
        }
        .instrument(span)
        .await
    }

    async fn on_frame(&mut self, text: &str) {
        match ClientMessage::parse(text) {
            Ok(ClientMessage::Execute { code, language }) => {
                self.execute(code, language.as_deref()).await;
            }
            Ok(ClientMessage::Input { value }) => self.input(value).await,
            Ok(ClientMessage::Stop) => self.stop(),
            Err(e) => {
                debug!(error = %e, "rejected frame");
                self.send(ServerMessage::error(e.to_string())).await;
            }
        }
    }

    async fn execute(&mut self, code: String, language: Option<&str>) {
        if self.active.is_some() {
            warn!("execute ignored, an execution is already in flight");
            return;
        }

        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        match self.runner.start(self.id(), code, language, tx) {
            Ok(handle) => {
                self.guard.set_state(SessionState::Compiling);
                self.active = Some(Active {
                    handle,
                    events: rx,
                    running: false,
                });
            }
            Err(e) => {
                warn!(error = %e, "cannot execute");
                self.send(ServerMessage::error(format!("Server Error: {e}\n")))
                    .await;
                self.send(ServerMessage::done(false)).await;
            }
        }
    }

    async fn input(&mut self, value: String) {
        let Some(active) = self.active.as_ref().filter(|active| active.running) else {
            debug!("input ignored, no program is running");
            return;
        };
        if !active.handle.send_input(value) {
            debug!("input dropped");
        }
        if let Some(held) = self.gate.release() {
            self.send(held).await;
        }
    }

    fn stop(&mut self) {
        match &self.active {
            Some(active) => active.handle.stop(),
            None => debug!("stop ignored, nothing is running"),
        }
    }

    async fn on_event(&mut self, event: Option<ExecutionEvent>) {
        let Some(event) = event else {
            // Supervisor vanished without a Finished event
            warn!("execution ended without an outcome");
            self.finish(ExecutionOutcome::ended(ExecutionStatus::Failed, Duration::ZERO))
                .await;
            return;
        };

        match event {
            ExecutionEvent::Notice(text) => {
                self.flush_gate().await;
                self.send(ServerMessage::output(text)).await;
            }
            ExecutionEvent::Stdout(text) => {
                for message in self.gate.accept(&text) {
                    self.send(message).await;
                }
            }
            ExecutionEvent::Stderr(text) => self.send(ServerMessage::error(text)).await,
            ExecutionEvent::Error(text) => {
                self.flush_gate().await;
                self.send(ServerMessage::error(text)).await;
            }
            ExecutionEvent::Started { pid } => {
                debug!(?pid, "program running");
                if let Some(active) = self.active.as_mut() {
                    active.running = true;
                }
                self.guard.set_state(SessionState::Running);
            }
            ExecutionEvent::Finished(outcome) => self.finish(outcome).await,
        }
    }

    /// Report the end of the current execution and return to idle
    async fn finish(&mut self, outcome: ExecutionOutcome) {
        self.flush_gate().await;
        if let Some(active) = self.active.take() {
            active.handle.join().await;
        }

        self.guard.set_state(outcome.status.state());
        self.send(ServerMessage::done(outcome.is_success())).await;
        self.guard.set_state(SessionState::Idle);
    }

    /// Stop whatever is running and wait until it is cleaned up
    async fn wind_down(&mut self) {
        let Some(active) = &self.active else {
            return;
        };
        active.handle.stop();
        while self.active.is_some() {
            let event = next_event(&mut self.active).await;
            self.on_event(event).await;
        }
    }

    async fn flush_gate(&mut self) {
        if let Some(held) = self.gate.flush() {
            self.send(held).await;
        }
    }

    async fn send(&self, message: ServerMessage) {
        if self.outbound.send(message).await.is_err() {
            debug!("client gone, dropping message");
        }
    }
}

/// Next event of the active execution; pends forever when idle
async fn next_event(active: &mut Option<Active>) -> Option<ExecutionEvent> {
    match active {
        Some(active) => active.events.recv().await,
        None => std::future::pending().await,
    }
}
