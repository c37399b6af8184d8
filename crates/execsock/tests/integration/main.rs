//! Integration tests for execsock
//!
//! These tests compile and run real Java programs, so `javac` and `java`
//! must be on PATH.
//! Run with: cargo test -p execsock --features integration-tests

#![cfg(feature = "integration-tests")]

use std::fs;
use std::path::Path;
use std::time::Duration;

use execsock::config::Config;
use execsock::runner::Runner;
use execsock::session::{ClientMessage, ServerMessage, Session, SessionRegistry, detector_for};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

mod java_sessions;

const FIXTURES_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures");

/// JVM start-up plus compilation can be slow on CI machines
const RECV_TIMEOUT: Duration = Duration::from_secs(60);

/// Helper to get fixture file content
pub(crate) fn fixture_source(name: &str) -> String {
    let path = format!("{FIXTURES_PATH}/sources/{name}");
    fs::read_to_string(&path).unwrap_or_else(|e| panic!("Failed to read fixture {path}: {e}"))
}

/// Default config with the scratch directory moved into `tmp`
pub(crate) fn test_config(tmp: &Path) -> Config {
    let mut config = Config::default();
    config.scratch_dir = tmp.join("scratch");
    config
}

/// Client side of one session
pub(crate) struct Client {
    inbound: Option<mpsc::Sender<String>>,
    outbound: mpsc::Receiver<ServerMessage>,
    task: Option<JoinHandle<()>>,
}

impl Client {
    pub fn connect(registry: &SessionRegistry, runner: &Runner) -> Self {
        let guard = registry.open().expect("Failed to open session");
        let (inbound_tx, inbound_rx) = mpsc::channel(16);
        let (outbound_tx, outbound_rx) = mpsc::channel(256);
        let detector = detector_for(runner.config().prompt_detection);
        let session = Session::new(guard, runner.clone(), detector, outbound_tx);

        Self {
            inbound: Some(inbound_tx),
            outbound: outbound_rx,
            task: Some(tokio::spawn(session.run(inbound_rx))),
        }
    }

    pub async fn send(&self, message: ClientMessage) {
        self.inbound
            .as_ref()
            .expect("already disconnected")
            .send(message.to_json())
            .await
            .expect("Session stopped reading");
    }

    pub async fn execute_java(&self, code: String) {
        self.send(ClientMessage::Execute {
            code,
            language: Some("java".to_owned()),
        })
        .await;
    }

    pub async fn recv(&mut self) -> ServerMessage {
        tokio::time::timeout(RECV_TIMEOUT, self.outbound.recv())
            .await
            .expect("Timed out waiting for a message")
            .expect("Session closed")
    }

    pub async fn until(&mut self, pred: impl Fn(&ServerMessage) -> bool) -> Vec<ServerMessage> {
        let mut seen = Vec::new();
        loop {
            let message = self.recv().await;
            let hit = pred(&message);
            seen.push(message);
            if hit {
                return seen;
            }
        }
    }

    pub async fn until_done(&mut self) -> Vec<ServerMessage> {
        self.until(|m| matches!(m, ServerMessage::Done { .. })).await
    }

    pub async fn disconnect(&mut self) {
        self.inbound = None;
        if let Some(task) = self.task.take() {
            tokio::time::timeout(RECV_TIMEOUT, task)
                .await
                .expect("Session did not wind down")
                .expect("Session task panicked");
        }
    }
}

pub(crate) fn output_text(messages: &[ServerMessage]) -> String {
    messages
        .iter()
        .filter_map(|m| match m {
            ServerMessage::Output { data, .. } => Some(data.as_str()),
            _ => None,
        })
        .collect()
}

pub(crate) fn errors(messages: &[ServerMessage]) -> Vec<&str> {
    messages
        .iter()
        .filter_map(|m| match m {
            ServerMessage::Error { data } => Some(data.as_str()),
            _ => None,
        })
        .collect()
}

pub(crate) fn done_success(messages: &[ServerMessage]) -> bool {
    match messages.last() {
        Some(ServerMessage::Done { success }) => *success,
        other => panic!("Expected done last, got {other:?}"),
    }
}
