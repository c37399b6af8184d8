//! Session tests
//!
//! Drive the protocol engine through its channels, using POSIX `sh` as the
//! language. The `shc` language adds `sh -n` as a compile step.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use execsock::config::Config;
use execsock::runner::Runner;
use execsock::session::{ClientMessage, ServerMessage, Session, SessionRegistry, detector_for};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

mod lifecycle;

const SHELL_CONFIG: &str = r#"
run_timeout_secs = 30.0
compile_timeout_secs = 10.0
default_language = "sh"

[languages.sh]
name = "POSIX shell"
extension = "sh"
name_patterns = ['(?m)^#\s*name:\s*(\w+)']
default_name = "script"

[languages.sh.run]
command = ["sh", "{source}"]

[languages.shc]
name = "POSIX shell (syntax checked)"
extension = "sh"
name_patterns = ['(?m)^#\s*name:\s*(\w+)']
default_name = "script"

[languages.shc.compile]
command = ["sh", "-n", "{source}"]

[languages.shc.run]
command = ["sh", "{source}"]

[languages.missing]
name = "Missing runtime"
extension = "txt"

[languages.missing.run]
command = ["execsock-test-no-such-runtime", "{source}"]
"#;

/// How long any single message may take to arrive
const RECV_TIMEOUT: Duration = Duration::from_secs(10);

/// Shell config with the scratch directory inside `tmp`
pub(crate) fn shell_config(tmp: &Path) -> Config {
    let mut config = Config::parse_toml(SHELL_CONFIG).expect("test config should parse");
    config.scratch_dir = tmp.join("scratch");
    config
}

/// One client connection talking to a session over channels
pub(crate) struct Harness {
    _tmp: Option<TempDir>,
    pub scratch: PathBuf,
    pub registry: SessionRegistry,
    inbound: Option<mpsc::Sender<String>>,
    outbound: mpsc::Receiver<ServerMessage>,
    task: Option<JoinHandle<()>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(adjust: impl FnOnce(&mut Config)) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = shell_config(tmp.path());
        adjust(&mut config);

        let mut harness = Self::attach(&SessionRegistry::default(), &Runner::new(config));
        harness._tmp = Some(tmp);
        harness
    }

    /// Open another session on an existing registry and runner
    pub fn attach(registry: &SessionRegistry, runner: &Runner) -> Self {
        let guard = registry.open().unwrap();
        let (inbound_tx, inbound_rx) = mpsc::channel(16);
        let (outbound_tx, outbound_rx) = mpsc::channel(256);

        let detector = detector_for(runner.config().prompt_detection);
        let session = Session::new(guard, runner.clone(), detector, outbound_tx);
        let task = tokio::spawn(session.run(inbound_rx));

        Self {
            _tmp: None,
            scratch: runner.config().scratch_dir.clone(),
            registry: registry.clone(),
            inbound: Some(inbound_tx),
            outbound: outbound_rx,
            task: Some(task),
        }
    }

    pub async fn send(&self, message: ClientMessage) {
        self.send_raw(&message.to_json()).await;
    }

    pub async fn send_raw(&self, text: &str) {
        self.inbound
            .as_ref()
            .expect("already disconnected")
            .send(text.to_owned())
            .await
            .expect("session should be reading");
    }

    pub async fn execute(&self, language: &str, code: &str) {
        self.send(ClientMessage::Execute {
            code: code.to_owned(),
            language: Some(language.to_owned()),
        })
        .await;
    }

    pub async fn input(&self, value: &str) {
        self.send(ClientMessage::Input {
            value: value.to_owned(),
        })
        .await;
    }

    pub async fn recv(&mut self) -> ServerMessage {
        tokio::time::timeout(RECV_TIMEOUT, self.outbound.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("session closed")
    }

    /// Collect messages up to and including the next `done`
    pub async fn until_done(&mut self) -> Vec<ServerMessage> {
        let mut seen = Vec::new();
        loop {
            let message = self.recv().await;
            let done = matches!(message, ServerMessage::Done { .. });
            seen.push(message);
            if done {
                return seen;
            }
        }
    }

    /// Collect messages until one satisfies `pred`
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

    /// Assert that nothing arrives for `period`
    pub async fn expect_quiet(&mut self, period: Duration) {
        if let Ok(Some(message)) = tokio::time::timeout(period, self.outbound.recv()).await {
            panic!("unexpected message: {message:?}");
        }
    }

    /// Close the inbound side and wait for the session to wind down
    pub async fn disconnect(&mut self) {
        self.inbound = None;
        if let Some(task) = self.task.take() {
            tokio::time::timeout(RECV_TIMEOUT, task)
                .await
                .expect("session did not wind down")
                .unwrap();
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

pub(crate) fn success(messages: &[ServerMessage]) -> bool {
    match messages.last() {
        Some(ServerMessage::Done { success }) => *success,
        other => panic!("expected done last, got {other:?}"),
    }
}

pub(crate) fn done_count(messages: &[ServerMessage]) -> usize {
    messages
        .iter()
        .filter(|m| matches!(m, ServerMessage::Done { .. }))
        .count()
}

/// Files left anywhere under the scratch directory
pub(crate) fn leftovers(scratch: &Path) -> Vec<PathBuf> {
    fn walk(dir: &Path, found: &mut Vec<PathBuf>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                walk(&path, found);
            } else {
                found.push(path);
            }
        }
    }
    let mut found = Vec::new();
    walk(scratch, &mut found);
    found
}

pub(crate) fn process_exists(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}
