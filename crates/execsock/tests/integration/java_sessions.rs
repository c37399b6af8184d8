use std::path::Path;
use std::time::{Duration, Instant};

use execsock::runner::Runner;
use execsock::session::{ClientMessage, ServerMessage, SessionRegistry};

use super::{Client, done_success, errors, fixture_source, output_text, test_config};

fn scratch_is_empty(scratch: &Path) -> bool {
    fs_entries(scratch) == 0
}

fn fs_entries(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
}

fn setup() -> (tempfile::TempDir, Runner, SessionRegistry) {
    let tmp = tempfile::tempdir().expect("Failed to create temp dir");
    let runner = Runner::new(test_config(tmp.path()));
    (tmp, runner, SessionRegistry::default())
}

#[tokio::test]
async fn test_adder_prints_four() {
    let (_tmp, runner, registry) = setup();
    let mut client = Client::connect(&registry, &runner);

    client.execute_java(fixture_source("Adder.java")).await;
    let messages = client.until_done().await;

    assert_eq!(output_text(&messages), "Compiling...\n4\n");
    assert!(done_success(&messages));
    assert!(scratch_is_empty(&runner.config().scratch_dir));
}

#[tokio::test]
async fn test_syntax_error_reports_compiler_output() {
    let (_tmp, runner, registry) = setup();
    let mut client = Client::connect(&registry, &runner);

    client.execute_java(fixture_source("SyntaxError.java")).await;
    let messages = client.until_done().await;

    let errors = errors(&messages);
    assert_eq!(errors.len(), 1, "{messages:?}");
    assert!(errors[0].starts_with("Compilation Error:\n"));
    assert!(errors[0].contains("SyntaxError.java"));
    assert!(!done_success(&messages));
    assert!(scratch_is_empty(&runner.config().scratch_dir));
}

#[tokio::test]
async fn test_prompt_and_input() {
    let (_tmp, runner, registry) = setup();
    let mut client = Client::connect(&registry, &runner);

    client.execute_java(fixture_source("Square.java")).await;
    let before = client
        .until(|m| matches!(m, ServerMessage::Output { prompt: true, .. }))
        .await;
    assert_eq!(before.last(), Some(&ServerMessage::prompt("Enter n: ")));

    client
        .send(ClientMessage::Input {
            value: "5".to_owned(),
        })
        .await;
    let messages = client.until_done().await;
    assert_eq!(output_text(&messages), "square = 25\n");
    assert!(done_success(&messages));
}

#[tokio::test]
async fn test_stop_mid_run() {
    let (_tmp, runner, registry) = setup();
    let mut client = Client::connect(&registry, &runner);

    client.execute_java(fixture_source("Sleeper.java")).await;
    client
        .until(|m| matches!(m, ServerMessage::Output { data, .. } if data.trim().parse::<u32>().is_ok()))
        .await;

    let stopped_at = Instant::now();
    client.send(ClientMessage::Stop).await;
    let messages = client.until_done().await;

    assert!(stopped_at.elapsed() < Duration::from_secs(10));
    assert!(output_text(&messages).contains("[Execution stopped by user]"));
    assert!(errors(&messages).iter().all(|e| !e.contains("timeout")));
    assert!(!done_success(&messages));
}

#[tokio::test]
async fn test_timeout_kills_jvm() {
    let tmp = tempfile::tempdir().expect("Failed to create temp dir");
    let mut config = test_config(tmp.path());
    config.run_timeout_secs = 3.0;
    let runner = Runner::new(config);
    let registry = SessionRegistry::default();
    let mut client = Client::connect(&registry, &runner);

    client.execute_java(fixture_source("Sleeper.java")).await;
    let pid: u32 = loop {
        if let ServerMessage::Output { data, .. } = client.recv().await
            && let Ok(pid) = data.trim().parse()
        {
            break pid;
        }
    };

    let messages = client.until_done().await;
    assert_eq!(
        errors(&messages),
        vec!["\n[Execution timeout - 3 seconds exceeded]\n"]
    );
    assert!(!done_success(&messages));
    assert!(!Path::new(&format!("/proc/{pid}")).exists());
}

#[tokio::test]
async fn test_nested_types_are_purged() {
    let (_tmp, runner, registry) = setup();
    let mut client = Client::connect(&registry, &runner);

    client.execute_java(fixture_source("Nested.java")).await;
    let messages = client.until_done().await;

    assert!(output_text(&messages).ends_with("7\n"));
    assert!(done_success(&messages));
    assert!(scratch_is_empty(&runner.config().scratch_dir));
}

#[tokio::test]
async fn test_uncaught_exception_fails() {
    let (_tmp, runner, registry) = setup();
    let mut client = Client::connect(&registry, &runner);

    client.execute_java(fixture_source("Crash.java")).await;
    let messages = client.until_done().await;

    assert!(output_text(&messages).contains("before"));
    assert!(errors(&messages).concat().contains("IllegalStateException"));
    assert!(!done_success(&messages));
}

#[tokio::test]
async fn test_disconnect_cleans_up() {
    let (_tmp, runner, registry) = setup();
    let mut client = Client::connect(&registry, &runner);

    client.execute_java(fixture_source("Sleeper.java")).await;
    let pid: u32 = loop {
        if let ServerMessage::Output { data, .. } = client.recv().await
            && let Ok(pid) = data.trim().parse()
        {
            break pid;
        }
    };

    client.disconnect().await;
    assert!(!Path::new(&format!("/proc/{pid}")).exists());
    assert!(scratch_is_empty(&runner.config().scratch_dir));
    assert!(registry.is_empty());
}
