use std::time::Duration;

use execsock::runner::Runner;
use execsock::session::{ClientMessage, ServerMessage, SessionRegistry};

use super::{Harness, done_count, errors, leftovers, output_text, shell_config, success};

#[tokio::test]
async fn test_output_then_done_true() {
    let mut h = Harness::new();
    h.execute("sh", "echo hello\necho world\n").await;

    let messages = h.until_done().await;
    assert_eq!(output_text(&messages), "hello\nworld\n");
    assert!(errors(&messages).is_empty());
    assert!(success(&messages));
    assert_eq!(done_count(&messages), 1);
}

#[tokio::test]
async fn test_default_language_is_used_when_unnamed() {
    let mut h = Harness::new();
    h.send(ClientMessage::Execute {
        code: "echo default\n".to_owned(),
        language: None,
    })
    .await;

    let messages = h.until_done().await;
    assert_eq!(output_text(&messages), "default\n");
    assert!(success(&messages));
}

#[tokio::test]
async fn test_compiled_language_announces_compilation() {
    let mut h = Harness::new();
    h.execute("shc", "echo checked\n").await;

    let messages = h.until_done().await;
    assert_eq!(messages[0], ServerMessage::output("Compiling...\n"));
    assert_eq!(output_text(&messages), "Compiling...\nchecked\n");
    assert!(success(&messages));
}

#[tokio::test]
async fn test_compile_failure_reports_diagnostics_and_never_runs() {
    let mut h = Harness::new();
    h.execute("shc", "echo should-not-run\nif then fi (\n").await;

    let messages = h.until_done().await;
    let errors = errors(&messages);
    assert_eq!(errors.len(), 1, "{messages:?}");
    assert!(errors[0].starts_with("Compilation Error:\n"));
    assert!(errors[0].len() > "Compilation Error:\n".len());
    assert!(!output_text(&messages).contains("should-not-run"));
    assert!(!success(&messages));
}

#[tokio::test]
async fn test_stderr_and_non_zero_exit_fail() {
    let mut h = Harness::new();
    h.execute("sh", "echo partial\necho broken >&2\nexit 2\n").await;

    let messages = h.until_done().await;
    assert_eq!(output_text(&messages), "partial\n");
    assert_eq!(errors(&messages).concat(), "broken\n");
    assert!(!success(&messages));
}

#[tokio::test]
async fn test_spawn_failure_is_reported() {
    let mut h = Harness::new();
    h.execute("missing", "anything").await;

    let messages = h.until_done().await;
    let errors = errors(&messages);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("Execution Error: "));
    assert!(!success(&messages));
}

#[tokio::test]
async fn test_unknown_language_still_ends_with_done() {
    let mut h = Harness::new();
    h.execute("cobol", "DISPLAY 'HI'.").await;

    let messages = h.until_done().await;
    assert_eq!(messages.len(), 2);
    assert!(errors(&messages)[0].starts_with("Server Error: "));
    assert!(!success(&messages));
}

#[tokio::test]
async fn test_blank_lines_are_not_forwarded() {
    let mut h = Harness::new();
    h.execute("sh", "echo a\necho\necho '   '\necho b\n").await;

    let messages = h.until_done().await;
    assert_eq!(output_text(&messages), "a\nb\n");
}

#[tokio::test]
async fn test_malformed_message_keeps_session_alive() {
    let mut h = Harness::new();
    h.send_raw("not json").await;
    match h.recv().await {
        ServerMessage::Error { data } => assert!(data.starts_with("Invalid message format: ")),
        other => panic!("expected error, got {other:?}"),
    }

    h.send_raw(r#"{"type":"teleport"}"#).await;
    assert!(matches!(h.recv().await, ServerMessage::Error { .. }));

    h.execute("sh", "echo still-here\n").await;
    let messages = h.until_done().await;
    assert_eq!(output_text(&messages), "still-here\n");
}

#[tokio::test]
async fn test_stop_and_input_while_idle_are_no_ops() {
    let mut h = Harness::new();
    h.send(ClientMessage::Stop).await;
    h.input("ignored").await;
    h.expect_quiet(Duration::from_millis(300)).await;

    h.execute("sh", "echo fine\n").await;
    assert!(success(&h.until_done().await));
}

#[tokio::test]
async fn test_stop_after_done_is_a_no_op() {
    let mut h = Harness::new();
    h.execute("sh", "echo once\n").await;
    assert_eq!(done_count(&h.until_done().await), 1);

    h.send(ClientMessage::Stop).await;
    h.expect_quiet(Duration::from_millis(300)).await;
}

#[tokio::test]
async fn test_session_runs_again_after_terminal_state() {
    let mut h = Harness::new();
    h.execute("sh", "exit 1\n").await;
    assert!(!success(&h.until_done().await));

    h.execute("sh", "echo second\n").await;
    let messages = h.until_done().await;
    assert_eq!(output_text(&messages), "second\n");
    assert!(success(&messages));
}

#[tokio::test]
async fn test_artifacts_are_purged_after_every_attempt() {
    let mut h = Harness::new();
    let code = "# name: Widget\necho data > Widget.out\necho done\n";

    h.execute("shc", code).await;
    assert!(success(&h.until_done().await));
    assert!(leftovers(&h.scratch).is_empty(), "{:?}", leftovers(&h.scratch));

    h.execute("shc", "# name: Widget\nif then (\n").await;
    assert!(!success(&h.until_done().await));
    assert!(leftovers(&h.scratch).is_empty(), "{:?}", leftovers(&h.scratch));
}

#[tokio::test]
async fn test_files_written_by_the_program_are_removed() {
    let mut h = Harness::new();
    h.execute(
        "sh",
        "echo data > Helper.class\nmkdir out\necho x > out/report.txt\necho ok\n",
    )
    .await;
    assert!(success(&h.until_done().await));

    assert!(leftovers(&h.scratch).is_empty(), "{:?}", leftovers(&h.scratch));
    let dirs = std::fs::read_dir(&h.scratch).map(|d| d.count()).unwrap_or(0);
    assert_eq!(dirs, 0);
}

#[tokio::test]
async fn test_concurrent_sessions_with_same_name_do_not_collide() {
    let tmp = tempfile::tempdir().unwrap();
    let runner = Runner::new(shell_config(tmp.path()));
    let registry = SessionRegistry::default();
    let mut a = Harness::attach(&registry, &runner);
    let mut b = Harness::attach(&registry, &runner);
    assert_eq!(registry.len(), 2);

    let script = |marker: &str| format!("# name: Same\n# {marker}\nsleep 0.5\ngrep '^# marker' Same.sh\n");
    a.execute("sh", &script("marker-a")).await;
    b.execute("sh", &script("marker-b")).await;

    let (from_a, from_b) = tokio::join!(a.until_done(), b.until_done());
    assert_eq!(output_text(&from_a), "# marker-a\n");
    assert_eq!(output_text(&from_b), "# marker-b\n");
    assert!(success(&from_a) && success(&from_b));

    a.disconnect().await;
    b.disconnect().await;
    assert!(registry.is_empty());
}
