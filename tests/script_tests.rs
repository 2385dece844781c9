#![cfg(unix)]

use pipescript::{exit, Command, Script, ScriptError};

#[tokio::test]
async fn command_output_is_captured() {
    let out = Script::command("echo hello world").output().await.unwrap();
    assert_eq!(out, "hello world");
}

#[tokio::test]
async fn quoting_reaches_the_command_intact() {
    let out = Script::command(r#"echo 'a  b' "c d""#).output().await.unwrap();
    assert_eq!(out, "a  b c d");
}

#[tokio::test]
async fn exit_codes_pass_through() {
    let script = Script::command("sh -c 'exit 7'");
    assert_eq!(script.exit_code().await, 7);
    match script.done().await {
        Err(ScriptError::Failed(failed)) => {
            assert_eq!(failed.name, "sh");
            assert_eq!(failed.exit_code, 7);
        }
        other => panic!("expected a script failure, got {other:?}"),
    }
}

#[tokio::test]
async fn success_is_derived_from_exit_code() {
    assert!(Script::command("true").success().await);
    assert!(!Script::command("false").success().await);
}

#[tokio::test]
async fn stdin_feeds_the_subprocess() {
    let script = Script::command("cat");
    let stdout = script.stdout().unwrap();
    let stdin = script.stdin();
    stdin.write("hello ").await.unwrap();
    stdin.writeln("world").await.unwrap();
    stdin.close();
    assert_eq!(stdout.text().await, "hello world");
    script.done().await.unwrap();
}

#[tokio::test]
async fn stdin_writes_buffer_until_the_process_exists() {
    let script = Script::command("cat");
    let stdout = script.stdout().unwrap();
    // No await between construction and this write: the factory has
    // not resolved yet.
    let stdin = script.stdin();
    stdin.write("early").await.unwrap();
    stdin.close();
    assert_eq!(stdout.text().await, "early");
}

#[tokio::test]
async fn spawn_failure_uses_the_sentinel() {
    let script = Script::command("pipescript-no-such-binary-test");
    let stderr = script.stderr().unwrap();
    assert_eq!(script.exit_code().await, exit::SPAWN_FAILED);
    let diagnostic = stderr.text().await;
    assert!(diagnostic.contains("failed to start"), "got: {diagnostic}");
    match script.done().await {
        Err(ScriptError::Failed(failed)) => assert_eq!(failed.exit_code, exit::SPAWN_FAILED),
        other => panic!("expected a script failure, got {other:?}"),
    }
}

#[tokio::test]
async fn kill_reports_the_native_signal() {
    let script = Script::command("sleep 5");
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(script.kill());
    match script.done().await {
        Err(ScriptError::Failed(failed)) => {
            assert_eq!(failed.name, "sleep");
            assert_eq!(failed.exit_code, -15);
        }
        other => panic!("expected a script failure, got {other:?}"),
    }
    // Already exited: further signals are declined.
    assert!(!script.kill());
}

#[tokio::test]
async fn signals_sent_before_spawn_are_replayed() {
    let script = Script::command("sleep 5");
    assert!(script.kill());
    assert_eq!(script.exit_code().await, -15);
}

#[tokio::test]
async fn stdout_admits_one_subscriber() {
    let script = Script::command("echo once");
    let _stdout = script.stdout().unwrap();
    assert!(matches!(
        script.stdout(),
        Err(ScriptError::AlreadyConsumed { stream: "stdout" })
    ));
    script.done().await.unwrap();
}

#[tokio::test]
async fn late_subscription_loses_to_the_grace_window() {
    let script = Script::command("true");
    script.done().await.unwrap();
    assert!(matches!(
        script.stdout(),
        Err(ScriptError::AlreadyConsumed { .. })
    ));
    assert!(matches!(
        script.stderr(),
        Err(ScriptError::AlreadyConsumed { .. })
    ));
}

#[tokio::test]
async fn streams_reach_terminal_close_once_done() {
    let script = Script::command("echo bye");
    let stdout = script.stdout().unwrap();
    let stderr = script.stderr().unwrap();
    script.done().await.unwrap();
    assert_eq!(stdout.text().await, "bye");
    assert_eq!(stderr.bytes().await, Vec::<u8>::new());
}

#[tokio::test]
async fn invalid_command_lines_error_through_the_script() {
    let script = Script::command("'unterminated");
    assert_eq!(script.exit_code().await, exit::UNHANDLED_ERROR);
    assert!(script.done().await.is_err());
}

#[tokio::test]
async fn explicit_argv_skips_tokenization() {
    let out = Command::program("echo")
        .arg("a b")
        .arg("*")
        .spawn()
        .output()
        .await
        .unwrap();
    assert_eq!(out, "a b *");
}

#[tokio::test]
async fn workdir_applies_to_the_subprocess() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("f.txt"), "content").unwrap();
    let out = Command::new("cat f.txt")
        .workdir(dir.path())
        .spawn()
        .output()
        .await
        .unwrap();
    assert_eq!(out, "content");
}

#[tokio::test]
async fn globs_expand_against_the_workdir() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("b.txt"), "").unwrap();
    std::fs::write(dir.path().join("a.txt"), "").unwrap();
    let out = Command::new("echo *.txt")
        .workdir(dir.path())
        .spawn()
        .output()
        .await
        .unwrap();
    assert_eq!(out, "a.txt b.txt");
}

#[tokio::test]
async fn command_env_reaches_the_subprocess() {
    let out = Command::new("sh -c 'echo $PIPESCRIPT_TEST_VAR'")
        .env("PIPESCRIPT_TEST_VAR", "v1")
        .spawn()
        .output()
        .await
        .unwrap();
    assert_eq!(out, "v1");
}

#[tokio::test]
async fn parent_env_can_be_excluded() {
    let out = Command::new("/bin/sh -c 'echo ${HOME:-unset}'")
        .include_parent_env(false)
        .spawn()
        .output()
        .await
        .unwrap();
    assert_eq!(out, "unset");
}

#[tokio::test]
async fn run_in_shell_hands_the_line_to_sh() {
    let out = Command::new("echo one && echo two")
        .run_in_shell()
        .spawn()
        .output()
        .await
        .unwrap();
    assert_eq!(out, "one\ntwo");
}
