#![cfg(unix)]

use std::time::{Duration, Instant};

use pipescript::{exit, with_env, EnvOverlay, Script, ScriptContext, ScriptError, ScriptFailed};

#[tokio::test]
async fn prints_become_the_capture_stdout() {
    let cap = Script::capture("cap", |_| async {
        pipescript::println("x");
        Ok(())
    });
    assert_eq!(cap.output().await.unwrap(), "x");
}

#[tokio::test]
async fn capture_waits_for_child_scripts() {
    let started = Instant::now();
    let cap = Script::capture("cap", |_| async {
        pipescript::println("x");
        let _child = Script::command("sleep 0.3");
        Ok(())
    });
    assert_eq!(cap.output().await.unwrap(), "x");
    assert_eq!(cap.exit_code().await, 0);
    assert!(started.elapsed() >= Duration::from_millis(250));
}

#[tokio::test]
async fn unconsumed_child_output_flows_to_the_frame() {
    let cap = Script::capture("cap", |_| async {
        let _child = Script::command("echo from-child");
        Ok(())
    });
    assert_eq!(cap.output().await.unwrap(), "from-child");
}

#[tokio::test]
async fn nested_frames_redirect_to_the_innermost_group() {
    let outer = Script::capture("outer", |_| async {
        let inner = Script::capture("inner", |_| async {
            let _deep = Script::command("echo deep");
            Ok(())
        });
        assert_eq!(inner.output().await?, "deep");
        pipescript::println("outer-line");
        Ok(())
    });
    assert_eq!(outer.output().await.unwrap(), "outer-line");
}

#[tokio::test]
async fn unclaimed_child_failure_fails_the_capture() {
    let cap = Script::capture("outer", |_| async {
        let _child = Script::command("sh -c 'exit 4'");
        Ok(())
    });
    assert_eq!(cap.exit_code().await, 4);
    match cap.done().await {
        Err(ScriptError::Failed(failed)) => {
            assert_eq!(failed.name, "outer");
            assert_eq!(failed.exit_code, 4);
        }
        other => panic!("expected a script failure, got {other:?}"),
    }
}

#[tokio::test]
async fn handled_child_failure_does_not_fail_the_capture() {
    let cap = Script::capture("outer", |_| async {
        let child = Script::command("sh -c 'exit 4'");
        assert!(child.done().await.is_err());
        Ok(())
    });
    cap.done().await.unwrap();
}

#[tokio::test]
async fn propagated_child_failure_keeps_its_exit_code() {
    let cap = Script::capture("outer", |_| async {
        Script::command("sh -c 'exit 6'").done().await?;
        Ok(())
    });
    assert_eq!(cap.exit_code().await, 6);
}

#[tokio::test]
async fn callback_errors_map_to_the_unhandled_sentinel() {
    let cap = Script::capture("cap", |_| async {
        Err(ScriptError::context(
            "boom",
            ScriptError::Failed(ScriptFailed::new("inner-step", 3)),
        ))
    });
    let stderr = cap.stderr().unwrap();
    assert_eq!(cap.exit_code().await, exit::UNHANDLED_ERROR);
    let diagnostic = stderr.text().await;
    let lines: Vec<&str> = diagnostic.lines().collect();
    // The error line is followed by its cause chain, one line each.
    assert_eq!(
        lines,
        ["Error in cap:", "boom", "script `inner-step` failed: exit 3"],
        "got: {diagnostic}"
    );
}

#[tokio::test]
async fn capture_stdin_reaches_the_callback() {
    let cap = Script::capture("cap", |stdin| async move {
        let text = stdin.text().await;
        pipescript::println(format!("got {text}"));
        Ok(())
    });
    let stdout = cap.stdout().unwrap();
    let sink = cap.stdin();
    sink.write("abc").await.unwrap();
    sink.close();
    assert_eq!(stdout.text().await, "got abc");
    cap.done().await.unwrap();
}

#[tokio::test]
async fn scripts_refuse_a_completed_frame() {
    let (tx, rx) = tokio::sync::oneshot::channel();
    let cap = Script::capture("outer", move |_| async move {
        let _ = tx.send(ScriptContext::current().expect("inside a frame"));
        Ok(())
    });
    cap.done().await.unwrap();

    let frame = rx.await.unwrap();
    assert!(frame.is_closed());
    let late = frame
        .run(async { Script::command("echo late") })
        .await;
    match late.done().await {
        Err(ScriptError::CaptureClosed { capture }) => assert_eq!(capture, "outer"),
        other => panic!("expected CaptureClosed, got {other:?}"),
    }
    assert_eq!(late.exit_code().await, exit::UNHANDLED_ERROR);
}

#[tokio::test]
async fn on_signal_is_consulted_for_kills() {
    let cap = Script::capture_with_signal(
        "sig",
        |_| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        },
        |_signal| Ok(true),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(cap.kill());
    cap.done().await.unwrap();
}

#[tokio::test]
async fn captures_without_a_handler_decline_signals() {
    let cap = Script::capture("sig", |_| async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(())
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!cap.kill());
    cap.done().await.unwrap();
}

#[tokio::test]
async fn failing_signal_handlers_error_the_capture() {
    let cap = Script::capture_with_signal(
        "sig",
        |_| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(())
        },
        |_signal| Err(ScriptError::unhandled("handler broke")),
    );
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(cap.kill());
    assert_eq!(cap.exit_code().await, exit::UNHANDLED_ERROR);
}

#[tokio::test]
async fn with_env_applies_to_spawned_commands() {
    let out = with_env(
        EnvOverlay::new().set("PIPESCRIPT_SCOPED", "42"),
        true,
        async {
            Script::command("sh -c 'echo $PIPESCRIPT_SCOPED'")
                .output()
                .await
        },
    )
    .await
    .unwrap();
    assert_eq!(out, "42");
}

#[tokio::test]
async fn env_overlays_nest_and_merge() {
    let out = with_env(EnvOverlay::new().set("A", "outer").set("B", "kept"), true, {
        with_env(EnvOverlay::new().set("A", "inner"), true, async {
            Script::command("sh -c 'echo $A $B'").output().await
        })
    })
    .await
    .unwrap();
    assert_eq!(out, "inner kept");
}
