#![cfg(unix)]

use std::sync::Arc;

use parking_lot::Mutex;
use pipescript::{exit, GrepOptions, LineStream, ReplaceOptions, Script};

#[tokio::test]
async fn byte_transformers_rewrite_the_stream() {
    let script = Script::byte_transform("shout", |bytes| {
        use futures::StreamExt;
        pipescript::ByteStream::new(bytes.map(|chunk| chunk.to_ascii_uppercase()))
    });
    let stdout = script.stdout().unwrap();
    let stdin = script.stdin();
    stdin.write("loud").await.unwrap();
    stdin.close();
    assert_eq!(stdout.text().await, "LOUD");
    script.done().await.unwrap();
}

#[tokio::test]
async fn map_lines_applies_per_line() {
    let script = Script::map_lines("upper", |line| line.to_uppercase());
    let stdout = script.stdout().unwrap();
    let stdin = script.stdin();
    stdin.writeln("one").await.unwrap();
    stdin.writeln("two").await.unwrap();
    stdin.close();
    assert_eq!(stdout.text().await, "ONE\nTWO");
    assert_eq!(script.exit_code().await, 0);
}

#[tokio::test]
async fn killed_transformers_exit_interrupted() {
    let script = Script::byte_transform("ident", |bytes| bytes);
    let _stdout = script.stdout().unwrap();
    let stdin = script.stdin();
    stdin.write("x").await.unwrap();
    assert!(script.kill());
    assert_eq!(script.exit_code().await, exit::INTERRUPTED);
    assert!(script.done().await.is_err());
}

#[tokio::test]
async fn from_stream_exits_cleanly_at_the_end() {
    let script = Script::from_stream("src", pipescript::ByteStream::from_bytes("data"));
    assert_eq!(script.output().await.unwrap(), "data");
}

#[tokio::test]
async fn grep_scripts_filter_in_pipelines() {
    let pipeline = Script::command("printf 'one\\ntwo\\nthree\\n'")
        | Script::grep("^t", GrepOptions::default()).unwrap();
    assert_eq!(pipeline.output().await.unwrap(), "two\nthree");
}

#[tokio::test]
async fn replace_scripts_rewrite_in_pipelines() {
    let pipeline = Script::command("printf 'aa\\nba\\n'")
        | Script::replace(
            "a",
            "X",
            ReplaceOptions {
                all: true,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(pipeline.output().await.unwrap(), "XX\nbX");
}

#[tokio::test]
async fn xargs_batches_sequentially() {
    let calls: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));
    let lines = LineStream::from_lines(["1", "2", "3", "4", "5"].map(String::from));
    let script = lines.xargs(2, {
        let calls = Arc::clone(&calls);
        move |batch| {
            let calls = Arc::clone(&calls);
            async move {
                calls.lock().push(batch);
                Ok(())
            }
        }
    });
    script.done().await.unwrap();
    let calls = calls.lock().clone();
    assert_eq!(
        calls,
        vec![
            vec!["1".to_owned(), "2".to_owned()],
            vec!["3".to_owned(), "4".to_owned()],
            vec!["5".to_owned()],
        ]
    );
}

#[tokio::test]
async fn xargs_aborts_after_a_failing_batch() {
    let calls: Arc<Mutex<usize>> = Arc::new(Mutex::new(0));
    let lines = LineStream::from_lines(["1", "2", "3", "4"].map(String::from));
    let script = lines.xargs(2, {
        let calls = Arc::clone(&calls);
        move |_batch| {
            let calls = Arc::clone(&calls);
            async move {
                *calls.lock() += 1;
                Err(pipescript::ScriptError::unhandled("nope"))
            }
        }
    });
    let stderr = script.stderr().unwrap();
    assert_eq!(script.exit_code().await, exit::UNHANDLED_ERROR);
    assert_eq!(*calls.lock(), 1);
    assert!(stderr.text().await.contains("nope"));
}

#[tokio::test]
async fn script_lines_split_stdout() {
    let script = Script::command("printf 'a\\nb\\nc\\n'");
    let lines = script.lines().unwrap().into_vec().await;
    assert_eq!(lines, ["a", "b", "c"]);
}
