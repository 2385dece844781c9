//! Captures whose stdio is withheld until explicitly released.
//!
//! A buffered capture pushes its stdout and stderr into an entangled
//! pair. Nothing reaches ambient stdio until `release`, at which point
//! the buffered events replay in their original cross-stream order and
//! later events flow live. `silence_until_failure` builds on this to
//! keep a capture quiet unless it fails.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::StreamExt;
use tokio::task::yield_now;

use crate::capture::{self, ScriptContext};
use crate::entangled::{EntangledPair, EntangledSender, Lane};
use crate::error::Result;
use crate::script::{forward_ambient, Script, Signal};
use crate::stream::ByteStream;

enum BufferMode {
    Both,
    StderrOnly,
}

/// A capture whose output is buffered until [`BufferedScript::release`].
pub struct BufferedScript {
    script: Script,
    pair: EntangledPair,
    mode: BufferMode,
    released: AtomicBool,
    context: Option<ScriptContext>,
}

impl BufferedScript {
    /// Buffer both stdout and stderr of a capture.
    pub fn capture<F, Fut>(name: impl Into<String>, cb: F) -> BufferedScript
    where
        F: FnOnce(ByteStream) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        BufferedScript::build(name, cb, BufferMode::Both)
    }

    /// Buffer only stderr; stdout passes through to ambient stdio
    /// unbuffered.
    pub fn capture_stderr_only<F, Fut>(name: impl Into<String>, cb: F) -> BufferedScript
    where
        F: FnOnce(ByteStream) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        BufferedScript::build(name, cb, BufferMode::StderrOnly)
    }

    fn build<F, Fut>(name: impl Into<String>, cb: F, mode: BufferMode) -> BufferedScript
    where
        F: FnOnce(ByteStream) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let script = Script::capture(name, cb);
        // The caller decides later whether to release or discard, so
        // the inner failure must not surface on its own.
        script.claim();

        let pair = EntangledPair::new();
        if matches!(mode, BufferMode::Both) {
            if let Ok(stdout) = script.stdout() {
                feed_lane(stdout, pair.sender(Lane::First));
            }
        }
        if let Ok(stderr) = script.stderr() {
            feed_lane(stderr, pair.sender(Lane::Second));
        }

        BufferedScript {
            script,
            pair,
            mode,
            released: AtomicBool::new(false),
            context: capture::current(),
        }
    }

    /// Replay everything buffered so far into ambient stdio, let
    /// future output flow live, and wait for the capture to finish
    /// plus one propagation step. Idempotent.
    pub async fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            if matches!(self.mode, BufferMode::Both) {
                if let Ok(stdout) = self.pair.subscribe(Lane::First) {
                    forward_ambient(&self.context, stdout, false);
                }
            }
            if let Ok(stderr) = self.pair.subscribe(Lane::Second) {
                forward_ambient(&self.context, stderr, true);
            }
        }
        let _ = self.script.exit_code().await;
        yield_now().await;
    }

    pub fn name(&self) -> &str {
        self.script.name()
    }

    /// The inner capture's completion. Holding this is what decides
    /// the failure's fate; the enclosing capture will not see it.
    pub async fn done(&self) -> Result<()> {
        self.script.done().await
    }

    pub async fn exit_code(&self) -> i32 {
        self.script.exit_code().await
    }

    pub fn kill(&self) -> bool {
        self.script.kill()
    }

    pub fn kill_signal(&self, signal: Signal) -> bool {
        self.script.kill_signal(signal)
    }
}

fn feed_lane(mut stream: ByteStream, sender: EntangledSender) {
    tokio::spawn(async move {
        while let Some(chunk) = stream.next().await {
            sender.send(chunk);
        }
        sender.close();
    });
}

/// Run a capture and throw its stdio away, success or failure. The
/// result still reports the capture's outcome.
pub async fn silence<F, Fut>(name: impl Into<String>, cb: F) -> Result<()>
where
    F: FnOnce(ByteStream) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let script = Script::capture(name, cb);
    drop(script.stdout());
    drop(script.stderr());
    script.done().await
}

/// Run a capture discarding only its stderr.
pub async fn silence_stderr<F, Fut>(name: impl Into<String>, cb: F) -> Result<()>
where
    F: FnOnce(ByteStream) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let script = Script::capture(name, cb);
    drop(script.stderr());
    script.done().await
}

/// Run a capture silently; if it fails, flush everything it printed
/// in order and propagate the failure.
pub async fn silence_until_failure<F, Fut>(name: impl Into<String>, cb: F) -> Result<()>
where
    F: FnOnce(ByteStream) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let buffered = BufferedScript::capture(name, cb);
    match buffered.done().await {
        Ok(()) => Ok(()),
        Err(err) => {
            buffered.release().await;
            Err(err)
        }
    }
}
