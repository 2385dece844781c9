//! In-process scripts: stream transformers, raw streams, and `xargs`.
//!
//! All of these reuse the raw-components factory: stdin is an internal
//! channel, stdout is that channel transformed, and the exit code
//! resolves when the transformed stream closes. Killing a transformer
//! closes its input side, which the transform observes as upstream
//! cancellation, and forces exit 143.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use futures::stream::{Stream, StreamExt};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Result, ScriptError};
use crate::exit;
use crate::pipeline::IntoScript;
use crate::script::{ExitFuture, KillFn, RawStream, Script, ScriptComponents, StdinTarget};
use crate::stream::{ByteStream, ChannelStream, LineStream};

/// Shared stop flag between a transformer's kill handler and its
/// input stream.
#[derive(Clone)]
struct Stop {
    stopped: Arc<AtomicBool>,
    waker: Arc<Mutex<Option<Waker>>>,
}

impl Stop {
    fn new() -> Stop {
        Stop {
            stopped: Arc::new(AtomicBool::new(false)),
            waker: Arc::new(Mutex::new(None)),
        }
    }

    fn stop(&self) -> bool {
        let first = !self.stopped.swap(true, Ordering::SeqCst);
        if let Some(waker) = self.waker.lock().take() {
            waker.wake();
        }
        first
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Ends as soon as the stop flag is raised, regardless of the inner
/// stream's state.
struct StoppableStream<S> {
    inner: S,
    stop: Stop,
}

impl<S: Stream<Item = Vec<u8>> + Unpin> Stream for StoppableStream<S> {
    type Item = Vec<u8>;

    fn poll_next(mut self: std::pin::Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Vec<u8>>> {
        if self.stop.is_stopped() {
            return Poll::Ready(None);
        }
        *self.stop.waker.lock() = Some(cx.waker().clone());
        let polled = self.inner.poll_next_unpin(cx);
        if self.stop.is_stopped() {
            return Poll::Ready(None);
        }
        polled
    }
}

/// Wrap a transformed output stream so the factory exit future
/// resolves when it closes: 0 on a natural end, 143 when killed.
fn monitored(out: ByteStream, stop: Stop) -> (RawStream, ExitFuture) {
    let (exit_tx, exit_rx) = oneshot::channel();
    let stream = futures::stream::unfold(
        (out, Some(exit_tx), stop),
        |(mut out, mut exit_tx, stop)| async move {
            // A panic in a user transform closure surfaces during this
            // poll; it must become the exit code, not kill the pump.
            let item = std::panic::AssertUnwindSafe(out.next()).catch_unwind().await;
            match item {
                Ok(Some(chunk)) => Some((Ok(chunk), (out, exit_tx, stop))),
                Ok(None) => {
                    if let Some(tx) = exit_tx.take() {
                        let code = if stop.is_stopped() {
                            exit::INTERRUPTED
                        } else {
                            exit::SUCCESS
                        };
                        let _ = tx.send(code);
                    }
                    None
                }
                Err(_panic) => {
                    if let Some(tx) = exit_tx.take() {
                        let _ = tx.send(exit::UNHANDLED_ERROR);
                    }
                    None
                }
            }
        },
    )
    .boxed();
    let exit = Box::pin(async move { exit_rx.await.unwrap_or(exit::UNHANDLED_ERROR) });
    (stream, exit)
}

fn transformer_components<F>(f: F) -> (KillFn, impl FnOnce() -> Result<ScriptComponents>)
where
    F: FnOnce(ByteStream) -> ByteStream + Send + 'static,
{
    let stop = Stop::new();
    let kill: KillFn = Box::new({
        let stop = stop.clone();
        move |_signal| Ok(stop.stop())
    });
    let build = move || {
        let (tx, rx) = mpsc::unbounded_channel();
        let input = ByteStream::new(StoppableStream {
            inner: ChannelStream(rx),
            stop: stop.clone(),
        });
        let (stdout, exit) = monitored(f(input), stop);
        Ok(ScriptComponents {
            stdin: StdinTarget::Channel(tx),
            stdout,
            stderr: futures::stream::empty().boxed(),
            exit,
        })
    };
    (kill, build)
}

impl Script {
    /// A script transforming its stdin bytes into its stdout bytes.
    pub fn byte_transform<F>(name: impl Into<String>, f: F) -> Script
    where
        F: FnOnce(ByteStream) -> ByteStream + Send + 'static,
    {
        let (kill, build) = transformer_components(f);
        Script::from_components_with_kill(name, move || async move { build() }, Some(kill))
    }

    /// A byte transformer bracketed by line decoding and newline
    /// re-encoding.
    pub fn line_transform<F>(name: impl Into<String>, f: F) -> Script
    where
        F: FnOnce(LineStream) -> LineStream + Send + 'static,
    {
        Script::byte_transform(name, move |bytes| f(bytes.lines()).bytes())
    }

    /// A script applying a function to each input line.
    pub fn map_lines<F>(name: impl Into<String>, f: F) -> Script
    where
        F: FnMut(String) -> String + Send + 'static,
    {
        Script::line_transform(name, move |lines| LineStream::new(lines.map(f)))
    }

    /// Wrap a raw byte stream as a script: stdout is the stream, stdin
    /// is discarded, and the exit code is 0 when the stream ends (143
    /// if killed first).
    pub fn from_stream(name: impl Into<String>, stream: ByteStream) -> Script {
        let stop = Stop::new();
        let kill: KillFn = Box::new({
            let stop = stop.clone();
            move |_signal| Ok(stop.stop())
        });
        Script::from_components_with_kill(
            name,
            move || async move {
                let source = ByteStream::new(StoppableStream {
                    inner: stream,
                    stop: stop.clone(),
                });
                let (stdout, exit) = monitored(source, stop);
                Ok(ScriptComponents {
                    stdin: StdinTarget::Null,
                    stdout,
                    stderr: futures::stream::empty().boxed(),
                    exit,
                })
            },
            Some(kill),
        )
    }
}

/// Pipeline-item wrapper for a byte transformer closure.
pub struct ByteTransform<F>(F);

/// A stdin-to-stdout byte transformer, usable as a pipeline item.
pub fn byte_transform<F>(f: F) -> ByteTransform<F>
where
    F: FnOnce(ByteStream) -> ByteStream + Send + 'static,
{
    ByteTransform(f)
}

impl<F> IntoScript for ByteTransform<F>
where
    F: FnOnce(ByteStream) -> ByteStream + Send + 'static,
{
    fn into_script(self) -> Script {
        Script::byte_transform("transform", self.0)
    }
}

/// Pipeline-item wrapper for a line transformer closure.
pub struct LineTransform<F>(F);

pub fn line_transform<F>(f: F) -> LineTransform<F>
where
    F: FnOnce(LineStream) -> LineStream + Send + 'static,
{
    LineTransform(f)
}

impl<F> IntoScript for LineTransform<F>
where
    F: FnOnce(LineStream) -> LineStream + Send + 'static,
{
    fn into_script(self) -> Script {
        Script::line_transform("transform", self.0)
    }
}

/// Pipeline-item wrapper for a per-line map.
pub struct MapLines<F>(F);

pub fn map_lines<F>(f: F) -> MapLines<F>
where
    F: FnMut(String) -> String + Send + 'static,
{
    MapLines(f)
}

impl<F> IntoScript for MapLines<F>
where
    F: FnMut(String) -> String + Send + 'static,
{
    fn into_script(self) -> Script {
        Script::map_lines("map", self.0)
    }
}

impl LineStream {
    /// Invoke `cb` with batches of at most `max_args` elements,
    /// sequentially, as a script. A failing callback aborts the run
    /// with exit 257; remaining batches are not attempted.
    pub fn xargs<F, Fut>(self, max_args: usize, mut cb: F) -> Script
    where
        F: FnMut(Vec<String>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Script::from_components("xargs", move || async move {
            if max_args == 0 {
                return Err(ScriptError::InvalidInput(
                    "xargs requires max_args >= 1".to_owned(),
                ));
            }
            let (err_tx, err_rx) = mpsc::unbounded_channel();
            let exit: ExitFuture = Box::pin(async move {
                let mut lines = self;
                let mut batch = Vec::new();
                loop {
                    let item = lines.next().await;
                    match item {
                        Some(line) => {
                            batch.push(line);
                            if batch.len() < max_args {
                                continue;
                            }
                        }
                        None if batch.is_empty() => break,
                        None => {}
                    }
                    let full = std::mem::take(&mut batch);
                    let ended = full.len() < max_args;
                    let outcome = std::panic::AssertUnwindSafe(cb(full)).catch_unwind().await;
                    match outcome {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            let _ = err_tx.send(format!("xargs: {}\n", err).into_bytes());
                            return exit::UNHANDLED_ERROR;
                        }
                        Err(panic) => {
                            let message = crate::capture::panic_message(panic);
                            let _ = err_tx.send(format!("xargs: {}\n", message).into_bytes());
                            return exit::UNHANDLED_ERROR;
                        }
                    }
                    if ended {
                        break;
                    }
                }
                exit::SUCCESS
            });
            Ok(ScriptComponents {
                stdin: StdinTarget::Null,
                stdout: futures::stream::empty().boxed(),
                stderr: ChannelStream(err_rx).map(Ok).boxed(),
                exit,
            })
        })
    }
}
