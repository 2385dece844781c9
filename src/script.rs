//! The uniform four-port script unit.
//!
//! A `Script` is anything with a stdin sink, stdout/stderr streams,
//! and an exit code: a subprocess, a capture block running user code,
//! or a stream transformer. Every constructor funnels through the
//! late-binding [`ScriptComponents`] factory; the shell built here
//! owns the lifecycle, the one-macrotask grace window that forwards
//! unconsumed output to ambient stdio, and the signal plumbing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::yield_now;

use crate::capture::{self, ChildGuard, ScriptContext};
use crate::delayed::DelayedOneShot;
use crate::error::{Result, ScriptError, ScriptFailed};
use crate::exit;
use crate::out;
use crate::stream::{ByteStream, LineStream};

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        pub use nix::sys::signal::Signal;
    } else {
        /// The subset of signals deliverable on non-unix hosts.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum Signal {
            SIGINT,
            SIGTERM,
            SIGKILL,
            SIGHUP,
        }
    }
}

/// Raw output stream handed over by a factory. Production errors on
/// this stream are routed into the script's exit code, never onto the
/// public data streams.
pub type RawStream = BoxStream<'static, std::io::Result<Vec<u8>>>;

/// The factory-side exit future.
pub type ExitFuture = BoxFuture<'static, i32>;

/// Signal handler supplied by a factory. An `Err` is routed through
/// the script's error path, like any other callback failure.
pub type KillFn = Box<dyn FnMut(Signal) -> Result<bool> + Send>;

/// Where a script's buffered stdin writes are delivered once the
/// factory has resolved.
pub enum StdinTarget {
    /// An async writer (a subprocess stdin pipe).
    Writer(Box<dyn AsyncWrite + Send + Unpin>),
    /// An in-process channel (capture and transformer scripts).
    Channel(mpsc::UnboundedSender<Vec<u8>>),
    /// Another script's stdin (pipeline head).
    Sink(StdinSink),
    /// Discard.
    Null,
}

/// The four raw ports produced by a late-binding factory.
pub struct ScriptComponents {
    pub stdin: StdinTarget,
    pub stdout: RawStream,
    pub stderr: RawStream,
    pub exit: ExitFuture,
}

/// Write handle for a script's stdin. Writes made before the factory
/// resolves are buffered; writes after the script has exited fail
/// through the sink's own result.
#[derive(Clone)]
pub struct StdinSink {
    name: Arc<str>,
    tx: Arc<Mutex<Option<mpsc::Sender<Vec<u8>>>>>,
}

impl StdinSink {
    fn new(name: &str, tx: mpsc::Sender<Vec<u8>>) -> StdinSink {
        StdinSink {
            name: Arc::from(name),
            tx: Arc::new(Mutex::new(Some(tx))),
        }
    }

    fn closed_error(&self) -> ScriptError {
        ScriptError::InvalidInput(format!("stdin of `{}` is closed", self.name))
    }

    pub async fn write(&self, chunk: impl Into<Vec<u8>>) -> Result<()> {
        let tx = self.tx.lock().clone();
        match tx {
            Some(tx) => tx.send(chunk.into()).await.map_err(|_| self.closed_error()),
            None => Err(self.closed_error()),
        }
    }

    pub async fn writeln(&self, line: impl AsRef<str>) -> Result<()> {
        let mut bytes = line.as_ref().as_bytes().to_vec();
        bytes.push(b'\n');
        self.write(bytes).await
    }

    /// Feed an entire stream into the sink, then close it. Stops early
    /// if the script goes away.
    pub async fn pipe_from(&self, mut stream: ByteStream) -> Result<()> {
        while let Some(chunk) = stream.next().await {
            if let Err(err) = self.write(chunk).await {
                self.close();
                return Err(err);
            }
        }
        self.close();
        Ok(())
    }

    pub fn close(&self) {
        self.tx.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }
}

/// Broadcast-once output port.
struct OutputTap {
    which: &'static str,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    taken: AtomicBool,
}

impl OutputTap {
    fn new(which: &'static str, rx: mpsc::UnboundedReceiver<Vec<u8>>) -> OutputTap {
        OutputTap {
            which,
            rx: Mutex::new(Some(rx)),
            taken: AtomicBool::new(false),
        }
    }

    fn take(&self) -> Result<ByteStream> {
        match self.rx.lock().take() {
            Some(rx) => {
                self.taken.store(true, Ordering::SeqCst);
                Ok(ByteStream::from_channel(rx))
            }
            None => Err(ScriptError::AlreadyConsumed { stream: self.which }),
        }
    }

    fn is_taken(&self) -> bool {
        self.taken.load(Ordering::SeqCst)
    }
}

struct ScriptInner {
    name: String,
    stdin: StdinSink,
    stdout: OutputTap,
    stderr: OutputTap,
    /// Side door for diagnostics written by the shell itself; cleared
    /// at exit so the stderr stream can seal.
    stderr_extra: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    exit: DelayedOneShot<i32>,
    done: DelayedOneShot<Result<()>>,
    kill: Mutex<Option<KillFn>>,
    /// Whether some caller has taken responsibility for this script's
    /// failure (by requesting `done`, `output`, or `success`, or by
    /// absorbing it into a pipeline).
    claimed: AtomicBool,
    context: Option<ScriptContext>,
}

impl ScriptInner {
    fn write_diagnostic(&self, err: &ScriptError) {
        if let Some(tx) = &*self.stderr_extra.lock() {
            let _ = tx.send(out::format_error_in(&self.name, err).into_bytes());
        }
    }

    /// Resolve exit and done from an error, first writer wins. Used by
    /// both the driver's failure path and mid-flight error injection.
    fn settle_error(&self, err: ScriptError) -> i32 {
        if !matches!(err, ScriptError::Failed(_)) {
            self.write_diagnostic(&err);
        }
        self.exit.complete(err.exit_code());
        let code = self.exit.try_value().unwrap_or_else(|| err.exit_code());
        let done_err = match err {
            // Keep the precise kind; everything else collapses into
            // the uniform failure carrying the script's own name.
            ScriptError::CaptureClosed { .. } => err,
            _ => ScriptError::Failed(ScriptFailed::new(self.name.clone(), code)),
        };
        self.done.complete(Err(done_err));
        code
    }
}

/// The uniform script unit. Cheap to clone; all clones share the same
/// ports.
#[derive(Clone)]
pub struct Script {
    inner: Arc<ScriptInner>,
}

impl Script {
    /// The primitive every other constructor shares: wrap a factory
    /// that late-binds the four raw ports.
    pub fn from_components<F, Fut>(name: impl Into<String>, factory: F) -> Script
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<ScriptComponents>> + Send + 'static,
    {
        Script::from_components_with_kill(name, factory, None)
    }

    pub fn from_components_with_kill<F, Fut>(
        name: impl Into<String>,
        factory: F,
        kill: Option<KillFn>,
    ) -> Script
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<ScriptComponents>> + Send + 'static,
    {
        let name = name.into();
        let (stdin_tx, stdin_rx) = mpsc::channel::<Vec<u8>>(64);
        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();

        let exit = DelayedOneShot::new();
        exit.release();

        let context = capture::current();
        let inner = Arc::new(ScriptInner {
            stdin: StdinSink::new(&name, stdin_tx),
            stdout: OutputTap::new("stdout", stdout_rx),
            stderr: OutputTap::new("stderr", stderr_rx),
            stderr_extra: Mutex::new(Some(stderr_tx.clone())),
            exit,
            done: DelayedOneShot::new(),
            kill: Mutex::new(kill),
            claimed: AtomicBool::new(false),
            context: context.clone(),
            name,
        });

        // Children register before the grace window opens.
        let registration = match &context {
            Some(ctx) => ctx.register_child(&inner.name).map(Some),
            None => Ok(None),
        };

        tokio::spawn(drive(
            Arc::clone(&inner),
            factory,
            stdin_rx,
            stdout_tx,
            stderr_tx,
            registration,
        ));
        tokio::spawn(grace_window(Arc::clone(&inner)));

        Script { inner }
    }

    /// A script that is already in its error state; used where a
    /// composition step fails but the API returns a `Script`.
    pub(crate) fn from_error(name: impl Into<String>, err: ScriptError) -> Script {
        Script::from_components(name, move || async move { Err(err) })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The write handle for this script's stdin.
    pub fn stdin(&self) -> StdinSink {
        self.inner.stdin.clone()
    }

    /// Take the stdout stream. Fails on a second take, or once the
    /// grace window has forwarded the stream to ambient stdio.
    pub fn stdout(&self) -> Result<ByteStream> {
        let stream = self.inner.stdout.take()?;
        self.release_if_fully_consumed();
        Ok(stream)
    }

    pub fn stderr(&self) -> Result<ByteStream> {
        let stream = self.inner.stderr.take()?;
        self.release_if_fully_consumed();
        Ok(stream)
    }

    /// Stdout split into lines.
    pub fn lines(&self) -> Result<LineStream> {
        Ok(self.stdout()?.lines())
    }

    fn release_if_fully_consumed(&self) {
        if self.inner.stdout.is_taken() && self.inner.stderr.is_taken() {
            self.inner.done.release();
        }
    }

    /// The exit code; resolves on termination. Observing it does not
    /// take responsibility for a failure.
    pub async fn exit_code(&self) -> i32 {
        self.inner.exit.wait().await
    }

    /// Resolves `Ok` iff the exit code is zero.
    pub async fn done(&self) -> Result<()> {
        self.claim();
        self.inner.done.wait().await
    }

    pub async fn success(&self) -> bool {
        self.claim();
        exit::success(self.inner.exit.wait().await)
    }

    /// Collect stdout as text and fail if the script fails.
    pub async fn output(&self) -> Result<String> {
        self.claim();
        let stdout = self.stdout()?;
        let (text, done) = futures::join!(stdout.text(), self.inner.done.wait());
        done?;
        Ok(text)
    }

    /// Deliver SIGTERM. Returns whether the script accepted it.
    pub fn kill(&self) -> bool {
        self.kill_signal(Signal::SIGTERM)
    }

    /// Deliver a specific signal. `false` when the script has already
    /// exited or its factory declined the signal.
    pub fn kill_signal(&self, signal: Signal) -> bool {
        if self.inner.exit.is_complete() {
            return false;
        }
        let outcome = {
            let mut kill = self.inner.kill.lock();
            match kill.as_mut() {
                Some(handler) => handler(signal),
                None => Ok(false),
            }
        };
        match outcome {
            Ok(accepted) => accepted,
            Err(err) => {
                self.inner.settle_error(err);
                true
            }
        }
    }

    pub(crate) fn claim(&self) {
        self.inner.claimed.store(true, Ordering::SeqCst);
    }
}

async fn drive<F, Fut>(
    inner: Arc<ScriptInner>,
    factory: F,
    stdin_rx: mpsc::Receiver<Vec<u8>>,
    stdout_tx: mpsc::UnboundedSender<Vec<u8>>,
    stderr_tx: mpsc::UnboundedSender<Vec<u8>>,
    registration: Result<Option<ChildGuard>>,
) where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<ScriptComponents>> + Send + 'static,
{
    let guard = match registration {
        Ok(guard) => guard,
        Err(err) => {
            finish_error(&inner, None, err).await;
            return;
        }
    };

    let components = match factory().await {
        Ok(components) => components,
        Err(err) => {
            finish_error(&inner, guard, err).await;
            return;
        }
    };

    let produce_err: Arc<Mutex<Option<ScriptError>>> = Arc::new(Mutex::new(None));
    let stdin_task = tokio::spawn(pump_stdin(stdin_rx, components.stdin));
    let stdout_task = tokio::spawn(pump_output(
        components.stdout,
        stdout_tx,
        Arc::clone(&produce_err),
    ));
    let stderr_task = tokio::spawn(pump_output(
        components.stderr,
        stderr_tx,
        Arc::clone(&produce_err),
    ));

    let code = components.exit.await;

    // Stdin closes, and its upstream with it, no later than exit
    // resolution.
    inner.stdin.close();
    let _ = stdin_task.await;
    // Let the output sides flush to their terminal close.
    let _ = stdout_task.await;
    let _ = stderr_task.await;

    let produce_err = produce_err.lock().take();
    match produce_err {
        Some(err) => {
            let code = match &err {
                ScriptError::Failed(failed) => failed.exit_code,
                _ => exit::UNHANDLED_ERROR,
            };
            if !matches!(err, ScriptError::Failed(_)) {
                inner.write_diagnostic(&err);
            }
            inner.stderr_extra.lock().take();
            inner.exit.complete(code);
            let failure = ScriptError::Failed(ScriptFailed::new(inner.name.clone(), code));
            settle(&inner, guard, Err(failure)).await;
        }
        None => {
            inner.stderr_extra.lock().take();
            inner.exit.complete(code);
            settle(&inner, guard, classify(&inner.name, code)).await;
        }
    }
}

fn classify(name: &str, code: i32) -> Result<()> {
    if exit::success(code) {
        Ok(())
    } else {
        Err(ScriptError::Failed(ScriptFailed::new(name, code)))
    }
}

async fn settle(inner: &Arc<ScriptInner>, guard: Option<ChildGuard>, result: Result<()>) {
    // One macrotask so the last data chunks reach their consumers
    // before completion is observable.
    yield_now().await;
    let code = inner.exit.try_value().unwrap_or(exit::UNHANDLED_ERROR);
    inner.done.complete(result);
    if let Some(guard) = guard {
        guard.finish(code, inner.claimed.load(Ordering::SeqCst));
    }
}

async fn finish_error(inner: &Arc<ScriptInner>, guard: Option<ChildGuard>, err: ScriptError) {
    let code = inner.settle_error(err);
    inner.stderr_extra.lock().take();
    yield_now().await;
    if let Some(guard) = guard {
        guard.finish(code, inner.claimed.load(Ordering::SeqCst));
    }
}

async fn pump_stdin(mut rx: mpsc::Receiver<Vec<u8>>, target: StdinTarget) {
    match target {
        StdinTarget::Writer(mut writer) => {
            while let Some(chunk) = rx.recv().await {
                if writer.write_all(&chunk).await.is_err() {
                    break;
                }
            }
            let _ = writer.shutdown().await;
        }
        StdinTarget::Channel(tx) => {
            while let Some(chunk) = rx.recv().await {
                if tx.send(chunk).is_err() {
                    break;
                }
            }
        }
        StdinTarget::Sink(sink) => {
            while let Some(chunk) = rx.recv().await {
                if sink.write(chunk).await.is_err() {
                    break;
                }
            }
            sink.close();
        }
        StdinTarget::Null => while rx.recv().await.is_some() {},
    }
}

async fn pump_output(
    mut src: RawStream,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    err_slot: Arc<Mutex<Option<ScriptError>>>,
) {
    while let Some(item) = src.next().await {
        match item {
            Ok(chunk) => {
                if chunk.is_empty() {
                    continue;
                }
                // A consumer walking away is interest withdrawal, not
                // cancellation: keep draining the source.
                let _ = tx.send(chunk);
            }
            Err(err) => {
                let mut slot = err_slot.lock();
                if slot.is_none() {
                    *slot = Some(ScriptError::unhandled(err));
                }
                break;
            }
        }
    }
}

/// After one macrotask, any output port the caller has not consumed is
/// attached to the ambient stdio group (or the OS streams when there
/// is no enclosing capture), and `done` is released.
async fn grace_window(inner: Arc<ScriptInner>) {
    yield_now().await;
    yield_now().await;
    if let Ok(stream) = inner.stdout.take() {
        forward_ambient(&inner.context, stream, false);
    }
    if let Ok(stream) = inner.stderr.take() {
        forward_ambient(&inner.context, stream, true);
    }
    inner.done.release();
}

pub(crate) fn forward_ambient(context: &Option<ScriptContext>, stream: ByteStream, is_err: bool) {
    let group = context.as_ref().and_then(|ctx| {
        if is_err {
            ctx.stderr_group()
        } else {
            ctx.stdout_group()
        }
    });
    match group {
        Some(group) => {
            // If the frame exited while this script was still
            // producing, the add fails and late output is discarded.
            let _ = group.add(stream);
        }
        None => {
            tokio::spawn(async move {
                if is_err {
                    let mut err = tokio::io::stderr();
                    let _ = stream.pipe_to(&mut err).await;
                } else {
                    let mut out = tokio::io::stdout();
                    let _ = stream.pipe_to(&mut out).await;
                }
            });
        }
    }
}
