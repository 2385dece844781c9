//! Capture frames and the ambient script context.
//!
//! A capture runs user code as a virtual script: prints and the
//! unconsumed output of nested scripts land in the frame's stdio
//! groups instead of the OS streams, and the frame refuses to finish
//! until every registered child script has. The context is carried in
//! a task-local so nested captures form a stack.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::yield_now;

use crate::env::EnvOverlay;
use crate::error::{Result, ScriptError};
use crate::exit;
use crate::out;
use crate::script::{KillFn, Script, ScriptComponents, Signal, StdinTarget};
use crate::stdio_group::StdioGroup;
use crate::stream::ByteStream;

tokio::task_local! {
    static CONTEXT: ScriptContext;
}

/// The context of the innermost enclosing capture frame, if any.
pub(crate) fn current() -> Option<ScriptContext> {
    CONTEXT.try_with(|ctx| ctx.clone()).ok()
}

/// Run a future under the given context.
pub(crate) async fn scoped<F: Future>(ctx: ScriptContext, fut: F) -> F::Output {
    CONTEXT.scope(ctx, fut).await
}

struct ContextInner {
    name: String,
    stdout: Option<StdioGroup>,
    stderr: Option<StdioGroup>,
    tracker: Option<ChildTracker>,
    env: EnvOverlay,
    verbose: bool,
    debug: bool,
}

/// One dynamically-scoped record per capture frame.
#[derive(Clone)]
pub struct ScriptContext {
    inner: Arc<ContextInner>,
}

impl ScriptContext {
    /// The innermost enclosing capture frame, if any. The handle can
    /// outlive the task-local scope; use [`ScriptContext::run`] to
    /// re-enter the frame from spawned tasks or deferred work.
    pub fn current() -> Option<ScriptContext> {
        current()
    }

    /// Run a future inside this frame. Scripts it creates register
    /// with the frame's tracker; once the frame has completed they
    /// fail with `CaptureClosed`.
    pub async fn run<F: Future>(self, fut: F) -> F::Output {
        CONTEXT.scope(self, fut).await
    }

    /// Whether the frame has completed and refuses new scripts.
    pub fn is_closed(&self) -> bool {
        match &self.inner.tracker {
            Some(tracker) => tracker.inner.lock().closed,
            None => false,
        }
    }

    fn frame(
        parent: Option<&ScriptContext>,
        name: &str,
        stdout: StdioGroup,
        stderr: StdioGroup,
        tracker: ChildTracker,
    ) -> ScriptContext {
        ScriptContext {
            inner: Arc::new(ContextInner {
                name: name.to_owned(),
                stdout: Some(stdout),
                stderr: Some(stderr),
                tracker: Some(tracker),
                env: parent.map(|p| p.inner.env.clone()).unwrap_or_default(),
                verbose: parent.map(|p| p.inner.verbose).unwrap_or(false),
                debug: parent.map(|p| p.inner.debug).unwrap_or(false),
            }),
        }
    }

    /// A context outside any capture, used to scope env or flags at
    /// top level.
    fn bare() -> ScriptContext {
        ScriptContext {
            inner: Arc::new(ContextInner {
                name: String::new(),
                stdout: None,
                stderr: None,
                tracker: None,
                env: EnvOverlay::new(),
                verbose: false,
                debug: false,
            }),
        }
    }

    /// Same frame, different environment overlay.
    pub(crate) fn derive_env(base: Option<ScriptContext>, env: EnvOverlay) -> ScriptContext {
        let base = base.unwrap_or_else(ScriptContext::bare);
        ScriptContext {
            inner: Arc::new(ContextInner {
                name: base.inner.name.clone(),
                stdout: base.inner.stdout.clone(),
                stderr: base.inner.stderr.clone(),
                tracker: base.inner.tracker.clone(),
                env,
                verbose: base.inner.verbose,
                debug: base.inner.debug,
            }),
        }
    }

    /// Same frame, different trace flags.
    pub(crate) fn derive_flags(
        base: Option<ScriptContext>,
        verbose: bool,
        debug: bool,
    ) -> ScriptContext {
        let base = base.unwrap_or_else(ScriptContext::bare);
        ScriptContext {
            inner: Arc::new(ContextInner {
                name: base.inner.name.clone(),
                stdout: base.inner.stdout.clone(),
                stderr: base.inner.stderr.clone(),
                tracker: base.inner.tracker.clone(),
                env: base.inner.env.clone(),
                verbose,
                debug,
            }),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.inner.name
    }

    pub(crate) fn stdout_group(&self) -> Option<StdioGroup> {
        self.inner.stdout.clone()
    }

    pub(crate) fn stderr_group(&self) -> Option<StdioGroup> {
        self.inner.stderr.clone()
    }

    pub(crate) fn env(&self) -> &EnvOverlay {
        &self.inner.env
    }

    pub(crate) fn verbose(&self) -> bool {
        self.inner.verbose
    }

    pub(crate) fn debug(&self) -> bool {
        self.inner.debug
    }

    /// Register a new child script with this frame's tracker. Fails
    /// once the frame has completed.
    pub(crate) fn register_child(&self, child: &str) -> Result<ChildGuard> {
        match &self.inner.tracker {
            Some(tracker) => tracker.register(child),
            None => Ok(ChildGuard::detached()),
        }
    }
}

struct TrackerInner {
    capture: String,
    pending: usize,
    spawns: u64,
    event: u64,
    /// First unclaimed child failure: (child name, exit code).
    error: Option<(String, i32)>,
    closed: bool,
    wakers: Vec<Waker>,
}

impl TrackerInner {
    fn bump(&mut self) {
        self.event += 1;
        for waker in self.wakers.drain(..) {
            waker.wake();
        }
    }
}

/// Futures-group of the child scripts registered in a capture frame.
#[derive(Clone)]
pub(crate) struct ChildTracker {
    inner: Arc<Mutex<TrackerInner>>,
}

impl ChildTracker {
    fn new(capture: &str) -> ChildTracker {
        ChildTracker {
            inner: Arc::new(Mutex::new(TrackerInner {
                capture: capture.to_owned(),
                pending: 0,
                spawns: 0,
                event: 0,
                error: None,
                closed: false,
                wakers: Vec::new(),
            })),
        }
    }

    fn register(&self, child: &str) -> Result<ChildGuard> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(ScriptError::CaptureClosed {
                capture: inner.capture.clone(),
            });
        }
        inner.pending += 1;
        inner.spawns += 1;
        inner.bump();
        Ok(ChildGuard {
            tracker: Some(self.clone()),
            child: child.to_owned(),
            finished: false,
        })
    }

    fn finish_child(&self, child: &str, code: i32, claimed: bool) {
        let mut inner = self.inner.lock();
        inner.pending = inner.pending.saturating_sub(1);
        if !exit::success(code) && !claimed && inner.error.is_none() {
            inner.error = Some((child.to_owned(), code));
        }
        inner.bump();
    }

    fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.bump();
    }

    fn snapshot(&self) -> (usize, u64, Option<(String, i32)>, u64) {
        let inner = self.inner.lock();
        (inner.pending, inner.spawns, inner.error.clone(), inner.event)
    }

    fn wait_event(&self, seen: u64) -> EventWait {
        EventWait {
            inner: Arc::clone(&self.inner),
            seen,
        }
    }
}

struct EventWait {
    inner: Arc<Mutex<TrackerInner>>,
    seen: u64,
}

impl Future for EventWait {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut inner = self.inner.lock();
        if inner.event != self.seen {
            return Poll::Ready(());
        }
        if !inner.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            inner.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

/// Drop-on-complete handle held by a script's driver, not by the
/// parent, so the frame and its children share no ownership cycle.
pub(crate) struct ChildGuard {
    tracker: Option<ChildTracker>,
    child: String,
    finished: bool,
}

impl ChildGuard {
    fn detached() -> ChildGuard {
        ChildGuard {
            tracker: None,
            child: String::new(),
            finished: false,
        }
    }

    pub(crate) fn finish(mut self, code: i32, claimed: bool) {
        if let Some(tracker) = self.tracker.take() {
            tracker.finish_child(&self.child, code, claimed);
        }
        self.finished = true;
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if !self.finished {
            if let Some(tracker) = self.tracker.take() {
                tracker.finish_child(&self.child, exit::SUCCESS, true);
            }
        }
    }
}

impl Script {
    /// Run user code as a virtual script. `cb` receives the script's
    /// stdin; its prints and any unconsumed child output become the
    /// script's stdout/stderr, and the exit code stays pending until
    /// every child script has completed.
    pub fn capture<F, Fut>(name: impl Into<String>, cb: F) -> Script
    where
        F: FnOnce(ByteStream) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Script::capture_impl(name.into(), cb, None)
    }

    /// Like [`Script::capture`], with a handler consulted when the
    /// script is killed.
    pub fn capture_with_signal<F, Fut, S>(name: impl Into<String>, cb: F, on_signal: S) -> Script
    where
        F: FnOnce(ByteStream) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
        S: FnMut(Signal) -> Result<bool> + Send + 'static,
    {
        Script::capture_impl(name.into(), cb, Some(Box::new(on_signal) as KillFn))
    }

    fn capture_impl<F, Fut>(name: String, cb: F, on_signal: Option<KillFn>) -> Script
    where
        F: FnOnce(ByteStream) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let factory_name = name.clone();
        // The factory runs in a spawned task, outside the caller's
        // task-local scope; the parent frame must be read here.
        let parent = current();
        Script::from_components_with_kill(
            name,
            move || async move {
                let stdout = StdioGroup::new(factory_name.clone());
                let stderr = StdioGroup::new(factory_name.clone());
                let tracker = ChildTracker::new(&factory_name);
                let ctx = ScriptContext::frame(
                    parent.as_ref(),
                    &factory_name,
                    stdout.clone(),
                    stderr.clone(),
                    tracker.clone(),
                );

                let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
                let out_stream = stdout.stream()?;
                let err_stream = stderr.stream()?;
                let exit = Box::pin(run_capture(
                    factory_name,
                    ctx,
                    cb,
                    ByteStream::from_channel(stdin_rx),
                    stdout,
                    stderr,
                    tracker,
                ));

                Ok(ScriptComponents {
                    stdin: StdinTarget::Channel(stdin_tx),
                    stdout: out_stream.map(Ok).boxed(),
                    stderr: err_stream.map(Ok).boxed(),
                    exit,
                })
            },
            on_signal,
        )
    }
}

async fn run_capture<F, Fut>(
    name: String,
    ctx: ScriptContext,
    cb: F,
    stdin: ByteStream,
    stdout: StdioGroup,
    stderr: StdioGroup,
    tracker: ChildTracker,
) -> i32
where
    F: FnOnce(ByteStream) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    if ctx.debug() {
        out::debug_line(&format!("entering capture `{}`", name));
    }
    // The closure itself is invoked inside the scope too, so scripts
    // created before its first await still register with this frame.
    let result = std::panic::AssertUnwindSafe(CONTEXT.scope(ctx, async move { cb(stdin).await }))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(ScriptError::unhandled(panic_message(panic))));
    let code = match result {
        Ok(()) => wait_for_children(&tracker).await,
        // A script failure propagated out of the callback keeps its
        // exit code; its output already went through the groups.
        Err(ScriptError::Failed(failed)) => failed.exit_code,
        Err(err) => {
            stderr.write(out::format_error_in(&name, &err).into_bytes());
            exit::UNHANDLED_ERROR
        }
    };
    tracker.close();
    stdout.close();
    stderr.close();
    if let Some((_, child_code)) = tracker.snapshot().2 {
        // An unclaimed child failure wins over a clean callback.
        if exit::success(code) {
            return child_code;
        }
    }
    code
}

/// Idle once no child futures are pending and one scheduling step has
/// passed without new children being spawned.
async fn wait_for_children(tracker: &ChildTracker) -> i32 {
    loop {
        let (pending, spawns, error, event) = tracker.snapshot();
        if let Some((_, code)) = error {
            return code;
        }
        if pending == 0 {
            yield_now().await;
            let (pending, spawns_after, error, _) = tracker.snapshot();
            if let Some((_, code)) = error {
                return code;
            }
            if pending == 0 && spawns_after == spawns {
                return exit::SUCCESS;
            }
            continue;
        }
        tracker.wait_event(event).await;
    }
}

pub(crate) fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "panicked".to_owned()
    }
}

/// Scope trace flags for the duration of a future.
pub async fn with_trace<F: Future>(verbose: bool, debug: bool, fut: F) -> F::Output {
    let ctx = ScriptContext::derive_flags(current(), verbose, debug);
    CONTEXT.scope(ctx, fut).await
}
