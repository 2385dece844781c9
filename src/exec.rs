//! The subprocess script factory.
//!
//! Builds scripts backed by `tokio::process`. The command line is
//! tokenized (with optional glob expansion against the working
//! directory), the environment is resolved from the ambient overlay,
//! and signals delivered before the OS process exists are captured and
//! replayed after spawn.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use futures::stream::StreamExt;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;

use crate::args;
use crate::capture;
use crate::env::{self, EnvOverlay};
use crate::error::{Result, ScriptError};
use crate::out;
use crate::script::{KillFn, RawStream, Script, ScriptComponents, Signal, StdinTarget};

enum CommandLine {
    /// A full command line to tokenize (or hand to the shell).
    Line(String),
    /// An explicit program and argument vector; no tokenization, no
    /// glob expansion.
    Argv { program: String, args: Vec<String> },
}

/// Builder for subprocess scripts.
pub struct Command {
    line: CommandLine,
    name: Option<String>,
    workdir: Option<PathBuf>,
    env: EnvOverlay,
    include_parent_env: bool,
    run_in_shell: bool,
    globs: bool,
}

impl Command {
    /// A command from a shell-like command line.
    pub fn new(cmdline: impl Into<String>) -> Command {
        Command {
            line: CommandLine::Line(cmdline.into()),
            name: None,
            workdir: None,
            env: EnvOverlay::new(),
            include_parent_env: true,
            run_in_shell: false,
            globs: cfg!(not(windows)),
        }
    }

    /// A command from an explicit program name; arguments are added
    /// with [`Command::arg`] and pass through untouched.
    pub fn program(program: impl Into<String>) -> Command {
        Command {
            line: CommandLine::Argv {
                program: program.into(),
                args: Vec::new(),
            },
            name: None,
            workdir: None,
            env: EnvOverlay::new(),
            include_parent_env: true,
            run_in_shell: false,
            globs: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Command {
        if let CommandLine::Argv { args, .. } = &mut self.line {
            args.push(arg.into());
        }
        self
    }

    pub fn args<I>(mut self, new: I) -> Command
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        if let CommandLine::Argv { args, .. } = &mut self.line {
            args.extend(new.into_iter().map(Into::into));
        }
        self
    }

    /// Override the diagnostic name; defaults to the program token.
    pub fn name(mut self, name: impl Into<String>) -> Command {
        self.name = Some(name.into());
        self
    }

    pub fn workdir(mut self, dir: impl Into<PathBuf>) -> Command {
        self.workdir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Command {
        self.env = self.env.set(key, value);
        self
    }

    pub fn env_remove(mut self, key: &str) -> Command {
        self.env = self.env.unset(key);
        self
    }

    pub fn include_parent_env(mut self, include: bool) -> Command {
        self.include_parent_env = include;
        self
    }

    /// Hand the whole line to the system shell instead of tokenizing.
    pub fn run_in_shell(mut self) -> Command {
        self.run_in_shell = true;
        self
    }

    pub fn globs(mut self, globs: bool) -> Command {
        self.globs = globs;
        self
    }

    /// Spawn the subprocess as a script.
    pub fn spawn(self) -> Script {
        let name = self.name.clone().unwrap_or_else(|| self.display_name());
        let signal_state = Arc::new(Mutex::new(SignalState::Pending(Vec::new())));
        let kill: KillFn = Box::new({
            let state = Arc::clone(&signal_state);
            move |signal| Ok(deliver(&state, signal))
        });

        // Ambient state is read at spawn time; the factory itself runs
        // outside the caller's task-local scope.
        let context = capture::current();
        let ambient_env = context.as_ref().map(|ctx| ctx.env().clone());
        let verbose = context.as_ref().map(|ctx| ctx.verbose()).unwrap_or(false);

        let factory_name = name.clone();
        Script::from_components_with_kill(
            name,
            move || async move {
                build_components(self, factory_name, ambient_env, verbose, signal_state)
            },
            Some(kill),
        )
    }

    fn display_name(&self) -> String {
        match &self.line {
            CommandLine::Line(line) => line
                .split_whitespace()
                .next()
                .unwrap_or("command")
                .to_owned(),
            CommandLine::Argv { program, .. } => program.clone(),
        }
    }

    fn resolve_argv(&self) -> Result<Vec<String>> {
        match &self.line {
            CommandLine::Line(line) => {
                if self.run_in_shell {
                    Ok(shell_argv(line))
                } else {
                    let root = self
                        .workdir
                        .clone()
                        .unwrap_or_else(|| PathBuf::from("."));
                    args::parse_with_globs(line, &root, self.globs)
                }
            }
            CommandLine::Argv { program, args } => {
                let mut argv = Vec::with_capacity(args.len() + 1);
                argv.push(program.clone());
                argv.extend(args.iter().cloned());
                Ok(argv)
            }
        }
    }
}

impl Script {
    /// Spawn a subprocess from a shell-like command line.
    pub fn command(cmdline: impl Into<String>) -> Script {
        Command::new(cmdline).spawn()
    }
}

enum SignalState {
    /// Process not started yet; signals are captured for replay.
    Pending(Vec<Signal>),
    Started(i32),
    Done,
}

fn deliver(state: &Arc<Mutex<SignalState>>, signal: Signal) -> bool {
    let mut state = state.lock();
    match &mut *state {
        SignalState::Pending(queue) => {
            queue.push(signal);
            true
        }
        SignalState::Started(pid) => os_kill(*pid, signal),
        SignalState::Done => false,
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        fn os_kill(pid: i32, signal: Signal) -> bool {
            nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), signal).is_ok()
        }
    } else {
        fn os_kill(_pid: i32, _signal: Signal) -> bool {
            // No general signal delivery on this platform.
            false
        }
    }
}

fn build_components(
    command: Command,
    name: String,
    ambient_env: Option<EnvOverlay>,
    verbose: bool,
    signal_state: Arc<Mutex<SignalState>>,
) -> Result<ScriptComponents> {
    let argv = command.resolve_argv()?;
    if verbose {
        out::trace_command(&argv.join(" "));
    }

    let mut proc = tokio::process::Command::new(&argv[0]);
    proc.args(&argv[1..]);
    proc.env_clear();
    for (key, value) in env::resolve(
        command.include_parent_env,
        ambient_env.as_ref(),
        &command.env,
    ) {
        proc.env(key, value);
    }
    if let Some(dir) = &command.workdir {
        proc.current_dir(dir);
    }
    proc.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = proc.spawn().map_err(|err| {
        *signal_state.lock() = SignalState::Done;
        ScriptError::SpawnFailed {
            name: name.clone(),
            message: err.to_string(),
        }
    })?;

    let stdin = match child.stdin.take() {
        Some(writer) => StdinTarget::Writer(Box::new(writer)),
        None => StdinTarget::Null,
    };
    let stdout = match child.stdout.take() {
        Some(reader) => reader_stream(reader),
        None => futures::stream::empty().boxed(),
    };
    let stderr = match child.stderr.take() {
        Some(reader) => reader_stream(reader),
        None => futures::stream::empty().boxed(),
    };

    // The process exists now: replay any signals captured while it was
    // spawning.
    {
        let mut state = signal_state.lock();
        if let SignalState::Pending(queue) = &mut *state {
            let queued = std::mem::take(queue);
            let pid = child.id().map(|id| id as i32).unwrap_or(-1);
            *state = SignalState::Started(pid);
            for signal in queued {
                os_kill(pid, signal);
            }
        }
    }

    let exit_state = signal_state;
    let exit = Box::pin(async move {
        let code = match child.wait().await {
            Ok(status) => exit_code_of(status),
            Err(_) => crate::exit::UNHANDLED_ERROR,
        };
        *exit_state.lock() = SignalState::Done;
        if verbose && !crate::exit::success(code) {
            out::trace_exit(code);
        }
        code
    });

    Ok(ScriptComponents {
        stdin,
        stdout,
        stderr,
        exit,
    })
}

cfg_if::cfg_if! {
    if #[cfg(windows)] {
        fn shell_argv(line: &str) -> Vec<String> {
            vec!["cmd.exe".to_owned(), "/C".to_owned(), line.to_owned()]
        }
    } else {
        fn shell_argv(line: &str) -> Vec<String> {
            vec!["/bin/sh".to_owned(), "-c".to_owned(), line.to_owned()]
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        fn exit_code_of(status: std::process::ExitStatus) -> i32 {
            use std::os::unix::process::ExitStatusExt;

            match status.code() {
                Some(code) => code,
                None => status.signal().map(|sig| -sig).unwrap_or(-1),
            }
        }
    } else {
        fn exit_code_of(status: std::process::ExitStatus) -> i32 {
            status.code().unwrap_or(-1)
        }
    }
}

fn reader_stream<R>(reader: R) -> RawStream
where
    R: tokio::io::AsyncRead + Send + Unpin + 'static,
{
    futures::stream::unfold(Some(reader), |state| async move {
        let mut reader = state?;
        let mut buf = vec![0u8; 8192];
        match reader.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((Ok(buf), Some(reader)))
            }
            Err(err) => Some((Err(err), None)),
        }
    })
    .boxed()
}
