//! Capture-aware printing and terminal diagnostics.

use std::fmt::Display;
use std::io::Write;

use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

use crate::capture;
use crate::error::ScriptError;

/// Print without a newline. Inside a capture frame this lands in the
/// frame's stdout group; outside it goes to the OS stream.
pub fn print(message: impl Display) {
    match capture::current().and_then(|ctx| ctx.stdout_group()) {
        Some(group) => group.write(message.to_string().into_bytes()),
        None => {
            let mut stdout = std::io::stdout();
            let _ = write!(stdout, "{}", message);
            let _ = stdout.flush();
        }
    }
}

/// Print a line, capture-aware like [`print`].
pub fn println(message: impl Display) {
    match capture::current().and_then(|ctx| ctx.stdout_group()) {
        Some(group) => group.writeln(message),
        None => {
            let mut stdout = std::io::stdout();
            let _ = writeln!(stdout, "{}", message);
        }
    }
}

/// Print a line to stderr, capture-aware.
pub fn eprintln(message: impl Display) {
    match capture::current().and_then(|ctx| ctx.stderr_group()) {
        Some(group) => group.writeln(message),
        None => {
            let mut stderr = std::io::stderr();
            let _ = writeln!(stderr, "{}", message);
        }
    }
}

/// The diagnostic block injected into a script's stderr when a
/// non-script error escapes its user code: the error line followed by
/// its cause chain, one line per cause.
pub(crate) fn format_error_in(name: &str, err: &ScriptError) -> String {
    use std::error::Error;

    let mut message = format!("Error in {}:\n{}\n", name, err);
    let mut previous = err.to_string();
    let mut cause = err.source();
    while let Some(err) = cause {
        let line = err.to_string();
        // Wrapper errors that delegate their Display to the payload
        // would print it twice; keep one copy.
        if line != previous {
            message.push_str(&line);
            message.push('\n');
        }
        previous = line;
        cause = err.source();
    }
    message
}

pub(crate) fn error(message: std::fmt::Arguments) {
    let stream = StandardStream::stderr(ColorChoice::Auto);
    let mut lock = stream.lock();
    let _ = lock.set_color(ColorSpec::new().set_bold(true).set_fg(Some(Color::Red)));
    let _ = write!(lock, "error:");
    let _ = lock.reset();
    let _ = writeln!(lock, " {message}");
}

/// Verbose trace of a command about to run, `> cmd` prompt style.
pub(crate) fn trace_command(line: &str) {
    let stream = StandardStream::stderr(ColorChoice::Auto);
    let mut lock = stream.lock();
    let _ = lock.set_color(ColorSpec::new().set_bold(true));
    let _ = write!(lock, ">");
    let _ = lock.reset();
    let _ = writeln!(lock, " {line}");
}

/// Verbose trace of a non-zero exit, `=> exit n` style.
pub(crate) fn trace_exit(code: i32) {
    let stream = StandardStream::stderr(ColorChoice::Auto);
    let mut lock = stream.lock();
    let _ = writeln!(lock, "=> {}", crate::exit::describe(code));
}

/// Lifecycle detail behind the context's debug flag.
pub(crate) fn debug_line(message: &str) {
    let stream = StandardStream::stderr(ColorChoice::Auto);
    let mut lock = stream.lock();
    let _ = lock.set_color(ColorSpec::new().set_dimmed(true));
    let _ = writeln!(lock, "# {message}");
    let _ = lock.reset();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ScriptError, ScriptFailed};

    #[test]
    fn diagnostic_includes_the_cause_chain() {
        let err = ScriptError::context("boom", ScriptError::Failed(ScriptFailed::new("step", 3)));
        assert_eq!(
            format_error_in("cap", &err),
            "Error in cap:\nboom\nscript `step` failed: exit 3\n"
        );
    }

    #[test]
    fn diagnostic_without_a_cause_is_two_lines() {
        let err = ScriptError::unhandled("boom");
        assert_eq!(format_error_in("cap", &err), "Error in cap:\nboom\n");
    }

    #[test]
    fn delegating_wrappers_are_not_printed_twice() {
        // Failed's Display restates its payload; the chain keeps one
        // copy of it.
        let err = ScriptError::Failed(ScriptFailed::new("step", 3));
        assert_eq!(
            format_error_in("cap", &err),
            "Error in cap:\nscript `step` failed: exit 3\n"
        );
    }
}
