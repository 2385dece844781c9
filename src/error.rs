use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ScriptError>;

/// A script terminated with a non-zero exit code.
///
/// Constructed only for failing exits; `exit_code != 0` is an invariant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptFailed {
    pub name: String,
    pub exit_code: i32,
}

impl ScriptFailed {
    pub fn new(name: impl Into<String>, exit_code: i32) -> ScriptFailed {
        debug_assert!(exit_code != 0, "ScriptFailed requires a non-zero exit code");
        ScriptFailed {
            name: name.into(),
            exit_code,
        }
    }
}

impl Display for ScriptFailed {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        write!(
            fmt,
            "script `{}` failed: {}",
            self.name,
            crate::exit::describe(self.exit_code)
        )
    }
}

impl Error for ScriptFailed {}

#[derive(Debug, Clone)]
pub enum ScriptError {
    /// The subprocess behind a script could not be started.
    SpawnFailed { name: String, message: String },
    /// A script exited with a non-zero code.
    Failed(ScriptFailed),
    /// A script was created inside a capture frame that has already
    /// completed.
    CaptureClosed { capture: String },
    /// Second subscription to stdout or stderr, or a subscription after
    /// the grace window has forwarded the stream to ambient stdio.
    AlreadyConsumed { stream: &'static str },
    /// Malformed caller input: empty pipeline, unterminated quote,
    /// conflicting transformer flags, bad replacement group reference.
    InvalidInput(String),
    /// A non-script error escaped user code running inside a script.
    /// The cause, when present, shows up on the error chain and in
    /// capture diagnostics.
    Unhandled {
        message: String,
        cause: Option<Arc<ScriptError>>,
    },
}

impl ScriptError {
    pub fn unhandled(err: impl Display) -> ScriptError {
        ScriptError::Unhandled {
            message: err.to_string(),
            cause: None,
        }
    }

    /// Wrap a failure with a message; the original error stays
    /// reachable through [`Error::source`].
    pub fn context(message: impl Into<String>, cause: ScriptError) -> ScriptError {
        ScriptError::Unhandled {
            message: message.into(),
            cause: Some(Arc::new(cause)),
        }
    }

    /// The exit code a script terminates with when this error becomes
    /// its exit.
    pub(crate) fn exit_code(&self) -> i32 {
        match self {
            ScriptError::SpawnFailed { .. } => crate::exit::SPAWN_FAILED,
            ScriptError::Failed(failed) => failed.exit_code,
            ScriptError::CaptureClosed { .. }
            | ScriptError::AlreadyConsumed { .. }
            | ScriptError::InvalidInput(_)
            | ScriptError::Unhandled { .. } => crate::exit::UNHANDLED_ERROR,
        }
    }
}

impl Display for ScriptError {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ScriptError::SpawnFailed { name, message } => {
                write!(fmt, "failed to start `{}`: {}", name, message)
            }
            ScriptError::Failed(failed) => Display::fmt(failed, fmt),
            ScriptError::CaptureClosed { capture } => {
                write!(fmt, "capture `{}` has already completed", capture)
            }
            ScriptError::AlreadyConsumed { stream } => {
                write!(fmt, "{} has already been consumed", stream)
            }
            ScriptError::InvalidInput(message) => write!(fmt, "{}", message),
            ScriptError::Unhandled { message, .. } => write!(fmt, "{}", message),
        }
    }
}

impl Error for ScriptError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ScriptError::Failed(failed) => Some(failed),
            ScriptError::Unhandled {
                cause: Some(cause), ..
            } => Some(cause.as_ref()),
            _ => None,
        }
    }
}

impl From<ScriptFailed> for ScriptError {
    fn from(failed: ScriptFailed) -> ScriptError {
        ScriptError::Failed(failed)
    }
}
