//! Top-level failure handling for script-shaped programs.

use std::future::Future;

use crate::error::{Result, ScriptError};
use crate::exit;
use crate::out;

/// Run the body of a script-shaped `main` and exit the process with a
/// code reflecting its outcome.
///
/// A `ScriptFailed` exits with that script's code (its output already
/// went to the right streams); other library errors print an `error:`
/// diagnostic first and exit with a sysexits code.
pub async fn wrap_main<F>(body: F)
where
    F: Future<Output = Result<()>>,
{
    let code = match body.await {
        Ok(()) => exitcode::OK,
        Err(ScriptError::Failed(failed)) => exit::to_os_code(failed.exit_code),
        Err(err) => {
            out::error(format_args!("{}", err));
            exit::to_os_code(match &err {
                ScriptError::SpawnFailed { .. } => exit::SPAWN_FAILED,
                _ => exit::UNHANDLED_ERROR,
            })
        }
    };
    std::process::exit(code);
}
