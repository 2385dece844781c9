//! Shell-script-style composition for async Rust.
//!
//! The central abstraction is [`Script`]: a uniform unit with a stdin
//! sink, stdout/stderr streams, and an exit code. Subprocesses,
//! in-process [`Script::capture`] blocks, and stream transformers all
//! satisfy the same contract, so they pipe into each other freely:
//!
//! ```no_run
//! use pipescript::{wrap_main, Script};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     wrap_main(async {
//!         let count = (Script::command("ls demos") | Script::command("wc -l"))
//!             .output()
//!             .await?;
//!         pipescript::println(format_args!("{count} entries"));
//!         Ok(())
//!     })
//!     .await;
//! }
//! ```
//!
//! Output nobody consumes is not lost: a script created inside a
//! capture frame forwards it to the frame's stdio after a one-task
//! grace window, and at top level it reaches the OS streams. Failures
//! carry exit codes (`256` = failed to spawn, `257` = unhandled error,
//! negative = killed by that signal) and surface as
//! [`ScriptFailed`] through [`Script::done`].

pub mod args;
mod buffered;
mod capture;
mod delayed;
mod entangled;
mod env;
mod error;
mod exec;
pub mod exit;
mod grep;
mod out;
mod pipeline;
mod script;
mod stdio_group;
mod stream;
mod temp;
mod transform;
mod wrap;

pub use buffered::{silence, silence_stderr, silence_until_failure, BufferedScript};
pub use capture::{with_trace, ScriptContext};
pub use delayed::DelayedOneShot;
pub use entangled::{EntangledPair, EntangledSender, Lane};
pub use env::{with_env, EnvKey, EnvOverlay};
pub use error::{Result, ScriptError, ScriptFailed};
pub use exec::Command;
pub use grep::{GrepOptions, ReplaceOptions};
pub use out::{eprintln, print, println};
pub use pipeline::IntoScript;
pub use script::{
    ExitFuture, KillFn, RawStream, Script, ScriptComponents, Signal, StdinSink, StdinTarget,
};
pub use stdio_group::{GroupSink, StdioGroup};
pub use stream::{ByteStream, LineStream};
pub use temp::{with_temp_dir, with_temp_file};
pub use transform::{
    byte_transform, line_transform, map_lines, ByteTransform, LineTransform, MapLines,
};
pub use wrap::wrap_main;
