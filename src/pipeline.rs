//! End-to-end script composition.
//!
//! `Script::pipeline` wires stdout into the next stdin across N
//! scripts and exposes the whole thing as one script with pipefail
//! exit semantics. The `|` operator builds two-element pipelines out
//! of scripts, raw byte streams, and transformer values.

use std::ops::BitOr;

use futures::stream::StreamExt;

use crate::error::{Result, ScriptError};
use crate::exit;
use crate::script::{ExitFuture, KillFn, Script, ScriptComponents, StdinTarget};
use crate::stream::ByteStream;

/// Anything that can stand as a pipeline element.
pub trait IntoScript {
    fn into_script(self) -> Script;
}

impl IntoScript for Script {
    fn into_script(self) -> Script {
        self
    }
}

impl Script {
    /// Compose scripts end-to-end. The composite exposes the first
    /// script's stdin and the last one's stdout/stderr; intermediate
    /// stderr flows to ambient stdio as usual. The exit code is the
    /// last non-zero component exit, or 0.
    pub fn pipeline<I>(items: I) -> Result<Script>
    where
        I: IntoIterator<Item = Script>,
    {
        let items: Vec<Script> = items.into_iter().collect();
        if items.is_empty() {
            return Err(ScriptError::InvalidInput("empty pipeline".to_owned()));
        }
        if items.len() == 1 {
            let mut items = items;
            return Ok(items.pop().expect("length checked"));
        }

        // Junctions: each stdout feeds the next stdin, which closes
        // when the upstream ends.
        for window in items.windows(2) {
            let upstream = window[0].stdout()?;
            let sink = window[1].stdin();
            tokio::spawn(async move {
                let _ = sink.pipe_from(upstream).await;
            });
        }

        // The composite takes responsibility for component failures;
        // pipefail reports them through the composite exit.
        for item in &items {
            item.claim();
        }

        let name = items
            .iter()
            .map(Script::name)
            .collect::<Vec<_>>()
            .join(" | ");
        let last = items.last().expect("non-empty");
        let first_stdin = items[0].stdin();
        let last_stdout = last.stdout()?;
        let last_stderr = last.stderr()?;

        let kill_items = items.clone();
        let kill: KillFn = Box::new(move |signal| {
            for item in &kill_items {
                if item.kill_signal(signal) {
                    return Ok(true);
                }
            }
            Ok(false)
        });

        let exit: ExitFuture = Box::pin(async move {
            let mut last_nonzero = exit::SUCCESS;
            for item in &items {
                let _ = item.done().await;
                let code = item.exit_code().await;
                if !exit::success(code) {
                    last_nonzero = code;
                }
            }
            last_nonzero
        });

        Ok(Script::from_components_with_kill(
            name,
            move || async move {
                Ok(ScriptComponents {
                    stdin: StdinTarget::Sink(first_stdin),
                    stdout: last_stdout.map(Ok).boxed(),
                    stderr: last_stderr.map(Ok).boxed(),
                    exit,
                })
            },
            Some(kill),
        ))
    }
}

impl<T: IntoScript> BitOr<T> for Script {
    type Output = Script;

    fn bitor(self, rhs: T) -> Script {
        let rhs = rhs.into_script();
        let name = format!("{} | {}", self.name(), rhs.name());
        match Script::pipeline([self, rhs]) {
            Ok(script) => script,
            Err(err) => Script::from_error(name, err),
        }
    }
}

impl<T: IntoScript> BitOr<T> for ByteStream {
    type Output = Script;

    fn bitor(self, rhs: T) -> Script {
        Script::from_stream("stream", self) | rhs
    }
}
