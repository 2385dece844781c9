//! A merging multiplexer of byte streams with a writable control sink.
//!
//! Each capture frame owns one group for stdout and one for stderr.
//! Scripts whose output nobody consumed are `add`ed here by their
//! grace-window task; `writeln` carries in-process prints. Writes and
//! stream chunks interleave in submission order on one shared buffer.

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{Result, ScriptError};
use crate::stream::ByteStream;

struct GroupInner {
    label: String,
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    rx: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    closed: bool,
}

#[derive(Clone)]
pub struct StdioGroup {
    inner: Arc<Mutex<GroupInner>>,
}

impl StdioGroup {
    pub fn new(label: impl Into<String>) -> StdioGroup {
        let (tx, rx) = mpsc::unbounded_channel();
        StdioGroup {
            inner: Arc::new(Mutex::new(GroupInner {
                label: label.into(),
                tx: Some(tx),
                rx: Some(rx),
                closed: false,
            })),
        }
    }

    /// Attach a new source stream. Its chunks are forwarded into the
    /// merged output as they arrive.
    pub fn add(&self, mut stream: ByteStream) -> Result<()> {
        let tx = {
            let inner = self.inner.lock();
            if inner.closed {
                return Err(ScriptError::CaptureClosed {
                    capture: inner.label.clone(),
                });
            }
            match &inner.tx {
                Some(tx) => tx.clone(),
                None => {
                    return Err(ScriptError::CaptureClosed {
                        capture: inner.label.clone(),
                    })
                }
            }
        };
        tokio::spawn(async move {
            while let Some(chunk) = stream.next().await {
                if tx.send(chunk).is_err() {
                    break;
                }
            }
        });
        Ok(())
    }

    /// Write directly onto the shared buffer. Succeeds regardless of
    /// the state of any handed-out sink; after the group itself has
    /// closed the bytes are discarded.
    pub fn write(&self, bytes: Vec<u8>) {
        if let Some(tx) = &self.inner.lock().tx {
            let _ = tx.send(bytes);
        }
    }

    pub fn writeln(&self, message: impl Display) {
        self.write(format!("{}\n", message).into_bytes());
    }

    /// An unbounded write handle. Closing the sink never closes the
    /// group.
    pub fn sink(&self) -> GroupSink {
        let inner = self.inner.lock();
        GroupSink {
            label: inner.label.clone(),
            tx: inner.tx.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Seal the group: further `add`s fail, further `write`s are
    /// dropped, and the merged output ends once attached sources have
    /// flushed.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.tx = None;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// The merged output. Admits exactly one consumer.
    pub fn stream(&self) -> Result<ByteStream> {
        let mut inner = self.inner.lock();
        inner
            .rx
            .take()
            .map(ByteStream::from_channel)
            .ok_or(ScriptError::AlreadyConsumed {
                stream: "stdio group output",
            })
    }
}

#[derive(Clone)]
pub struct GroupSink {
    label: String,
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    closed: Arc<AtomicBool>,
}

impl GroupSink {
    pub fn write(&self, bytes: Vec<u8>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ScriptError::InvalidInput(format!(
                "sink for `{}` is closed",
                self.label
            )));
        }
        if let Some(tx) = &self.tx {
            let _ = tx.send(bytes);
        }
        Ok(())
    }

    pub fn writeln(&self, message: impl Display) -> Result<()> {
        self.write(format!("{}\n", message).into_bytes())
    }

    /// Close this handle only; the group and its other writers are
    /// unaffected.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_and_streams_interleave_in_submission_order() {
        let group = StdioGroup::new("out");
        group.writeln("first");
        group.add(ByteStream::from_bytes("second\n")).unwrap();
        // Let the forwarder run before the next direct write.
        tokio::task::yield_now().await;
        group.writeln("third");
        group.close();
        let merged = group.stream().unwrap().text().await;
        assert_eq!(merged, "first\nsecond\nthird");
    }

    #[tokio::test]
    async fn group_writeln_survives_sink_close() {
        let group = StdioGroup::new("out");
        let sink = group.sink();
        sink.close();
        assert!(sink.writeln("nope").is_err());
        group.writeln("still here");
        group.close();
        assert_eq!(group.stream().unwrap().text().await, "still here");
    }

    #[tokio::test]
    async fn add_after_close_is_refused() {
        let group = StdioGroup::new("out");
        group.close();
        assert!(matches!(
            group.add(ByteStream::empty()),
            Err(ScriptError::CaptureClosed { .. })
        ));
    }

    #[tokio::test]
    async fn merged_output_admits_one_consumer() {
        let group = StdioGroup::new("out");
        group.stream().unwrap();
        assert!(matches!(
            group.stream(),
            Err(ScriptError::AlreadyConsumed { .. })
        ));
    }
}
