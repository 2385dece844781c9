//! Byte and line stream wrappers.
//!
//! `ByteStream` and `LineStream` are the crate's public stream
//! currencies: boxed, single-consumer, infallible. Errors raised while
//! producing data never travel on these streams; they are routed into
//! the owning script's exit code.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::stream::{self, Stream, StreamExt};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// Adapter exposing an unbounded receiver as a `Stream`.
pub(crate) struct ChannelStream<T>(pub(crate) mpsc::UnboundedReceiver<T>);

impl<T> Stream for ChannelStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.0.poll_recv(cx)
    }
}

/// A single-consumer stream of byte chunks.
pub struct ByteStream {
    inner: Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>,
}

impl ByteStream {
    pub fn new(stream: impl Stream<Item = Vec<u8>> + Send + 'static) -> ByteStream {
        ByteStream {
            inner: Box::pin(stream),
        }
    }

    pub fn empty() -> ByteStream {
        ByteStream::new(stream::empty())
    }

    /// A stream yielding the given bytes as one chunk.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> ByteStream {
        let bytes = bytes.into();
        if bytes.is_empty() {
            ByteStream::empty()
        } else {
            ByteStream::new(stream::iter([bytes]))
        }
    }

    pub(crate) fn from_channel(rx: mpsc::UnboundedReceiver<Vec<u8>>) -> ByteStream {
        ByteStream::new(ChannelStream(rx))
    }

    /// Collect every chunk into one buffer.
    pub async fn bytes(mut self) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = self.inner.next().await {
            out.extend_from_slice(&chunk);
        }
        out
    }

    /// Collect the stream and decode it as text, trimming one trailing
    /// newline the way `$(...)` substitution does.
    pub async fn text(self) -> String {
        let bytes = self.bytes().await;
        let mut text = String::from_utf8_lossy(&bytes).into_owned();
        if text.ends_with('\n') {
            text.pop();
            if text.ends_with('\r') {
                text.pop();
            }
        }
        text
    }

    /// Split the stream into lines. Chunk boundaries are transparent;
    /// a trailing unterminated line is still emitted.
    pub fn lines(self) -> LineStream {
        let seed = (self.inner, Vec::new(), false);
        let lines = stream::unfold(seed, |(mut src, mut buf, mut eof)| async move {
            loop {
                if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                    let mut line: Vec<u8> = buf.drain(..=pos).collect();
                    line.pop();
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    let line = String::from_utf8_lossy(&line).into_owned();
                    return Some((line, (src, buf, eof)));
                }
                if eof {
                    if buf.is_empty() {
                        return None;
                    }
                    let line = String::from_utf8_lossy(&buf).into_owned();
                    buf.clear();
                    return Some((line, (src, buf, eof)));
                }
                match src.next().await {
                    Some(chunk) => buf.extend_from_slice(&chunk),
                    None => eof = true,
                }
            }
        });
        LineStream::new(lines)
    }

    /// Copy every chunk into an async writer.
    pub async fn pipe_to<W>(mut self, writer: &mut W) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        while let Some(chunk) = self.inner.next().await {
            writer.write_all(&chunk).await?;
        }
        writer.flush().await
    }
}

impl Stream for ByteStream {
    type Item = Vec<u8>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Vec<u8>>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// A single-consumer stream of decoded lines, without terminators.
pub struct LineStream {
    inner: Pin<Box<dyn Stream<Item = String> + Send>>,
}

impl LineStream {
    pub fn new(stream: impl Stream<Item = String> + Send + 'static) -> LineStream {
        LineStream {
            inner: Box::pin(stream),
        }
    }

    pub fn from_lines<I>(lines: I) -> LineStream
    where
        I: IntoIterator<Item = String>,
        I::IntoIter: Send + 'static,
    {
        LineStream::new(stream::iter(lines))
    }

    pub async fn into_vec(mut self) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(line) = self.inner.next().await {
            out.push(line);
        }
        out
    }

    /// Re-encode each line with a trailing newline.
    pub fn bytes(self) -> ByteStream {
        ByteStream::new(self.inner.map(|mut line| {
            line.push('\n');
            line.into_bytes()
        }))
    }
}

impl Stream for LineStream {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        self.inner.as_mut().poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn text_trims_one_trailing_newline() {
        assert_eq!(ByteStream::from_bytes("hi\n").text().await, "hi");
        assert_eq!(ByteStream::from_bytes("hi\r\n").text().await, "hi");
        assert_eq!(ByteStream::from_bytes("hi\n\n").text().await, "hi\n");
        assert_eq!(ByteStream::from_bytes("hi").text().await, "hi");
    }

    #[tokio::test]
    async fn lines_cross_chunk_boundaries() {
        let chunks = vec![b"ab".to_vec(), b"c\nde\nf".to_vec()];
        let lines = ByteStream::new(stream::iter(chunks)).lines().into_vec().await;
        assert_eq!(lines, vec!["abc", "de", "f"]);
    }

    #[tokio::test]
    async fn lines_round_trip_to_bytes() {
        let lines = LineStream::from_lines(vec!["a".to_owned(), "b".to_owned()]);
        assert_eq!(lines.bytes().bytes().await, b"a\nb\n");
    }
}
