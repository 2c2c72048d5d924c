//! Classify-then-replay buffered reading.
//!
//! The demultiplexer must look at the first bytes of a connection without
//! consuming them: whatever handler the connection is routed to (handshake
//! parser or fallback splicer) needs the stream intact from offset 0.
//! [`PeekableReader`] buffers bytes pulled from the transport during
//! classification and replays them ahead of the transport on later reads.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

/// An `AsyncRead` adapter supporting bounded lookahead.
pub struct PeekableReader<R> {
    inner: R,
    buffered: Vec<u8>,
    consumed: usize,
}

impl<R: AsyncRead + Unpin> PeekableReader<R> {
    /// Wrap a transport reader.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buffered: Vec::new(),
            consumed: 0,
        }
    }

    /// Look at the first `n` bytes of the stream without consuming them.
    ///
    /// Blocks until `n` bytes are buffered; fails with `UnexpectedEof` if
    /// the stream ends first. Bytes pulled in by a failed peek stay
    /// buffered and are still replayed by subsequent reads.
    pub async fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        debug_assert_eq!(self.consumed, 0, "peek must precede reads");

        let mut chunk = [0u8; 256];
        while self.buffered.len() < n {
            let read = self.inner.read(&mut chunk).await?;
            if read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("stream ended after {} bytes", self.buffered.len()),
                ));
            }
            self.buffered.extend_from_slice(&chunk[..read]);
        }

        Ok(&self.buffered[..n])
    }

    /// Buffered bytes that have not been consumed by a read yet.
    pub fn buffered(&self) -> &[u8] {
        &self.buffered[self.consumed..]
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for PeekableReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;

        // Drain the replay buffer before touching the transport
        if this.consumed < this.buffered.len() {
            let available = &this.buffered[this.consumed..];
            let n = available.len().min(buf.remaining());
            buf.put_slice(&available[..n]);
            this.consumed += n;

            if this.consumed == this.buffered.len() {
                this.buffered.clear();
                this.consumed = 0;
            }
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}
