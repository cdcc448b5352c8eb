//! Byte-peeking stream wrapper.
//!
//! The listener has to look at the first byte of every connection before it
//! knows whether to hand the stream to a TLS handshake or straight to the
//! HTTP parser. [`PeekedStream`] gives those bytes back: the next reader sees
//! the captured prefix followed by the untouched remainder of the stream.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A stream that replays a captured prefix before reading from `inner`.
#[derive(Debug)]
pub struct PeekedStream<S> {
    inner: S,
    prefix: Bytes,
    /// Error from `inner` raised while prefix bytes were being delivered.
    deferred: Option<io::Error>,
}

impl<S> PeekedStream<S> {
    /// Wrap `inner`, replaying `prefix` to the first reader(s).
    pub fn new(inner: S, prefix: impl Into<Bytes>) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
            deferred: None,
        }
    }

    /// Bytes captured but not yet delivered.
    pub fn pending(&self) -> &[u8] {
        &self.prefix
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Unwrap the inner stream. Undelivered prefix bytes are returned with it.
    pub fn into_parts(self) -> (S, Bytes) {
        (self.inner, self.prefix)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if let Some(err) = this.deferred.take() {
            return Poll::Ready(Err(err));
        }

        if this.prefix.is_empty() {
            return Pin::new(&mut this.inner).poll_read(cx, buf);
        }

        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let n = this.prefix.len().min(buf.remaining());
        buf.put_slice(&this.prefix[..n]);
        this.prefix.advance(n);

        if !this.prefix.is_empty() || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        // Top up from the raw stream, but only with what is ready right now.
        // The replayed bytes are already in `buf`, so this call must not
        // report Pending or an error that would make the caller drop them.
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) | Poll::Pending => Poll::Ready(Ok(())),
            Poll::Ready(Err(err)) => {
                this.deferred = Some(err);
                Poll::Ready(Ok(()))
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
