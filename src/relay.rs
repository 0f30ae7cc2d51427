//! Full-duplex byte relay
//!
//! Moves bytes between a client stream and an origin stream until either end
//! signals EOF or fails. When both sides are plain TCP the relay uses
//! independent half-closes so protocols that signal EOF by shutting down one
//! direction keep working; otherwise both directions run under a join
//! barrier and the streams are fully shut down once both copies finish.
//! The relay never retries and never interprets bytes.

use bytes::Bytes;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Object-safe alias for the byte streams the relay moves data between.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// The hijacked client connection.
///
/// Streams either support independent half-close or they do not; the relay
/// picks its strategy from the variant rather than probing at runtime.
pub enum ClientStream {
    /// A plain TCP connection: supports half-close
    Tcp(TcpStream),
    /// Anything else (TLS, in-memory pipes, prefixed streams)
    Boxed(Box<dyn AsyncStream>),
}

impl ClientStream {
    pub fn boxed(stream: impl AsyncStream + 'static) -> Self {
        Self::Boxed(Box::new(stream))
    }
}

impl AsyncRead for ClientStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            Self::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Self::Boxed(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            Self::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Self::Boxed(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            Self::Tcp(s) => Pin::new(s).poll_flush(cx),
            Self::Boxed(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            Self::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Self::Boxed(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// A connection to the origin or parent proxy.
pub enum UpstreamStream {
    /// Plain TCP: supports half-close
    Tcp(TcpStream),
    /// TLS through `tokio-rustls`
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for UpstreamStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            Self::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            Self::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            Self::Tcp(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            Self::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// A stream with some already-read bytes replayed before the inner stream.
///
/// The outer server may read past the CONNECT head; those bytes belong to
/// the tunnel and must be the first ones any later reader sees.
pub struct RewindStream<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> RewindStream<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for RewindStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            let this = self.get_mut();
            this.prefix = this.prefix.slice(n..);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for RewindStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Half-close-aware relay between two TCP connections.
///
/// One task per direction; each direction, once its copy completes, shuts
/// down writes on its destination and drops its source half, so the peer
/// still reading in the other direction is undisturbed.
pub fn relay_tcp(session: u64, a: TcpStream, b: TcpStream) {
    let (a_read, a_write) = a.into_split();
    let (b_read, b_write) = b.into_split();
    tokio::spawn(copy_then_shutdown(session, a_read, b_write));
    tokio::spawn(copy_then_shutdown(session, b_read, a_write));
}

async fn copy_then_shutdown(session: u64, mut src: OwnedReadHalf, mut dst: OwnedWriteHalf) {
    if let Err(e) = io::copy(&mut src, &mut dst).await {
        warn!(session, error = %e, "tunnel copy failed");
    }
    let _ = dst.shutdown().await;
    drop(src);
}

/// Fallback relay for streams without independent half-close.
///
/// Both directions run concurrently; an I/O error terminates its own
/// direction only. Once both finish, both streams are shut down.
pub async fn relay_streams<A, B>(session: u64, a: A, b: B)
where
    A: AsyncStream,
    B: AsyncStream,
{
    let (mut a_read, mut a_write) = io::split(a);
    let (mut b_read, mut b_write) = io::split(b);

    let a_to_b = async {
        if let Err(e) = io::copy(&mut a_read, &mut b_write).await {
            warn!(session, error = %e, "tunnel copy to origin failed");
        }
    };
    let b_to_a = async {
        if let Err(e) = io::copy(&mut b_read, &mut a_write).await {
            warn!(session, error = %e, "tunnel copy to client failed");
        }
    };
    tokio::join!(a_to_b, b_to_a);

    let _ = a_write.shutdown().await;
    let _ = b_write.shutdown().await;
    debug!(session, "tunnel closed");
}
