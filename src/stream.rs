//! Stream types for the origin leg

use std::io::Error;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

/// Wire byte counters attached to the raw socket of an upstream dial.
///
/// Counts bytes as they cross the TCP socket, below any TLS layer, so the
/// numbers reflect what is actually on the wire.
#[derive(Debug, Clone, Default)]
pub struct WireStats {
  read: Arc<AtomicU64>,
  written: Arc<AtomicU64>,
}

impl WireStats {
  /// Bytes read from the origin so far.
  pub fn bytes_read(&self) -> u64 {
    self.read.load(Ordering::Relaxed)
  }

  /// Bytes written to the origin so far.
  pub fn bytes_written(&self) -> u64 {
    self.written.load(Ordering::Relaxed)
  }
}

/// A stream that updates [`WireStats`] on every read and write.
#[derive(Debug)]
pub struct Counted<S> {
  inner: S,
  stats: WireStats,
}

impl<S> Counted<S> {
  /// Wrap a stream, returning the wrapper and a handle to its counters.
  pub fn new(inner: S) -> (Self, WireStats) {
    let stats = WireStats::default();
    (
      Self {
        inner,
        stats: stats.clone(),
      },
      stats,
    )
  }
}

impl<S: AsyncRead + Unpin> AsyncRead for Counted<S> {
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    let before = buf.filled().len();
    let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
    if let Poll::Ready(Ok(())) = poll {
      let n = (buf.filled().len() - before) as u64;
      self.stats.read.fetch_add(n, Ordering::Relaxed);
    }
    poll
  }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Counted<S> {
  fn poll_write(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, Error>> {
    let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
    if let Poll::Ready(Ok(n)) = poll {
      self.stats.written.fetch_add(n as u64, Ordering::Relaxed);
    }
    poll
  }

  fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    Pin::new(&mut self.inner).poll_flush(cx)
  }

  fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    Pin::new(&mut self.inner).poll_shutdown(cx)
  }
}

/// The origin-leg stream: plain TCP, or TLS over any already-established
/// layer (which allows a TLS origin behind a TLS upstream proxy).
#[derive(Debug)]
pub enum MaybeTlsStream {
  /// TCP with wire counters
  Tcp(Counted<TcpStream>),
  /// TLS with rustls
  Tls(Box<TlsStream<Box<MaybeTlsStream>>>),
}

impl AsyncRead for MaybeTlsStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
      MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
    }
  }
}

impl AsyncWrite for MaybeTlsStream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
      MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
      MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
      MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
    }
  }
}

/// A stream with a prefix of already-buffered bytes in front of it.
///
/// Used to hand a connection to another consumer after a buffered reader has
/// read past the point of interest: the unconsumed tail is replayed first.
#[derive(Debug)]
pub struct PrefixedStream<S> {
  prefix: Bytes,
  inner: S,
}

impl<S> PrefixedStream<S> {
  /// Create a stream yielding `prefix` before the bytes of `inner`.
  pub fn new(prefix: Bytes, inner: S) -> Self {
    Self { prefix, inner }
  }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    if !self.prefix.is_empty() {
      let n = self.prefix.len().min(buf.remaining());
      let chunk = self.prefix.split_to(n);
      buf.put_slice(&chunk);
      return Poll::Ready(Ok(()));
    }
    Pin::new(&mut self.inner).poll_read(cx, buf)
  }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
  fn poll_write(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, Error>> {
    Pin::new(&mut self.inner).poll_write(cx, buf)
  }

  fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    Pin::new(&mut self.inner).poll_flush(cx)
  }

  fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    Pin::new(&mut self.inner).poll_shutdown(cx)
  }
}
