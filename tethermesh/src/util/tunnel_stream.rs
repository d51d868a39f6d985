// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::io::Error as IOError;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::TcpStream;
use tokio_util::compat::Compat;

/// A duplex stream abstracting over a connection, allowing use of memory streams,
/// plain TCP, TLS-wrapped physical links, and multiplexed logical streams
pub trait TunnelStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<'stream, TInner: TunnelStream + ?Sized + 'stream> TunnelStream for &'stream mut TInner {}
impl<TInner: TunnelStream + ?Sized> TunnelStream for Box<TInner> {}
impl TunnelStream for TcpStream {}
impl TunnelStream for DuplexStream {}

/// Whether shutting down the write side leaves the read side usable
///
/// Splicing only signals end-of-stream to a peer which can still deliver data
/// in the other direction afterwards; otherwise the write side stays open until
/// both directions are done.
pub trait HalfClose {
  fn supports_half_close(&self) -> bool;
}

impl HalfClose for TcpStream {
  fn supports_half_close(&self) -> bool {
    true
  }
}

impl HalfClose for DuplexStream {
  fn supports_half_close(&self) -> bool {
    true
  }
}

impl<T: HalfClose + ?Sized> HalfClose for &mut T {
  fn supports_half_close(&self) -> bool {
    (**self).supports_half_close()
  }
}

pub enum WrappedStream {
  Tcp(TcpStream),
  Tls(Box<tokio_rustls::TlsStream<TcpStream>>),
  Mux(Compat<yamux::Stream>),
  DuplexStream(DuplexStream),
}

impl WrappedStream {
  #[cfg(test)]
  /// Asserts that WrappedStream complies with TunnelStream, Send, and Unpin traits
  fn _assert_traits() {
    let _x: &(dyn TunnelStream + Send + Unpin) =
      &WrappedStream::DuplexStream(tokio::io::duplex(64).0);
    unreachable!("Compile-time static assertion function should never be called");
  }

  pub fn duplex(max_buf_size: usize) -> (WrappedStream, WrappedStream) {
    let (a, b) = tokio::io::duplex(max_buf_size);
    (a.into(), b.into())
  }

  /// Short label for log fields
  pub fn kind(&self) -> &'static str {
    match self {
      WrappedStream::Tcp(_) => "tcp",
      WrappedStream::Tls(_) => "tls",
      WrappedStream::Mux(_) => "mux",
      WrappedStream::DuplexStream(_) => "duplex",
    }
  }
}

impl From<DuplexStream> for WrappedStream {
  fn from(s: DuplexStream) -> Self {
    WrappedStream::DuplexStream(s)
  }
}

impl From<TcpStream> for WrappedStream {
  fn from(s: TcpStream) -> Self {
    WrappedStream::Tcp(s)
  }
}

impl From<tokio_rustls::TlsStream<TcpStream>> for WrappedStream {
  fn from(s: tokio_rustls::TlsStream<TcpStream>) -> Self {
    WrappedStream::Tls(Box::new(s))
  }
}

impl From<tokio_rustls::client::TlsStream<TcpStream>> for WrappedStream {
  fn from(s: tokio_rustls::client::TlsStream<TcpStream>) -> Self {
    WrappedStream::Tls(Box::new(s.into()))
  }
}

impl From<tokio_rustls::server::TlsStream<TcpStream>> for WrappedStream {
  fn from(s: tokio_rustls::server::TlsStream<TcpStream>) -> Self {
    WrappedStream::Tls(Box::new(s.into()))
  }
}

impl From<Compat<yamux::Stream>> for WrappedStream {
  fn from(s: Compat<yamux::Stream>) -> Self {
    WrappedStream::Mux(s)
  }
}

impl HalfClose for WrappedStream {
  fn supports_half_close(&self) -> bool {
    // TLS close_notify ends the session for both directions
    !matches!(self, WrappedStream::Tls(_))
  }
}

impl AsyncRead for WrappedStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut tokio::io::ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      WrappedStream::Tcp(ref mut s) => AsyncRead::poll_read(Pin::new(s), cx, buf),
      WrappedStream::Tls(ref mut s) => AsyncRead::poll_read(Pin::new(&mut **s), cx, buf),
      WrappedStream::Mux(ref mut s) => AsyncRead::poll_read(Pin::new(s), cx, buf),
      WrappedStream::DuplexStream(ref mut s) => AsyncRead::poll_read(Pin::new(s), cx, buf),
    }
  }
}

impl AsyncWrite for WrappedStream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, IOError>> {
    match self.get_mut() {
      WrappedStream::Tcp(ref mut s) => AsyncWrite::poll_write(Pin::new(s), cx, buf),
      WrappedStream::Tls(ref mut s) => AsyncWrite::poll_write(Pin::new(&mut **s), cx, buf),
      WrappedStream::Mux(ref mut s) => AsyncWrite::poll_write(Pin::new(s), cx, buf),
      WrappedStream::DuplexStream(ref mut s) => AsyncWrite::poll_write(Pin::new(s), cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    match self.get_mut() {
      WrappedStream::Tcp(ref mut s) => AsyncWrite::poll_flush(Pin::new(s), cx),
      WrappedStream::Tls(ref mut s) => AsyncWrite::poll_flush(Pin::new(&mut **s), cx),
      WrappedStream::Mux(ref mut s) => AsyncWrite::poll_flush(Pin::new(s), cx),
      WrappedStream::DuplexStream(ref mut s) => AsyncWrite::poll_flush(Pin::new(s), cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    match self.get_mut() {
      WrappedStream::Tcp(ref mut s) => AsyncWrite::poll_shutdown(Pin::new(s), cx),
      WrappedStream::Tls(ref mut s) => AsyncWrite::poll_shutdown(Pin::new(&mut **s), cx),
      WrappedStream::Mux(ref mut s) => AsyncWrite::poll_shutdown(Pin::new(s), cx),
      WrappedStream::DuplexStream(ref mut s) => AsyncWrite::poll_shutdown(Pin::new(s), cx),
    }
  }
}

impl TunnelStream for WrappedStream {}
