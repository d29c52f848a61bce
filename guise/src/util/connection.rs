// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::io::Error as IOError;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::TcpStream;

/// A physical connection owned by an engine, abstracting over TCP and memory streams
pub enum Connection {
  /// No connection attached yet; all I/O fails with [std::io::ErrorKind::NotConnected]
  Detached,
  Tcp(TcpStream),
  DuplexStream(DuplexStream),
}

impl Default for Connection {
  fn default() -> Self {
    Self::Detached
  }
}

impl std::fmt::Debug for Connection {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Connection::Detached => f.write_str("Connection::Detached"),
      Connection::Tcp(s) => f
        .debug_struct("Connection::Tcp")
        .field("local", &s.local_addr().ok())
        .field("peer", &s.peer_addr().ok())
        .finish(),
      Connection::DuplexStream(_) => f.write_str("Connection::DuplexStream"),
    }
  }
}

fn detached_error() -> IOError {
  IOError::new(
    std::io::ErrorKind::NotConnected,
    "no physical connection is attached",
  )
}

impl Connection {
  pub fn duplex(max_buf_size: usize) -> (Connection, Connection) {
    let (a, b) = tokio::io::duplex(max_buf_size);
    (a.into(), b.into())
  }

  pub fn is_attached(&self) -> bool {
    !matches!(self, Connection::Detached)
  }

  pub fn local_addr(&self) -> Option<SocketAddr> {
    match self {
      Connection::Tcp(s) => s.local_addr().ok(),
      _ => None,
    }
  }
}

impl From<TcpStream> for Connection {
  fn from(s: TcpStream) -> Self {
    Connection::Tcp(s)
  }
}

impl From<DuplexStream> for Connection {
  fn from(s: DuplexStream) -> Self {
    Connection::DuplexStream(s)
  }
}

impl AsyncRead for Connection {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut tokio::io::ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      Connection::Detached => Poll::Ready(Err(detached_error())),
      Connection::Tcp(ref mut s) => AsyncRead::poll_read(Pin::new(s), cx, buf),
      Connection::DuplexStream(ref mut s) => AsyncRead::poll_read(Pin::new(s), cx, buf),
    }
  }
}

impl AsyncWrite for Connection {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, IOError>> {
    match self.get_mut() {
      Connection::Detached => Poll::Ready(Err(detached_error())),
      Connection::Tcp(ref mut s) => AsyncWrite::poll_write(Pin::new(s), cx, buf),
      Connection::DuplexStream(ref mut s) => AsyncWrite::poll_write(Pin::new(s), cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    match self.get_mut() {
      Connection::Detached => Poll::Ready(Err(detached_error())),
      Connection::Tcp(ref mut s) => AsyncWrite::poll_flush(Pin::new(s), cx),
      Connection::DuplexStream(ref mut s) => AsyncWrite::poll_flush(Pin::new(s), cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    match self.get_mut() {
      // Nothing to shut down
      Connection::Detached => Poll::Ready(Ok(())),
      Connection::Tcp(ref mut s) => AsyncWrite::poll_shutdown(Pin::new(s), cx),
      Connection::DuplexStream(ref mut s) => AsyncWrite::poll_shutdown(Pin::new(s), cx),
    }
  }
}
