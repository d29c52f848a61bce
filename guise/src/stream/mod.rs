// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Logical byte-streams carved out of physical connections
//!
//! Each logical stream has two ends. The application end, a [Stream], behaves
//! like an ordinary connection and is what listeners hand out from `accept`.
//! The protocol end, a [StreamHandle], lives in a [StreamSet] where actions
//! running inside an engine can find it by id and shuttle bytes between it and
//! the physical connection.

use std::io::Error as IOError;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};

pub mod set;

pub use set::StreamSet;

/// Buffer capacity of each direction of a logical stream
pub const DEFAULT_STREAM_BUFFER: usize = 64 * 1024;

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct StreamId(u32);

impl StreamId {
  pub fn new(inner: u32) -> StreamId {
    Self(inner)
  }

  pub fn random() -> StreamId {
    Self(uuid::Uuid::new_v4().as_u128() as u32)
  }

  pub fn inner(&self) -> u32 {
    self.0
  }
}

impl From<u32> for StreamId {
  fn from(inner: u32) -> Self {
    Self::new(inner)
  }
}

impl From<StreamId> for u32 {
  fn from(id: StreamId) -> Self {
    id.inner()
  }
}

impl std::fmt::Debug for StreamId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("StreamID")
      .field("inner", &self.inner())
      .finish()
  }
}

impl std::fmt::Display for StreamId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
  #[error("Stream closed")]
  Closed,
  #[error("Stream {0} is already registered")]
  DuplicateStream(StreamId),
  #[error("Stream {0} is not registered")]
  NotFound(StreamId),
  #[error("Stream {0} was not taken by any acceptor")]
  Unpublished(StreamId),
  #[error("Protocol end of stream {0} was already taken")]
  AlreadyTaken(StreamId),
}

impl From<StreamError> for IOError {
  fn from(e: StreamError) -> Self {
    let kind = match &e {
      StreamError::Closed => std::io::ErrorKind::NotConnected,
      StreamError::NotFound(_) => std::io::ErrorKind::NotFound,
      StreamError::DuplicateStream(_) | StreamError::AlreadyTaken(_) => {
        std::io::ErrorKind::AlreadyExists
      }
      StreamError::Unpublished(_) => std::io::ErrorKind::ConnectionRefused,
    };
    IOError::new(kind, e)
  }
}

type Peer = Arc<Mutex<Option<DuplexStream>>>;

/// Application end of a logical stream
pub struct Stream {
  id: StreamId,
  io: Option<DuplexStream>,
  /// Protocol end this stream was created with; only that registration is removed on close
  peer: Weak<Mutex<Option<DuplexStream>>>,
  owner: Weak<set::StreamSetInner>,
}

/// Protocol end of a logical stream, as held by a [StreamSet]
///
/// Cloning a handle shares the same underlying protocol end.
#[derive(Clone)]
pub struct StreamHandle {
  id: StreamId,
  peer: Peer,
}

impl Stream {
  /// Creates both ends of a logical stream, not yet registered in any set
  pub fn pair(id: StreamId, max_buf_size: usize) -> (Stream, StreamHandle) {
    let (local, remote) = tokio::io::duplex(max_buf_size);
    let peer: Peer = Arc::new(Mutex::new(Some(remote)));
    let stream = Stream {
      id,
      io: Some(local),
      peer: Arc::downgrade(&peer),
      owner: Weak::new(),
    };
    let handle = StreamHandle { id, peer };
    (stream, handle)
  }

  pub fn id(&self) -> StreamId {
    self.id
  }

  pub fn is_closed(&self) -> bool {
    self.io.is_none()
  }

  /// Closes the application end and deregisters the stream from its set.
  ///
  /// Closing an already-closed stream does nothing, and a newer stream
  /// registered under the same id is left in place.
  pub fn close(&mut self) {
    if self.io.take().is_none() {
      return;
    }
    if let Some(owner) = self.owner.upgrade() {
      let peer = &self.peer;
      owner
        .streams
        .remove_if(&self.id, |_, handle| handle.is_peer(peer));
    }
    tracing::trace!(id = %self.id, "stream closed");
  }

  pub(crate) fn set_owner(&mut self, owner: Weak<set::StreamSetInner>) {
    self.owner = owner;
  }

  fn io_mut(&mut self) -> Result<&mut DuplexStream, IOError> {
    self.io.as_mut().ok_or_else(|| StreamError::Closed.into())
  }
}

impl Drop for Stream {
  fn drop(&mut self) {
    self.close();
  }
}

impl std::fmt::Debug for Stream {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Stream")
      .field("id", &self.id)
      .field("closed", &self.is_closed())
      .finish_non_exhaustive()
  }
}

impl AsyncRead for Stream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut tokio::io::ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    match self.get_mut().io_mut() {
      Ok(io) => AsyncRead::poll_read(Pin::new(io), cx, buf),
      Err(e) => Poll::Ready(Err(e)),
    }
  }
}

impl AsyncWrite for Stream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, IOError>> {
    match self.get_mut().io_mut() {
      Ok(io) => AsyncWrite::poll_write(Pin::new(io), cx, buf),
      Err(e) => Poll::Ready(Err(e)),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    match self.get_mut().io_mut() {
      Ok(io) => AsyncWrite::poll_flush(Pin::new(io), cx),
      Err(e) => Poll::Ready(Err(e)),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    match self.get_mut().io.as_mut() {
      Some(io) => AsyncWrite::poll_shutdown(Pin::new(io), cx),
      None => Poll::Ready(Ok(())),
    }
  }
}

impl StreamHandle {
  pub fn id(&self) -> StreamId {
    self.id
  }

  /// Whether both handles share the same protocol end
  pub fn same_stream(&self, other: &StreamHandle) -> bool {
    Arc::ptr_eq(&self.peer, &other.peer)
  }

  fn is_peer(&self, peer: &Weak<Mutex<Option<DuplexStream>>>) -> bool {
    std::ptr::eq(Arc::as_ptr(&self.peer), peer.as_ptr())
  }

  /// Takes exclusive ownership of the protocol end, for relaying it over a connection
  pub fn take_peer(&self) -> Result<DuplexStream, StreamError> {
    self
      .peer
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take()
      .ok_or(StreamError::AlreadyTaken(self.id))
  }

  pub fn is_taken(&self) -> bool {
    self
      .peer
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .is_none()
  }
}

impl std::fmt::Debug for StreamHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("StreamHandle")
      .field("id", &self.id)
      .field("taken", &self.is_taken())
      .finish()
  }
}
