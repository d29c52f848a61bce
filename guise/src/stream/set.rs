// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use dashmap::{mapref::entry::Entry, DashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use super::{Stream, StreamError, StreamHandle, StreamId, DEFAULT_STREAM_BUFFER};

/// A ready stream on its way to an acceptor, along with the acknowledgement
/// its publisher waits on
pub(crate) type Publication = (Stream, oneshot::Sender<()>);

pub(crate) struct StreamSetInner {
  pub(crate) streams: DashMap<StreamId, StreamHandle>,
  publisher: Option<mpsc::Sender<Publication>>,
  buffer_size: usize,
}

/// The concurrency-safe registry of logical streams shared by every engine of
/// one listener or dialer
///
/// Cloning a [StreamSet] produces another reference to the same registry.
#[derive(Clone)]
pub struct StreamSet {
  inner: Arc<StreamSetInner>,
}

impl Default for StreamSet {
  fn default() -> Self {
    Self::new()
  }
}

impl std::fmt::Debug for StreamSet {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("StreamSet")
      .field("len", &self.len())
      .field("publishing", &self.inner.publisher.is_some())
      .finish()
  }
}

impl StreamSet {
  pub fn new() -> Self {
    Self::build(None)
  }

  /// A set whose ready streams are handed to the receiving end of `publisher`
  pub(crate) fn with_publisher(publisher: mpsc::Sender<Publication>) -> Self {
    Self::build(Some(publisher))
  }

  fn build(publisher: Option<mpsc::Sender<Publication>>) -> Self {
    Self {
      inner: Arc::new(StreamSetInner {
        streams: DashMap::new(),
        publisher,
        buffer_size: DEFAULT_STREAM_BUFFER,
      }),
    }
  }

  /// Registers the protocol end of a stream under its id.
  ///
  /// Fails without touching the existing entry if the id is already taken.
  pub fn add(&self, handle: StreamHandle) -> Result<(), StreamError> {
    match self.inner.streams.entry(handle.id()) {
      Entry::Occupied(occupied) => Err(StreamError::DuplicateStream(*occupied.key())),
      Entry::Vacant(vacant) => {
        vacant.insert(handle);
        Ok(())
      }
    }
  }

  pub fn get(&self, id: StreamId) -> Option<StreamHandle> {
    self.inner.streams.get(&id).map(|entry| entry.value().clone())
  }

  /// Deregisters a stream; removing an absent id is a no-op.
  pub fn remove(&self, id: StreamId) -> Option<StreamHandle> {
    self.inner.streams.remove(&id).map(|(_, handle)| handle)
  }

  /// Deregisters `handle` only if it is still the registration under its id
  pub fn remove_handle(&self, handle: &StreamHandle) -> bool {
    self
      .inner
      .streams
      .remove_if(&handle.id(), |_, registered| registered.same_stream(handle))
      .is_some()
  }

  pub fn contains(&self, id: StreamId) -> bool {
    self.inner.streams.contains_key(&id)
  }

  pub fn len(&self) -> usize {
    self.inner.streams.len()
  }

  pub fn is_empty(&self) -> bool {
    self.inner.streams.is_empty()
  }

  /// Creates a stream under `id` and registers its protocol end.
  ///
  /// The returned application end deregisters itself when closed or dropped.
  pub fn open(&self, id: StreamId) -> Result<Stream, StreamError> {
    match self.inner.streams.entry(id) {
      Entry::Occupied(_) => Err(StreamError::DuplicateStream(id)),
      Entry::Vacant(vacant) => {
        let (mut stream, handle) = Stream::pair(id, self.inner.buffer_size);
        vacant.insert(handle);
        stream.set_owner(Arc::downgrade(&self.inner));
        Ok(stream)
      }
    }
  }

  /// Creates a stream under a random id not currently in use
  pub fn open_random(&self) -> Stream {
    loop {
      if let Ok(stream) = self.open(StreamId::random()) {
        return stream;
      }
    }
  }

  /// Hands a ready stream to whoever accepts from this set, waiting until it is taken.
  ///
  /// Fails with [StreamError::Unpublished] if this set has no acceptor, or if
  /// the acceptor went away before taking the stream.
  pub async fn publish(&self, stream: Stream) -> Result<(), StreamError> {
    let id = stream.id();
    let publisher = self
      .inner
      .publisher
      .as_ref()
      .ok_or(StreamError::Unpublished(id))?;
    let (ack, acked) = oneshot::channel();
    publisher
      .send((stream, ack))
      .await
      .map_err(|_| StreamError::Unpublished(id))?;
    tracing::trace!(%id, "stream offered to acceptor");
    acked.await.map_err(|_| StreamError::Unpublished(id))
  }
}
