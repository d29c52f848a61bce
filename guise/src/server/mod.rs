// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Types for accepting physical connections and surfacing the logical streams
//! their engines negotiate

use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::{Arc, Once, PoisonError, RwLock};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing_futures::Instrument;

use crate::common::document::{Document, InvalidPort};
use crate::common::protocol::{ActionRegistry, Fsm, Party};
use crate::common::transport::{Transport, UnsupportedTransport};
use crate::stream::{set::Publication, Stream, StreamSet};

#[derive(thiserror::Error, Debug, Clone)]
pub enum ListenerError {
  #[error(transparent)]
  InvalidPort(#[from] InvalidPort),
  #[error(transparent)]
  UnsupportedTransport(#[from] UnsupportedTransport),
  #[error("failed to bind listener: {0}")]
  Bind(Arc<std::io::Error>),
  #[error("failed to accept connection: {0}")]
  Accept(Arc<std::io::Error>),
  #[error("listener closed")]
  Closed,
}

/// Accepts physical connections, runs one server-role engine per connection,
/// and hands the logical streams those engines publish to [Listener::accept]
pub struct Listener {
  local_addr: SocketAddr,
  streams: StreamSet,
  accepted: Mutex<mpsc::Receiver<Publication>>,
  err: Arc<RwLock<Option<ListenerError>>>,
  shutdown: CancellationToken,
  /// Cancelled once the accept loop has stopped and recorded its terminal error
  surface_closed: CancellationToken,
  close_once: Once,
  tracker: TaskTracker,
}

impl std::fmt::Debug for Listener {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Listener")
      .field("local_addr", &self.local_addr)
      .field("streams", &self.streams)
      .field("tasks", &self.tracker.len())
      .finish_non_exhaustive()
  }
}

/// Everything the accept loop carries into each connection it spawns
struct AcceptContext {
  doc: Arc<Document>,
  actions: Arc<ActionRegistry>,
  streams: StreamSet,
  shutdown: CancellationToken,
  tracker: TaskTracker,
  err: Arc<RwLock<Option<ListenerError>>>,
  surface_closed: CancellationToken,
}

impl Listener {
  /// Binds `iface` on the document's transport and port, and begins accepting.
  #[tracing::instrument(level = "debug", skip(doc, actions), fields(doc = doc.display_name()), err)]
  pub async fn listen(
    doc: Arc<Document>,
    iface: &str,
    actions: Arc<ActionRegistry>,
  ) -> Result<Listener, ListenerError> {
    let port = doc.bind_port()?;
    let transport: Transport = doc.transport.parse()?;
    let listener = transport
      .bind(iface, port)
      .await
      .map_err(|e| ListenerError::Bind(Arc::new(e)))?;
    let local_addr = listener
      .local_addr()
      .map_err(|e| ListenerError::Bind(Arc::new(e)))?;

    // Capacity is irrelevant; publishers wait on acknowledgement regardless
    let (publisher, accepted) = mpsc::channel(1);
    let streams = StreamSet::with_publisher(publisher);
    let err = Arc::new(RwLock::new(None));
    let shutdown = CancellationToken::new();
    let surface_closed = CancellationToken::new();
    let tracker = TaskTracker::new();

    let accept_context = AcceptContext {
      doc: Arc::clone(&doc),
      actions,
      streams: streams.clone(),
      shutdown: shutdown.clone(),
      tracker: tracker.clone(),
      err: Arc::clone(&err),
      surface_closed: surface_closed.clone(),
    };
    tracker.spawn(
      accept_loop(listener, accept_context).instrument(tracing::span!(
        tracing::Level::INFO,
        "listener",
        addr = %local_addr,
        doc = doc.display_name()
      )),
    );
    tracing::info!(addr = %local_addr, "listening");

    Ok(Listener {
      local_addr,
      streams,
      accepted: Mutex::new(accepted),
      err,
      shutdown,
      surface_closed,
      close_once: Once::new(),
      tracker,
    })
  }

  /// Waits for the next logical stream, or for the listener to stop.
  ///
  /// Once the listener has stopped, returns the terminal error it recorded.
  pub async fn accept(&self) -> Result<Stream, ListenerError> {
    let mut accepted = self.accepted.lock().await;
    loop {
      let publication = tokio::select! {
        biased;
        _ = self.surface_closed.cancelled() => None,
        publication = accepted.recv() => publication,
      };
      let (stream, ack) = match publication {
        Some(publication) => publication,
        None => return Err(self.err().unwrap_or(ListenerError::Closed)),
      };
      if ack.send(()).is_ok() {
        tracing::trace!(id = %stream.id(), "stream accepted");
        return Ok(stream);
      }
      tracing::trace!(id = %stream.id(), "publisher abandoned stream before acceptance");
    }
  }

  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  /// The terminal error recorded by the accept loop, if it has stopped
  pub fn err(&self) -> Option<ListenerError> {
    self
      .err
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  /// The streams currently live across every connection of this listener
  pub fn streams(&self) -> &StreamSet {
    &self.streams
  }

  /// Number of tasks still running, the accept loop included
  pub fn active_connections(&self) -> usize {
    self.tracker.len()
  }

  /// Stops accepting and cancels every connection, returning once all have exited.
  ///
  /// Safe to call concurrently and repeatedly; every caller waits for the same
  /// shutdown and receives the same result.
  pub async fn close(&self) -> Result<(), ListenerError> {
    self.close_once.call_once(|| {
      tracing::debug!(addr = %self.local_addr, "closing listener");
      self.shutdown.cancel();
      self.tracker.close();
    });
    self.tracker.wait().await;
    Ok(())
  }
}

impl Drop for Listener {
  fn drop(&mut self) {
    self.shutdown.cancel();
    self.tracker.close();
  }
}

async fn accept_loop(listener: TcpListener, context: AcceptContext) {
  let mut incoming = Box::pin(TcpListenerStream::new(listener).take_until({
    let shutdown = context.shutdown.clone();
    async move { shutdown.cancelled().await }
  }));
  let terminal = loop {
    match incoming.next().await {
      None => break ListenerError::Closed,
      Some(Err(e)) => {
        tracing::warn!(error = %e, "accept failed");
        break ListenerError::Accept(Arc::new(e));
      }
      Some(Ok(conn)) => {
        let peer = conn.peer_addr().ok();
        let mut fsm = Fsm::new(
          Arc::clone(&context.doc),
          Party::Server,
          context.streams.clone(),
          Arc::clone(&context.actions),
        );
        fsm.attach(conn);
        let span = tracing::span!(tracing::Level::DEBUG, "connection", fsm = %fsm.id(), ?peer);
        let shutdown = context.shutdown.child_token();
        context.tracker.spawn(
          async move {
            if let Err(e) = fsm.execute(&shutdown).await {
              tracing::debug!(error = %e, "connection engine exited with error");
            }
          }
          .instrument(span),
        );
      }
    }
  };
  // Drop the physical listener before announcing closure
  drop(incoming);
  *context.err.write().unwrap_or_else(PoisonError::into_inner) = Some(terminal);
  context.surface_closed.cancel();
}
