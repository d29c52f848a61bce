// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Types for opening logical streams over client-role engines

use std::sync::{Arc, Once};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing_futures::Instrument;

use crate::common::document::{Document, InvalidPort};
use crate::common::protocol::{ActionRegistry, Fsm, FsmContext, Party, Value};
use crate::common::transport::{Transport, UnsupportedTransport};
use crate::plugins::tunnel::STREAM_ID_VAR;
use crate::stream::{Stream, StreamSet};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DialerError {
  #[error(transparent)]
  InvalidPort(#[from] InvalidPort),
  #[error(transparent)]
  UnsupportedTransport(#[from] UnsupportedTransport),
  #[error("dialer closed")]
  Closed,
}

/// Opens one physical connection, driven by a client-role engine, per dialed stream
pub struct Dialer {
  doc: Arc<Document>,
  host: String,
  actions: Arc<ActionRegistry>,
  streams: StreamSet,
  shutdown: CancellationToken,
  close_once: Once,
  tracker: TaskTracker,
}

impl std::fmt::Debug for Dialer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Dialer")
      .field("host", &self.host)
      .field("doc", &self.doc.display_name())
      .field("streams", &self.streams)
      .finish_non_exhaustive()
  }
}

impl Dialer {
  pub fn new<H: Into<String>>(
    doc: Arc<Document>,
    host: H,
    actions: Arc<ActionRegistry>,
  ) -> Result<Self, DialerError> {
    doc.bind_port()?;
    doc.transport.parse::<Transport>()?;
    Ok(Self {
      doc,
      host: host.into(),
      actions,
      streams: StreamSet::new(),
      shutdown: CancellationToken::new(),
      close_once: Once::new(),
      tracker: TaskTracker::new(),
    })
  }

  /// Opens a new logical stream and starts the engine that will carry it.
  ///
  /// Returns immediately; if the engine fails, the stream reads as ended.
  /// Must be called from within a tokio runtime.
  pub fn dial(&self) -> Result<Stream, DialerError> {
    if self.shutdown.is_cancelled() {
      return Err(DialerError::Closed);
    }
    let stream = self.streams.open_random();
    let id = stream.id();
    let mut fsm = Fsm::new(
      Arc::clone(&self.doc),
      Party::Client,
      self.streams.clone(),
      Arc::clone(&self.actions),
    )
    .with_remote(self.host.clone());
    fsm.set_var(STREAM_ID_VAR, Value::Int(id.inner().into()));
    fsm.register_stream(id);

    let span = tracing::span!(tracing::Level::DEBUG, "dial", fsm = %fsm.id(), %id, host = %self.host);
    let shutdown = self.shutdown.child_token();
    self.tracker.spawn(
      async move {
        if let Err(e) = fsm.execute(&shutdown).await {
          tracing::debug!(error = %e, "dialed engine exited with error");
        }
      }
      .instrument(span),
    );
    Ok(stream)
  }

  pub fn streams(&self) -> &StreamSet {
    &self.streams
  }

  pub fn active_connections(&self) -> usize {
    self.tracker.len()
  }

  /// Cancels every engine this dialer started, returning once all have exited
  pub async fn close(&self) {
    self.close_once.call_once(|| {
      tracing::debug!(host = %self.host, "closing dialer");
      self.shutdown.cancel();
      self.tracker.close();
    });
    self.tracker.wait().await;
  }
}

impl Drop for Dialer {
  fn drop(&mut self) {
    self.shutdown.cancel();
    self.tracker.close();
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;
  use std::time::Duration;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  use super::{Dialer, DialerError};
  use crate::common::document::{ActionStep, Document, Program, Transition};
  use crate::common::protocol::{ActionRegistry, Party};
  use crate::server::Listener;

  const TIMEOUT: Duration = Duration::from_secs(5);

  fn banner_document(port: &str) -> Document {
    let banner = "220 guise ready\r\n";
    let program = Program::new(vec![
      Transition::new("start", "greeted")
        .with_action(ActionStep::new("io.puts", vec![banner.into()]).for_party(Party::Server))
        .with_action(ActionStep::new("io.gets", vec![banner.into()]).for_party(Party::Client)),
      Transition::new("greeted", "end").with_action(ActionStep::new("tunnel.relay", vec![])),
    ]);
    Document::new("tcp", port, program)
  }

  fn unused_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
      .unwrap()
      .local_addr()
      .unwrap()
      .port()
  }

  #[tokio::test]
  async fn dialed_streams_reach_the_listener() {
    let _ = tracing_subscriber::fmt()
      .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
      .with_test_writer()
      .try_init();
    let actions = Arc::new(ActionRegistry::with_builtins());
    let listener = Listener::listen(Arc::new(banner_document("0")), "127.0.0.1", Arc::clone(&actions))
      .await
      .unwrap();
    let port = listener.local_addr().port().to_string();
    let dialer = Dialer::new(Arc::new(banner_document(&port)), "127.0.0.1", actions).unwrap();

    let mut outbound = dialer.dial().unwrap();
    outbound.write_all(b"ping").await.unwrap();
    let mut inbound = tokio::time::timeout(TIMEOUT, listener.accept())
      .await
      .expect("The server engine must publish the relayed stream")
      .unwrap();
    let mut buf = [0u8; 4];
    inbound.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
    inbound.write_all(b"pong").await.unwrap();
    tokio::time::timeout(TIMEOUT, outbound.read_exact(&mut buf))
      .await
      .expect("The reply must be relayed back")
      .unwrap();
    assert_eq!(&buf, b"pong");

    dialer.close().await;
    listener.close().await.unwrap();
    assert_eq!(dialer.active_connections(), 0);
    assert!(dialer.streams().is_empty());
  }

  #[tokio::test]
  async fn failed_connections_end_the_stream() {
    let doc = banner_document(&unused_port().to_string());
    let dialer = Dialer::new(Arc::new(doc), "127.0.0.1", Arc::new(ActionRegistry::with_builtins())).unwrap();
    let mut stream = dialer.dial().unwrap();
    let mut rest = Vec::new();
    tokio::time::timeout(TIMEOUT, stream.read_to_end(&mut rest))
      .await
      .expect("A refused connection must end the stream")
      .unwrap();
    assert!(rest.is_empty());
    dialer.close().await;
  }

  #[tokio::test]
  async fn closed_dialers_refuse_new_streams() {
    let dialer = Dialer::new(
      Arc::new(banner_document("21")),
      "127.0.0.1",
      Arc::new(ActionRegistry::with_builtins()),
    )
    .unwrap();
    dialer.close().await;
    dialer.close().await;
    assert_eq!(dialer.dial().unwrap_err(), DialerError::Closed);
  }

  #[test]
  fn configuration_is_validated_up_front() {
    let actions = Arc::new(ActionRegistry::new());
    assert!(matches!(
      Dialer::new(Arc::new(banner_document("ftp")), "localhost", Arc::clone(&actions)),
      Err(DialerError::InvalidPort(_))
    ));
    let mut doc = banner_document("21");
    doc.transport = "quic".into();
    assert!(matches!(
      Dialer::new(Arc::new(doc), "localhost", actions),
      Err(DialerError::UnsupportedTransport(_))
    ));
  }
}
