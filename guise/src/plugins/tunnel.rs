// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use futures::future::{BoxFuture, FutureExt};

use crate::common::protocol::{
  action::{Action, ActionError},
  FsmContext, Party, Value,
};
use crate::stream::{StreamError, StreamId};

/// Variable through which a dialer tells its client engine which stream to carry
pub const STREAM_ID_VAR: &str = "stream_id";

/// `tunnel.relay()`: carries a logical stream over the physical connection until
/// either side finishes.
///
/// The server side opens a fresh stream and publishes it to the listener,
/// waiting until the application accepts it. The client side carries the
/// stream its dialer named in [STREAM_ID_VAR].
pub struct Relay;

impl Action for Relay {
  fn invoke<'a>(
    &'a self,
    ctx: &'a mut dyn FsmContext,
    _args: &'a [Value],
  ) -> BoxFuture<'a, Result<(), ActionError>> {
    relay(ctx).boxed()
  }
}

async fn relay(ctx: &mut dyn FsmContext) -> Result<(), ActionError> {
  let streams = ctx.streams().clone();
  let handle = match ctx.party() {
    Party::Server => {
      let stream = streams.open_random();
      let id = stream.id();
      ctx.register_stream(id);
      let handle = streams.get(id).ok_or(StreamError::NotFound(id))?;
      streams.publish(stream).await?;
      handle
    }
    Party::Client => {
      let id = match ctx.var(STREAM_ID_VAR) {
        Value::Int(id) => u32::try_from(id)
          .map(StreamId::new)
          .map_err(|_| ActionError::InvalidArgumentType)?,
        _ => {
          return Err(ActionError::Failed(format!(
            "no stream named in {:?}",
            STREAM_ID_VAR
          )))
        }
      };
      streams.get(id).ok_or(StreamError::NotFound(id))?
    }
  };
  let id = handle.id();
  let mut peer = handle.take_peer()?;
  tracing::debug!(%id, "relaying stream");
  let (sent, received) = tokio::io::copy_bidirectional(ctx.conn(), &mut peer).await?;
  tracing::debug!(%id, sent, received, "stream relay finished");
  Ok(())
}

#[cfg(test)]
mod tests {
  use std::time::Duration;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::sync::mpsc;

  use super::{Relay, STREAM_ID_VAR};
  use crate::common::protocol::{
    fsm::context::MockFsmContext, Action, ActionError, Party, Value,
  };
  use crate::stream::{StreamError, StreamSet};
  use crate::util::connection::Connection;

  #[tokio::test]
  async fn server_publishes_and_relays() {
    let (tx, mut rx) = mpsc::channel(1);
    let streams = StreamSet::with_publisher(tx);
    let (local, mut remote) = tokio::io::duplex(256);
    let mut ctx = MockFsmContext::new();
    ctx.expect_party().return_const(Party::Server);
    ctx.expect_streams().return_const(streams.clone());
    ctx.expect_register_stream().times(1).return_const(());
    ctx.expect_conn().return_var(Connection::from(local));

    let application = tokio::task::spawn(async move {
      let (mut stream, ack) = rx.recv().await.unwrap();
      ack.send(()).unwrap();
      stream.write_all(b"ping").await.unwrap();
      stream.shutdown().await.unwrap();
      let mut reply = Vec::new();
      stream.read_to_end(&mut reply).await.unwrap();
      reply
    });
    let wire = async {
      let mut buf = [0u8; 4];
      remote.read_exact(&mut buf).await.unwrap();
      assert_eq!(&buf, b"ping");
      remote.write_all(b"pong").await.unwrap();
      remote.shutdown().await.unwrap();
    };
    let (relayed, ()) = tokio::time::timeout(
      Duration::from_secs(5),
      futures::future::join(Relay.invoke(&mut ctx, &[]), wire),
    )
    .await
    .expect("Relay must finish once both sides are done");
    relayed.unwrap();
    assert_eq!(application.await.unwrap(), b"pong");
  }

  #[tokio::test]
  async fn client_requires_a_registered_stream() {
    let mut ctx = MockFsmContext::new();
    ctx.expect_party().return_const(Party::Client);
    ctx.expect_streams().return_const(StreamSet::new());
    ctx
      .expect_var()
      .withf(|name| name == STREAM_ID_VAR)
      .return_const(Value::Int(77));
    ctx.expect_conn().never();
    match Relay.invoke(&mut ctx, &[]).await {
      Err(ActionError::Stream(StreamError::NotFound(id))) => assert_eq!(id.inner(), 77),
      other => panic!("unexpected outcome {:?}", other),
    }
  }

  #[tokio::test]
  async fn server_without_acceptor_fails() {
    let mut ctx = MockFsmContext::new();
    let streams = StreamSet::new();
    ctx.expect_party().return_const(Party::Server);
    ctx.expect_streams().return_const(streams.clone());
    ctx.expect_register_stream().return_const(());
    ctx.expect_conn().never();
    assert!(matches!(
      Relay.invoke(&mut ctx, &[]).await,
      Err(ActionError::Stream(StreamError::Unpublished(_)))
    ));
    assert!(streams.is_empty());
  }
}
