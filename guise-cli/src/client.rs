// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use guise::{client::Dialer, common::protocol::ActionRegistry, util, Document};
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing_futures::Instrument;

#[derive(Clone, Debug)]
pub struct ClientArgs {
  pub document: Arc<Document>,
  pub remote_host: String,
  pub local_addr: SocketAddr,
}

/// Carry every connection made to the local address to the remote server
#[tracing::instrument(
  skip(config, shutdown),
  fields(local=?config.local_addr, remote=%config.remote_host, doc=config.document.display_name()),
  err
)]
pub async fn client_main(config: ClientArgs, shutdown: CancellationToken) -> Result<()> {
  let dialer = Dialer::new(
    Arc::clone(&config.document),
    config.remote_host.clone(),
    Arc::new(ActionRegistry::with_builtins()),
  )?;
  let local = TcpListener::bind(config.local_addr)
    .await
    .context("Failed to bind local address")?;
  tracing::info!(addr = ?local.local_addr().ok(), "Accepting application connections");

  let forwarders = TaskTracker::new();
  let result = loop {
    let (mut conn, peer) = tokio::select! {
      _ = shutdown.cancelled() => break Ok(()),
      accepted = local.accept() => match accepted {
        Ok(accepted) => accepted,
        Err(e) => break Err(anyhow::Error::new(e).context("Failed accepting local connection")),
      },
    };
    let mut stream = match dialer.dial() {
      Ok(stream) => stream,
      Err(e) => break Err(anyhow::Error::new(e)),
    };
    let id = stream.id();
    forwarders.spawn(
      async move {
        if let Err(e) = util::proxy_streams(&mut conn, &mut stream).await {
          tracing::debug!(error = %e, "Carrying ended with error");
        }
      }
      .instrument(tracing::span!(tracing::Level::DEBUG, "carry", %id, %peer)),
    );
  };

  drop(local);
  dialer.close().await;
  forwarders.close();
  forwarders.wait().await;
  result
}
