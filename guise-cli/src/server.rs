// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use guise::{common::protocol::ActionRegistry, server::Listener, util, Document};
use std::{
  net::{IpAddr, SocketAddr},
  sync::Arc,
};
use tokio::net::TcpStream;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing_futures::Instrument;

/// Parameters used to run a guise server forwarding streams to a fixed target
#[derive(Clone, Debug)]
pub struct ServerArgs {
  pub document: Arc<Document>,
  pub bind_ip: IpAddr,
  pub target: SocketAddr,
}

/// Accept cover-protocol connections and forward every stream they carry to the target
#[tracing::instrument(
  skip(config, shutdown),
  fields(bind=?config.bind_ip, target=?config.target, doc=config.document.display_name()),
  err
)]
pub async fn server_main(config: ServerArgs, shutdown: CancellationToken) -> Result<()> {
  let listener = Listener::listen(
    Arc::clone(&config.document),
    &config.bind_ip.to_string(),
    Arc::new(ActionRegistry::with_builtins()),
  )
  .await
  .context("Failed to start listener")?;
  tracing::info!(addr = %listener.local_addr(), "Accepting cover connections");

  let forwarders = TaskTracker::new();
  loop {
    let stream = tokio::select! {
      _ = shutdown.cancelled() => break,
      accepted = listener.accept() => match accepted {
        Ok(stream) => stream,
        Err(e) => {
          tracing::warn!(error = %e, "Listener stopped accepting");
          break;
        }
      },
    };
    let id = stream.id();
    let target = config.target;
    forwarders.spawn(
      async move {
        let mut stream = stream;
        match TcpStream::connect(target).await {
          Ok(mut upstream) => {
            if let Err(e) = util::proxy_streams(&mut stream, &mut upstream).await {
              tracing::debug!(error = %e, "Forwarding ended with error");
            }
          }
          Err(e) => tracing::warn!(error = %e, "Failed to reach forwarding target"),
        }
      }
      .instrument(tracing::span!(tracing::Level::DEBUG, "forward", %id, %target)),
    );
  }

  listener.close().await.context("Failed to close listener")?;
  forwarders.close();
  forwarders.wait().await;
  Ok(())
}
