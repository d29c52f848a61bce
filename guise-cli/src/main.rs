// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![warn(unused_imports)]

use anyhow::Result;
use clap::{Arg, ArgMatches, Command};
use guise::util;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use util::validators::{
  parse_document, parse_ipaddr, parse_socketaddr, validate_document, validate_ipaddr,
  validate_socketaddr,
};

mod client;
mod server;

fn main() {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));
  let collector = tracing_subscriber::fmt()
    .pretty()
    .with_env_filter(env_filter)
    .finish();
  tracing::subscriber::set_global_default(collector).expect("Logger init must succeed");
  let app = Command::new(env!("CARGO_BIN_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .subcommand(
      Command::new("client")
        .alias("-c")
        .about("Carry local TCP connections to a remote server over the cover protocol")
        .arg(
          Arg::new("document")
            .long("document")
            .short('d')
            .validator(validate_document)
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("remote")
            .help("Host running the server; the port comes from the document")
            .long("remote")
            .short('r')
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("local")
            .help("Address accepting the application connections to carry")
            .long("local")
            .short('l')
            .validator(validate_socketaddr)
            .default_value("127.0.0.1:8080")
            .takes_value(true),
        ),
    )
    .subcommand(
      Command::new("server")
        .alias("-s")
        .about("Accept cover-protocol connections and forward their streams to a target")
        .arg(
          Arg::new("document")
            .long("document")
            .short('d')
            .validator(validate_document)
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("bind")
            .long("bind")
            .alias("bindip")
            .short('i')
            .validator(validate_ipaddr)
            .default_value("127.0.0.1")
            .takes_value(true),
        )
        .arg(
          Arg::new("target")
            .help("Address each accepted stream is forwarded to")
            .long("target")
            .short('t')
            .validator(validate_socketaddr)
            .takes_value(true)
            .required(true),
        ),
    )
    .subcommand_required(true)
    .arg_required_else_help(true);
  let matches = app.get_matches();
  let mode = matches.subcommand_name().unwrap_or("<No subcommand?>");
  let handler = main_args_handler(&matches);
  let rt = tokio::runtime::Builder::new_multi_thread()
    .thread_name("tokio-reactor-worker")
    .enable_all()
    .build()
    .expect("Tokio Runtime setup failure");
  match rt.block_on(handler) {
    Err(err) => {
      tracing::error!(mode = mode, err = ?err, "dispatch_command_failure");
    }
    Ok(_) => tracing::info!("{} exited successfully", mode),
  }
}

pub fn client_arg_handling(args: &'_ ArgMatches) -> Result<client::ClientArgs> {
  Ok(client::ClientArgs {
    document: Arc::new(parse_document(required(args, "document")?)?),
    remote_host: required(args, "remote")?.to_owned(),
    local_addr: parse_socketaddr(required(args, "local")?)?,
  })
}

pub fn server_arg_handling(args: &'_ ArgMatches) -> Result<server::ServerArgs> {
  Ok(server::ServerArgs {
    document: Arc::new(parse_document(required(args, "document")?)?),
    bind_ip: parse_ipaddr(required(args, "bind")?)?,
    target: parse_socketaddr(required(args, "target")?)?,
  })
}

fn required<'a>(args: &'a ArgMatches, name: &str) -> Result<&'a str> {
  args
    .value_of(name)
    .ok_or_else(|| anyhow::Error::msg(format!("Missing argument {:?}", name)))
}

/// Cancels the returned token on the first ctrl-c
fn shutdown_on_sigint() -> (CancellationToken, tokio::task::JoinHandle<()>) {
  let shutdown = CancellationToken::new();
  let shutdown_trigger = shutdown.clone();
  let sigint_handler_task = tokio::task::spawn(async move {
    let _ = tokio::signal::ctrl_c().await;
    tracing::trace!("SIGINT detected, initiating graceful shutdown");
    shutdown_trigger.cancel();
  });
  (shutdown, sigint_handler_task)
}

async fn main_args_handler(matches: &'_ ArgMatches) -> Result<()> {
  let (shutdown, sigint_handler_task) = shutdown_on_sigint();
  let result = match matches.subcommand() {
    Some(("server", opts)) => {
      let config = server_arg_handling(opts)?;
      tracing::info!("Running as server with config {:#?}", config);
      server::server_main(config, shutdown).await
    }
    Some(("client", opts)) => {
      let config = client_arg_handling(opts)?;
      tracing::info!("Running as client with config {:#?}", config);
      client::client_main(config, shutdown).await
    }
    _ => Err(anyhow::Error::msg("A subcommand is required")),
  };
  sigint_handler_task.abort();
  let _cancelled = sigint_handler_task.await;
  result
}
