// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Argument parsers and validators for command-line front-ends
use anyhow::{Context, Error as AnyErr, Result};
use std::net::SocketAddr;
use std::path::Path;

use crate::common::Document;

pub fn validate_existing_file(v: &str) -> Result<(), String> {
  if !Path::new(&v).is_file() {
    Err(String::from("A file must exist at the given path"))
  } else {
    Ok(())
  }
}

pub fn parse_socketaddr(v: &str) -> Result<SocketAddr> {
  use std::net::ToSocketAddrs;
  ToSocketAddrs::to_socket_addrs(v)
    .map_err(AnyErr::from)
    .and_then(|mut items| {
      items
        .next()
        .ok_or_else(|| AnyErr::msg("No addresses were resolved from the given host"))
    })
}

pub fn parse_ipaddr(v: &str) -> Result<std::net::IpAddr> {
  v.parse::<std::net::IpAddr>()
    .map_err(|_| AnyErr::msg("Could not parse input as ipv4 or ipv6 address"))
}

/// Loads a protocol document, checking that its port and transport are usable
pub fn parse_document(v: &str) -> Result<Document> {
  let doc = Document::load(v).with_context(|| format!("Loading protocol document {:?}", v))?;
  doc.bind_port()?;
  doc
    .transport
    .parse::<crate::common::transport::Transport>()?;
  Ok(doc)
}

pub fn validate_socketaddr(v: &str) -> Result<(), String> {
  parse_socketaddr(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_ipaddr(v: &str) -> Result<(), String> {
  parse_ipaddr(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_document(v: &str) -> Result<(), String> {
  parse_document(v)
    .map(|_| ())
    .map_err(|e| format!("{:#}", e))
}
