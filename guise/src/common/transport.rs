// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Physical transports a document may name
use std::net::SocketAddr;
use std::str::FromStr;
use tokio::net::{TcpListener, TcpStream};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unsupported transport {0:?}")]
pub struct UnsupportedTransport(pub String);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Transport {
  /// TCP over whichever address family the host resolves to
  Tcp,
  Tcp4,
  Tcp6,
}

impl FromStr for Transport {
  type Err = UnsupportedTransport;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "tcp" => Ok(Transport::Tcp),
      "tcp4" => Ok(Transport::Tcp4),
      "tcp6" => Ok(Transport::Tcp6),
      other => Err(UnsupportedTransport(other.to_owned())),
    }
  }
}

impl Transport {
  fn admits(&self, addr: &SocketAddr) -> bool {
    match self {
      Transport::Tcp => true,
      Transport::Tcp4 => addr.is_ipv4(),
      Transport::Tcp6 => addr.is_ipv6(),
    }
  }

  async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<SocketAddr>> {
    let addrs = tokio::net::lookup_host((host, port))
      .await?
      .filter(|addr| self.admits(addr))
      .collect::<Vec<_>>();
    if addrs.is_empty() {
      return Err(std::io::Error::new(
        std::io::ErrorKind::AddrNotAvailable,
        format!("{:?} has no address usable over {:?}", host, self),
      ));
    }
    Ok(addrs)
  }

  /// Binds the first resolved address of `iface` that accepts a listener
  pub async fn bind(&self, iface: &str, port: u16) -> std::io::Result<TcpListener> {
    let mut last_err = None;
    for addr in self.resolve(iface, port).await? {
      match TcpListener::bind(addr).await {
        Ok(listener) => return Ok(listener),
        Err(e) => last_err = Some(e),
      }
    }
    Err(last_err.unwrap_or_else(|| std::io::ErrorKind::AddrNotAvailable.into()))
  }

  /// Connects to the first resolved address of `host` that accepts
  pub async fn connect(&self, host: &str, port: u16) -> std::io::Result<TcpStream> {
    let mut last_err = None;
    for addr in self.resolve(host, port).await? {
      match TcpStream::connect(addr).await {
        Ok(stream) => return Ok(stream),
        Err(e) => last_err = Some(e),
      }
    }
    Err(last_err.unwrap_or_else(|| std::io::ErrorKind::AddrNotAvailable.into()))
  }
}
