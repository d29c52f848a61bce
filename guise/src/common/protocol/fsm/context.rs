// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use tokio::net::TcpListener;

use crate::common::protocol::{ActionError, Party, Value};
use crate::stream::{StreamId, StreamSet};
use crate::util::connection::Connection;

/// The view of an executing engine that actions are handed
///
/// Everything an action may touch goes through here: the engine's role, its
/// variable environment, its physical connection, and the stream registry it
/// shares with every other engine of the same listener or dialer.
#[cfg_attr(test, mockall::automock)]
pub trait FsmContext: Send {
  fn party(&self) -> Party;

  /// Reads a variable; unset names read as [Value::None]
  fn var(&self, name: &str) -> Value;

  fn set_var(&mut self, name: &str, value: Value);

  /// Binds an ephemeral listener alongside the physical connection, returning its port.
  ///
  /// The listener lives as long as the engine unless taken with [FsmContext::take_listener].
  fn listen(&mut self) -> Result<u16, ActionError>;

  /// Takes ownership of an ephemeral listener previously bound via [FsmContext::listen]
  fn take_listener(&mut self, port: u16) -> Option<TcpListener>;

  fn conn(&mut self) -> &mut Connection;

  fn streams(&self) -> &StreamSet;

  /// Ties the stream currently registered under `id` to this engine, so that
  /// exactly that registration is removed when the engine exits
  fn register_stream(&mut self, id: StreamId);
}
