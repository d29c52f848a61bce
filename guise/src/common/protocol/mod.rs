// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Types for interpreting protocol programs against a physical connection

// Lifetime stages of a connection, server side:
//
// - the listener accepts a physical connection and builds an engine in the server role
// - the engine walks the program from its initial state, invoking registered actions
// - - actions shape the cover protocol on the wire, and may carve logical streams out of it
// - logical streams are published back through the listener to the application
// - the engine reaches a terminal state or fails, and its streams are torn down with it
//
// The client side is symmetric, but opens its own physical connection.

use serde::{Deserialize, Serialize};

pub mod action;
pub mod fsm;
pub mod value;

pub use action::{Action, ActionError, ActionRegistry};
pub use fsm::{context::FsmContext, Fsm, FsmError};
pub use value::Value;

/// Which side of the exchange an engine plays
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Party {
  /// Initiates the physical connection
  Client,
  /// Responds to an accepted physical connection
  Server,
}

impl Party {
  pub fn as_str(&self) -> &'static str {
    match self {
      Party::Client => "client",
      Party::Server => "server",
    }
  }
}

impl std::fmt::Display for Party {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}
