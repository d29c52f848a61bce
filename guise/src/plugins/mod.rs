// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Built-in actions, addressable from documents by their dotted names
//!
//! Anything protocol-specific lives here rather than in the engine; for
//! instance, passive-mode data ports are modelled by `channel.bind` storing a
//! freshly bound port in a variable that later transitions can announce.

use crate::common::protocol::ActionRegistry;

pub mod channel;
pub mod io;
pub mod model;
pub mod tunnel;

pub fn register_builtins(registry: &mut ActionRegistry) {
  registry.register("channel.bind", channel::Bind);
  registry.register("io.puts", io::Puts);
  registry.register("io.gets", io::Gets);
  registry.register("model.sleep", model::Sleep);
  registry.register("tunnel.relay", tunnel::Relay);
}
