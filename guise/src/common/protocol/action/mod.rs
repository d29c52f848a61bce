// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! The dispatch boundary between engines and pluggable protocol behaviour
//!
//! Engines never interpret what an action does; they look it up by name in an
//! [ActionRegistry] and invoke it with the transition's literal arguments and
//! access to their own [FsmContext]. Actions validate their own arguments.

use futures::future::BoxFuture;
use std::{collections::HashMap, sync::Arc};

use super::{FsmContext, Value};
use crate::stream::StreamError;

#[derive(thiserror::Error, Debug)]
pub enum ActionError {
  #[error("not enough arguments")]
  NotEnoughArguments,
  #[error("invalid argument type")]
  InvalidArgumentType,
  /// Soft failure; the engine moves on to the next candidate transition
  #[error("transition declined: {0}")]
  Declined(String),
  #[error("I/O failure: {0}")]
  Io(#[from] std::io::Error),
  #[error(transparent)]
  Stream(#[from] StreamError),
  #[error("{0}")]
  Failed(String),
}

impl ActionError {
  pub fn is_declined(&self) -> bool {
    matches!(self, Self::Declined(_))
  }
}

/// A named unit of protocol behaviour, invoked from within a transition
///
/// Implementations must tolerate repeated invocation: if whatever the action
/// establishes is already in place, invoking it again must succeed without
/// side effects, as transitions may be retried or re-entered.
pub trait Action: Send + Sync {
  fn invoke<'a>(
    &'a self,
    ctx: &'a mut dyn FsmContext,
    args: &'a [Value],
  ) -> BoxFuture<'a, Result<(), ActionError>>;
}

/// Fetches a required string argument
pub fn str_arg(args: &[Value], index: usize) -> Result<&str, ActionError> {
  args
    .get(index)
    .ok_or(ActionError::NotEnoughArguments)?
    .as_str()
    .ok_or(ActionError::InvalidArgumentType)
}

/// Fetches a required integer argument
pub fn int_arg(args: &[Value], index: usize) -> Result<i64, ActionError> {
  args
    .get(index)
    .ok_or(ActionError::NotEnoughArguments)?
    .as_int()
    .ok_or(ActionError::InvalidArgumentType)
}

/// Name → action mapping shared read-only by every engine of a listener or dialer
#[derive(Clone, Default)]
pub struct ActionRegistry {
  actions: HashMap<String, Arc<dyn Action>>,
}

impl ActionRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// A registry preloaded with every action in [crate::plugins]
  pub fn with_builtins() -> Self {
    let mut registry = Self::new();
    crate::plugins::register_builtins(&mut registry);
    registry
  }

  /// Registers an action, returning any action it replaced
  pub fn register<N, A>(&mut self, name: N, action: A) -> Option<Arc<dyn Action>>
  where
    N: Into<String>,
    A: Action + 'static,
  {
    self.actions.insert(name.into(), Arc::new(action))
  }

  pub fn get(&self, name: &str) -> Option<Arc<dyn Action>> {
    self.actions.get(name).cloned()
  }

  pub fn contains(&self, name: &str) -> bool {
    self.actions.contains_key(name)
  }

  pub fn names(&self) -> impl Iterator<Item = &str> {
    self.actions.keys().map(String::as_str)
  }
}

impl std::fmt::Debug for ActionRegistry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let mut names = self.names().collect::<Vec<_>>();
    names.sort_unstable();
    f.debug_struct("ActionRegistry")
      .field("actions", &names)
      .finish()
  }
}
