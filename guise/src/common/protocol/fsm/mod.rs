// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! The per-connection interpreter for protocol programs
//!
//! One [Fsm] is built for every physical connection: the listener builds one in
//! the server role for each accepted connection, and a dialer builds one in the
//! client role for each logical stream it opens. The engine owns its connection,
//! its variable environment, and any ephemeral listeners it binds; it shares the
//! stream registry and the action registry with its siblings.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::{ActionError, ActionRegistry, Party, Value};
use crate::common::document::{Document, InvalidPort, Program, Transition};
use crate::common::transport::{Transport, UnsupportedTransport};
use crate::stream::{StreamHandle, StreamId, StreamSet};
use crate::util::connection::Connection;

pub mod context;

use context::FsmContext;

#[derive(thiserror::Error, Debug)]
pub enum FsmError {
  #[error("no transition could be taken from state {state:?}")]
  NoMatchingTransition { state: String },
  #[error("action {action:?} failed in state {state:?}: {source}")]
  Action {
    state: String,
    action: String,
    #[source]
    source: ActionError,
  },
  #[error("action {action:?} referenced from state {state:?} is not registered")]
  UnknownAction { state: String, action: String },
  #[error("client engine has no remote host to connect to")]
  NoRemote,
  #[error(transparent)]
  InvalidPort(#[from] InvalidPort),
  #[error(transparent)]
  UnsupportedTransport(#[from] UnsupportedTransport),
  #[error("failed to connect: {0}")]
  Connect(#[source] std::io::Error),
  #[error("execution cancelled")]
  Cancelled,
}

/// Outcome of attempting a single transition
enum Attempt {
  Taken,
  Declined(String),
}

pub struct Fsm {
  id: uuid::Uuid,
  doc: Arc<Document>,
  party: Party,
  streams: StreamSet,
  actions: Arc<ActionRegistry>,
  conn: Connection,
  remote: Option<String>,
  state: String,
  vars: HashMap<String, Value>,
  ephemeral: HashMap<u16, TcpListener>,
  owned_streams: Vec<StreamHandle>,
}

impl std::fmt::Debug for Fsm {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Fsm")
      .field("id", &self.id)
      .field("party", &self.party)
      .field("state", &self.state)
      .field("conn", &self.conn)
      .finish_non_exhaustive()
  }
}

impl Fsm {
  pub fn new(
    doc: Arc<Document>,
    party: Party,
    streams: StreamSet,
    actions: Arc<ActionRegistry>,
  ) -> Self {
    let state = doc.program.initial.clone();
    Self {
      id: uuid::Uuid::new_v4(),
      doc,
      party,
      streams,
      actions,
      conn: Connection::Detached,
      remote: None,
      state,
      vars: HashMap::new(),
      ephemeral: HashMap::new(),
      owned_streams: Vec::new(),
    }
  }

  /// Hands the engine an already-established physical connection
  pub fn attach<C: Into<Connection>>(&mut self, conn: C) {
    self.conn = conn.into();
  }

  /// Sets the host a client engine dials when it starts executing without a connection
  pub fn with_remote<H: Into<String>>(mut self, host: H) -> Self {
    self.remote = Some(host.into());
    self
  }

  pub fn id(&self) -> uuid::Uuid {
    self.id
  }

  pub fn state(&self) -> &str {
    &self.state
  }

  fn lookup(&self, name: &str) -> Value {
    self.vars.get(name).cloned().unwrap_or_default()
  }

  /// Runs the program until a terminal state is reached or execution fails.
  ///
  /// Whatever the outcome, the engine's streams are deregistered, its
  /// ephemeral listeners are dropped, and its connection is shut down before
  /// this returns.
  pub async fn execute(&mut self, shutdown: &CancellationToken) -> Result<(), FsmError> {
    let result = self.run(shutdown).await;
    self.teardown().await;
    match &result {
      Ok(()) => tracing::debug!(fsm = %self.id, state = %self.state, "reached terminal state"),
      Err(e) => tracing::debug!(fsm = %self.id, state = %self.state, error = %e, "execution ended"),
    }
    result
  }

  async fn run(&mut self, shutdown: &CancellationToken) -> Result<(), FsmError> {
    if self.party == Party::Client && !self.conn.is_attached() {
      self.connect(shutdown).await?;
    }
    let doc = Arc::clone(&self.doc);
    let program = &doc.program;
    while !program.is_terminal(&self.state) {
      if shutdown.is_cancelled() {
        return Err(FsmError::Cancelled);
      }
      let next = self.step(program, shutdown).await?;
      tracing::trace!(fsm = %self.id, from = %self.state, to = %next, "transition taken");
      self.state = next;
    }
    Ok(())
  }

  async fn connect(&mut self, shutdown: &CancellationToken) -> Result<(), FsmError> {
    let host = self.remote.clone().ok_or(FsmError::NoRemote)?;
    let transport: Transport = self.doc.transport.parse()?;
    let port = self.doc.bind_port()?;
    tracing::trace!(fsm = %self.id, %host, port, "connecting");
    let stream = tokio::select! {
      _ = shutdown.cancelled() => return Err(FsmError::Cancelled),
      res = transport.connect(&host, port) => res.map_err(FsmError::Connect)?,
    };
    self.conn = stream.into();
    Ok(())
  }

  async fn step(
    &mut self,
    program: &Program,
    shutdown: &CancellationToken,
  ) -> Result<String, FsmError> {
    let state = self.state.clone();
    for transition in program.transitions_from(&state) {
      let permitted = {
        let lookup = |name: &str| self.lookup(name);
        transition.guard.evaluate(self.party, &lookup)
      };
      if !permitted {
        continue;
      }
      match self.attempt(transition, shutdown).await? {
        Attempt::Taken => return Ok(transition.to.clone()),
        Attempt::Declined(reason) => {
          tracing::trace!(fsm = %self.id, from = %state, to = %transition.to, %reason, "transition declined");
        }
      }
    }
    Err(FsmError::NoMatchingTransition { state })
  }

  async fn attempt(
    &mut self,
    transition: &Transition,
    shutdown: &CancellationToken,
  ) -> Result<Attempt, FsmError> {
    let party = self.party;
    for step in transition.actions.iter().filter(|s| s.applies_to(party)) {
      let action = self
        .actions
        .get(&step.name)
        .ok_or_else(|| FsmError::UnknownAction {
          state: self.state.clone(),
          action: step.name.clone(),
        })?;
      let outcome = tokio::select! {
        biased;
        _ = shutdown.cancelled() => return Err(FsmError::Cancelled),
        res = action.invoke(&mut *self, &step.args) => res,
      };
      match outcome {
        Ok(()) => {}
        Err(ActionError::Declined(reason)) => return Ok(Attempt::Declined(reason)),
        Err(source) => {
          return Err(FsmError::Action {
            state: self.state.clone(),
            action: step.name.clone(),
            source,
          })
        }
      }
    }
    Ok(Attempt::Taken)
  }

  fn release_streams(&mut self) {
    for handle in self.owned_streams.drain(..) {
      self.streams.remove_handle(&handle);
    }
  }

  async fn teardown(&mut self) {
    self.release_streams();
    self.ephemeral.clear();
    let mut conn = std::mem::take(&mut self.conn);
    if let Err(e) = conn.shutdown().await {
      tracing::trace!(fsm = %self.id, error = %e, "connection shutdown failed");
    }
  }
}

impl Drop for Fsm {
  fn drop(&mut self) {
    self.release_streams();
  }
}

impl FsmContext for Fsm {
  fn party(&self) -> Party {
    self.party
  }

  fn var(&self, name: &str) -> Value {
    self.lookup(name)
  }

  fn set_var(&mut self, name: &str, value: Value) {
    self.vars.insert(name.to_owned(), value);
  }

  fn listen(&mut self) -> Result<u16, ActionError> {
    let ip = self
      .conn
      .local_addr()
      .map(|addr| addr.ip())
      .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    let listener = std::net::TcpListener::bind((ip, 0))?;
    listener.set_nonblocking(true)?;
    let listener = TcpListener::from_std(listener)?;
    let port = listener.local_addr()?.port();
    tracing::trace!(fsm = %self.id, port, "bound ephemeral listener");
    self.ephemeral.insert(port, listener);
    Ok(port)
  }

  fn take_listener(&mut self, port: u16) -> Option<TcpListener> {
    self.ephemeral.remove(&port)
  }

  fn conn(&mut self) -> &mut Connection {
    &mut self.conn
  }

  fn streams(&self) -> &StreamSet {
    &self.streams
  }

  fn register_stream(&mut self, id: StreamId) {
    let handle = match self.streams.get(id) {
      Some(handle) => handle,
      None => {
        tracing::trace!(fsm = %self.id, %id, "ignoring unregistered stream");
        return;
      }
    };
    if !self.owned_streams.iter().any(|owned| owned.same_stream(&handle)) {
      self.owned_streams.push(handle);
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::{atomic::Ordering, Arc};
  use std::time::Duration;
  use tokio_util::sync::CancellationToken;

  use super::{Fsm, FsmContext, FsmError};
  use crate::common::document::{ActionStep, Document, Guard, Program, Transition};
  use crate::common::protocol::action::testing::{Assign, Decline, Fail, Hang, Noop};
  use crate::common::protocol::{ActionError, ActionRegistry, Party, Value};
  use crate::stream::{StreamId, StreamSet};
  use crate::util::connection::Connection;

  fn registry() -> (ActionRegistry, Noop, Hang) {
    let noop = Noop::default();
    let hang = Hang::default();
    let mut registry = ActionRegistry::new();
    registry.register("noop", noop.clone());
    registry.register("hang", hang.clone());
    registry.register("assign", Assign);
    registry.register("decline", Decline);
    registry.register("fail", Fail);
    (registry, noop, hang)
  }

  fn engine(transitions: Vec<Transition>, party: Party, registry: ActionRegistry) -> Fsm {
    let doc = Document::new("tcp", "0", Program::new(transitions));
    let mut fsm = Fsm::new(
      Arc::new(doc),
      party,
      StreamSet::new(),
      Arc::new(registry),
    );
    let (local, _remote) = Connection::duplex(64);
    fsm.attach(local);
    fsm
  }

  fn step(name: &str) -> ActionStep {
    ActionStep::new(name, vec![])
  }

  #[tokio::test]
  async fn single_transition_reaches_terminal() {
    let (registry, noop, _) = registry();
    let mut fsm = engine(
      vec![Transition::new("start", "end").with_action(step("noop"))],
      Party::Server,
      registry,
    );
    fsm.execute(&CancellationToken::new()).await.unwrap();
    assert_eq!(fsm.state(), "end");
    assert_eq!(noop.0.load(Ordering::SeqCst), 1);
    assert!(!fsm.conn().is_attached(), "The connection is released on exit");
  }

  #[tokio::test]
  async fn no_candidate_names_the_stuck_state() {
    let (registry, _, _) = registry();
    let mut fsm = engine(
      vec![Transition::new("start", "middle").with_action(step("noop"))],
      Party::Server,
      registry,
    );
    match fsm.execute(&CancellationToken::new()).await {
      Err(FsmError::NoMatchingTransition { state }) => assert_eq!(state, "middle"),
      other => panic!("unexpected outcome {:?}", other),
    }
  }

  #[tokio::test]
  async fn declined_actions_fall_through_to_the_next_candidate() {
    let (registry, noop, _) = registry();
    let mut fsm = engine(
      vec![
        Transition::new("start", "wrong")
          .with_action(step("noop"))
          .with_action(step("decline")),
        Transition::new("start", "end").with_action(step("noop")),
      ],
      Party::Server,
      registry,
    );
    fsm.execute(&CancellationToken::new()).await.unwrap();
    assert_eq!(fsm.state(), "end");
    assert_eq!(noop.0.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn hard_failures_carry_state_and_action() {
    let (registry, _, _) = registry();
    let mut fsm = engine(
      vec![
        Transition::new("start", "end").with_action(step("fail")),
        Transition::new("start", "end").with_action(step("noop")),
      ],
      Party::Server,
      registry,
    );
    match fsm.execute(&CancellationToken::new()).await {
      Err(FsmError::Action {
        state,
        action,
        source: ActionError::Failed(_),
      }) => {
        assert_eq!(state, "start");
        assert_eq!(action, "fail");
      }
      other => panic!("unexpected outcome {:?}", other),
    }
  }

  #[tokio::test]
  async fn unregistered_actions_are_reported() {
    let (registry, _, _) = registry();
    let mut fsm = engine(
      vec![Transition::new("start", "end").with_action(step("nonexistent"))],
      Party::Server,
      registry,
    );
    assert!(matches!(
      fsm.execute(&CancellationToken::new()).await,
      Err(FsmError::UnknownAction { action, .. }) if action == "nonexistent"
    ));
  }

  #[tokio::test]
  async fn steps_and_guards_follow_the_party() {
    let (registry, noop, _) = registry();
    let transitions = vec![
      Transition::new("start", "assigned")
        .with_action(step("fail").for_party(Party::Server))
        .with_action(ActionStep::new("assign", vec!["mode".into(), "active".into()])),
      Transition::new("assigned", "wrong").with_guard(Guard::Party(Party::Server)),
      Transition::new("assigned", "end")
        .with_guard(Guard::Equals {
          var: "mode".into(),
          value: "active".into(),
        })
        .with_action(step("noop")),
    ];
    let mut fsm = engine(transitions, Party::Client, registry);
    fsm.execute(&CancellationToken::new()).await.unwrap();
    assert_eq!(fsm.state(), "end");
    assert_eq!(fsm.var("mode"), Value::from("active"));
    assert_eq!(noop.0.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn cancellation_is_checked_before_each_transition() {
    let (registry, noop, _) = registry();
    let mut fsm = engine(
      vec![Transition::new("start", "end").with_action(step("noop"))],
      Party::Server,
      registry,
    );
    let shutdown = CancellationToken::new();
    shutdown.cancel();
    assert!(matches!(fsm.execute(&shutdown).await, Err(FsmError::Cancelled)));
    assert_eq!(noop.0.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn cancellation_interrupts_blocked_actions() {
    let (registry, _, hang) = registry();
    let mut fsm = engine(
      vec![Transition::new("start", "end").with_action(step("hang"))],
      Party::Server,
      registry,
    );
    let shutdown = CancellationToken::new();
    let canceller = {
      let shutdown = shutdown.clone();
      let hang = hang.clone();
      tokio::task::spawn(async move {
        while hang.0.load(Ordering::SeqCst) == 0 {
          tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown.cancel();
      })
    };
    let result = tokio::time::timeout(Duration::from_secs(5), fsm.execute(&shutdown))
      .await
      .expect("Blocked action must be interrupted");
    assert!(matches!(result, Err(FsmError::Cancelled)));
    assert_eq!(hang.0.load(Ordering::SeqCst), 0, "The in-flight action was dropped");
    canceller.await.unwrap();
  }

  #[tokio::test]
  async fn unset_variables_read_as_none() {
    let (registry, _, _) = registry();
    let mut fsm = engine(vec![], Party::Server, registry);
    assert_eq!(fsm.var("missing"), Value::None);
    fsm.set_var("port", Value::Int(21));
    fsm.set_var("port", Value::Int(2121));
    assert_eq!(fsm.var("port"), Value::Int(2121));
  }

  #[tokio::test]
  async fn registered_streams_are_released_on_exit() {
    let (registry, _, _) = registry();
    let mut fsm = engine(
      vec![Transition::new("start", "end").with_action(step("noop"))],
      Party::Server,
      registry,
    );
    let streams = fsm.streams().clone();
    let stream = streams.open(StreamId::new(5)).unwrap();
    fsm.register_stream(stream.id());
    fsm.register_stream(stream.id());
    fsm.execute(&CancellationToken::new()).await.unwrap();
    assert!(streams.get(StreamId::new(5)).is_none());
    drop(stream);
    assert!(streams.is_empty());
  }

  #[tokio::test]
  async fn teardown_spares_streams_reopened_under_the_same_id() {
    let (registry, _, _) = registry();
    let mut fsm = engine(
      vec![Transition::new("start", "end").with_action(step("noop"))],
      Party::Server,
      registry,
    );
    let streams = fsm.streams().clone();
    let id = StreamId::new(11);
    let stale = streams.open(id).unwrap();
    fsm.register_stream(id);
    streams.remove(id);
    let live = streams.open(id).unwrap();
    fsm.execute(&CancellationToken::new()).await.unwrap();
    assert!(streams.contains(id), "Teardown must only release its own registration");
    drop(stale);
    assert!(streams.contains(id));
    drop(live);
    assert!(streams.is_empty());
  }

  #[tokio::test]
  async fn ephemeral_listeners_are_owned_until_taken() {
    let (registry, _, _) = registry();
    let mut fsm = engine(vec![], Party::Server, registry);
    let port = fsm.listen().unwrap();
    assert_ne!(port, 0);
    let listener = fsm.take_listener(port).expect("Listener must be retained");
    assert_eq!(listener.local_addr().unwrap().port(), port);
    assert!(fsm.take_listener(port).is_none());
  }

  #[tokio::test]
  async fn client_without_remote_cannot_start() {
    let doc = Document::new("tcp", "0", Program::new(vec![]));
    let mut fsm = Fsm::new(
      Arc::new(doc),
      Party::Client,
      StreamSet::new(),
      Arc::new(ActionRegistry::new()),
    );
    assert!(matches!(
      fsm.execute(&CancellationToken::new()).await,
      Err(FsmError::NoRemote)
    ));
  }
}
