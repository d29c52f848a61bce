// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! The already-parsed protocol document consumed by listeners, dialers, and engines
//!
//! A document is immutable once loaded and is shared read-only between every
//! engine spawned from it, so it is generally passed around as an `Arc<Document>`.

use serde::{Deserialize, Serialize};
use std::path::Path;

use super::protocol::{Party, Value};

pub const DEFAULT_INITIAL_STATE: &str = "start";
pub const DEFAULT_TERMINAL_STATE: &str = "end";

#[derive(thiserror::Error, Debug)]
pub enum DocumentError {
  #[error("Failure reading protocol document: {0}")]
  Io(#[from] std::io::Error),
  #[error("Failure parsing protocol document: {0}")]
  Parse(#[from] serde_json::Error),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid connection port {0:?}")]
pub struct InvalidPort(pub String);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
  /// Human-readable name of the cover protocol, used only for diagnostics
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  pub transport: String,
  /// Kept as a string, as documents may name a port that is only known at runtime
  pub port: String,
  pub program: Program,
}

impl Document {
  pub fn new<T: Into<String>, P: Into<String>>(transport: T, port: P, program: Program) -> Self {
    Self {
      name: None,
      transport: transport.into(),
      port: port.into(),
      program,
    }
  }

  pub fn from_json(source: &str) -> Result<Self, DocumentError> {
    Ok(serde_json::from_str(source)?)
  }

  pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, DocumentError> {
    let content = std::fs::read_to_string(path)?;
    Self::from_json(&content)
  }

  /// Parses the document's port field; `0` requests a dynamically assigned port.
  pub fn bind_port(&self) -> Result<u16, InvalidPort> {
    self
      .port
      .parse::<u16>()
      .map_err(|_| InvalidPort(self.port.clone()))
  }

  pub fn display_name(&self) -> &str {
    self.name.as_deref().unwrap_or("<unnamed>")
  }
}

fn default_initial() -> String {
  DEFAULT_INITIAL_STATE.to_owned()
}

fn default_terminal() -> Vec<String> {
  vec![DEFAULT_TERMINAL_STATE.to_owned()]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
  #[serde(default = "default_initial")]
  pub initial: String,
  #[serde(default = "default_terminal")]
  pub terminal: Vec<String>,
  #[serde(default)]
  pub transitions: Vec<Transition>,
}

impl Default for Program {
  fn default() -> Self {
    Self {
      initial: default_initial(),
      terminal: default_terminal(),
      transitions: Vec::new(),
    }
  }
}

impl Program {
  pub fn new(transitions: Vec<Transition>) -> Self {
    Self {
      transitions,
      ..Default::default()
    }
  }

  pub fn is_terminal(&self, state: &str) -> bool {
    self.terminal.iter().any(|t| t == state)
  }

  /// Transitions leaving `state`, in declaration order
  pub fn transitions_from<'a>(&'a self, state: &'a str) -> impl Iterator<Item = &'a Transition> {
    self.transitions.iter().filter(move |t| t.from == state)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
  pub from: String,
  pub to: String,
  #[serde(default)]
  pub guard: Guard,
  #[serde(default)]
  pub actions: Vec<ActionStep>,
}

impl Transition {
  pub fn new<F: Into<String>, T: Into<String>>(from: F, to: T) -> Self {
    Self {
      from: from.into(),
      to: to.into(),
      guard: Guard::Always,
      actions: Vec::new(),
    }
  }

  pub fn with_guard(mut self, guard: Guard) -> Self {
    self.guard = guard;
    self
  }

  pub fn with_action(mut self, step: ActionStep) -> Self {
    self.actions.push(step);
    self
  }
}

/// One named action invocation within a transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionStep {
  pub name: String,
  #[serde(default)]
  pub args: Vec<Value>,
  /// Restricts the step to one side of the exchange; steps for the other side are skipped
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub party: Option<Party>,
}

impl ActionStep {
  pub fn new<N: Into<String>>(name: N, args: Vec<Value>) -> Self {
    Self {
      name: name.into(),
      args,
      party: None,
    }
  }

  pub fn for_party(mut self, party: Party) -> Self {
    self.party = Some(party);
    self
  }

  pub fn applies_to(&self, party: Party) -> bool {
    self.party.map_or(true, |p| p == party)
  }
}

/// Condition gating a transition, evaluated over the engine's role and variables
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Guard {
  #[default]
  Always,
  Party(Party),
  Set(String),
  Unset(String),
  Equals { var: String, value: Value },
  All(Vec<Guard>),
  Any(Vec<Guard>),
  Not(Box<Guard>),
}

impl Guard {
  pub fn evaluate<F>(&self, party: Party, lookup: &F) -> bool
  where
    F: Fn(&str) -> Value,
  {
    match self {
      Guard::Always => true,
      Guard::Party(p) => *p == party,
      Guard::Set(name) => lookup(name).is_some(),
      Guard::Unset(name) => lookup(name).is_none(),
      Guard::Equals { var, value } => &lookup(var) == value,
      Guard::All(guards) => guards.iter().all(|g| g.evaluate(party, lookup)),
      Guard::Any(guards) => guards.iter().any(|g| g.evaluate(party, lookup)),
      Guard::Not(guard) => !guard.evaluate(party, lookup),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::{Document, Guard, InvalidPort};
  use crate::common::protocol::{Party, Value};

  const FTP_LIKE: &str = r#"{
    "name": "ftp_pasv",
    "transport": "tcp",
    "port": "2121",
    "program": {
      "transitions": [
        {
          "from": "start",
          "to": "banner",
          "actions": [
            { "name": "channel.bind", "args": ["ftp_pasv_port"] },
            { "name": "io.puts", "args": ["220 ready\r\n"], "party": "server" }
          ]
        },
        {
          "from": "banner",
          "to": "end",
          "guard": { "all": [{ "party": "client" }, { "set": "ftp_pasv_port" }] }
        }
      ]
    }
  }"#;

  #[test]
  fn parse_document_with_defaults() {
    let doc = Document::from_json(FTP_LIKE).unwrap();
    assert_eq!(doc.display_name(), "ftp_pasv");
    assert_eq!(doc.bind_port(), Ok(2121));
    assert_eq!(doc.program.initial, "start");
    assert!(doc.program.is_terminal("end"));
    assert_eq!(doc.program.transitions_from("start").count(), 1);
    let steps = &doc.program.transitions[0].actions;
    assert!(steps[0].applies_to(Party::Client));
    assert!(!steps[1].applies_to(Party::Client));
    assert_eq!(doc.program.transitions[0].guard, Guard::Always);
  }

  #[test]
  fn malformed_ports_are_rejected() {
    for port in ["", "abc", "-1", "65536", "21.5", "ftp_pasv_port"] {
      let mut doc = Document::from_json(FTP_LIKE).unwrap();
      doc.port = port.to_owned();
      assert_eq!(doc.bind_port(), Err(InvalidPort(port.to_owned())));
    }
  }

  #[test]
  fn guards_follow_role_and_variables() {
    let lookup = |name: &str| match name {
      "mode" => Value::from("passive"),
      _ => Value::None,
    };
    let guard = Guard::All(vec![
      Guard::Party(Party::Server),
      Guard::Equals {
        var: "mode".into(),
        value: "passive".into(),
      },
      Guard::Not(Box::new(Guard::Set("port".into()))),
    ]);
    assert!(guard.evaluate(Party::Server, &lookup));
    assert!(!guard.evaluate(Party::Client, &lookup));
    assert!(Guard::Any(vec![Guard::Unset("port".into()), Guard::Set("port".into())])
      .evaluate(Party::Client, &lookup));
  }
}
