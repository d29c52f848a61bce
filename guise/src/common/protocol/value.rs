// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use serde::{Deserialize, Serialize};

/// A dynamically-typed literal, used both for action arguments and for the
/// values held in an engine's variable environment.
///
/// Serialized untagged, so `null`, `"text"`, and `42` map onto
/// [Value::None], [Value::Str], and [Value::Int] respectively.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
  /// Absent; also the result of reading an unset variable
  #[default]
  None,
  Int(i64),
  Str(String),
}

impl Value {
  pub fn is_none(&self) -> bool {
    matches!(self, Self::None)
  }

  pub fn is_some(&self) -> bool {
    !self.is_none()
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      Self::Str(s) => Some(s.as_str()),
      _ => None,
    }
  }

  pub fn as_int(&self) -> Option<i64> {
    match self {
      Self::Int(i) => Some(*i),
      _ => None,
    }
  }
}

impl From<&str> for Value {
  fn from(s: &str) -> Self {
    Self::Str(s.to_owned())
  }
}

impl From<String> for Value {
  fn from(s: String) -> Self {
    Self::Str(s)
  }
}

impl From<i64> for Value {
  fn from(i: i64) -> Self {
    Self::Int(i)
  }
}

impl From<u16> for Value {
  fn from(port: u16) -> Self {
    Self::Int(port.into())
  }
}

impl<T: Into<Value>> From<Option<T>> for Value {
  fn from(v: Option<T>) -> Self {
    v.map(Into::into).unwrap_or_default()
  }
}

impl std::fmt::Display for Value {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::None => f.write_str("<none>"),
      Self::Int(i) => write!(f, "{}", i),
      Self::Str(s) => write!(f, "{:?}", s),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::Value;

  #[test]
  fn untagged_json_literals() {
    let parsed: Vec<Value> = serde_json::from_str(r#"[null, 12, "ftp_pasv_port"]"#).unwrap();
    assert_eq!(
      parsed,
      vec![Value::None, Value::Int(12), Value::from("ftp_pasv_port")]
    );
  }

  #[test]
  fn absent_option_is_none() {
    assert!(Value::from(Option::<i64>::None).is_none());
    assert_eq!(Value::from(Some(3i64)).as_int(), Some(3));
    assert_eq!(Value::from("a").as_int(), None);
  }
}
