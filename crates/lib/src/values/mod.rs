//! Layered configuration values.
//!
//! [`Values`] is the deep-mergeable bag of configuration that every layer of
//! the resolution cascade contributes to. Nested tables merge recursively;
//! scalars and sequences replace wholesale. Dotted paths address nested
//! entries, creating intermediate tables on write.

mod dynamic;
mod exec;
mod mapping;
mod resolve;
mod set;

pub use dynamic::{DynamicValue, ResolvedValue};
pub use exec::{ExecContext, run_argv, run_script};
pub use mapping::ValueMappings;
pub use resolve::{PersistableValues, PersistedValues, resolve_values};
pub use set::{ExtractArgs, ValueSet, ValueSetCollection};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use thiserror::Error;

/// Errors from value merging, path access, file loading, and dynamic
/// resolution.
#[derive(Debug, Error)]
pub enum ValuesError {
  #[error("empty value path")]
  EmptyPath,

  #[error("empty command")]
  EmptyCommand,

  /// A dotted path crossed a value that is not a table.
  #[error("path {path:?} crosses a non-table value")]
  PathConflict { path: String },

  #[error("reading values file {path:?}: {source}")]
  FileRead {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("parsing values file {path:?}: {source}")]
  FileParse {
    path: String,
    #[source]
    source: serde_yaml::Error,
  },

  #[error("serializing values: {0}")]
  Serialize(#[from] serde_yaml::Error),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  /// A dynamic value could not be resolved.
  #[error("resolving dynamic value {key:?}: {message}")]
  DynamicResolve { key: String, message: String },

  /// An external command exited non-zero.
  #[error("command failed with exit code {code:?}: {cmd}")]
  CmdFailed { cmd: String, code: Option<i32> },

  /// The deploy was cancelled while a command was running.
  #[error("cancelled while running {cmd}")]
  Cancelled { cmd: String },

  #[error("timed out after {seconds}s running {cmd}")]
  TimedOut { cmd: String, seconds: u64 },

  /// A value-mapping rename pass referenced a missing source path.
  #[error("applying value mapping from {from:?} to {to:?}: {message}")]
  Mapping {
    from: String,
    to: String,
    message: String,
  },
}

/// A string-keyed tree of configuration values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Values(pub BTreeMap<String, Value>);

impl Values {
  pub fn new() -> Values {
    Values(BTreeMap::new())
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
    self.0.insert(key.into(), value.into());
  }

  pub fn get(&self, key: &str) -> Option<&Value> {
    self.0.get(key)
  }

  /// Deep-merge `other` over this instance.
  ///
  /// Nested tables merge recursively; any other collision is won by `other`.
  pub fn merge(&mut self, other: &Values) {
    for (key, incoming) in &other.0 {
      match self.0.get_mut(key) {
        Some(existing) => merge_value(existing, incoming),
        None => {
          self.0.insert(key.clone(), incoming.clone());
        }
      }
    }
  }

  /// Consuming form of [`Values::merge`].
  pub fn merged(mut self, other: &Values) -> Values {
    self.merge(other);
    self
  }

  /// Set `value` at a dotted `path`, creating intermediate tables as needed.
  pub fn set_at_path(&mut self, path: &str, value: Value) -> Result<(), ValuesError> {
    let mut segments = path.split('.').filter(|s| !s.is_empty());
    let Some(first) = segments.next() else {
      return Err(ValuesError::EmptyPath);
    };
    let rest: Vec<&str> = segments.collect();

    if rest.is_empty() {
      self.0.insert(first.to_string(), value);
      return Ok(());
    }

    let slot = self
      .0
      .entry(first.to_string())
      .or_insert_with(|| Value::Mapping(Mapping::new()));
    set_value_at_path(slot, &rest, value, path)
  }

  /// Read the value at a dotted `path`, if present.
  pub fn get_at_path(&self, path: &str) -> Option<&Value> {
    let mut segments = path.split('.').filter(|s| !s.is_empty());
    let first = segments.next()?;
    let mut current = self.0.get(first)?;
    for segment in segments {
      let Value::Mapping(map) = current else {
        return None;
      };
      current = map.get(segment)?;
    }
    Some(current)
  }

  /// Flatten every leaf into `PREFIX_UPPER_SNAKE` environment pairs.
  ///
  /// Used to expose resolved values to spawned commands and scripts.
  pub fn to_env(&self, prefix: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (key, value) in &self.0 {
      flatten_env(&format!("{prefix}{}", env_segment(key)), value, &mut out);
    }
    out
  }

  /// Mirror the value shape with `source` at every leaf.
  ///
  /// The result is merged into a running attribution tree so diagnostics can
  /// report which layer won each key.
  pub fn make_attributions(&self, source: &str) -> Values {
    let mut out = Values::new();
    for (key, value) in &self.0 {
      out.0.insert(key.clone(), attribution_value(value, source));
    }
    out
  }

  pub fn to_yaml(&self) -> Result<String, ValuesError> {
    Ok(serde_yaml::to_string(self)?)
  }

  pub fn from_yaml(raw: &str) -> Result<Values, serde_yaml::Error> {
    serde_yaml::from_str(raw)
  }
}

fn merge_value(existing: &mut Value, incoming: &Value) {
  if let (Value::Mapping(dst), Value::Mapping(src)) = (&mut *existing, incoming) {
    for (key, value) in src {
      match dst.get_mut(key) {
        Some(slot) => merge_value(slot, value),
        None => {
          dst.insert(key.clone(), value.clone());
        }
      }
    }
    return;
  }
  *existing = incoming.clone();
}

fn set_value_at_path(slot: &mut Value, path: &[&str], value: Value, full_path: &str) -> Result<(), ValuesError> {
  let Value::Mapping(map) = slot else {
    return Err(ValuesError::PathConflict {
      path: full_path.to_string(),
    });
  };

  let key = Value::String(path[0].to_string());
  if path.len() == 1 {
    map.insert(key, value);
    return Ok(());
  }

  let next = map.entry(key).or_insert_with(|| Value::Mapping(Mapping::new()));
  set_value_at_path(next, &path[1..], value, full_path)
}

fn flatten_env(key: &str, value: &Value, out: &mut BTreeMap<String, String>) {
  match value {
    Value::Mapping(map) => {
      for (child_key, child) in map {
        if let Value::String(name) = child_key {
          flatten_env(&format!("{key}_{}", env_segment(name)), child, out);
        }
      }
    }
    Value::String(s) => {
      out.insert(key.to_string(), s.clone());
    }
    Value::Null => {
      out.insert(key.to_string(), String::new());
    }
    other => {
      let rendered = serde_yaml::to_string(other).unwrap_or_default();
      out.insert(key.to_string(), rendered.trim_end().to_string());
    }
  }
}

fn env_segment(name: &str) -> String {
  name
    .chars()
    .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
    .collect()
}

fn attribution_value(value: &Value, source: &str) -> Value {
  match value {
    Value::Mapping(map) => {
      let mut out = Mapping::new();
      for (key, child) in map {
        out.insert(key.clone(), attribution_value(child, source));
      }
      Value::Mapping(out)
    }
    _ => Value::String(source.to_string()),
  }
}
