//! Dynamic value entries.
//!
//! A [`DynamicValue`] is a value-set entry whose final string is produced by
//! running something at resolution time. It is an explicit tagged union; the
//! legacy wire shapes (bare string, sequence, mapping) are decoded by a
//! discriminated parser rather than trial deserialization.
//!
//! There is deliberately no raw accessor on the unresolved type. The only way
//! to read a dynamic value is [`DynamicValue::resolve`], which returns a
//! [`ResolvedValue`], so "read before resolve" cannot be expressed.

use std::collections::BTreeMap;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_yaml::Value;

use super::exec::{ExecContext, run_argv, run_script};
use super::ValuesError;

/// An unresolved dynamic entry.
#[derive(Debug, Clone, PartialEq)]
pub enum DynamicValue {
  /// A literal string used as-is.
  Literal(String),
  /// An argv-style command; its stdout becomes the value.
  Command(Vec<String>),
  /// A multi-line shell script; its stdout becomes the value.
  Script(String),
  /// A per-OS table of dynamic values, keyed by OS name (`linux`, `macos`,
  /// `windows`).
  PerOs(BTreeMap<String, DynamicValue>),
}

/// The output of resolving a [`DynamicValue`], trimmed of surrounding
/// whitespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedValue(String);

impl ResolvedValue {
  pub fn as_str(&self) -> &str {
    &self.0
  }

  pub fn into_string(self) -> String {
    self.0
  }
}

impl DynamicValue {
  /// Resolve this entry to its final string by executing it.
  ///
  /// Execution is bounded by the context's timeout and aborted by its cancel
  /// token. Trailing whitespace is trimmed, as script output usually ends
  /// with a newline.
  pub async fn resolve(&self, ctx: &ExecContext<'_>) -> Result<ResolvedValue, ValuesError> {
    let raw = match self {
      DynamicValue::Literal(value) => value.clone(),
      DynamicValue::Command(argv) => run_argv(argv, ctx).await?,
      DynamicValue::Script(script) => run_script(script, ctx).await?,
      DynamicValue::PerOs(by_os) => {
        let os = std::env::consts::OS;
        let Some(entry) = by_os.get(os) else {
          return Err(ValuesError::DynamicResolve {
            key: os.to_string(),
            message: format!("no entry for os {os:?}"),
          });
        };
        return Box::pin(entry.resolve(ctx)).await;
      }
    };

    Ok(ResolvedValue(raw.trim().to_string()))
  }

  fn from_wire(value: &Value) -> Result<DynamicValue, String> {
    match value {
      Value::String(s) => {
        if s.lines().count() > 1 {
          Ok(DynamicValue::Script(s.clone()))
        } else {
          Ok(DynamicValue::Literal(s.clone()))
        }
      }
      Value::Sequence(seq) => {
        let argv = seq
          .iter()
          .map(|item| match item {
            Value::String(s) => Ok(s.clone()),
            other => Err(format!("command element must be a string, got {other:?}")),
          })
          .collect::<Result<Vec<_>, _>>()?;
        Ok(DynamicValue::Command(argv))
      }
      Value::Mapping(map) => {
        if let Some(Value::Mapping(by_os)) = map.get("os") {
          let mut out = BTreeMap::new();
          for (key, entry) in by_os {
            let Value::String(os) = key else {
              return Err("os keys must be strings".to_string());
            };
            out.insert(os.clone(), DynamicValue::from_wire(entry)?);
          }
          return Ok(DynamicValue::PerOs(out));
        }
        if let Some(command) = map.get("command") {
          return DynamicValue::from_wire(command).and_then(|d| match d {
            DynamicValue::Command(_) => Ok(d),
            _ => Err("command must be a sequence of strings".to_string()),
          });
        }
        if let Some(Value::String(script)) = map.get("script") {
          return Ok(DynamicValue::Script(script.clone()));
        }
        if let Some(Value::String(value)) = map.get("value") {
          return Ok(DynamicValue::Literal(value.clone()));
        }
        Err("expected one of: os, command, script, value".to_string())
      }
      other => Err(format!("cannot interpret {other:?} as a dynamic value")),
    }
  }

  fn to_wire(&self) -> Value {
    match self {
      DynamicValue::Literal(s) => Value::String(s.clone()),
      DynamicValue::Command(argv) => Value::Sequence(argv.iter().cloned().map(Value::String).collect()),
      DynamicValue::Script(s) => Value::String(s.clone()),
      DynamicValue::PerOs(by_os) => {
        let mut os_map = serde_yaml::Mapping::new();
        for (os, entry) in by_os {
          os_map.insert(Value::String(os.clone()), entry.to_wire());
        }
        let mut outer = serde_yaml::Mapping::new();
        outer.insert(Value::String("os".to_string()), Value::Mapping(os_map));
        Value::Mapping(outer)
      }
    }
  }
}

impl Serialize for DynamicValue {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    self.to_wire().serialize(serializer)
  }
}

impl<'de> Deserialize<'de> for DynamicValue {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let value = Value::deserialize(deserializer)?;
    DynamicValue::from_wire(&value).map_err(D::Error::custom)
  }
}
