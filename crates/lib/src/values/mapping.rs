//! Final value-rename pass.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{Values, ValuesError};

/// A map of dotted source path to dotted destination path.
///
/// Applied after the cascade has fully merged, so apps can adapt upstream
/// value shapes to what their chart expects without re-declaring the values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValueMappings(pub BTreeMap<String, String>);

impl ValueMappings {
  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// Copy the value at each source path to its destination path.
  ///
  /// A missing source path is an error: a mapping that silently does nothing
  /// usually means the chart gets a null where it expected a value.
  pub fn apply(&self, target: &mut Values) -> Result<(), ValuesError> {
    for (from, to) in &self.0 {
      let Some(value) = target.get_at_path(from).cloned() else {
        return Err(ValuesError::Mapping {
          from: from.clone(),
          to: to.clone(),
          message: "no value at source path".to_string(),
        });
      };
      target.set_at_path(to, value).map_err(|err| ValuesError::Mapping {
        from: from.clone(),
        to: to.clone(),
        message: err.to_string(),
      })?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use serde_yaml::Value;

  use super::*;

  #[test]
  fn apply_copies_values() {
    let mut mappings = ValueMappings::default();
    mappings.0.insert("app.version".to_string(), "image.tag".to_string());

    let mut values = Values::from_yaml("app:\n  version: 1.2.3").unwrap();
    mappings.apply(&mut values).unwrap();

    assert_eq!(values.get_at_path("image.tag"), Some(&Value::from("1.2.3")));
    assert_eq!(values.get_at_path("app.version"), Some(&Value::from("1.2.3")));
  }

  #[test]
  fn missing_source_is_an_error() {
    let mut mappings = ValueMappings::default();
    mappings.0.insert("missing.path".to_string(), "dest".to_string());

    let mut values = Values::new();
    let err = mappings.apply(&mut values).unwrap_err();
    assert!(matches!(err, ValuesError::Mapping { .. }));
  }
}
