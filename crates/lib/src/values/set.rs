//! Value sets and their selection.
//!
//! A [`ValueSet`] is one layer of configuration: static values, dynamic
//! entries, and references to values files. A [`ValueSetCollection`] holds a
//! default layer plus named/role-scoped layers; [`ValueSetCollection::extract`]
//! selects and merges the layers applicable to one deployment target.

use std::collections::BTreeMap;
use std::path::Path;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml::Value;
use tracing::trace;

use crate::contracts::ValueFileLoader;
use crate::match_map::{MatchArgs, MatchFilter, keys};

use super::dynamic::DynamicValue;
use super::{Values, ValuesError};

/// One layer of configuration values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ValueSet {
  #[serde(skip_serializing_if = "String::is_empty")]
  pub name: String,

  /// Diagnostic label describing where this layer came from.
  #[serde(skip_serializing_if = "String::is_empty")]
  pub source: String,

  /// Environment roles this layer applies to.
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub roles: Vec<String>,

  /// Match-context filter this layer applies under.
  #[serde(skip_serializing_if = "MatchFilter::is_empty")]
  pub exact_match: MatchFilter,

  /// Values files to load under the static values.
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub files: Vec<String>,

  #[serde(skip_serializing_if = "BTreeMap::is_empty")]
  pub dynamic: BTreeMap<String, DynamicValue>,

  #[serde(rename = "static", skip_serializing_if = "Values::is_empty")]
  pub static_values: Values,

  /// Per-leaf source labels, maintained as layers merge.
  #[serde(skip)]
  pub attributions: Values,
}

impl ValueSet {
  pub fn from_values(static_values: Values) -> ValueSet {
    ValueSet {
      static_values,
      ..ValueSet::default()
    }
  }

  pub fn is_empty(&self) -> bool {
    self.static_values.is_empty() && self.dynamic.is_empty() && self.files.is_empty()
  }

  /// Set the source label and attribute every current leaf to it.
  pub fn with_source(mut self, source: &str) -> ValueSet {
    self.source = source.to_string();
    self.attributions.merge(&self.static_values.make_attributions(source));
    self
  }

  /// Like [`ValueSet::with_source`], but keeps an existing label.
  pub fn with_default_source(mut self, source: &str) -> ValueSet {
    if self.source.is_empty() {
      self.source = source.to_string();
    }
    let label = self.source.clone();
    self.attributions.merge(&self.static_values.make_attributions(&label));
    self
  }

  /// Layer `other` over this set.
  ///
  /// Static values deep-merge, dynamic entries override by key, file lists
  /// append, and attributions follow the winning layer.
  pub fn with_values(mut self, other: &ValueSet) -> ValueSet {
    let label = if !other.source.is_empty() {
      other.source.clone()
    } else {
      other.name.clone()
    };

    self.files.extend(other.files.iter().cloned());
    self.static_values.merge(&other.static_values);

    if other.attributions.is_empty() {
      self.attributions.merge(&other.static_values.make_attributions(&label));
    } else {
      self.attributions.merge(&other.attributions);
    }

    for (key, value) in &other.dynamic {
      self.dynamic.insert(key.clone(), value.clone());
    }

    self
  }

  /// Set one value at a dotted path, attributed to `source`.
  pub fn with_value_at_path(mut self, path: &str, value: Value, source: &str) -> Result<ValueSet, ValuesError> {
    self.static_values.set_at_path(path, value)?;
    let _ = self
      .attributions
      .set_at_path(path, Value::String(source.to_string()));
    Ok(self)
  }

  /// Load every referenced file and merge its contents UNDER the static
  /// values, clearing the file references.
  pub fn with_files_loaded(mut self, loader: &dyn ValueFileLoader, base: &Path) -> Result<ValueSet, ValuesError> {
    if self.files.is_empty() {
      return Ok(self);
    }

    let mut from_files = Values::new();
    for file in &self.files {
      let path = base.join(file);
      let loaded = loader.load(&path)?;
      self.attributions.merge(&loaded.make_attributions(&format!("file: {file}")));
      from_files.merge(&loaded);
    }

    // Existing statics win over file contents.
    from_files.merge(&self.static_values);
    self.static_values = from_files;
    self.files.clear();
    Ok(self)
  }
}

/// Selection arguments for [`ValueSetCollection::extract`].
#[derive(Debug, Clone, Default)]
pub struct ExtractArgs<'a> {
  /// Accept layers with one of these names.
  pub names: &'a [String],
  /// Accept layers declaring one of these roles.
  pub roles: &'a [String],
  /// Match-context the layer's exact-match filter must accept.
  pub exact_match: Option<&'a MatchArgs>,
}

/// A default layer plus named/role-scoped custom layers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValueSetCollection {
  #[serde(skip_serializing_if = "ValueSet::is_empty")]
  pub defaults: ValueSet,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub custom: Vec<ValueSet>,
}

impl ValueSetCollection {
  pub fn is_empty(&self) -> bool {
    self.defaults.is_empty() && self.custom.is_empty()
  }

  /// Merge the applicable layers for one target, defaults first.
  ///
  /// A custom layer applies when its name is requested (if any names were
  /// requested), its roles intersect the requested roles (if it declares
  /// roles), and its exact-match filter accepts the target's match-context.
  /// When no roles are requested explicitly, the match-context's
  /// `environmentRole` is used.
  pub fn extract(&self, args: &ExtractArgs<'_>) -> ValueSet {
    let mut out = self.defaults.clone();

    let mut roles: Vec<String> = args.roles.to_vec();
    if roles.is_empty()
      && let Some(exact) = args.exact_match
      && let Some(role) = exact.get(keys::ENVIRONMENT_ROLE)
    {
      roles.push(role.clone());
    }

    for candidate in &self.custom {
      if !args.names.is_empty() && !args.names.contains(&candidate.name) {
        trace!(value_set = %candidate.name, "skipping: name not requested");
        continue;
      }
      if !candidate.roles.is_empty() && !candidate.roles.iter().any(|r| roles.contains(r)) {
        trace!(value_set = %candidate.name, "skipping: role not requested");
        continue;
      }
      if let Some(exact) = args.exact_match
        && !candidate.exact_match.matches(exact)
      {
        trace!(value_set = %candidate.name, "skipping: filters did not match");
        continue;
      }
      out = out.with_values(candidate);
    }

    out
  }
}

// The wire shape predates the struct form: a collection may be a mapping of
// role keys (possibly comma-separated) to value sets, or a sequence of value
// sets where the one named "default" is the default layer.
impl<'de> Deserialize<'de> for ValueSetCollection {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let raw = Value::deserialize(deserializer)?;
    match raw {
      Value::Mapping(map) => {
        if map.contains_key("defaults") || map.contains_key("custom") {
          let defaults = match map.get("defaults") {
            Some(v) => serde_yaml::from_value(v.clone()).map_err(D::Error::custom)?,
            None => ValueSet::default(),
          };
          let custom = match map.get("custom") {
            Some(v) => serde_yaml::from_value(v.clone()).map_err(D::Error::custom)?,
            None => Vec::new(),
          };
          return Ok(ValueSetCollection { defaults, custom });
        }

        let mut out = ValueSetCollection::default();
        for (key, value) in map {
          let Value::String(key) = key else {
            return Err(D::Error::custom("value set keys must be strings"));
          };
          let mut set: ValueSet = serde_yaml::from_value(value).map_err(D::Error::custom)?;
          if key == "default" {
            out.defaults = set;
            continue;
          }
          set.roles = key.split(',').map(|r| r.trim().to_string()).collect();
          set.name = key;
          out.custom.push(set);
        }
        Ok(out)
      }
      Value::Sequence(seq) => {
        let mut out = ValueSetCollection::default();
        for entry in seq {
          let set: ValueSet = serde_yaml::from_value(entry).map_err(D::Error::custom)?;
          if set.name == "default" {
            out.defaults = set;
          } else {
            out.custom.push(set);
          }
        }
        Ok(out)
      }
      Value::Null => Ok(ValueSetCollection::default()),
      other => Err(D::Error::custom(format!(
        "cannot interpret {other:?} as a value set collection"
      ))),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn values(yaml: &str) -> Values {
    Values::from_yaml(yaml).unwrap()
  }

  #[test]
  fn with_values_layers_statics() {
    let low = ValueSet::from_values(values("a: 1\nnested:\n  x: low")).with_source("low");
    let high = ValueSet::from_values(values("nested:\n  x: high\n  y: 2")).with_source("high");

    let merged = low.with_values(&high);

    assert_eq!(merged.static_values.get_at_path("nested.x"), Some(&Value::from("high")));
    assert_eq!(merged.static_values.get_at_path("nested.y"), Some(&Value::from(2)));
    assert_eq!(merged.static_values.get("a"), Some(&Value::from(1)));
    assert_eq!(
      merged.attributions.get_at_path("nested.x"),
      Some(&Value::from("high"))
    );
    assert_eq!(merged.attributions.get_at_path("a"), Some(&Value::from("low")));
  }

  #[test]
  fn dynamic_entries_override_by_key() {
    let mut low = ValueSet::default();
    low.dynamic.insert("app.commit".to_string(), DynamicValue::Literal("old".to_string()));
    let mut high = ValueSet::default();
    high
      .dynamic
      .insert("app.commit".to_string(), DynamicValue::Literal("new".to_string()));

    let merged = low.with_values(&high);
    assert_eq!(
      merged.dynamic.get("app.commit"),
      Some(&DynamicValue::Literal("new".to_string()))
    );
  }

  #[test]
  fn collection_mapping_form_with_comma_roles() {
    let collection: ValueSetCollection = serde_yaml::from_str(
      r#"
default:
  static:
    replicas: 1
"qa,prod":
  static:
    replicas: 3
"#,
    )
    .unwrap();

    assert_eq!(collection.custom.len(), 1);
    assert_eq!(collection.custom[0].roles, vec!["qa", "prod"]);
    assert_eq!(
      collection.defaults.static_values.get("replicas"),
      Some(&Value::from(1))
    );
  }

  #[test]
  fn collection_sequence_form() {
    let collection: ValueSetCollection = serde_yaml::from_str(
      r#"
- name: default
  static:
    a: 1
- name: prod
  roles: [prod]
  static:
    a: 2
"#,
    )
    .unwrap();

    assert_eq!(collection.defaults.static_values.get("a"), Some(&Value::from(1)));
    assert_eq!(collection.custom.len(), 1);
  }

  #[test]
  fn extract_starts_from_defaults() {
    let collection: ValueSetCollection = serde_yaml::from_str(
      r#"
default:
  static:
    replicas: 1
prod:
  static:
    replicas: 5
"#,
    )
    .unwrap();

    let extracted = collection.extract(&ExtractArgs {
      roles: &["qa".to_string()],
      ..ExtractArgs::default()
    });
    assert_eq!(extracted.static_values.get("replicas"), Some(&Value::from(1)));

    let extracted = collection.extract(&ExtractArgs {
      roles: &["prod".to_string()],
      ..ExtractArgs::default()
    });
    assert_eq!(extracted.static_values.get("replicas"), Some(&Value::from(5)));
  }

  #[test]
  fn extract_uses_environment_role_from_match_context() {
    let collection: ValueSetCollection = serde_yaml::from_str(
      r#"
prod:
  static:
    tier: gold
"#,
    )
    .unwrap();

    let mut exact = MatchArgs::new();
    exact.insert(keys::ENVIRONMENT_ROLE.to_string(), "prod".to_string());

    let extracted = collection.extract(&ExtractArgs {
      exact_match: Some(&exact),
      ..ExtractArgs::default()
    });
    assert_eq!(extracted.static_values.get("tier"), Some(&Value::from("gold")));
  }

  #[test]
  fn extract_honors_exact_match_filters() {
    let collection: ValueSetCollection = serde_yaml::from_str(
      r#"
custom:
- name: east-only
  exactMatch:
    cluster: [east]
  static:
    region: east
"#,
    )
    .unwrap();

    let mut east = MatchArgs::new();
    east.insert("cluster".to_string(), "east".to_string());
    let mut west = MatchArgs::new();
    west.insert("cluster".to_string(), "west".to_string());

    let hit = collection.extract(&ExtractArgs {
      exact_match: Some(&east),
      ..ExtractArgs::default()
    });
    assert_eq!(hit.static_values.get("region"), Some(&Value::from("east")));

    let miss = collection.extract(&ExtractArgs {
      exact_match: Some(&west),
      ..ExtractArgs::default()
    });
    assert!(miss.static_values.get("region").is_none());
  }
}
