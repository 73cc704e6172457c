//! Label-based app selection.
//!
//! Anything that exposes labels can be selected with a [`LabelSelector`]
//! built from `key=value` expressions. The selector is resolved at compile
//! time against the [`Labelled`] capability, so it works for app manifests
//! today and for any future labelled type without reflection.

use std::collections::BTreeMap;

use thiserror::Error;

/// Exposes a flat label map for selection.
pub trait Labelled {
  fn labels(&self) -> BTreeMap<String, String>;
}

#[derive(Debug, Error)]
pub enum SelectorError {
  #[error("invalid selector expression {expr:?}, expected key=value")]
  InvalidExpression { expr: String },
}

/// A conjunction of `key=value` requirements.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector(BTreeMap<String, String>);

impl LabelSelector {
  /// Parse expressions like `name=auth` or `branch=release/2.1`.
  pub fn parse(expressions: &[String]) -> Result<LabelSelector, SelectorError> {
    let mut out = BTreeMap::new();
    for expr in expressions {
      let Some((key, value)) = expr.split_once('=') else {
        return Err(SelectorError::InvalidExpression { expr: expr.clone() });
      };
      out.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(LabelSelector(out))
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn matches<T: Labelled>(&self, item: &T) -> bool {
    let labels = item.labels();
    self
      .0
      .iter()
      .all(|(key, value)| labels.get(key).is_some_and(|actual| actual == value))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  struct Item(BTreeMap<String, String>);

  impl Labelled for Item {
    fn labels(&self) -> BTreeMap<String, String> {
      self.0.clone()
    }
  }

  fn item(pairs: &[(&str, &str)]) -> Item {
    Item(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect())
  }

  #[test]
  fn empty_selector_matches_all() {
    let sel = LabelSelector::parse(&[]).unwrap();
    assert!(sel.matches(&item(&[("name", "auth")])));
  }

  #[test]
  fn all_expressions_must_hold() {
    let sel = LabelSelector::parse(&["name=auth".to_string(), "branch=main".to_string()]).unwrap();

    assert!(sel.matches(&item(&[("name", "auth"), ("branch", "main")])));
    assert!(!sel.matches(&item(&[("name", "auth"), ("branch", "dev")])));
    assert!(!sel.matches(&item(&[("name", "auth")])));
  }

  #[test]
  fn malformed_expression_is_an_error() {
    let err = LabelSelector::parse(&["justaname".to_string()]).unwrap_err();
    assert!(matches!(err, SelectorError::InvalidExpression { .. }));
  }
}
