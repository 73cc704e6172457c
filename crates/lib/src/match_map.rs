//! Exact-match context filtering.
//!
//! Every deployment unit carries a match-context: a flat map of attributes
//! describing where it is going (environment, cluster, namespace, and their
//! roles). Value sets and action hooks declare a [`MatchFilter`] over those
//! attributes to scope themselves to particular targets.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Well-known match-context keys.
pub mod keys {
  pub const APP_NAME: &str = "appName";
  pub const ENVIRONMENT: &str = "environment";
  pub const ENVIRONMENT_ROLE: &str = "environmentRole";
  pub const CLUSTER: &str = "cluster";
  pub const CLUSTER_ROLE: &str = "clusterRole";
  pub const CLUSTER_PROVIDER: &str = "clusterProvider";
  pub const NAMESPACE: &str = "namespace";
  pub const NAMESPACE_ROLE: &str = "namespaceRole";
}

/// The attributes of one concrete deployment target.
pub type MatchArgs = BTreeMap<String, String>;

/// A single acceptable value, with `!value` meaning "anything but".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MatchValue(pub String);

impl MatchValue {
  pub fn matches(&self, arg: &str) -> bool {
    match self.0.strip_prefix('!') {
      Some(negated) => arg != negated,
      None => arg == self.0,
    }
  }
}

impl fmt::Display for MatchValue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// An exact-match filter over a match-context.
///
/// Empty filters match everything. Otherwise every declared key must be
/// satisfied by at least one of its values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MatchFilter(pub BTreeMap<String, Vec<MatchValue>>);

impl MatchFilter {
  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn matches(&self, args: &MatchArgs) -> bool {
    self.0.iter().all(|(key, accepted)| {
      let target = args.get(key).map(String::as_str).unwrap_or("");
      accepted.iter().any(|value| value.matches(target))
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn args(pairs: &[(&str, &str)]) -> MatchArgs {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
  }

  fn filter(yaml: &str) -> MatchFilter {
    serde_yaml::from_str(yaml).unwrap()
  }

  #[test]
  fn empty_filter_matches_anything() {
    let f = MatchFilter::default();
    assert!(f.matches(&args(&[("cluster", "blue")])));
    assert!(f.matches(&MatchArgs::new()));
  }

  #[test]
  fn all_keys_must_match() {
    let f = filter("environment: [prod]\nclusterRole: [primary]");

    assert!(f.matches(&args(&[("environment", "prod"), ("clusterRole", "primary")])));
    assert!(!f.matches(&args(&[("environment", "prod"), ("clusterRole", "backup")])));
    assert!(!f.matches(&args(&[("environment", "prod")])));
  }

  #[test]
  fn any_value_per_key_suffices() {
    let f = filter("namespaceRole: [default, jobs]");
    assert!(f.matches(&args(&[("namespaceRole", "jobs")])));
    assert!(!f.matches(&args(&[("namespaceRole", "system")])));
  }

  #[test]
  fn negated_values() {
    let f = filter("environment: ['!prod']");
    assert!(f.matches(&args(&[("environment", "qa")])));
    assert!(!f.matches(&args(&[("environment", "prod")])));
  }
}
