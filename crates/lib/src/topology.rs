//! The environment topology: environments, clusters, and namespaces.
//!
//! Apps declare *roles* (cluster roles, namespace roles) rather than concrete
//! targets; the topology resolves roles to the clusters and namespaces of the
//! current environment. Switching the active cluster yields an explicit
//! [`ClusterSession`] handle that every subsequent engine call takes, so no
//! action depends on ambient context state.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use thiserror::Error;

use crate::values::{Values, ValueSetCollection};

#[derive(Debug, Error)]
pub enum TopologyError {
  #[error("no cluster in environment {environment:?} has role {role:?}")]
  NoClusterForRole { environment: String, role: ClusterRole },

  #[error("no cluster named {name:?} in environment {environment:?}")]
  UnknownCluster { environment: String, name: String },

  #[error("cluster {cluster:?} has no namespace for role {role:?}")]
  NoNamespaceForRole { cluster: String, role: NamespaceRole },

  #[error("switching to cluster {cluster:?}: {message}")]
  SwitchFailed { cluster: String, message: String },
}

/// A logical label resolved to concrete clusters.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterRole(pub String);

impl ClusterRole {
  pub fn default_role() -> ClusterRole {
    ClusterRole("default".to_string())
  }
}

impl fmt::Display for ClusterRole {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// A logical label resolved to one namespace within a cluster.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NamespaceRole(pub String);

impl NamespaceRole {
  pub fn default_role() -> NamespaceRole {
    NamespaceRole("default".to_string())
  }
}

impl fmt::Display for NamespaceRole {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceConfig {
  pub name: String,
}

/// One cluster of the environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterConfig {
  pub name: String,

  #[serde(skip_serializing_if = "String::is_empty")]
  pub provider: String,

  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub roles: Vec<ClusterRole>,

  /// Context name used to address this cluster; defaults to the cluster
  /// name.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub kube_context: Option<String>,

  /// Namespace-role name to namespace mapping.
  #[serde(skip_serializing_if = "BTreeMap::is_empty")]
  pub namespaces: BTreeMap<String, NamespaceConfig>,

  #[serde(skip_serializing_if = "ValueSetCollection::is_empty")]
  pub value_overrides: ValueSetCollection,

  /// Per-app override collections, keyed by app name.
  #[serde(skip_serializing_if = "BTreeMap::is_empty")]
  pub app_overrides: BTreeMap<String, ValueSetCollection>,
}

impl ClusterConfig {
  pub fn has_role(&self, role: &ClusterRole) -> bool {
    self.roles.contains(role)
  }

  pub fn namespace(&self, role: &NamespaceRole) -> Result<&NamespaceConfig, TopologyError> {
    self.namespaces.get(&role.0).ok_or_else(|| TopologyError::NoNamespaceForRole {
      cluster: self.name.clone(),
      role: role.clone(),
    })
  }

  pub fn kube_context(&self) -> &str {
    self.kube_context.as_deref().unwrap_or(&self.name)
  }

  /// Namespace-role to namespace-name values, exposed to the cascade so
  /// charts can reference sibling namespaces.
  pub fn namespace_values(&self) -> Values {
    let mut out = Values::new();
    for (role, namespace) in &self.namespaces {
      out.insert(role.clone(), Value::String(namespace.name.clone()));
    }
    out
  }
}

/// The deploy target universe for one environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Environment {
  pub name: String,

  #[serde(skip_serializing_if = "String::is_empty")]
  pub role: String,

  #[serde(skip_serializing_if = "std::ops::Not::not")]
  pub is_local: bool,

  pub clusters: Vec<ClusterConfig>,

  #[serde(skip_serializing_if = "ValueSetCollection::is_empty")]
  pub value_overrides: ValueSetCollection,

  #[serde(skip_serializing_if = "BTreeMap::is_empty")]
  pub app_overrides: BTreeMap<String, ValueSetCollection>,
}

impl Environment {
  /// All clusters satisfying `role`; it is an error if there are none.
  pub fn clusters_for_role(&self, role: &ClusterRole) -> Result<Vec<&ClusterConfig>, TopologyError> {
    let matched: Vec<&ClusterConfig> = self.clusters.iter().filter(|c| c.has_role(role)).collect();
    if matched.is_empty() {
      return Err(TopologyError::NoClusterForRole {
        environment: self.name.clone(),
        role: role.clone(),
      });
    }
    Ok(matched)
  }

  pub fn cluster_by_name(&self, name: &str) -> Result<&ClusterConfig, TopologyError> {
    self
      .clusters
      .iter()
      .find(|c| c.name == name)
      .ok_or_else(|| TopologyError::UnknownCluster {
        environment: self.name.clone(),
        name: name.to_string(),
      })
  }

  /// Role names per cluster, exposed to the cascade.
  pub fn cluster_role_values(&self) -> Values {
    let mut out = Values::new();
    for cluster in &self.clusters {
      let roles: Vec<Value> = cluster.roles.iter().map(|r| Value::String(r.0.clone())).collect();
      out.insert(cluster.name.clone(), Value::Sequence(roles));
    }
    out
  }
}

/// An explicit handle to the active cluster, returned by a context switch.
///
/// Holding a session is proof the switch succeeded; engine calls take it so
/// actions for one unit can never run against another unit's cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSession {
  pub cluster: String,
  pub kube_context: String,
}

#[cfg(test)]
mod tests {
  use super::*;

  fn environment() -> Environment {
    serde_yaml::from_str(
      r#"
name: qa
role: qa
clusters:
  - name: east
    provider: amazon
    roles: [default, primary]
    namespaces:
      default: { name: apps }
      jobs: { name: batch }
  - name: west
    provider: amazon
    roles: [backup]
    kubeContext: west-admin
    namespaces:
      default: { name: apps }
"#,
    )
    .unwrap()
  }

  #[test]
  fn clusters_for_role_filters_by_role() {
    let env = environment();

    let primary = env.clusters_for_role(&ClusterRole("primary".to_string())).unwrap();
    assert_eq!(primary.len(), 1);
    assert_eq!(primary[0].name, "east");

    let err = env.clusters_for_role(&ClusterRole("dr".to_string())).unwrap_err();
    assert!(matches!(err, TopologyError::NoClusterForRole { .. }));
  }

  #[test]
  fn namespace_lookup_by_role() {
    let env = environment();
    let east = env.cluster_by_name("east").unwrap();

    assert_eq!(east.namespace(&NamespaceRole("jobs".to_string())).unwrap().name, "batch");

    let err = east.namespace(&NamespaceRole("missing".to_string())).unwrap_err();
    assert!(matches!(err, TopologyError::NoNamespaceForRole { .. }));
  }

  #[test]
  fn kube_context_defaults_to_cluster_name() {
    let env = environment();
    assert_eq!(env.cluster_by_name("east").unwrap().kube_context(), "east");
    assert_eq!(env.cluster_by_name("west").unwrap().kube_context(), "west-admin");
  }

  #[test]
  fn namespace_values_map_role_to_name() {
    let env = environment();
    let east = env.cluster_by_name("east").unwrap();
    let values = east.namespace_values();
    assert_eq!(values.get("jobs"), Some(&Value::String("batch".to_string())));
  }
}
