//! Platform-level app configuration.
//!
//! The platform declares which apps exist, the cluster/namespace roles each
//! fans out to, and platform-wide value overrides that sit above app-declared
//! values in the cascade.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::topology::{ClusterRole, NamespaceRole};
use crate::values::ValueSetCollection;

/// Platform entry for one app.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlatformAppConfig {
  pub name: String,

  /// Cluster roles this app deploys to; empty means the default role.
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub cluster_roles: Vec<ClusterRole>,

  /// Namespace roles this app deploys to; empty means the default role.
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub namespace_roles: Vec<NamespaceRole>,

  #[serde(skip_serializing_if = "ValueSetCollection::is_empty")]
  pub value_overrides: ValueSetCollection,
}

impl PlatformAppConfig {
  pub fn cluster_roles(&self) -> Vec<ClusterRole> {
    if self.cluster_roles.is_empty() {
      vec![ClusterRole::default_role()]
    } else {
      self.cluster_roles.clone()
    }
  }

  pub fn namespace_roles(&self) -> Vec<NamespaceRole> {
    if self.namespace_roles.is_empty() {
      vec![NamespaceRole::default_role()]
    } else {
      self.namespace_roles.clone()
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Platform {
  #[serde(skip_serializing_if = "String::is_empty")]
  pub name: String,

  #[serde(skip_serializing_if = "ValueSetCollection::is_empty")]
  pub value_overrides: ValueSetCollection,

  #[serde(skip_serializing_if = "BTreeMap::is_empty")]
  pub apps: BTreeMap<String, PlatformAppConfig>,
}

impl Platform {
  pub fn app_config(&self, name: &str) -> Option<&PlatformAppConfig> {
    self.apps.get(name)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn roles_default_when_unspecified() {
    let config = PlatformAppConfig::default();
    assert_eq!(config.cluster_roles(), vec![ClusterRole::default_role()]);
    assert_eq!(config.namespace_roles(), vec![NamespaceRole::default_role()]);
  }

  #[test]
  fn declared_roles_are_kept() {
    let config: PlatformAppConfig = serde_yaml::from_str(
      "name: auth\nclusterRoles: [primary, backup]\nnamespaceRoles: [jobs]",
    )
    .unwrap();

    assert_eq!(config.cluster_roles().len(), 2);
    assert_eq!(config.namespace_roles(), vec![NamespaceRole("jobs".to_string())]);
  }
}
