//! Deploy assembly: selection, ordering, and role fan-out.
//!
//! [`Deploy::new`] turns a set of candidate app manifests into an ordered
//! list of [`DeploymentUnit`]s:
//!
//! 1. The selector drops apps that are not part of this deploy (recorded as
//!    filtered, so their absence as dependencies is expected).
//! 2. The dependency resolver orders the remainder.
//! 3. Each app fans out to one unit per distinct (cluster, namespace) pair
//!    resolved from its declared cluster/namespace roles.

mod execute;
mod plan_file;
mod reconcile;
mod unit;

pub use execute::{DeployContext, Parameters};
pub use plan_file::{
  AppPlanEntry, AppProgress, CreatePlanRequest, DeploymentPlan, ExecutePlanRequest, PlanFileError, execute_plan,
};
pub use reconcile::{Plan, PlanStep, StepAction, plan_reconciliation};
pub use unit::DeploymentUnit;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_yaml::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::actions::ActionError;
use crate::contracts::EngineError;
use crate::graph::{GraphError, dependency_order};
use crate::labels::LabelSelector;
use crate::manifest::AppManifest;
use crate::match_map::{MatchArgs, keys};
use crate::platform::Platform;
use crate::state::{AppState, Routing, Status};
use crate::topology::{ClusterRole, Environment, NamespaceRole, TopologyError};
use crate::values::{ValueSet, Values, ValuesError};

/// The error of a single plan step.
#[derive(Debug, Error)]
pub enum StepError {
  #[error(transparent)]
  Engine(#[from] EngineError),
  #[error(transparent)]
  Action(#[from] ActionError),
}

#[derive(Debug, Error)]
pub enum DeployError {
  #[error(transparent)]
  Order(#[from] GraphError),

  #[error("an app specifies a dependency that could not be found: {name:?}")]
  MissingDependency { name: String },

  #[error("all apps were filtered out of this deploy")]
  AllAppsFiltered,

  #[error("find cluster to deploy {app:?} with role {role:?}: {source}")]
  ClusterForRole {
    app: String,
    role: String,
    #[source]
    source: TopologyError,
  },

  #[error("mapping namespace for {app:?}: {source}")]
  Namespace {
    app: String,
    #[source]
    source: TopologyError,
  },

  #[error("switch to cluster {cluster:?} to deploy {app:?}: {source}")]
  Switch {
    cluster: String,
    app: String,
    #[source]
    source: TopologyError,
  },

  #[error("resolve values for app {app:?}: {source}")]
  Values {
    app: String,
    #[source]
    source: ValuesError,
  },

  #[error("check actual state for {app:?}: {source}")]
  ActualState {
    app: String,
    #[source]
    source: EngineError,
  },

  #[error("step {step:?} failed for app {app:?}: {source}")]
  StepFailed {
    app: String,
    step: String,
    #[source]
    source: StepError,
  },

  #[error("recycle pods for {app:?}: {source}")]
  Recycle {
    app: String,
    #[source]
    source: EngineError,
  },

  #[error("deploy cancelled")]
  Cancelled,
}

/// Per-app additions to a deploy.
#[derive(Debug, Clone, Default)]
pub struct AppDeploySettings {
  /// Extra value layers for this app, above the deploy-wide layers.
  pub value_sets: Vec<ValueSet>,
}

/// Everything a deploy is parameterized by.
#[derive(Debug, Clone, Default)]
pub struct DeploySettings {
  /// Value layers applied to every app in this deploy.
  pub value_sets: Vec<ValueSet>,

  /// Candidate apps by name.
  pub app_manifests: BTreeMap<String, Arc<AppManifest>>,

  pub app_settings: BTreeMap<String, AppDeploySettings>,

  /// Precomputed order; when empty the dependency resolver derives it.
  pub app_order: Vec<String>,

  /// Cluster allow-list; empty allows every cluster.
  pub clusters: BTreeSet<String>,

  /// Optional selection predicate over the candidate apps.
  pub selector: Option<LabelSelector>,

  /// Per-app desired status overrides; unlisted apps deploy normally.
  pub desired: BTreeMap<String, Status>,

  /// Skip missing dependencies instead of failing.
  pub ignore_dependencies: bool,

  /// Recycle pods after each unit deploys.
  pub recycle: bool,
}

/// One end-to-end orchestration run.
#[derive(Debug)]
pub struct Deploy {
  pub settings: DeploySettings,
  /// Topological order over the non-filtered apps.
  pub app_order: Vec<String>,
  /// Apps excluded by the selector, so missing dependencies on them are
  /// expected rather than fatal.
  pub filtered: BTreeSet<String>,
  /// Deployment units in execution order.
  pub units: Vec<DeploymentUnit>,
}

impl Deploy {
  /// Assemble a deploy: select, order, and fan out.
  pub fn new(environment: &Environment, platform: &Platform, settings: DeploySettings) -> Result<Deploy, DeployError> {
    let mut candidates = settings.app_manifests.clone();
    let mut filtered = BTreeSet::new();

    if let Some(selector) = &settings.selector
      && !selector.is_empty()
    {
      for (name, manifest) in &settings.app_manifests {
        if !selector.matches(manifest.as_ref()) {
          warn!(app = %name, "app was filtered out of this deploy");
          filtered.insert(name.clone());
        }
      }
      candidates.retain(|name, _| !filtered.contains(name));
      if candidates.is_empty() {
        return Err(DeployError::AllAppsFiltered);
      }
    }

    let app_order = if settings.app_order.is_empty() {
      ordered_apps(&candidates, &filtered, &settings)?
    } else {
      settings.app_order.clone()
    };

    let mut deploy = Deploy {
      app_order,
      filtered,
      units: Vec::new(),
      settings,
    };

    for app_name in deploy.app_order.clone() {
      let Some(manifest) = candidates.get(&app_name).cloned() else {
        return Err(DeployError::MissingDependency { name: app_name });
      };
      deploy.fan_out(environment, platform, &app_name, manifest)?;
    }

    Ok(deploy)
  }

  /// Expand one app into units, one per distinct (cluster, namespace) pair.
  fn fan_out(
    &mut self,
    environment: &Environment,
    platform: &Platform,
    app_name: &str,
    manifest: Arc<AppManifest>,
  ) -> Result<(), DeployError> {
    let platform_app = platform.app_config(app_name);
    let cluster_roles = platform_app
      .map(|p| p.cluster_roles())
      .unwrap_or_else(|| vec![ClusterRole::default_role()]);
    let namespace_roles = platform_app
      .map(|p| p.namespace_roles())
      .unwrap_or_else(|| vec![NamespaceRole::default_role()]);

    let desired_status = self
      .settings
      .desired
      .get(app_name)
      .copied()
      .unwrap_or(Status::Deployed);

    // A cluster is fanned out to at most once even when it carries several
    // matching roles; same for namespaces within a cluster.
    let mut cluster_for_role: BTreeMap<String, ClusterRole> = BTreeMap::new();

    for cluster_role in &cluster_roles {
      let clusters = environment
        .clusters_for_role(cluster_role)
        .map_err(|source| DeployError::ClusterForRole {
          app: app_name.to_string(),
          role: cluster_role.to_string(),
          source,
        })?;

      for cluster in clusters {
        if !self.settings.clusters.is_empty() && !self.settings.clusters.contains(&cluster.name) {
          info!(app = %app_name, cluster = %cluster.name, "skipping deploy to cluster: excluded by allow-list");
          continue;
        }

        if let Some(existing_role) = cluster_for_role.get(&cluster.name) {
          info!(
            app = %app_name,
            cluster = %cluster.name,
            role = %existing_role,
            "already prepared deploy to cluster for role, skipping additional deploys"
          );
          continue;
        }
        cluster_for_role.insert(cluster.name.clone(), cluster_role.clone());

        let mut namespace_for_role: BTreeMap<String, NamespaceRole> = BTreeMap::new();

        for namespace_role in &namespace_roles {
          let namespace = cluster.namespace(namespace_role).map_err(|source| DeployError::Namespace {
            app: app_name.to_string(),
            source,
          })?;

          if let Some(existing_role) = namespace_for_role.get(&namespace.name) {
            info!(
              app = %app_name,
              namespace = %namespace.name,
              role = %existing_role,
              "already prepared deploy to namespace for role, skipping additional deploys"
            );
            continue;
          }
          namespace_for_role.insert(namespace.name.clone(), namespace_role.clone());

          debug!(app = %app_name, cluster = %cluster.name, namespace = %namespace.name, "configuring app deploy");

          let match_args = build_match_args(
            environment,
            app_name,
            &cluster.name,
            cluster_role,
            &cluster.provider,
            &namespace.name,
            namespace_role,
          );

          let mut layers = Vec::new();

          // Lowest priority so user-provided layers can override the tag
          // and context table.
          layers.push(template_value_set(
            environment,
            &manifest,
            &match_args,
            &namespace_roles,
            cluster.roles.clone(),
          ));

          layers.extend(self.settings.value_sets.iter().cloned());
          if let Some(app_settings) = self.settings.app_settings.get(app_name) {
            layers.extend(app_settings.value_sets.iter().cloned());
          }

          // Namespace mappings for the cluster, resolvable from chart values.
          let mut namespace_values = Values::new();
          namespace_values
            .set_at_path("stevedore.namespaces", Value::Mapping(to_mapping(cluster.namespace_values())))
            .ok();
          layers.push(ValueSet::from_values(namespace_values).with_source("cluster namespaces"));

          if let Some(platform_app) = platform_app {
            let overrides = platform_app.value_overrides.extract(&crate::values::ExtractArgs {
              exact_match: Some(&match_args),
              ..Default::default()
            });
            layers.push(overrides.with_default_source("platform app overrides"));
          }

          self.units.push(DeploymentUnit {
            name: app_name.to_string(),
            manifest: manifest.clone(),
            cluster: cluster.name.clone(),
            namespace: namespace.name.clone(),
            match_args,
            desired_state: AppState {
              status: desired_status,
              routing: Routing::Cluster,
              version: manifest.version.to_string(),
              diff: None,
              force: false,
            },
            actual_state: None,
            value_layers: layers,
          });
        }
      }
    }

    Ok(())
  }
}

/// Dependency-order the candidates, applying the missing-dependency policy.
fn ordered_apps(
  candidates: &BTreeMap<String, Arc<AppManifest>>,
  filtered: &BTreeSet<String>,
  settings: &DeploySettings,
) -> Result<Vec<String>, DeployError> {
  let mut requested = Vec::new();
  let mut dependencies = BTreeMap::new();
  for (name, manifest) in candidates {
    requested.push(name.clone());
    let deps: Vec<String> = manifest.app_config.depends_on.iter().map(|d| d.name.clone()).collect();
    if !deps.is_empty() {
      dependencies.insert(name.clone(), deps);
    }
  }

  let topology = dependency_order(&dependencies, &requested)?;

  let mut out = Vec::new();
  for name in topology {
    if !candidates.contains_key(&name) {
      if settings.ignore_dependencies {
        continue;
      }
      if filtered.contains(&name) {
        continue;
      }
      return Err(DeployError::MissingDependency { name });
    }
    if settings.desired.get(&name) == Some(&Status::Unchanged) {
      info!(app = %name, "skipping deploy: desired state is UNCHANGED");
      continue;
    }
    out.push(name);
  }
  Ok(out)
}

fn build_match_args(
  environment: &Environment,
  app_name: &str,
  cluster: &str,
  cluster_role: &ClusterRole,
  cluster_provider: &str,
  namespace: &str,
  namespace_role: &NamespaceRole,
) -> MatchArgs {
  let mut args = MatchArgs::new();
  args.insert(keys::APP_NAME.to_string(), app_name.to_string());
  args.insert(keys::ENVIRONMENT.to_string(), environment.name.clone());
  args.insert(keys::ENVIRONMENT_ROLE.to_string(), environment.role.clone());
  args.insert(keys::CLUSTER.to_string(), cluster.to_string());
  args.insert(keys::CLUSTER_ROLE.to_string(), cluster_role.to_string());
  args.insert(keys::CLUSTER_PROVIDER.to_string(), cluster_provider.to_string());
  args.insert(keys::NAMESPACE.to_string(), namespace.to_string());
  args.insert(keys::NAMESPACE_ROLE.to_string(), namespace_role.to_string());
  args
}

/// The baseline context table and image tag every unit starts from.
fn template_value_set(
  environment: &Environment,
  manifest: &AppManifest,
  match_args: &MatchArgs,
  namespace_roles: &[NamespaceRole],
  cluster_roles: Vec<ClusterRole>,
) -> ValueSet {
  let mut values = Values::new();
  values.insert("tag", Value::String(manifest.image_tag()));

  let mut table = Values::new();
  table.insert("appName", Value::String(manifest.name.clone()));
  table.insert("appVersion", Value::String(manifest.version.to_string()));
  table.insert("environment", Value::String(environment.name.clone()));
  table.insert("environmentRole", Value::String(environment.role.clone()));
  for key in [keys::CLUSTER, keys::CLUSTER_ROLE, keys::CLUSTER_PROVIDER, keys::NAMESPACE, keys::NAMESPACE_ROLE] {
    if let Some(value) = match_args.get(key) {
      table.insert(key, Value::String(value.clone()));
    }
  }
  table.insert(
    "namespaceRoles",
    Value::Sequence(namespace_roles.iter().map(|r| Value::String(r.0.clone())).collect()),
  );
  table.insert(
    "clusterRoles",
    Value::Sequence(cluster_roles.into_iter().map(|r| Value::String(r.0)).collect()),
  );
  table.insert(
    "clustersRoles",
    Value::Mapping(to_mapping(environment.cluster_role_values())),
  );
  values.insert("stevedore", Value::Mapping(to_mapping(table)));

  ValueSet::from_values(values).with_source("deploy template")
}

fn to_mapping(values: Values) -> serde_yaml::Mapping {
  let mut out = serde_yaml::Mapping::new();
  for (key, value) in values.0 {
    out.insert(Value::String(key), value);
  }
  out
}

#[cfg(test)]
mod tests {
  use super::*;

  fn manifest(name: &str, deps: &[&str]) -> Arc<AppManifest> {
    let deps_yaml = if deps.is_empty() {
      String::new()
    } else {
      format!("\n  dependsOn: [{}]", deps.join(", "))
    };
    let yaml = format!(
      "name: {name}\nversion: 1.0.0\nbranch: main\nappConfig:\n  name: {name}{deps_yaml}"
    );
    Arc::new(serde_yaml::from_str(&yaml).unwrap())
  }

  fn environment(yaml: &str) -> Environment {
    serde_yaml::from_str(yaml).unwrap()
  }

  fn simple_environment() -> Environment {
    environment(
      r#"
name: qa
role: qa
clusters:
  - name: east
    provider: amazon
    roles: [default]
    namespaces:
      default: { name: apps }
"#,
    )
  }

  fn settings(apps: &[Arc<AppManifest>]) -> DeploySettings {
    DeploySettings {
      app_manifests: apps.iter().map(|m| (m.name.clone(), m.clone())).collect(),
      ..DeploySettings::default()
    }
  }

  #[test]
  fn app_order_follows_dependencies() {
    let env = simple_environment();
    let platform = Platform::default();
    let apps = [manifest("web", &["api"]), manifest("api", &["db"]), manifest("db", &[])];

    let deploy = Deploy::new(&env, &platform, settings(&apps)).unwrap();

    assert_eq!(deploy.app_order, vec!["db", "api", "web"]);
    assert_eq!(deploy.units.len(), 3);
  }

  #[test]
  fn missing_dependency_is_fatal() {
    let env = simple_environment();
    let platform = Platform::default();
    let apps = [manifest("web", &["api"])];

    let err = Deploy::new(&env, &platform, settings(&apps)).unwrap_err();
    assert!(matches!(err, DeployError::MissingDependency { name } if name == "api"));
  }

  #[test]
  fn missing_dependency_is_skipped_when_ignored() {
    let env = simple_environment();
    let platform = Platform::default();
    let apps = [manifest("web", &["api"])];
    let mut s = settings(&apps);
    s.ignore_dependencies = true;

    let deploy = Deploy::new(&env, &platform, s).unwrap();
    assert_eq!(deploy.app_order, vec!["web"]);
  }

  #[test]
  fn filtered_dependency_is_not_fatal() {
    let env = simple_environment();
    let platform = Platform::default();
    let apps = [manifest("web", &[]), manifest("api", &["web"])];
    let mut s = settings(&apps);
    // Selects only "api": "web" becomes a filtered dependency.
    s.selector = Some(LabelSelector::parse(&["name=api".to_string()]).unwrap());

    let deploy = Deploy::new(&env, &platform, s).unwrap();
    assert_eq!(deploy.app_order, vec!["api"]);
    assert!(deploy.filtered.contains("web"));
  }

  #[test]
  fn unchanged_apps_are_skipped() {
    let env = simple_environment();
    let platform = Platform::default();
    let apps = [manifest("web", &[])];
    let mut s = settings(&apps);
    s.desired.insert("web".to_string(), Status::Unchanged);

    let deploy = Deploy::new(&env, &platform, s).unwrap();
    assert!(deploy.app_order.is_empty());
    assert!(deploy.units.is_empty());
  }

  #[test]
  fn overlapping_cluster_roles_produce_one_unit() {
    let env = environment(
      r#"
name: qa
role: qa
clusters:
  - name: east
    roles: [default, primary]
    namespaces:
      default: { name: apps }
"#,
    );
    let platform: Platform = serde_yaml::from_str(
      r#"
apps:
  web:
    name: web
    clusterRoles: [default, primary]
"#,
    )
    .unwrap();

    let deploy = Deploy::new(&env, &platform, settings(&[manifest("web", &[])])).unwrap();
    assert_eq!(deploy.units.len(), 1);
    assert_eq!(deploy.units[0].cluster, "east");
  }

  #[test]
  fn overlapping_namespace_roles_produce_one_unit() {
    let env = environment(
      r#"
name: qa
role: qa
clusters:
  - name: east
    roles: [default]
    namespaces:
      default: { name: apps }
      jobs: { name: apps }
"#,
    );
    let platform: Platform = serde_yaml::from_str(
      r#"
apps:
  web:
    name: web
    namespaceRoles: [default, jobs]
"#,
    )
    .unwrap();

    let deploy = Deploy::new(&env, &platform, settings(&[manifest("web", &[])])).unwrap();
    assert_eq!(deploy.units.len(), 1);
    assert_eq!(deploy.units[0].namespace, "apps");
  }

  #[test]
  fn multi_cluster_role_fans_out_per_cluster() {
    let env = environment(
      r#"
name: prod
role: prod
clusters:
  - name: east
    roles: [default]
    namespaces:
      default: { name: apps }
  - name: west
    roles: [default]
    namespaces:
      default: { name: apps }
"#,
    );
    let platform = Platform::default();

    let deploy = Deploy::new(&env, &platform, settings(&[manifest("web", &[])])).unwrap();
    assert_eq!(deploy.units.len(), 2);
    let clusters: Vec<&str> = deploy.units.iter().map(|u| u.cluster.as_str()).collect();
    assert_eq!(clusters, vec!["east", "west"]);
  }

  #[test]
  fn cluster_allow_list_excludes_clusters() {
    let env = environment(
      r#"
name: prod
role: prod
clusters:
  - name: east
    roles: [default]
    namespaces:
      default: { name: apps }
  - name: west
    roles: [default]
    namespaces:
      default: { name: apps }
"#,
    );
    let platform = Platform::default();
    let mut s = settings(&[manifest("web", &[])]);
    s.clusters.insert("west".to_string());

    let deploy = Deploy::new(&env, &platform, s).unwrap();
    assert_eq!(deploy.units.len(), 1);
    assert_eq!(deploy.units[0].cluster, "west");
  }

  #[test]
  fn unresolvable_cluster_role_is_fatal_for_the_app() {
    let env = simple_environment();
    let platform: Platform = serde_yaml::from_str(
      r#"
apps:
  web:
    name: web
    clusterRoles: [gpu]
"#,
    )
    .unwrap();

    let err = Deploy::new(&env, &platform, settings(&[manifest("web", &[])])).unwrap_err();
    assert!(matches!(err, DeployError::ClusterForRole { app, .. } if app == "web"));
  }

  #[test]
  fn units_carry_match_context_and_template_values() {
    let env = simple_environment();
    let platform = Platform::default();

    let deploy = Deploy::new(&env, &platform, settings(&[manifest("web", &[])])).unwrap();
    let unit = &deploy.units[0];

    assert_eq!(unit.match_args.get(keys::ENVIRONMENT), Some(&"qa".to_string()));
    assert_eq!(unit.match_args.get(keys::CLUSTER), Some(&"east".to_string()));
    assert_eq!(unit.match_args.get(keys::NAMESPACE), Some(&"apps".to_string()));
    assert_eq!(unit.match_args.get(keys::NAMESPACE_ROLE), Some(&"default".to_string()));

    let template = &unit.value_layers[0];
    assert_eq!(
      template.static_values.get("tag"),
      Some(&Value::String("1.0.0".to_string()))
    );
    assert_eq!(
      template.static_values.get_at_path("stevedore.cluster"),
      Some(&Value::String("east".to_string()))
    );
  }

  #[test]
  fn desired_state_defaults_to_deployed() {
    let env = simple_environment();
    let platform = Platform::default();

    let deploy = Deploy::new(&env, &platform, settings(&[manifest("web", &[])])).unwrap();
    let unit = &deploy.units[0];
    assert_eq!(unit.desired_state.status, Status::Deployed);
    assert_eq!(unit.desired_state.routing, Routing::Cluster);
    assert_eq!(unit.desired_state.version, "1.0.0");
  }
}
