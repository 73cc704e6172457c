//! A single concrete deployment target.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::labels::Labelled;
use crate::manifest::AppManifest;
use crate::match_map::MatchArgs;
use crate::state::AppState;
use crate::values::ValueSet;

/// One (app, cluster, namespace) deployment target.
///
/// Created by the fan-out pass with its cluster/namespace assignment fixed
/// for the rest of the run. The value layers accumulate as fan-out decorates
/// the unit; the cascade merges them when the unit executes.
#[derive(Debug, Clone)]
pub struct DeploymentUnit {
  pub name: String,
  pub manifest: Arc<AppManifest>,
  pub cluster: String,
  pub namespace: String,
  /// Attributes describing this target, used for scoped value lookups and
  /// action-hook eligibility.
  pub match_args: MatchArgs,
  pub desired_state: AppState,
  /// Populated lazily by querying the live cluster.
  pub actual_state: Option<AppState>,
  /// Value layers contributed so far, lowest precedence first.
  pub value_layers: Vec<ValueSet>,
}

impl DeploymentUnit {
  /// Pod selector for this unit's release.
  pub fn pod_selector(&self) -> String {
    format!("release={}", self.name)
  }
}

impl Labelled for DeploymentUnit {
  fn labels(&self) -> BTreeMap<String, String> {
    self.manifest.labels()
  }
}
