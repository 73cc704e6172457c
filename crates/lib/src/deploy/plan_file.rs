//! Persisted deployment plans.
//!
//! A deployment plan decouples planning from execution: `create` resolves the
//! requested apps and their dependency order once, embedding a portable copy
//! of each manifest next to the plan file, and `execute` later reconstructs a
//! deploy from the document without re-querying upstream providers. Only app
//! selection and ordering are precomputed; cluster/namespace fan-out is
//! re-derived from the loaded manifests at execute time.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::contracts::{ContextSwitcher, ManifestProvider, ReleaseEngine, StateInspector};
use crate::graph::{GraphError, dependency_order};
use crate::manifest::{AppManifest, ManifestError};
use crate::values::{ValueSet, Values};

use super::{AppDeploySettings, Deploy, DeployContext, DeployError, DeploySettings, DeploymentUnit};

#[derive(Debug, Error)]
pub enum PlanFileError {
  #[error("reading plan {path:?}: {source}")]
  Io {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("parsing plan {path:?}: {source}")]
  Parse {
    path: String,
    #[source]
    source: serde_yaml::Error,
  },

  #[error("serializing plan: {0}")]
  Serialize(#[from] serde_yaml::Error),

  #[error(transparent)]
  Manifest(#[from] ManifestError),

  #[error("apps could not be sorted in dependency order: {0}")]
  Order(#[from] GraphError),

  #[error("an app specifies a dependency that could not be found: {name:?}")]
  MissingDependency { name: String },

  #[error("plan has no path to save to")]
  NoPath,

  #[error(transparent)]
  Deploy(#[from] DeployError),
}

/// Progress record for one app deployed from this plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppProgress {
  pub app_name: String,
  /// Manifest hash summary at deploy time, used to detect staleness.
  pub hash: String,
  pub timestamp: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub error: String,
}

/// One app entry in a persisted plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppPlanEntry {
  pub name: String,

  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub tag: String,

  #[serde(default, skip_serializing_if = "ValueSet::is_empty")]
  pub value_overrides: ValueSet,

  /// Manifest location relative to the plan file.
  pub manifest_path: String,

  #[serde(skip)]
  pub manifest: Option<Arc<AppManifest>>,
}

/// The persisted, portable form of a planned deploy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeploymentPlan {
  #[serde(skip_serializing_if = "String::is_empty")]
  pub provider: String,

  #[serde(skip_serializing_if = "std::ops::Not::not")]
  pub skip_dependency_validation: bool,

  #[serde(skip_serializing_if = "ValueSet::is_empty")]
  pub value_overrides: ValueSet,

  #[serde(rename = "deployedApps", skip_serializing_if = "Vec::is_empty")]
  pub progress: Vec<AppProgress>,

  pub apps: Vec<AppPlanEntry>,

  #[serde(skip)]
  pub from_path: PathBuf,
}

/// Inputs to [`DeploymentPlan::create`].
#[derive(Debug, Clone, Default)]
pub struct CreatePlanRequest {
  /// Where the plan file will live; manifests are embedded beside it.
  pub path: PathBuf,
  /// Requested root apps.
  pub apps: Vec<String>,
  pub ignore_dependencies: bool,
  /// Name of the manifest provider the plan was created from.
  pub provider: String,
}

impl DeploymentPlan {
  /// Resolve the requested apps plus transitive dependencies into an ordered
  /// plan document.
  pub fn create(provider: &dyn ManifestProvider, request: &CreatePlanRequest) -> Result<DeploymentPlan, PlanFileError> {
    let mut manifests: BTreeMap<String, Arc<AppManifest>> = BTreeMap::new();
    let mut dependencies: BTreeMap<String, Vec<String>> = BTreeMap::new();

    // Walk the dependency closure from the requested roots.
    let mut pending: Vec<String> = request.apps.clone();
    while let Some(name) = pending.pop() {
      if manifests.contains_key(&name) {
        continue;
      }
      let manifest = match provider.app_manifest(&name) {
        Ok(manifest) => manifest,
        Err(ManifestError::NotFound { .. }) if request.ignore_dependencies => {
          warn!(app = %name, "skipping unknown dependency");
          continue;
        }
        Err(ManifestError::NotFound { .. }) if !request.apps.contains(&name) => {
          return Err(PlanFileError::MissingDependency { name });
        }
        Err(err) => return Err(err.into()),
      };

      let deps: Vec<String> = manifest.app_config.depends_on.iter().map(|d| d.name.clone()).collect();
      pending.extend(deps.iter().cloned());
      if !deps.is_empty() {
        dependencies.insert(name.clone(), deps);
      }
      manifests.insert(name, manifest);
    }

    let topology = dependency_order(&dependencies, &request.apps)?;

    let mut plan = DeploymentPlan {
      provider: request.provider.clone(),
      skip_dependency_validation: request.ignore_dependencies,
      from_path: request.path.clone(),
      ..DeploymentPlan::default()
    };

    for name in topology {
      let Some(manifest) = manifests.get(&name) else {
        // Unknown dependencies were already skipped above.
        continue;
      };
      plan.apps.push(AppPlanEntry {
        name: name.clone(),
        tag: manifest.image_tag(),
        value_overrides: ValueSet::default(),
        manifest_path: format!("{name}.yaml"),
        manifest: Some(manifest.clone()),
      });
    }

    Ok(plan)
  }

  /// Write the plan file and the portable manifest beside it for every app.
  pub fn save(&mut self) -> Result<(), PlanFileError> {
    let dir = self.directory()?;
    std::fs::create_dir_all(&dir).map_err(|source| PlanFileError::Io {
      path: dir.display().to_string(),
      source,
    })?;

    for entry in &mut self.apps {
      if let Some(manifest) = &entry.manifest {
        let saved = manifest.save(&dir)?;
        entry.manifest_path = saved
          .file_name()
          .map(|f| f.to_string_lossy().to_string())
          .unwrap_or_else(|| format!("{}.yaml", entry.name));
      }
    }

    self.save_plan_file_only()
  }

  /// Write only the plan document, leaving embedded manifests untouched.
  ///
  /// Used to checkpoint progress after each app deploys.
  pub fn save_plan_file_only(&self) -> Result<(), PlanFileError> {
    if self.from_path.as_os_str().is_empty() {
      return Err(PlanFileError::NoPath);
    }
    let rendered = serde_yaml::to_string(self)?;
    std::fs::write(&self.from_path, rendered).map_err(|source| PlanFileError::Io {
      path: self.from_path.display().to_string(),
      source,
    })
  }

  /// Load a plan document and its embedded manifests.
  pub fn load(path: &Path) -> Result<DeploymentPlan, PlanFileError> {
    let raw = std::fs::read_to_string(path).map_err(|source| PlanFileError::Io {
      path: path.display().to_string(),
      source,
    })?;
    let mut plan: DeploymentPlan = serde_yaml::from_str(&raw).map_err(|source| PlanFileError::Parse {
      path: path.display().to_string(),
      source,
    })?;
    plan.from_path = path.to_path_buf();

    let dir = plan.directory()?;
    for entry in &mut plan.apps {
      let manifest_path = dir.join(&entry.manifest_path);
      entry.manifest = Some(Arc::new(AppManifest::load(&manifest_path)?));
    }

    Ok(plan)
  }

  fn directory(&self) -> Result<PathBuf, PlanFileError> {
    if self.from_path.as_os_str().is_empty() {
      return Err(PlanFileError::NoPath);
    }
    Ok(
      self
        .from_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(".")),
    )
  }

  /// Record (or refresh) the outcome of deploying one app.
  pub fn record_progress(&mut self, app: &str, hash: &str, error: Option<&str>) {
    let error = error.unwrap_or_default().to_string();
    let timestamp = Utc::now();

    if let Some(existing) = self.progress.iter_mut().find(|p| p.app_name == app) {
      existing.hash = hash.to_string();
      existing.timestamp = timestamp;
      existing.error = error;
      return;
    }

    self.progress.push(AppProgress {
      app_name: app.to_string(),
      hash: hash.to_string(),
      timestamp,
      error,
    });
  }

  /// Whether this app, at this manifest hash, already deployed successfully
  /// from this plan.
  pub fn find_progress(&self, app: &str, hash: &str) -> Option<&AppProgress> {
    self
      .progress
      .iter()
      .find(|p| p.app_name == app && p.hash == hash && p.error.is_empty())
  }
}

/// Inputs to [`execute_plan`].
#[derive(Debug, Clone, Default)]
pub struct ExecutePlanRequest {
  /// Only these apps deploy when non-empty; naming an app also forces it
  /// past the already-deployed check.
  pub include_apps: Vec<String>,
  /// Extra value layers above the plan's own overrides.
  pub value_sets: Vec<ValueSet>,
  pub recycle: bool,
}

/// Execute a loaded plan: reconstruct an equivalent deploy and run it.
///
/// App selection and ordering come from the plan; fan-out is re-derived from
/// the loaded manifests against the current environment topology.
pub async fn execute_plan<C, I, E>(
  mut plan: DeploymentPlan,
  ctx: &DeployContext<'_>,
  request: &ExecutePlanRequest,
  switcher: &C,
  inspector: &I,
  engine: &E,
) -> Result<DeploymentPlan, PlanFileError>
where
  C: ContextSwitcher,
  I: StateInspector,
  E: ReleaseEngine,
{
  let mut settings = DeploySettings {
    value_sets: std::iter::once(plan.value_overrides.clone())
      .chain(request.value_sets.iter().cloned())
      .collect(),
    ignore_dependencies: true,
    recycle: request.recycle,
    ..DeploySettings::default()
  };

  for entry in &plan.apps {
    let requested = request.include_apps.contains(&entry.name);
    let denied = !request.include_apps.is_empty() && !requested;
    if denied {
      info!(app = %entry.name, "skipping app: not included in the requested apps");
      continue;
    }

    let Some(manifest) = &entry.manifest else {
      return Err(PlanFileError::Manifest(ManifestError::NotFound {
        name: entry.name.clone(),
      }));
    };

    if !requested && plan.find_progress(&entry.name, &manifest.hashes.summarize()).is_some() {
      info!(
        app = %entry.name,
        "skipping app: already deployed from this plan (deploy it explicitly by name to force)"
      );
      continue;
    }

    let mut app_settings = AppDeploySettings::default();
    if !entry.tag.is_empty() {
      let mut tag_values = Values::new();
      tag_values.insert("tag", serde_yaml::Value::String(entry.tag.clone()));
      app_settings
        .value_sets
        .push(ValueSet::from_values(tag_values).with_source("app plan"));
    }
    if !entry.value_overrides.is_empty() {
      app_settings
        .value_sets
        .push(entry.value_overrides.clone().with_default_source("app plan overrides"));
    }

    settings.app_manifests.insert(entry.name.clone(), manifest.clone());
    settings.app_settings.insert(entry.name.clone(), app_settings);
    settings.app_order.push(entry.name.clone());
  }

  if settings.app_order.is_empty() {
    info!("all apps excluded or already deployed");
    return Ok(plan);
  }

  let mut deploy = Deploy::new(ctx.environment, ctx.platform, settings)?;

  // Checkpoint progress into the plan file after every unit.
  let can_checkpoint = !plan.from_path.as_os_str().is_empty();
  let plan_cell = Mutex::new(&mut plan);
  let after_deploy = |unit: &DeploymentUnit, err: Option<&DeployError>| {
    let mut plan = plan_cell.lock().unwrap();
    plan.record_progress(
      &unit.name,
      &unit.manifest.hashes.summarize(),
      err.map(|e| e.to_string()).as_deref(),
    );
    if can_checkpoint
      && let Err(save_err) = plan.save_plan_file_only()
    {
      warn!(app = %unit.name, error = %save_err, "progress save failed");
    }
  };

  let run_ctx = DeployContext {
    after_deploy: Some(&after_deploy),
    ..ctx_clone(ctx)
  };

  deploy.run(&run_ctx, switcher, inspector, engine).await?;

  drop(plan_cell);
  Ok(plan)
}

/// DeployContext is not Clone (it borrows collaborators); rebuild it field
/// by field so the plan executor can attach its own callback.
fn ctx_clone<'a>(ctx: &DeployContext<'a>) -> DeployContext<'a> {
  DeployContext {
    environment: ctx.environment,
    platform: ctx.platform,
    params: ctx.params.clone(),
    dir: ctx.dir.clone(),
    loader: ctx.loader,
    tracker: ctx.tracker,
    cancel: ctx.cancel.clone(),
    command_timeout: ctx.command_timeout,
    after_deploy: None,
  }
}
