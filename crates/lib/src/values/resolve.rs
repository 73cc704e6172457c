//! The value resolution cascade.
//!
//! Produces the final, flat value set for one deployment unit by merging the
//! ordered sources, lowest to highest precedence:
//!
//! 1. match-context values
//! 2. app metadata (version, branch, commit)
//! 3. the chart's default values file
//! 4. the app's declared value sets, filtered to the current target
//! 5. value layers supplied to this deploy invocation
//! 6. platform-level overrides
//! 7. environment values, then the environment's per-app overrides
//! 8. cluster values, then the cluster's per-app overrides
//! 9. command-line `path=value` overrides
//! 10. dynamic resolution (each entry executed at most once per unit)
//! 11. the app's value-mapping rename pass
//!
//! Every source tags its contribution so diagnostics can report which layer
//! won each key. The result is deterministic given its inputs.

use std::io::Write;
use std::path::Path;

use serde_yaml::Value;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::deploy::{DeployContext, DeploymentUnit};

use super::exec::ExecContext;
use super::set::{ExtractArgs, ValueSet};
use super::{Values, ValuesError};

/// The fully merged values for one unit, plus per-key source attributions.
#[derive(Debug, Clone)]
pub struct PersistableValues {
  pub values: Values,
  pub attributions: Values,
}

/// A values file materialized for the chart-installation collaborator.
///
/// The file is owned by one deployment unit for its lifetime and removed
/// when this handle drops, on every exit path.
#[derive(Debug)]
pub struct PersistedValues {
  file: NamedTempFile,
}

impl PersistedValues {
  pub fn path(&self) -> &Path {
    self.file.path()
  }
}

impl PersistableValues {
  /// Write the values to a temporary YAML file.
  pub fn persist(&self) -> Result<PersistedValues, ValuesError> {
    let mut file = tempfile::Builder::new()
      .prefix("stevedore-values-")
      .suffix(".yaml")
      .tempfile()?;
    file.write_all(self.values.to_yaml()?.as_bytes())?;
    file.flush()?;
    Ok(PersistedValues { file })
  }
}

/// Run the full cascade for one unit.
pub async fn resolve_values(
  unit: &DeploymentUnit,
  ctx: &DeployContext<'_>,
) -> Result<PersistableValues, ValuesError> {
  let app_dir = unit.manifest.dir();
  let extract_args = ExtractArgs {
    exact_match: Some(&unit.match_args),
    ..ExtractArgs::default()
  };

  // 1. Match-context values.
  let mut context_values = Values::new();
  for (key, value) in &unit.match_args {
    context_values.insert(key.clone(), Value::String(value.clone()));
  }
  let mut acc = ValueSet::from_values(context_values).with_source("deploy context");

  // 2. App metadata under the fixed prefix.
  let mut metadata = Values::new();
  metadata.set_at_path("stevedore.app.version", Value::String(unit.manifest.version.to_string()))?;
  metadata.set_at_path("stevedore.app.branch", Value::String(unit.manifest.branch.clone()))?;
  metadata.set_at_path("stevedore.app.commit", Value::String(unit.manifest.hashes.commit.clone()))?;
  acc = acc.with_values(&ValueSet::from_values(metadata).with_source("app metadata"));

  // 3. The chart's own default values, if present.
  if let Some(chart_dir) = unit.manifest.chart_dir() {
    let chart_values = chart_dir.join("values.yaml");
    if chart_values.exists() {
      let loaded = ctx.loader.load(&chart_values)?;
      acc = acc.with_values(&ValueSet::from_values(loaded).with_source("chart values file"));
    }
  }

  // 4. The app's declared value sets, filtered to this target.
  let app_values = unit
    .manifest
    .app_config
    .values
    .extract(&extract_args)
    .with_default_source("app config")
    .with_files_loaded(ctx.loader, &app_dir)?;
  acc = acc.with_values(&app_values);

  // 5. Layers supplied to this deploy invocation (including fan-out
  // decorations, lowest first).
  for layer in &unit.value_layers {
    let layer = layer
      .clone()
      .with_default_source("deploy settings")
      .with_files_loaded(ctx.loader, &ctx.dir)?;
    acc = acc.with_values(&layer);
  }

  // 6. Platform-level overrides.
  let platform_values = ctx
    .platform
    .value_overrides
    .extract(&extract_args)
    .with_source("platform overrides")
    .with_files_loaded(ctx.loader, &ctx.dir)?;
  acc = acc.with_values(&platform_values);

  // 7. Environment values, then the environment's per-app overrides.
  let environment = ctx.environment;
  let environment_values = environment
    .value_overrides
    .extract(&extract_args)
    .with_default_source(&format!("{} environment", environment.name))
    .with_files_loaded(ctx.loader, &ctx.dir)?;
  acc = acc.with_values(&environment_values);

  if let Some(app_overrides) = environment.app_overrides.get(&unit.name) {
    let extracted = app_overrides
      .extract(&extract_args)
      .with_default_source(&format!("{} environment app overrides", environment.name))
      .with_files_loaded(ctx.loader, &ctx.dir)?;
    acc = acc.with_values(&extracted);
  }

  // 8. Cluster values, then the cluster's per-app overrides.
  if let Ok(cluster) = environment.cluster_by_name(&unit.cluster) {
    let cluster_values = cluster
      .value_overrides
      .extract(&extract_args)
      .with_default_source(&format!("{} cluster", cluster.name))
      .with_files_loaded(ctx.loader, &ctx.dir)?;
    acc = acc.with_values(&cluster_values);

    if let Some(app_overrides) = cluster.app_overrides.get(&unit.name) {
      let extracted = app_overrides
        .extract(&extract_args)
        .with_default_source(&format!("{} cluster app overrides", cluster.name))
        .with_files_loaded(ctx.loader, &ctx.dir)?;
      acc = acc.with_values(&extracted);
    }
  }

  // 9. Command-line overrides: highest static precedence.
  for (path, raw) in &ctx.params.value_overrides {
    let value: Value = serde_yaml::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()));
    acc = acc.with_value_at_path(path, value, "command line")?;
  }

  // 10. Dynamic resolution. Each entry runs at most once per unit; the
  // already-merged statics are exported to the commands as environment
  // variables.
  let dynamic = std::mem::take(&mut acc.dynamic);
  if !dynamic.is_empty() {
    let env_vars = acc.static_values.to_env("STEVEDORE_");
    let exec_ctx = ExecContext {
      dir: &app_dir,
      env: &env_vars,
      cancel: &ctx.cancel,
      timeout: ctx.command_timeout,
    };

    for (key, entry) in &dynamic {
      debug!(key = %key, "resolving dynamic value");
      let resolved = entry
        .resolve(&exec_ctx)
        .await
        .map_err(|err| ValuesError::DynamicResolve {
          key: key.clone(),
          message: err.to_string(),
        })?;
      acc.static_values.set_at_path(key, Value::String(resolved.into_string()))?;
      let _ = acc
        .attributions
        .set_at_path(key, Value::String("dynamic value".to_string()));
    }
  }

  // 11. Final value-mapping pass.
  unit.manifest.app_config.value_mappings.apply(&mut acc.static_values)?;

  Ok(PersistableValues {
    values: acc.static_values,
    attributions: acc.attributions,
  })
}
