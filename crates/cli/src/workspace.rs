//! Workspace file loading.
//!
//! A workspace file is a single YAML document declaring the environment
//! topology, the platform app configuration, and the app manifests that are
//! candidates for deployment. Manifest paths are relative to the workspace
//! file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;

use stevedore_lib::contracts::ManifestProvider;
use stevedore_lib::manifest::{AppManifest, ManifestError};
use stevedore_lib::platform::Platform;
use stevedore_lib::topology::Environment;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkspaceFile {
  environment: Environment,
  #[serde(default)]
  platform: Platform,
  /// Manifest paths, relative to this file.
  #[serde(default)]
  apps: Vec<String>,
}

/// A loaded workspace: topology, platform, and candidate app manifests.
#[derive(Debug)]
pub struct Workspace {
  pub environment: Environment,
  pub platform: Platform,
  pub manifests: BTreeMap<String, Arc<AppManifest>>,
  /// Directory containing the workspace file.
  pub dir: PathBuf,
}

impl Workspace {
  pub fn load(path: &Path) -> Result<Workspace> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading workspace file {}", path.display()))?;
    let file: WorkspaceFile =
      serde_yaml::from_str(&raw).with_context(|| format!("parsing workspace file {}", path.display()))?;

    let dir = path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));

    let mut manifests = BTreeMap::new();
    for app_path in &file.apps {
      let manifest_path = dir.join(app_path);
      let manifest =
        AppManifest::load(&manifest_path).with_context(|| format!("loading app manifest {app_path}"))?;
      manifests.insert(manifest.name.clone(), Arc::new(manifest));
    }

    Ok(Workspace {
      environment: file.environment,
      platform: file.platform,
      manifests,
      dir,
    })
  }

  /// The manifests for the requested apps, or every candidate when no apps
  /// are named.
  pub fn select(&self, apps: &[String]) -> Result<BTreeMap<String, Arc<AppManifest>>> {
    if apps.is_empty() {
      return Ok(self.manifests.clone());
    }

    let mut out = BTreeMap::new();
    for name in apps {
      let manifest = self
        .manifests
        .get(name)
        .cloned()
        .with_context(|| format!("app {name:?} is not declared in the workspace"))?;
      out.insert(name.clone(), manifest);
    }
    Ok(out)
  }
}

impl ManifestProvider for Workspace {
  fn app_manifest(&self, name: &str) -> Result<Arc<AppManifest>, ManifestError> {
    self
      .manifests
      .get(name)
      .cloned()
      .ok_or_else(|| ManifestError::NotFound { name: name.to_string() })
  }
}
