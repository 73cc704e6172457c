//! App manifests.
//!
//! An [`AppManifest`] is the immutable description of one app at one version:
//! identity, content hashes, and the app's declared configuration (chart
//! reference, dependencies, action hooks, and value sets). Manifests are
//! produced upstream and consumed read-only by the deploy pipeline.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use semver::Version;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml::Value;
use thiserror::Error;

use crate::actions::AppAction;
use crate::labels::Labelled;
use crate::values::{ValueMappings, ValueSetCollection};

#[derive(Debug, Error)]
pub enum ManifestError {
  #[error("app {name:?} could not be found")]
  NotFound { name: String },

  #[error("reading manifest {path:?}: {source}")]
  Io {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("parsing manifest {path:?}: {source}")]
  Parse {
    path: String,
    #[source]
    source: serde_yaml::Error,
  },

  #[error("serializing manifest for {name:?}: {source}")]
  Serialize {
    name: String,
    #[source]
    source: serde_yaml::Error,
  },
}

/// Content hashes recorded when the manifest was produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Hashes {
  #[serde(skip_serializing_if = "String::is_empty")]
  pub commit: String,
  #[serde(skip_serializing_if = "String::is_empty")]
  pub chart: String,
  #[serde(skip_serializing_if = "String::is_empty")]
  pub app_config: String,
}

impl Hashes {
  /// Single string combining all hashes, used for change detection in
  /// persisted deployment plans.
  pub fn summarize(&self) -> String {
    format!("{}:{}:{}", self.commit, self.chart, self.app_config)
  }
}

/// A dependency on another app.
///
/// The wire form is either a bare name or a mapping with `name` and `repo`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
  pub name: String,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub repo: String,
}

impl<'de> Deserialize<'de> for Dependency {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let raw = Value::deserialize(deserializer)?;
    match raw {
      Value::String(name) => Ok(Dependency { name, repo: String::new() }),
      Value::Mapping(map) => {
        let name = match map.get("name") {
          Some(Value::String(name)) => name.clone(),
          _ => return Err(D::Error::custom("dependency requires a name")),
        };
        let repo = match map.get("repo") {
          Some(Value::String(repo)) => repo.clone(),
          _ => String::new(),
        };
        Ok(Dependency { name, repo })
      }
      other => Err(D::Error::custom(format!("cannot interpret {other:?} as a dependency"))),
    }
  }
}

/// The app's declared configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
  pub name: String,

  /// Chart directory, relative to the manifest file.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub chart_path: Option<String>,

  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub depends_on: Vec<Dependency>,

  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub actions: Vec<AppAction>,

  #[serde(skip_serializing_if = "ValueSetCollection::is_empty")]
  pub values: ValueSetCollection,

  #[serde(skip_serializing_if = "ValueMappings::is_empty")]
  pub value_mappings: ValueMappings,

  /// Whether deploys of this app are reported to the deployment tracker.
  #[serde(skip_serializing_if = "std::ops::Not::not")]
  pub report_deployment: bool,
}

/// Immutable description of one app at one version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppManifest {
  pub name: String,

  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub repo: String,

  pub version: Version,

  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub branch: String,

  #[serde(default)]
  pub hashes: Hashes,

  pub app_config: AppConfig,

  /// Where the manifest was loaded from; chart paths resolve relative to it.
  #[serde(skip)]
  pub from_path: PathBuf,
}

impl AppManifest {
  pub fn load(path: &Path) -> Result<AppManifest, ManifestError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
      path: path.display().to_string(),
      source,
    })?;
    let mut manifest: AppManifest = serde_yaml::from_str(&raw).map_err(|source| ManifestError::Parse {
      path: path.display().to_string(),
      source,
    })?;
    manifest.from_path = path.to_path_buf();
    Ok(manifest)
  }

  /// Write the manifest to `<dir>/<name>.yaml` and return that path.
  pub fn save(&self, dir: &Path) -> Result<PathBuf, ManifestError> {
    let rendered = serde_yaml::to_string(self).map_err(|source| ManifestError::Serialize {
      name: self.name.clone(),
      source,
    })?;
    let path = dir.join(format!("{}.yaml", self.name));
    std::fs::write(&path, rendered).map_err(|source| ManifestError::Io {
      path: path.display().to_string(),
      source,
    })?;
    Ok(path)
  }

  /// Directory containing the chart, if the app declares one.
  pub fn chart_dir(&self) -> Option<PathBuf> {
    let chart = self.app_config.chart_path.as_ref()?;
    let base = self.from_path.parent().unwrap_or_else(|| Path::new("."));
    Some(base.join(chart))
  }

  /// Directory the manifest was loaded from, used as the working directory
  /// for the app's scripts and relative file references.
  pub fn dir(&self) -> PathBuf {
    self
      .from_path
      .parent()
      .map(Path::to_path_buf)
      .unwrap_or_else(|| PathBuf::from("."))
  }

  /// Image tag for this manifest version.
  pub fn image_tag(&self) -> String {
    self.version.to_string()
  }
}

impl Labelled for AppManifest {
  fn labels(&self) -> BTreeMap<String, String> {
    BTreeMap::from([
      ("name".to_string(), self.name.clone()),
      ("version".to_string(), self.version.to_string()),
      ("branch".to_string(), self.branch.clone()),
      ("commit".to_string(), self.hashes.commit.clone()),
    ])
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const MANIFEST: &str = r#"
name: auth
repo: example/auth
version: 1.4.0
branch: main
hashes:
  commit: abc123
appConfig:
  name: auth
  chartPath: charts/auth
  dependsOn:
    - db
    - name: queue
      repo: example/queue
  values:
    default:
      static:
        replicas: 2
"#;

  #[test]
  fn manifest_parses_with_dependency_shorthand() {
    let manifest: AppManifest = serde_yaml::from_str(MANIFEST).unwrap();

    assert_eq!(manifest.name, "auth");
    assert_eq!(manifest.version, Version::new(1, 4, 0));
    assert_eq!(manifest.app_config.depends_on.len(), 2);
    assert_eq!(manifest.app_config.depends_on[0].name, "db");
    assert_eq!(manifest.app_config.depends_on[1].repo, "example/queue");
  }

  #[test]
  fn load_and_save_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("auth.yaml");
    std::fs::write(&path, MANIFEST).unwrap();

    let manifest = AppManifest::load(&path).unwrap();
    assert_eq!(manifest.from_path, path);
    assert_eq!(manifest.chart_dir(), Some(dir.path().join("charts/auth")));

    let out_dir = tempfile::tempdir().unwrap();
    let saved = manifest.save(out_dir.path()).unwrap();
    let reloaded = AppManifest::load(&saved).unwrap();
    assert_eq!(reloaded.name, manifest.name);
    assert_eq!(reloaded.hashes.summarize(), manifest.hashes.summarize());
  }

  #[test]
  fn labels_expose_identity() {
    let manifest: AppManifest = serde_yaml::from_str(MANIFEST).unwrap();
    let labels = manifest.labels();
    assert_eq!(labels.get("name"), Some(&"auth".to_string()));
    assert_eq!(labels.get("branch"), Some(&"main".to_string()));
    assert_eq!(labels.get("commit"), Some(&"abc123".to_string()));
  }
}
