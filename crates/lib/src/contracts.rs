//! Collaborator interfaces consumed by the deploy pipeline.
//!
//! The engine stays narrow: it decides *what* to do and these traits perform
//! it. Production implementations live in [`crate::engine`]; tests provide
//! fakes.

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

use crate::manifest::{AppManifest, ManifestError};
use crate::state::AppState;
use crate::topology::{ClusterConfig, ClusterSession, TopologyError};
use crate::values::{Values, ValuesError};

/// Supplies immutable app definitions by name.
pub trait ManifestProvider {
  fn app_manifest(&self, name: &str) -> Result<Arc<AppManifest>, ManifestError>;
}

/// Resolves value-file references to their deep-mergeable contents.
pub trait ValueFileLoader {
  fn load(&self, path: &Path) -> Result<Values, ValuesError>;
}

/// Reads YAML values files from disk.
#[derive(Debug, Default)]
pub struct FsValueFileLoader;

impl ValueFileLoader for FsValueFileLoader {
  fn load(&self, path: &Path) -> Result<Values, ValuesError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ValuesError::FileRead {
      path: path.display().to_string(),
      source,
    })?;
    Values::from_yaml(&raw).map_err(|source| ValuesError::FileParse {
      path: path.display().to_string(),
      source,
    })
  }
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct TrackerError(pub String);

/// Reports deployment progress to an external system (issue tracker,
/// deployment dashboard). Failures here are logged, never fatal.
pub trait DeploymentTracker {
  /// Record that a deployment is starting; returns an opaque id.
  fn create(&self, app: &str, branch: &str, environment: &str) -> Result<String, TrackerError>;

  /// Record the outcome for a previously created deployment.
  fn update(&self, id: &str, success: bool, message: &str) -> Result<(), TrackerError>;
}

/// Makes a cluster the active target and returns the session handle for it.
pub trait ContextSwitcher {
  fn switch_to(
    &self,
    cluster: &ClusterConfig,
  ) -> impl Future<Output = Result<ClusterSession, TopologyError>>;
}

#[derive(Debug, Error)]
pub enum EngineError {
  #[error("command failed with exit code {code:?}: {cmd}\n{stderr}")]
  CmdFailed {
    cmd: String,
    code: Option<i32>,
    stderr: String,
  },

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("release status {status:?} is not understood")]
  UnknownStatus { status: String },

  #[error("parsing release list: {0}")]
  ParseReleaseList(#[source] serde_yaml::Error),
}

/// Everything the engine needs to address one release.
#[derive(Debug, Clone)]
pub struct ReleaseRequest<'a> {
  /// Release name (the app name).
  pub release: &'a str,
  /// Chart directory or chart reference.
  pub chart: &'a str,
  /// Chart version to install or upgrade to.
  pub version: &'a str,
  pub namespace: &'a str,
  /// Path to the materialized values file.
  pub values_file: &'a Path,
  pub force: bool,
  pub dry_run: bool,
}

/// Queries the observed state of a release.
pub trait StateInspector {
  /// Observed state, with a drift diff when `diff` is set and the release is
  /// deployed. Returns [`AppState::unavailable`] when the cluster does not
  /// respond promptly.
  fn actual_state(
    &self,
    session: &ClusterSession,
    request: &ReleaseRequest<'_>,
    diff: bool,
  ) -> impl Future<Output = Result<AppState, EngineError>>;
}

/// Performs release mutations against the cluster.
pub trait ReleaseEngine {
  fn install(
    &self,
    session: &ClusterSession,
    request: &ReleaseRequest<'_>,
  ) -> impl Future<Output = Result<(), EngineError>>;

  fn upgrade(
    &self,
    session: &ClusterSession,
    request: &ReleaseRequest<'_>,
  ) -> impl Future<Output = Result<(), EngineError>>;

  fn rollback(
    &self,
    session: &ClusterSession,
    request: &ReleaseRequest<'_>,
  ) -> impl Future<Output = Result<(), EngineError>>;

  /// Remove the release. `keep_history` retains release history so a later
  /// rollback can resurrect it.
  fn delete(
    &self,
    session: &ClusterSession,
    request: &ReleaseRequest<'_>,
    keep_history: bool,
  ) -> impl Future<Output = Result<(), EngineError>>;

  /// Delete the release's pods so they are recreated.
  fn delete_pods(
    &self,
    session: &ClusterSession,
    namespace: &str,
    selector: &str,
  ) -> impl Future<Output = Result<(), EngineError>>;

  /// Whether every pod matching `selector` reports ready.
  fn pods_ready(
    &self,
    session: &ClusterSession,
    namespace: &str,
    selector: &str,
  ) -> impl Future<Output = Result<bool, EngineError>>;
}
