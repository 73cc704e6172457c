//! Release engine backed by the helm and kubectl binaries.
//!
//! This is the only module that invokes the external binaries. Every call
//! takes a [`ClusterSession`] and passes its context explicitly, so no
//! command depends on whatever context happens to be ambient.

use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::contracts::{ContextSwitcher, EngineError, ReleaseEngine, ReleaseRequest, StateInspector};
use crate::state::{AppState, Routing, Status};
use crate::topology::{ClusterConfig, ClusterSession, TopologyError};

/// Shell-exec engine over `helm` and `kubectl`.
#[derive(Debug, Clone)]
pub struct HelmEngine {
  helm_bin: String,
  kubectl_bin: String,
  /// How long to wait for a cluster to answer before reporting it
  /// unavailable.
  availability_timeout: Duration,
}

impl Default for HelmEngine {
  fn default() -> Self {
    Self {
      helm_bin: "helm".to_string(),
      kubectl_bin: "kubectl".to_string(),
      availability_timeout: Duration::from_secs(5),
    }
  }
}

/// One row of `helm list` output.
#[derive(Debug, Deserialize)]
struct HelmRelease {
  #[allow(dead_code)]
  name: String,
  #[serde(default)]
  status: String,
  #[serde(default)]
  chart: String,
  #[serde(default)]
  app_version: String,
}

impl HelmEngine {
  pub fn new(helm_bin: impl Into<String>, kubectl_bin: impl Into<String>) -> HelmEngine {
    HelmEngine {
      helm_bin: helm_bin.into(),
      kubectl_bin: kubectl_bin.into(),
      availability_timeout: Duration::from_secs(5),
    }
  }

  async fn run(&self, bin: &str, args: &[&str]) -> Result<String, EngineError> {
    let rendered = format!("{bin} {}", args.join(" "));
    debug!(cmd = %rendered, "running");

    let output = Command::new(bin)
      .args(args)
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true)
      .output()
      .await?;

    if !output.status.success() {
      return Err(EngineError::CmdFailed {
        cmd: rendered,
        code: output.status.code(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
      });
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
  }

  fn helm_flags(&self, session: &ClusterSession, request: &ReleaseRequest<'_>) -> Vec<String> {
    let mut flags = vec![
      "--kube-context".to_string(),
      session.kube_context.clone(),
      "--namespace".to_string(),
      request.namespace.to_string(),
    ];
    if request.dry_run {
      flags.push("--dry-run".to_string());
    }
    flags
  }

  /// Probe the cluster with a bounded request; `false` means assume
  /// unavailable rather than blocking the deploy.
  async fn cluster_available(&self, session: &ClusterSession) -> bool {
    let args = ["--context", &session.kube_context, "get", "namespaces", "--output", "name"];
    let probe = self.run(
      &self.kubectl_bin,
      &args,
    );
    match tokio::time::timeout(self.availability_timeout, probe).await {
      Ok(Ok(_)) => true,
      Ok(Err(err)) => {
        warn!(cluster = %session.cluster, error = %err, "cluster probe failed");
        false
      }
      Err(_) => {
        warn!(cluster = %session.cluster, "cluster probe timed out");
        false
      }
    }
  }

  async fn find_release(
    &self,
    session: &ClusterSession,
    request: &ReleaseRequest<'_>,
  ) -> Result<Option<HelmRelease>, EngineError> {
    let filter = format!("^{}$", request.release);
    let raw = self
      .run(
        &self.helm_bin,
        &[
          "list",
          "--all",
          "--kube-context",
          &session.kube_context,
          "--namespace",
          request.namespace,
          "--output",
          "yaml",
          "--filter",
          &filter,
        ],
      )
      .await?;

    if raw.is_empty() {
      return Ok(None);
    }

    let mut releases: Vec<HelmRelease> = serde_yaml::from_str(&raw).map_err(EngineError::ParseReleaseList)?;
    Ok(if releases.is_empty() { None } else { Some(releases.remove(0)) })
  }

  async fn diff(&self, session: &ClusterSession, request: &ReleaseRequest<'_>) -> Result<String, EngineError> {
    let values_file = request.values_file.to_string_lossy();
    let raw = self
      .run(
        &self.helm_bin,
        &[
          "diff",
          "upgrade",
          request.release,
          request.chart,
          "--kube-context",
          &session.kube_context,
          "--namespace",
          request.namespace,
          "-f",
          values_file.as_ref(),
        ],
      )
      .await?;

    if raw.is_empty() {
      debug!(release = %request.release, "diff detected no changes");
    }
    Ok(raw)
  }
}

impl ContextSwitcher for HelmEngine {
  async fn switch_to(&self, cluster: &ClusterConfig) -> Result<ClusterSession, TopologyError> {
    let context = cluster.kube_context().to_string();
    self
      .run(&self.kubectl_bin, &["config", "use-context", &context])
      .await
      .map_err(|err| TopologyError::SwitchFailed {
        cluster: cluster.name.clone(),
        message: err.to_string(),
      })?;

    info!(cluster = %cluster.name, context = %context, "switched cluster context");
    Ok(ClusterSession {
      cluster: cluster.name.clone(),
      kube_context: context,
    })
  }
}

impl StateInspector for HelmEngine {
  async fn actual_state(
    &self,
    session: &ClusterSession,
    request: &ReleaseRequest<'_>,
    diff: bool,
  ) -> Result<AppState, EngineError> {
    if !self.cluster_available(session).await {
      return Ok(AppState::unavailable());
    }

    let Some(release) = self.find_release(session, request).await? else {
      return Ok(AppState {
        status: Status::NotFound,
        routing: Routing::NotApplicable,
        ..AppState::default()
      });
    };

    let status = Status::from_release_status(&release.status).ok_or(EngineError::UnknownStatus {
      status: release.status.clone(),
    })?;

    let version = release_version(&release.chart, &release.app_version);

    let mut state = AppState {
      status,
      routing: Routing::Cluster,
      version,
      ..AppState::default()
    };

    if diff && state.status == Status::Deployed {
      state.diff = Some(self.diff(session, request).await?);
    }

    Ok(state)
  }
}

impl ReleaseEngine for HelmEngine {
  async fn install(&self, session: &ClusterSession, request: &ReleaseRequest<'_>) -> Result<(), EngineError> {
    let values_file = request.values_file.to_string_lossy();
    let mut args = vec!["install", request.release, request.chart, "-f", values_file.as_ref()];
    let flags = self.helm_flags(session, request);
    args.extend(flags.iter().map(String::as_str));

    let out = self.run(&self.helm_bin, &args).await?;
    debug!(release = %request.release, output = %out, "installed");
    Ok(())
  }

  async fn upgrade(&self, session: &ClusterSession, request: &ReleaseRequest<'_>) -> Result<(), EngineError> {
    let values_file = request.values_file.to_string_lossy();
    let mut args = vec![
      "upgrade",
      request.release,
      request.chart,
      "--history-max",
      "5",
      "-f",
      values_file.as_ref(),
    ];
    if request.force {
      args.push("--force");
    }
    let flags = self.helm_flags(session, request);
    args.extend(flags.iter().map(String::as_str));

    let out = self.run(&self.helm_bin, &args).await?;
    debug!(release = %request.release, output = %out, "upgraded");
    Ok(())
  }

  async fn rollback(&self, session: &ClusterSession, request: &ReleaseRequest<'_>) -> Result<(), EngineError> {
    let mut args = vec!["rollback", request.release];
    let flags = self.helm_flags(session, request);
    args.extend(flags.iter().map(String::as_str));

    let out = self.run(&self.helm_bin, &args).await?;
    debug!(release = %request.release, output = %out, "rolled back");
    Ok(())
  }

  async fn delete(
    &self,
    session: &ClusterSession,
    request: &ReleaseRequest<'_>,
    keep_history: bool,
  ) -> Result<(), EngineError> {
    let mut args = vec!["uninstall", request.release];
    if keep_history {
      args.push("--keep-history");
    }
    args.extend(["--kube-context", &session.kube_context, "--namespace", request.namespace]);

    let out = self.run(&self.helm_bin, &args).await?;
    debug!(release = %request.release, output = %out, "deleted");
    Ok(())
  }

  async fn delete_pods(
    &self,
    session: &ClusterSession,
    namespace: &str,
    selector: &str,
  ) -> Result<(), EngineError> {
    let selector_flag = format!("--selector={selector}");
    self
      .run(
        &self.kubectl_bin,
        &[
          "--context",
          &session.kube_context,
          "delete",
          "--namespace",
          namespace,
          "pods",
          &selector_flag,
        ],
      )
      .await?;
    Ok(())
  }

  async fn pods_ready(
    &self,
    session: &ClusterSession,
    namespace: &str,
    selector: &str,
  ) -> Result<bool, EngineError> {
    let selector_flag = format!("--selector={selector}");
    let out = self
      .run(
        &self.kubectl_bin,
        &[
          "--context",
          &session.kube_context,
          "get",
          "pods",
          "--namespace",
          namespace,
          &selector_flag,
          "-o",
          r#"jsonpath={range .items[*]}{@.metadata.name}:{@.status.conditions[?(@.type=='Ready')].status};{end}"#,
        ],
      )
      .await?;

    let mut ready = true;
    for pod in out.split(';').filter(|p| !p.is_empty()) {
      let Some((name, state)) = pod.split_once(':') else {
        continue;
      };
      let pod_ready = state == "True";
      debug!(pod = %name, ready = pod_ready, "pod readiness");
      ready = ready && pod_ready;
    }
    Ok(ready)
  }
}

/// Chart version from a `helm list` row: `"auth-1.4.0"` -> `"1.4.0"`,
/// falling back to the reported app version.
fn release_version(chart: &str, app_version: &str) -> String {
  chart
    .rsplit_once('-')
    .map(|(_, v)| v.to_string())
    .filter(|v| v.chars().next().is_some_and(|c| c.is_ascii_digit()))
    .unwrap_or_else(|| app_version.to_string())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn release_version_comes_from_the_chart_suffix() {
    assert_eq!(release_version("auth-1.4.0", "ignored"), "1.4.0");
    assert_eq!(release_version("some-long-name-0.2.1", "ignored"), "0.2.1");
  }

  #[test]
  fn release_version_falls_back_to_app_version() {
    assert_eq!(release_version("nodash", "2.0.0"), "2.0.0");
    assert_eq!(release_version("name-suffix", "3.1.0"), "3.1.0");
  }

  #[test]
  fn default_engine_uses_path_binaries() {
    let engine = HelmEngine::default();
    assert_eq!(engine.helm_bin, "helm");
    assert_eq!(engine.kubectl_bin, "kubectl");
  }
}
