//! Desired and observed release state.
//!
//! An [`AppState`] describes one release of one app in one namespace: its
//! lifecycle status, how traffic is routed to it, the deployed version, and
//! an optional computed drift diff. The reconciliation planner compares a
//! desired `AppState` against an observed one to decide what must change.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Release lifecycle status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
  /// The release exists and is healthy.
  #[serde(rename = "DEPLOYED")]
  Deployed,
  /// No release exists.
  #[default]
  #[serde(rename = "NOTFOUND")]
  NotFound,
  /// The release was uninstalled but its history is retained.
  #[serde(rename = "DELETED")]
  Deleted,
  /// The release is in a failed state.
  #[serde(rename = "FAILED")]
  Failed,
  /// The release is stuck mid-operation.
  #[serde(rename = "PENDING-UPGRADE")]
  PendingUpgrade,
  /// Desired-only marker: leave the release exactly as it is.
  #[serde(rename = "UNCHANGED")]
  Unchanged,
  /// Observed-only marker: the cluster could not be reached.
  #[serde(rename = "UNAVAILABLE")]
  Unavailable,
}

impl Status {
  /// Parse a status reported by the release engine.
  ///
  /// Accepts both helm 2 style (`DEPLOYED`) and helm 3 style (`deployed`)
  /// spellings; the pending states all collapse to [`Status::PendingUpgrade`].
  pub fn from_release_status(raw: &str) -> Option<Status> {
    match raw.to_uppercase().replace('_', "-").as_str() {
      "DEPLOYED" => Some(Status::Deployed),
      "NOTFOUND" | "NOT-FOUND" => Some(Status::NotFound),
      "DELETED" | "UNINSTALLED" => Some(Status::Deleted),
      "FAILED" => Some(Status::Failed),
      "PENDING-UPGRADE" | "PENDING-INSTALL" | "PENDING-ROLLBACK" => Some(Status::PendingUpgrade),
      _ => None,
    }
  }
}

impl fmt::Display for Status {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Status::Deployed => "DEPLOYED",
      Status::NotFound => "NOTFOUND",
      Status::Deleted => "DELETED",
      Status::Failed => "FAILED",
      Status::PendingUpgrade => "PENDING-UPGRADE",
      Status::Unchanged => "UNCHANGED",
      Status::Unavailable => "UNAVAILABLE",
    };
    f.write_str(s)
  }
}

/// How traffic reaches the release.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Routing {
  /// Traffic is served by pods in the cluster.
  #[serde(rename = "cluster")]
  Cluster,
  /// Traffic is redirected to a developer machine.
  #[serde(rename = "localhost")]
  Localhost,
  /// Routing does not apply (e.g. no release exists).
  #[default]
  #[serde(rename = "n/a")]
  NotApplicable,
}

impl fmt::Display for Routing {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Routing::Cluster => "cluster",
      Routing::Localhost => "localhost",
      Routing::NotApplicable => "n/a",
    };
    f.write_str(s)
  }
}

/// One release state, desired or observed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppState {
  pub status: Status,
  pub routing: Routing,
  #[serde(skip_serializing_if = "String::is_empty")]
  pub version: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub diff: Option<String>,
  #[serde(skip_serializing_if = "std::ops::Not::not")]
  pub force: bool,
}

impl AppState {
  /// Observed state when the cluster did not respond in time.
  pub fn unavailable() -> AppState {
    AppState {
      status: Status::Unavailable,
      ..AppState::default()
    }
  }

  /// True when a non-empty drift diff was computed.
  pub fn has_diff(&self) -> bool {
    self.diff.as_ref().is_some_and(|d| !d.is_empty())
  }
}

impl fmt::Display for AppState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} (routing: {}", self.status, self.routing)?;
    if !self.version.is_empty() {
      write!(f, ", version: {}", self.version)?;
    }
    if self.force {
      write!(f, ", force")?;
    }
    f.write_str(")")
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn release_status_parsing() {
    assert_eq!(Status::from_release_status("deployed"), Some(Status::Deployed));
    assert_eq!(Status::from_release_status("DEPLOYED"), Some(Status::Deployed));
    assert_eq!(Status::from_release_status("uninstalled"), Some(Status::Deleted));
    assert_eq!(Status::from_release_status("pending-upgrade"), Some(Status::PendingUpgrade));
    assert_eq!(Status::from_release_status("pending_install"), Some(Status::PendingUpgrade));
    assert_eq!(Status::from_release_status("superseded"), None);
  }

  #[test]
  fn display_includes_version_and_force() {
    let state = AppState {
      status: Status::Deployed,
      routing: Routing::Cluster,
      version: "1.2.3".to_string(),
      diff: None,
      force: true,
    };
    assert_eq!(state.to_string(), "DEPLOYED (routing: cluster, version: 1.2.3, force)");
  }

  #[test]
  fn unavailable_state_has_no_diff() {
    let state = AppState::unavailable();
    assert_eq!(state.status, Status::Unavailable);
    assert!(!state.has_diff());
  }

  #[test]
  fn empty_diff_is_not_drift() {
    let state = AppState {
      diff: Some(String::new()),
      ..AppState::default()
    };
    assert!(!state.has_diff());
  }
}
