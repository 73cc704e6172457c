//! App action hooks.
//!
//! Apps can declare actions to run around their deployment: database
//! migrations before an upgrade, smoke scripts after, and so on. Each action
//! carries a schedule (when it runs), a match-context filter (where it runs),
//! and a retry policy.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::match_map::{MatchArgs, MatchFilter};
use crate::values::{ExecContext, ValuesError};

#[derive(Debug, Error)]
pub enum ActionError {
  #[error("action {name:?} failed after {attempts} attempt(s): {source}")]
  Failed {
    name: String,
    attempts: u32,
    #[source]
    source: ValuesError,
  },

  #[error("action {name:?} cancelled")]
  Cancelled { name: String },
}

/// When an action runs relative to its app's deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionSchedule {
  BeforeDeploy,
  AfterDeploy,
  Manual,
}

/// What an action does. Bodies that need out-of-scope collaborators
/// (vault, databases) are not represented here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ActionBody {
  /// A shell script run in the app's directory.
  #[serde(rename = "script")]
  Script(String),
  /// An argv-style command.
  #[serde(rename = "exec")]
  Exec(Vec<String>),
}

/// One declared action hook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppAction {
  pub name: String,

  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub description: String,

  /// Schedules this action is attached to. Empty means manual-only.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub when: Vec<ActionSchedule>,

  /// Match-context filter; the action is skipped where it does not match.
  #[serde(default, rename = "where", skip_serializing_if = "MatchFilter::is_empty")]
  pub where_filter: MatchFilter,

  #[serde(default, skip_serializing_if = "is_zero_u32")]
  pub max_attempts: u32,

  #[serde(default, skip_serializing_if = "is_zero_u64")]
  pub timeout_secs: u64,

  #[serde(default, skip_serializing_if = "is_zero_u64")]
  pub interval_secs: u64,

  #[serde(flatten)]
  pub body: ActionBody,
}

fn is_zero_u32(v: &u32) -> bool {
  *v == 0
}

fn is_zero_u64(v: &u64) -> bool {
  *v == 0
}

/// Everything an action needs from the unit being deployed.
#[derive(Debug)]
pub struct ActionContext<'a> {
  /// The app's directory; scripts run here.
  pub dir: PathBuf,
  /// Resolved values exported as environment variables.
  pub env: BTreeMap<String, String>,
  pub match_args: &'a MatchArgs,
  pub cancel: &'a CancelToken,
}

impl AppAction {
  pub fn scheduled_for(&self, schedule: ActionSchedule) -> bool {
    self.when.contains(&schedule)
  }

  fn max_attempts(&self) -> u32 {
    self.max_attempts.max(1)
  }

  fn timeout(&self) -> Duration {
    Duration::from_secs(if self.timeout_secs == 0 { 5 } else { self.timeout_secs })
  }

  fn interval(&self) -> Duration {
    Duration::from_secs(if self.interval_secs == 0 { 5 } else { self.interval_secs })
  }

  /// Run the action with its retry policy.
  ///
  /// Returns `Ok` without running when the where-filter rejects the current
  /// match-context.
  pub async fn execute(&self, ctx: &ActionContext<'_>) -> Result<(), ActionError> {
    if !self.where_filter.matches(ctx.match_args) {
      debug!(action = %self.name, "skipping action: filter does not match target");
      return Ok(());
    }

    let mut remaining = self.max_attempts();
    let exec_ctx = ExecContext {
      dir: &ctx.dir,
      env: &ctx.env,
      cancel: ctx.cancel,
      timeout: self.timeout(),
    };

    loop {
      info!(action = %self.name, description = %self.description, "executing action");

      let result = match &self.body {
        ActionBody::Script(script) => crate::values::run_script(script, &exec_ctx).await,
        ActionBody::Exec(argv) => crate::values::run_argv(argv, &exec_ctx).await,
      };

      match result {
        Ok(output) => {
          if !output.is_empty() {
            debug!(action = %self.name, output = %output, "action output");
          }
          info!(action = %self.name, "action completed");
          return Ok(());
        }
        Err(ValuesError::Cancelled { .. }) => {
          return Err(ActionError::Cancelled { name: self.name.clone() });
        }
        Err(err) => {
          remaining -= 1;
          warn!(action = %self.name, error = %err, attempts_remaining = remaining, "action failed");
          if remaining == 0 {
            return Err(ActionError::Failed {
              name: self.name.clone(),
              attempts: self.max_attempts(),
              source: err,
            });
          }
        }
      }

      tokio::select! {
        _ = tokio::time::sleep(self.interval()) => {}
        _ = ctx.cancel.cancelled() => {
          return Err(ActionError::Cancelled { name: self.name.clone() });
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn action(yaml: &str) -> AppAction {
    serde_yaml::from_str(yaml).unwrap()
  }

  fn context<'a>(match_args: &'a MatchArgs, cancel: &'a CancelToken) -> ActionContext<'a> {
    ActionContext {
      dir: std::env::temp_dir(),
      env: BTreeMap::new(),
      match_args,
      cancel,
    }
  }

  #[test]
  fn parses_script_body_and_schedule() {
    let a = action("name: migrate\nwhen: [BeforeDeploy]\nscript: echo migrate");
    assert!(a.scheduled_for(ActionSchedule::BeforeDeploy));
    assert!(!a.scheduled_for(ActionSchedule::AfterDeploy));
    assert!(matches!(a.body, ActionBody::Script(_)));
  }

  #[test]
  fn parses_exec_body_with_filter() {
    let a = action("name: smoke\nwhen: [AfterDeploy]\nwhere:\n  clusterRole: [primary]\nexec: [\"true\"]");
    assert!(matches!(a.body, ActionBody::Exec(_)));
    assert!(!a.where_filter.is_empty());
  }

  #[test]
  fn unscheduled_action_runs_nowhere_automatically() {
    let a = action("name: manual-fix\nscript: echo fix");
    assert!(!a.scheduled_for(ActionSchedule::BeforeDeploy));
    assert!(!a.scheduled_for(ActionSchedule::AfterDeploy));
  }

  #[tokio::test]
  async fn filtered_out_action_is_a_noop() {
    let a = action("name: never\nwhere:\n  cluster: [other]\nexec: [\"false\"]");
    let mut args = MatchArgs::new();
    args.insert("cluster".to_string(), "blue".to_string());
    let cancel = CancelToken::none();

    // The body would fail if it ran; the filter must prevent that.
    a.execute(&context(&args, &cancel)).await.unwrap();
  }

  #[tokio::test]
  #[cfg(unix)]
  async fn successful_action_runs_once() {
    let a = action("name: ok\nexec: [\"true\"]");
    let args = MatchArgs::new();
    let cancel = CancelToken::none();
    a.execute(&context(&args, &cancel)).await.unwrap();
  }

  #[tokio::test]
  #[cfg(unix)]
  async fn failing_action_reports_attempts() {
    let a = action("name: broken\nmaxAttempts: 2\nintervalSecs: 1\nexec: [\"false\"]");
    let args = MatchArgs::new();
    let cancel = CancelToken::none();

    let err = a.execute(&context(&args, &cancel)).await.unwrap_err();
    match err {
      ActionError::Failed { attempts, .. } => assert_eq!(attempts, 2),
      other => panic!("unexpected error: {other}"),
    }
  }
}
