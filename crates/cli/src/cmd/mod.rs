//! Command implementations.

pub mod deploy;
pub mod plan;
pub mod show;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

use stevedore_lib::cancel::{CancelToken, cancel_pair};
use stevedore_lib::contracts::FsValueFileLoader;
use stevedore_lib::deploy::Parameters;

/// Flags shared by every deploying command.
#[derive(Debug, clap::Args)]
pub struct CommonDeployFlags {
  /// Workspace file (default: workspace.yaml)
  #[arg(short, long)]
  pub file: Option<PathBuf>,

  /// Value overrides as path=value, applied at the highest precedence
  #[arg(long = "set")]
  pub set: Vec<String>,

  /// Show what would change without mutating anything
  #[arg(long)]
  pub dry_run: bool,

  /// Force upgrades even when nothing appears to have changed
  #[arg(long)]
  pub force: bool,

  /// Suppress deployment-tracker notifications
  #[arg(long)]
  pub no_report: bool,
}

impl CommonDeployFlags {
  pub fn parameters(&self) -> Result<Parameters> {
    let mut value_overrides = BTreeMap::new();
    for (path, value) in crate::parse_set_flags(&self.set)? {
      value_overrides.insert(path, value);
    }
    Ok(Parameters {
      force: self.force,
      dry_run: self.dry_run,
      no_report: self.no_report,
      value_overrides,
      ..Parameters::default()
    })
  }
}

/// Shared collaborators owned for the duration of one command.
pub struct Session {
  pub loader: FsValueFileLoader,
  pub cancel: CancelToken,
}

impl Session {
  /// Wire ctrl-c to the cancellation token.
  pub fn new() -> Session {
    let (handle, cancel) = cancel_pair();
    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        handle.cancel();
      }
    });
    Session {
      loader: FsValueFileLoader,
      cancel,
    }
  }
}

pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(120);
