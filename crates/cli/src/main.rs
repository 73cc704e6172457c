//! stevedore: release/deployment orchestrator for a multi-service platform.

mod cmd;
mod workspace;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// Deployment orchestrator: dependency-ordered, role-aware, value-cascading.
#[derive(Parser)]
#[command(name = "stevedore")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Deploy apps from a workspace file
  Deploy(cmd::deploy::DeployArgs),

  /// Create and execute persisted deployment plans
  Plan {
    #[command(subcommand)]
    command: cmd::plan::PlanCommands,
  },

  /// Show resolved configuration for an app
  Show {
    #[command(subcommand)]
    command: cmd::show::ShowCommands,
  },
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  let default_filter = if cli.verbose { "debug" } else { "info" };
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
    .without_time()
    .init();

  match cli.command {
    Commands::Deploy(args) => cmd::deploy::run(args),
    Commands::Plan { command } => cmd::plan::run(command),
    Commands::Show { command } => cmd::show::run(command),
  }
}

/// Expand `KEY=VALUE` style override flags into a path/value list.
pub(crate) fn parse_set_flags(flags: &[String]) -> Result<Vec<(String, String)>> {
  let mut out = Vec::new();
  for flag in flags {
    let Some((path, value)) = flag.split_once('=') else {
      anyhow::bail!("invalid --set {flag:?}, expected path=value");
    };
    out.push((path.to_string(), value.to_string()));
  }
  Ok(out)
}

pub(crate) fn workspace_path(file: &Option<PathBuf>) -> PathBuf {
  file.clone().unwrap_or_else(|| PathBuf::from("workspace.yaml"))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn set_flags_parse_path_value_pairs() {
    let parsed = parse_set_flags(&["image.tag=1.2.3".to_string(), "replicas=4".to_string()]).unwrap();
    assert_eq!(parsed[0], ("image.tag".to_string(), "1.2.3".to_string()));
    assert_eq!(parsed[1], ("replicas".to_string(), "4".to_string()));
  }

  #[test]
  fn malformed_set_flag_is_rejected() {
    assert!(parse_set_flags(&["notapair".to_string()]).is_err());
  }
}
