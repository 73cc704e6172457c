//! Implementation of `stevedore deploy`.

use anyhow::{Context, Result};
use tracing::info;

use stevedore_lib::deploy::{Deploy, DeployContext, DeploySettings};
use stevedore_lib::engine::HelmEngine;
use stevedore_lib::labels::LabelSelector;

use crate::workspace::Workspace;

use super::{COMMAND_TIMEOUT, CommonDeployFlags, Session};

#[derive(Debug, clap::Args)]
pub struct DeployArgs {
  /// Apps to deploy; all workspace apps when omitted
  pub apps: Vec<String>,

  #[command(flatten)]
  pub common: CommonDeployFlags,

  /// Only deploy to these clusters
  #[arg(long = "cluster")]
  pub clusters: Vec<String>,

  /// Select apps by label, e.g. --selector branch=main
  #[arg(long = "selector")]
  pub selectors: Vec<String>,

  /// Skip dependencies that are not part of the workspace
  #[arg(long)]
  pub ignore_dependencies: bool,

  /// Delete pods after each deploy and wait for readiness
  #[arg(long)]
  pub recycle: bool,

  /// Print the plan and drift diff without deploying
  #[arg(long)]
  pub diff_only: bool,

  /// Print resolved values without deploying
  #[arg(long)]
  pub dump_values: bool,
}

pub fn run(args: DeployArgs) -> Result<()> {
  let workspace = Workspace::load(&crate::workspace_path(&args.common.file))?;

  let mut params = args.common.parameters()?;
  params.diff_only = args.diff_only;
  params.dump_values_only = args.dump_values;

  let selector = if args.selectors.is_empty() {
    None
  } else {
    Some(LabelSelector::parse(&args.selectors)?)
  };

  let settings = DeploySettings {
    app_manifests: workspace.select(&args.apps)?,
    clusters: args.clusters.iter().cloned().collect(),
    selector,
    ignore_dependencies: args.ignore_dependencies,
    recycle: args.recycle,
    ..DeploySettings::default()
  };

  let mut deploy =
    Deploy::new(&workspace.environment, &workspace.platform, settings).context("assembling deploy")?;

  info!(
    environment = %workspace.environment.name,
    apps = deploy.app_order.len(),
    units = deploy.units.len(),
    "deploy assembled"
  );
  for unit in &deploy.units {
    info!(app = %unit.name, cluster = %unit.cluster, namespace = %unit.namespace, "unit");
  }

  let engine = HelmEngine::default();
  let rt = tokio::runtime::Runtime::new().context("creating async runtime")?;

  rt.block_on(async {
    let session = Session::new();
    let ctx = DeployContext {
      environment: &workspace.environment,
      platform: &workspace.platform,
      params,
      dir: workspace.dir.clone(),
      loader: &session.loader,
      tracker: None,
      cancel: session.cancel.clone(),
      command_timeout: COMMAND_TIMEOUT,
      after_deploy: None,
    };

    deploy.run(&ctx, &engine, &engine, &engine).await
  })?;

  println!();
  println!("Deploy complete.");
  println!("  Environment: {}", workspace.environment.name);
  println!("  Apps deployed: {}", deploy.app_order.len());
  println!("  Units processed: {}", deploy.units.len());
  if !deploy.filtered.is_empty() {
    println!("  Filtered out: {}", deploy.filtered.len());
  }

  Ok(())
}
