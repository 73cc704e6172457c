//! Implementation of `stevedore show values`.
//!
//! Prints the fully resolved value cascade for one app, with per-key source
//! attributions, without touching any cluster.

use anyhow::{Context, Result};

use stevedore_lib::deploy::{Deploy, DeployContext, DeploySettings};
use stevedore_lib::values::resolve_values;

use crate::workspace::Workspace;

use super::{COMMAND_TIMEOUT, CommonDeployFlags, Session};

#[derive(Debug, clap::Subcommand)]
pub enum ShowCommands {
  /// Print the resolved values for an app, per deployment unit
  Values {
    /// The app to resolve
    app: String,

    #[command(flatten)]
    common: CommonDeployFlags,

    /// Also print which source won each key
    #[arg(long)]
    attributions: bool,

    /// Emit JSON instead of YAML
    #[arg(long)]
    json: bool,
  },
}

pub fn run(command: ShowCommands) -> Result<()> {
  match command {
    ShowCommands::Values {
      app,
      common,
      attributions,
      json,
    } => values(app, common, attributions, json),
  }
}

fn values(app: String, common: CommonDeployFlags, attributions: bool, json: bool) -> Result<()> {
  let workspace = Workspace::load(&crate::workspace_path(&common.file))?;
  let params = common.parameters()?;

  let settings = DeploySettings {
    app_manifests: workspace.select(&[app.clone()])?,
    ignore_dependencies: true,
    ..DeploySettings::default()
  };

  let deploy = Deploy::new(&workspace.environment, &workspace.platform, settings).context("assembling deploy")?;

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

    for unit in &deploy.units {
      let resolved = resolve_values(unit, &ctx)
        .await
        .with_context(|| format!("resolve values for app {:?}", unit.name))?;

      if json {
        println!("{}", serde_json::to_string_pretty(&resolved.values)?);
        if attributions {
          println!("{}", serde_json::to_string_pretty(&resolved.attributions)?);
        }
        continue;
      }

      println!("# App: {} -> {}/{}", unit.name, unit.cluster, unit.namespace);
      println!("{}", resolved.values.to_yaml()?);
      if attributions {
        println!("# Sources:");
        println!("{}", resolved.attributions.to_yaml()?);
      }
      println!("---");
    }

    Ok(())
  })
}
