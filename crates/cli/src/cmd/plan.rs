//! Implementation of `stevedore plan create` and `stevedore plan execute`.
//!
//! Planning resolves app selection and dependency order once, producing a
//! portable directory that can be executed later (or elsewhere) without the
//! original workspace.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::info;

use stevedore_lib::deploy::{CreatePlanRequest, DeployContext, DeploymentPlan, ExecutePlanRequest, execute_plan};
use stevedore_lib::engine::HelmEngine;

use crate::workspace::Workspace;

use super::{COMMAND_TIMEOUT, CommonDeployFlags, Session};

#[derive(Debug, clap::Subcommand)]
pub enum PlanCommands {
  /// Create a portable deployment plan from a workspace
  Create {
    #[command(flatten)]
    common: CommonDeployFlags,

    /// Apps to include; all workspace apps when omitted
    apps: Vec<String>,

    /// Where to write the plan (default: deployments/plan.yaml)
    #[arg(short, long)]
    out: Option<PathBuf>,

    /// Skip dependencies that are not part of the workspace
    #[arg(long)]
    ignore_dependencies: bool,
  },

  /// Execute a previously created deployment plan
  Execute {
    /// Path to the plan file
    plan: PathBuf,

    #[command(flatten)]
    common: CommonDeployFlags,

    /// Only deploy these apps (also forces apps already deployed)
    #[arg(long = "include")]
    include: Vec<String>,

    /// Delete pods after each deploy and wait for readiness
    #[arg(long)]
    recycle: bool,
  },
}

pub fn run(command: PlanCommands) -> Result<()> {
  match command {
    PlanCommands::Create {
      common,
      apps,
      out,
      ignore_dependencies,
    } => create(common, apps, out, ignore_dependencies),
    PlanCommands::Execute {
      plan,
      common,
      include,
      recycle,
    } => execute(plan, common, include, recycle),
  }
}

fn create(common: CommonDeployFlags, apps: Vec<String>, out: Option<PathBuf>, ignore_dependencies: bool) -> Result<()> {
  let workspace = Workspace::load(&crate::workspace_path(&common.file))?;

  let apps = if apps.is_empty() {
    workspace.manifests.keys().cloned().collect()
  } else {
    apps
  };

  let path = out.unwrap_or_else(|| PathBuf::from("deployments/plan.yaml"));

  let request = CreatePlanRequest {
    path: path.clone(),
    apps,
    ignore_dependencies,
    provider: "workspace".to_string(),
  };

  let mut plan = DeploymentPlan::create(&workspace, &request).context("creating deployment plan")?;
  plan.save().context("saving deployment plan")?;

  println!("Plan written to {}", path.display());
  println!("  Apps (in dependency order):");
  for entry in &plan.apps {
    println!("    {} @ {}", entry.name, entry.tag);
  }

  Ok(())
}

fn execute(plan_path: PathBuf, common: CommonDeployFlags, include: Vec<String>, recycle: bool) -> Result<()> {
  let workspace = Workspace::load(&crate::workspace_path(&common.file))?;
  let params = common.parameters()?;

  let plan = DeploymentPlan::load(&plan_path).with_context(|| format!("loading plan {}", plan_path.display()))?;
  info!(
    plan = %plan_path.display(),
    apps = plan.apps.len(),
    environment = %workspace.environment.name,
    "executing deployment plan"
  );

  let request = ExecutePlanRequest {
    include_apps: include,
    value_sets: Vec::new(),
    recycle,
  };

  let engine = HelmEngine::default();
  let rt = tokio::runtime::Runtime::new().context("creating async runtime")?;

  let plan = rt.block_on(async {
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

    execute_plan(plan, &ctx, &request, &engine, &engine, &engine).await
  })
  .with_context(|| format!("execute deployment plan from {}", plan_path.display()))?;

  println!();
  println!("Plan execution complete.");
  println!("  Progress records: {}", plan.progress.len());

  Ok(())
}
