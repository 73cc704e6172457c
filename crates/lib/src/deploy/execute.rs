//! Plan execution.
//!
//! Runs a [`Deploy`]'s units sequentially in app order. Units are processed
//! one at a time on purpose: downstream apps may depend on upstream apps
//! already being reconciled, and the active cluster context is not safe to
//! share. The first failing step aborts the whole deploy; already-completed
//! units are left as they are and a re-run reconciles the remainder.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::contracts::{
  ContextSwitcher, DeploymentTracker, ReleaseEngine, ReleaseRequest, StateInspector, ValueFileLoader,
};
use crate::platform::Platform;
use crate::state::{Routing, Status};
use crate::topology::Environment;
use crate::values::resolve_values;

use super::reconcile::{StepAction, plan_reconciliation};
use super::unit::DeploymentUnit;
use super::{Deploy, DeployError};

/// Delay between pod-readiness polls during a recycle.
const RECYCLE_POLL_DELAY: Duration = Duration::from_secs(5);

/// Invocation-scoped flags and overrides.
#[derive(Debug, Clone, Default)]
pub struct Parameters {
  pub force: bool,
  pub dry_run: bool,
  /// Suppress deployment-tracker notifications.
  pub no_report: bool,
  /// Print the resolved values instead of deploying.
  pub dump_values_only: bool,
  /// Print the plan and drift diff instead of deploying.
  pub diff_only: bool,
  /// `path=value` overrides applied at the highest static precedence.
  pub value_overrides: BTreeMap<String, String>,
}

/// Shared context for one deploy invocation.
pub struct DeployContext<'a> {
  pub environment: &'a Environment,
  pub platform: &'a Platform,
  pub params: Parameters,
  /// Base directory for resolving relative value-file references.
  pub dir: PathBuf,
  pub loader: &'a dyn ValueFileLoader,
  pub tracker: Option<&'a dyn DeploymentTracker>,
  pub cancel: CancelToken,
  /// Bound on each external command run during value resolution and hooks.
  pub command_timeout: Duration,
  /// Called after each unit with the unit and its outcome.
  pub after_deploy: Option<&'a (dyn Fn(&DeploymentUnit, Option<&DeployError>) + Sync)>,
}

impl Deploy {
  /// Execute every unit in app order, aborting on the first failure.
  pub async fn run<C, I, E>(
    &mut self,
    ctx: &DeployContext<'_>,
    switcher: &C,
    inspector: &I,
    engine: &E,
  ) -> Result<(), DeployError>
  where
    C: ContextSwitcher,
    I: StateInspector,
    E: ReleaseEngine,
  {
    let recycle = self.settings.recycle;

    for unit in &mut self.units {
      if ctx.cancel.is_cancelled() {
        return Err(DeployError::Cancelled);
      }

      info!(app = %unit.name, cluster = %unit.cluster, namespace = %unit.namespace, "deploying unit");

      let result = run_unit(unit, ctx, switcher, inspector, engine, recycle).await;

      if let Some(after_deploy) = ctx.after_deploy {
        after_deploy(unit, result.as_ref().err());
      }

      result?;
    }

    Ok(())
  }
}

async fn run_unit<C, I, E>(
  unit: &mut DeploymentUnit,
  ctx: &DeployContext<'_>,
  switcher: &C,
  inspector: &I,
  engine: &E,
  recycle: bool,
) -> Result<(), DeployError>
where
  C: ContextSwitcher,
  I: StateInspector,
  E: ReleaseEngine,
{
  let cluster = ctx
    .environment
    .cluster_by_name(&unit.cluster)
    .map_err(|source| DeployError::Switch {
      cluster: unit.cluster.clone(),
      app: unit.name.clone(),
      source,
    })?;

  let session = switcher.switch_to(cluster).await.map_err(|source| DeployError::Switch {
    cluster: unit.cluster.clone(),
    app: unit.name.clone(),
    source,
  })?;

  if unit.desired_state.routing == Routing::NotApplicable {
    unit.desired_state.routing = Routing::Cluster;
  }
  unit.desired_state.force = unit.desired_state.force || ctx.params.force;

  let resolved = resolve_values(unit, ctx).await.map_err(|source| DeployError::Values {
    app: unit.name.clone(),
    source,
  })?;

  if ctx.params.dump_values_only {
    info!(app = %unit.name, "running in values-preview mode");
    println!("# App: {} (namespace {})", unit.name, unit.namespace);
    println!("{}", resolved.values.to_yaml().unwrap_or_default());
    println!("---");
    return Ok(());
  }

  // Owned by this unit for the rest of its lifecycle; removed on drop, on
  // every exit path.
  let persisted = resolved.persist().map_err(|source| DeployError::Values {
    app: unit.name.clone(),
    source,
  })?;

  let chart = unit
    .manifest
    .chart_dir()
    .map(|p| p.display().to_string())
    .unwrap_or_else(|| unit.name.clone());
  let version = unit.manifest.version.to_string();

  let request = ReleaseRequest {
    release: &unit.name,
    chart: &chart,
    version: &version,
    namespace: &unit.namespace,
    values_file: persisted.path(),
    force: unit.desired_state.force,
    dry_run: ctx.params.dry_run,
  };

  let actual = inspector
    .actual_state(&session, &request, true)
    .await
    .map_err(|source| DeployError::ActualState {
      app: unit.name.clone(),
      source,
    })?;

  debug!(app = %unit.name, desired = %unit.desired_state, actual = %actual, "states compared");
  unit.actual_state = Some(actual);

  let plan = plan_reconciliation(unit);

  if unit.actual_state.as_ref().is_some_and(|a| a.status == Status::Unavailable) {
    info!(app = %unit.name, cluster = %unit.cluster, "cluster unavailable, skipping reconciliation");
    return Ok(());
  }

  if plan.is_empty() {
    info!(app = %unit.name, "no actions needed to reconcile state");
  } else {
    for step in &plan.steps {
      info!(app = %unit.name, step = %step.name, description = %step.description, "planned step");
    }

    if ctx.params.diff_only {
      info!(app = %unit.name, "running in diff-only mode");
      for step in &plan.steps {
        println!("{}: {}", step.name, step.description);
      }
      if let Some(diff) = unit.actual_state.as_ref().and_then(|a| a.diff.as_deref()) {
        println!("{diff}");
      }
      return Ok(());
    }

    let tracker_id = notify_deploy_started(unit, ctx);

    let mut result = Ok(());
    let action_env = resolved.values.to_env("STEVEDORE_");

    for step in &plan.steps {
      if ctx.cancel.is_cancelled() {
        result = Err(DeployError::Cancelled);
        break;
      }

      info!(app = %unit.name, step = %step.name, "executing step");
      match execute_step(unit, step, &session, &request, &action_env, ctx, engine).await {
        Ok(()) => info!(app = %unit.name, step = %step.name, "step complete"),
        Err(source) => {
          result = Err(DeployError::StepFailed {
            app: unit.name.clone(),
            step: step.name.clone(),
            source,
          });
          break;
        }
      }
    }

    notify_deploy_finished(ctx, tracker_id, &result);
    result?;
  }

  if recycle && !ctx.params.dry_run {
    recycle_unit(unit, &session, ctx, engine).await?;
  }

  Ok(())
}

async fn execute_step<E: ReleaseEngine>(
  unit: &DeploymentUnit,
  step: &super::reconcile::PlanStep,
  session: &crate::topology::ClusterSession,
  request: &ReleaseRequest<'_>,
  action_env: &BTreeMap<String, String>,
  ctx: &DeployContext<'_>,
  engine: &E,
) -> Result<(), super::StepError> {
  match &step.action {
    StepAction::Delete => {
      // Deleting because the desired state is NOTFOUND purges history;
      // otherwise history is kept so the release can be rolled back.
      let keep_history = unit.desired_state.status != Status::NotFound;
      engine.delete(session, request, keep_history).await?;
    }
    StepAction::Install => engine.install(session, request).await?,
    StepAction::Rollback => engine.rollback(session, request).await?,
    StepAction::Upgrade => engine.upgrade(session, request).await?,
    StepAction::AppAction(action) => {
      let action_ctx = crate::actions::ActionContext {
        dir: unit.manifest.dir(),
        env: action_env.clone(),
        match_args: &unit.match_args,
        cancel: &ctx.cancel,
      };
      action.execute(&action_ctx).await?;
    }
  }
  Ok(())
}

/// Notify the tracker that a deploy is starting. Failures and panics are
/// logged, never fatal.
fn notify_deploy_started(unit: &DeploymentUnit, ctx: &DeployContext<'_>) -> Option<String> {
  let tracker = ctx.tracker?;

  let report = !ctx.params.dry_run
    && !ctx.params.no_report
    && !ctx.environment.is_local
    && unit.desired_state.status == Status::Deployed
    && unit.manifest.app_config.report_deployment;
  if !report {
    return None;
  }

  info!(app = %unit.name, "deploy progress will be reported to the deployment tracker");

  let outcome = catch_unwind(AssertUnwindSafe(|| {
    tracker.create(&unit.name, &unit.manifest.branch, &ctx.environment.name)
  }));

  match outcome {
    Ok(Ok(id)) => Some(id),
    Ok(Err(err)) => {
      warn!(app = %unit.name, error = %err, "deployment tracker create failed");
      None
    }
    Err(_) => {
      warn!(app = %unit.name, "deployment tracker create panicked");
      None
    }
  }
}

fn notify_deploy_finished(ctx: &DeployContext<'_>, tracker_id: Option<String>, result: &Result<(), DeployError>) {
  let (Some(tracker), Some(id)) = (ctx.tracker, tracker_id) else {
    return;
  };

  let message = match result {
    Ok(()) => String::new(),
    Err(err) => err.to_string(),
  };

  let outcome = catch_unwind(AssertUnwindSafe(|| tracker.update(&id, result.is_ok(), &message)));
  match outcome {
    Ok(Ok(())) => {}
    Ok(Err(err)) => warn!(error = %err, "deployment tracker update failed"),
    Err(_) => warn!("deployment tracker update panicked"),
  }
}

/// Delete the unit's pods, then poll until every replacement reports ready.
///
/// There is no bound on poll attempts other than cancellation.
async fn recycle_unit<E: ReleaseEngine>(
  unit: &DeploymentUnit,
  session: &crate::topology::ClusterSession,
  ctx: &DeployContext<'_>,
  engine: &E,
) -> Result<(), DeployError> {
  let selector = unit.pod_selector();

  info!(app = %unit.name, "deleting pods");
  engine
    .delete_pods(session, &unit.namespace, &selector)
    .await
    .map_err(|source| DeployError::Recycle {
      app: unit.name.clone(),
      source,
    })?;

  info!(app = %unit.name, "pods deleted, waiting for recreated pods to be ready");

  loop {
    let ready = engine
      .pods_ready(session, &unit.namespace, &selector)
      .await
      .map_err(|source| DeployError::Recycle {
        app: unit.name.clone(),
        source,
      })?;

    if ready {
      break;
    }

    debug!(app = %unit.name, delay = ?RECYCLE_POLL_DELAY, "waiting to check readiness again");
    tokio::select! {
      _ = tokio::time::sleep(RECYCLE_POLL_DELAY) => {}
      _ = ctx.cancel.cancelled() => return Err(DeployError::Cancelled),
    }
  }

  info!(app = %unit.name, "recycle complete");
  Ok(())
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;
  use std::sync::Mutex;

  use crate::contracts::{EngineError, FsValueFileLoader, TrackerError};
  use crate::manifest::AppManifest;
  use crate::state::AppState;
  use crate::topology::{ClusterConfig, ClusterSession, TopologyError};

  use super::super::{AppDeploySettings, DeploySettings};
  use super::*;

  /// Fake collaborator recording every engine call.
  #[derive(Default)]
  struct FakeEngine {
    calls: Mutex<Vec<String>>,
    /// Apps whose first mutation fails.
    fail_on: Option<String>,
    /// Observed status per app.
    actual: BTreeMap<String, Status>,
  }

  impl FakeEngine {
    fn record(&self, call: String) {
      self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<String> {
      self.calls.lock().unwrap().clone()
    }

    fn check_failure(&self, release: &str) -> Result<(), EngineError> {
      if self.fail_on.as_deref() == Some(release) {
        return Err(EngineError::CmdFailed {
          cmd: format!("mutate {release}"),
          code: Some(1),
          stderr: "boom".to_string(),
        });
      }
      Ok(())
    }
  }

  impl ContextSwitcher for FakeEngine {
    async fn switch_to(&self, cluster: &ClusterConfig) -> Result<ClusterSession, TopologyError> {
      self.record(format!("switch:{}", cluster.name));
      Ok(ClusterSession {
        cluster: cluster.name.clone(),
        kube_context: cluster.kube_context().to_string(),
      })
    }
  }

  impl StateInspector for FakeEngine {
    async fn actual_state(
      &self,
      _session: &ClusterSession,
      request: &ReleaseRequest<'_>,
      _diff: bool,
    ) -> Result<AppState, EngineError> {
      let status = self.actual.get(request.release).copied().unwrap_or(Status::NotFound);
      Ok(AppState {
        status,
        routing: Routing::Cluster,
        version: request.version.to_string(),
        diff: None,
        force: false,
      })
    }
  }

  impl ReleaseEngine for FakeEngine {
    async fn install(&self, _s: &ClusterSession, r: &ReleaseRequest<'_>) -> Result<(), EngineError> {
      self.record(format!("install:{}", r.release));
      self.check_failure(r.release)
    }

    async fn upgrade(&self, _s: &ClusterSession, r: &ReleaseRequest<'_>) -> Result<(), EngineError> {
      self.record(format!("upgrade:{}", r.release));
      self.check_failure(r.release)
    }

    async fn rollback(&self, _s: &ClusterSession, r: &ReleaseRequest<'_>) -> Result<(), EngineError> {
      self.record(format!("rollback:{}", r.release));
      self.check_failure(r.release)
    }

    async fn delete(&self, _s: &ClusterSession, r: &ReleaseRequest<'_>, keep: bool) -> Result<(), EngineError> {
      self.record(format!("delete:{}:{}", r.release, keep));
      self.check_failure(r.release)
    }

    async fn delete_pods(&self, _s: &ClusterSession, ns: &str, sel: &str) -> Result<(), EngineError> {
      self.record(format!("delete_pods:{ns}:{sel}"));
      Ok(())
    }

    async fn pods_ready(&self, _s: &ClusterSession, _ns: &str, _sel: &str) -> Result<bool, EngineError> {
      self.record("pods_ready".to_string());
      Ok(true)
    }
  }

  struct FakeTracker {
    created: Mutex<Vec<String>>,
    updated: Mutex<Vec<(String, bool)>>,
  }

  impl DeploymentTracker for FakeTracker {
    fn create(&self, app: &str, _branch: &str, _environment: &str) -> Result<String, TrackerError> {
      self.created.lock().unwrap().push(app.to_string());
      Ok(format!("deploy-{app}"))
    }

    fn update(&self, id: &str, success: bool, _message: &str) -> Result<(), TrackerError> {
      self.updated.lock().unwrap().push((id.to_string(), success));
      Ok(())
    }
  }

  fn manifest(name: &str) -> Arc<AppManifest> {
    let yaml = format!(
      "name: {name}\nversion: 1.0.0\nbranch: main\nappConfig:\n  name: {name}\n  reportDeployment: true"
    );
    Arc::new(serde_yaml::from_str(&yaml).unwrap())
  }

  fn environment() -> Environment {
    serde_yaml::from_str(
      r#"
name: qa
role: qa
clusters:
  - name: east
    roles: [default]
    namespaces:
      default: { name: apps }
"#,
    )
    .unwrap()
  }

  fn deploy_for(apps: &[&str]) -> (Environment, Platform, Deploy) {
    let env = environment();
    let platform = Platform::default();
    let settings = DeploySettings {
      app_manifests: apps.iter().map(|a| (a.to_string(), manifest(a))).collect(),
      app_settings: BTreeMap::from([(apps[0].to_string(), AppDeploySettings::default())]),
      ..DeploySettings::default()
    };
    let deploy = Deploy::new(&env, &platform, settings).unwrap();
    (env, platform, deploy)
  }

  fn context<'a>(
    env: &'a Environment,
    platform: &'a Platform,
    loader: &'a FsValueFileLoader,
    tracker: Option<&'a dyn DeploymentTracker>,
  ) -> DeployContext<'a> {
    DeployContext {
      environment: env,
      platform,
      params: Parameters::default(),
      dir: std::env::temp_dir(),
      loader,
      tracker,
      cancel: CancelToken::none(),
      command_timeout: Duration::from_secs(5),
      after_deploy: None,
    }
  }

  #[tokio::test]
  async fn fresh_apps_are_installed_in_order() {
    let (env, platform, mut deploy) = deploy_for(&["alpha", "beta"]);
    let loader = FsValueFileLoader;
    let ctx = context(&env, &platform, &loader, None);
    let engine = FakeEngine::default();

    deploy.run(&ctx, &engine, &engine, &engine).await.unwrap();

    let calls = engine.calls();
    assert_eq!(
      calls,
      vec!["switch:east", "install:alpha", "switch:east", "install:beta"]
    );
  }

  #[tokio::test]
  async fn failing_step_aborts_remaining_units() {
    let (env, platform, mut deploy) = deploy_for(&["alpha", "beta", "gamma"]);
    let loader = FsValueFileLoader;
    let ctx = context(&env, &platform, &loader, None);
    let engine = FakeEngine {
      fail_on: Some("beta".to_string()),
      ..FakeEngine::default()
    };

    let err = deploy.run(&ctx, &engine, &engine, &engine).await.unwrap_err();
    assert!(matches!(err, DeployError::StepFailed { ref app, .. } if app == "beta"));

    let calls = engine.calls();
    // Unit 1 completes, unit 2 runs through its failing step, unit 3 never
    // begins.
    assert!(calls.contains(&"install:alpha".to_string()));
    assert!(calls.contains(&"install:beta".to_string()));
    assert!(!calls.iter().any(|c| c.contains("gamma")));
  }

  #[tokio::test]
  async fn in_sync_units_are_noops() {
    let (env, platform, mut deploy) = deploy_for(&["alpha"]);
    let loader = FsValueFileLoader;
    let ctx = context(&env, &platform, &loader, None);
    let engine = FakeEngine {
      actual: BTreeMap::from([("alpha".to_string(), Status::Deployed)]),
      ..FakeEngine::default()
    };

    deploy.run(&ctx, &engine, &engine, &engine).await.unwrap();

    let calls = engine.calls();
    assert_eq!(calls, vec!["switch:east"]);
  }

  #[tokio::test]
  async fn tracker_is_notified_around_the_deploy() {
    let (env, platform, mut deploy) = deploy_for(&["alpha"]);
    let loader = FsValueFileLoader;
    let tracker = FakeTracker {
      created: Mutex::new(Vec::new()),
      updated: Mutex::new(Vec::new()),
    };
    let ctx = context(&env, &platform, &loader, Some(&tracker));
    let engine = FakeEngine::default();

    deploy.run(&ctx, &engine, &engine, &engine).await.unwrap();

    assert_eq!(tracker.created.lock().unwrap().clone(), vec!["alpha"]);
    assert_eq!(
      tracker.updated.lock().unwrap().clone(),
      vec![("deploy-alpha".to_string(), true)]
    );
  }

  #[tokio::test]
  async fn recycle_deletes_pods_and_polls() {
    let (env, platform, mut deploy) = deploy_for(&["alpha"]);
    deploy.settings.recycle = true;
    let loader = FsValueFileLoader;
    let ctx = context(&env, &platform, &loader, None);
    let engine = FakeEngine::default();

    deploy.run(&ctx, &engine, &engine, &engine).await.unwrap();

    let calls = engine.calls();
    assert!(calls.contains(&"delete_pods:apps:release=alpha".to_string()));
    assert!(calls.contains(&"pods_ready".to_string()));
  }

  #[tokio::test]
  async fn after_deploy_callback_sees_each_unit() {
    let (env, platform, mut deploy) = deploy_for(&["alpha", "beta"]);
    let loader = FsValueFileLoader;
    let seen: Mutex<Vec<String>> = Mutex::new(Vec::new());
    let callback = |unit: &DeploymentUnit, err: Option<&DeployError>| {
      seen.lock().unwrap().push(format!("{}:{}", unit.name, err.is_none()));
    };
    let mut ctx = context(&env, &platform, &loader, None);
    ctx.after_deploy = Some(&callback);
    let engine = FakeEngine::default();

    deploy.run(&ctx, &engine, &engine, &engine).await.unwrap();

    assert_eq!(seen.lock().unwrap().clone(), vec!["alpha:true", "beta:true"]);
  }

  #[tokio::test]
  async fn cancelled_deploy_stops_before_next_unit() {
    let (env, platform, mut deploy) = deploy_for(&["alpha"]);
    let loader = FsValueFileLoader;
    let (handle, token) = crate::cancel::cancel_pair();
    let mut ctx = context(&env, &platform, &loader, None);
    ctx.cancel = token;
    handle.cancel();
    let engine = FakeEngine::default();

    let err = deploy.run(&ctx, &engine, &engine, &engine).await.unwrap_err();
    assert!(matches!(err, DeployError::Cancelled));
    assert!(engine.calls().is_empty());
  }
}
