//! Reconciliation planning.
//!
//! Compares one unit's desired state against its observed state and produces
//! an ordered [`Plan`]. An empty plan means nothing to do, which is a normal
//! outcome. No plan is produced while the cluster is unreachable; that unit
//! is skipped rather than failed.

use tracing::debug;

use crate::actions::{ActionSchedule, AppAction};
use crate::state::Status;

use super::unit::DeploymentUnit;

/// What one plan step does.
#[derive(Debug, Clone, PartialEq)]
pub enum StepAction {
  Delete,
  Install,
  Rollback,
  Upgrade,
  AppAction(AppAction),
}

/// One ordered reconciliation step.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanStep {
  pub name: String,
  pub description: String,
  pub action: StepAction,
}

impl PlanStep {
  fn new(name: &str, description: &str, action: StepAction) -> PlanStep {
    PlanStep {
      name: name.to_string(),
      description: description.to_string(),
      action,
    }
  }
}

/// An ordered sequence of reconciliation steps for one unit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
  pub steps: Vec<PlanStep>,
}

impl Plan {
  pub fn is_empty(&self) -> bool {
    self.steps.is_empty()
  }

  pub fn len(&self) -> usize {
    self.steps.len()
  }
}

/// Compute the ordered plan for one unit.
///
/// The transition rules, evaluated in fixed order:
/// - desiring `NotFound`/`Deleted` while something exists requires a delete;
/// - a `Failed` or `PendingUpgrade` release is deleted before anything else;
/// - desiring `Deployed` installs after a delete or onto nothing, rolls back
///   then upgrades a deleted release, and otherwise upgrades on any drift in
///   status, routing, version, or diff, or when forced.
///
/// Desiring `Unchanged` short-circuits to an empty plan regardless of the
/// observed state.
pub fn plan_reconciliation(unit: &DeploymentUnit) -> Plan {
  let desired = &unit.desired_state;

  if desired.status == Status::Unchanged {
    debug!(app = %unit.name, "desired state is UNCHANGED, nothing to do");
    return Plan::default();
  }

  let Some(actual) = &unit.actual_state else {
    debug!(app = %unit.name, "no observed state, no plan produced");
    return Plan::default();
  };
  if actual.status == Status::Unavailable {
    debug!(app = %unit.name, "cluster unavailable, no plan produced");
    return Plan::default();
  }

  debug!(app = %unit.name, desired = %desired, actual = %actual, "planning reconciliation");

  let mut needs_install = false;
  let mut needs_rollback = false;
  let mut needs_upgrade = false;

  let needs_delete = if desired.status == Status::NotFound || desired.status == Status::Deleted {
    actual.status != Status::Deleted && actual.status != Status::NotFound
  } else {
    actual.status == Status::Failed || actual.status == Status::PendingUpgrade
  };

  if desired.status == Status::Deployed {
    if needs_delete || actual.status == Status::NotFound {
      needs_install = true;
    } else if actual.status == Status::Deleted {
      needs_rollback = true;
      needs_upgrade = true;
    } else {
      needs_upgrade = actual.status != Status::Deployed
        || actual.routing != desired.routing
        || actual.version != desired.version
        || actual.has_diff()
        || desired.force;
    }
  }

  let mut steps = Vec::new();

  if needs_delete {
    steps.push(PlanStep::new(
      "Delete",
      "Delete release from the cluster.",
      StepAction::Delete,
    ));
  }

  if desired.status == Status::Deployed {
    push_hooks(&mut steps, unit, ActionSchedule::BeforeDeploy);
  }

  if needs_install {
    steps.push(PlanStep::new(
      "Install",
      "Install chart to the cluster.",
      StepAction::Install,
    ));
  }

  if needs_rollback {
    steps.push(PlanStep::new(
      "Rollback",
      "Rollback existing release to allow upgrade.",
      StepAction::Rollback,
    ));
  }

  if needs_upgrade {
    steps.push(PlanStep::new(
      "Upgrade",
      "Upgrade existing release in the cluster.",
      StepAction::Upgrade,
    ));
  }

  if desired.status == Status::Deployed {
    push_hooks(&mut steps, unit, ActionSchedule::AfterDeploy);
  }

  Plan { steps }
}

fn push_hooks(steps: &mut Vec<PlanStep>, unit: &DeploymentUnit, schedule: ActionSchedule) {
  for action in &unit.manifest.app_config.actions {
    if action.scheduled_for(schedule) && action.where_filter.matches(&unit.match_args) {
      steps.push(PlanStep {
        name: action.name.clone(),
        description: action.description.clone(),
        action: StepAction::AppAction(action.clone()),
      });
    }
  }
}
