//! One reconciliation step for a server record.
//!
//! A step plans from `(action, phase)`, does at most one unit of object work
//! and returns the updated copy of the record. It never persists anything;
//! the owning actor commits the copy once the store accepted it.

use daas_kube::{KubeApi, ResourceKind};
use daas_runtime::{
    plan, DatabaseServer, Direction, PhasePlan, PhaseWork, ProvisioningAction, ProvisioningError,
    ProvisioningStatus, ServerPhase,
};

use crate::options::EngineOptions;
use crate::provisioner::{ServerProvisioner, WorkOutcome};
use crate::proxy::DatabaseProxy;

pub struct StepContext<'a> {
    pub kube: &'a dyn KubeApi,
    pub proxy: &'a dyn DatabaseProxy,
    pub options: &'a EngineOptions,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    Idle,
    /// The phase's object exists but has not settled.
    Waiting {
        phase: ServerPhase,
        kind: ResourceKind,
    },
    /// One create or delete was issued; the phase is unchanged.
    Acted { phase: ServerPhase, detail: String },
    Advanced { from: ServerPhase, to: ServerPhase },
    /// The action finished and was reset to `None`.
    Completed { action: ProvisioningAction },
}

impl StepOutcome {
    pub fn changed_phase(&self) -> bool {
        matches!(
            self,
            StepOutcome::Advanced { .. } | StepOutcome::Completed { .. }
        )
    }
}

pub async fn step(
    server: &DatabaseServer,
    ctx: &StepContext<'_>,
) -> Result<(DatabaseServer, StepOutcome), ProvisioningError> {
    let mut next = server.clone();
    let action = server.action;
    let (work, direction, target) = match plan(action, server.phase) {
        PhasePlan::Idle => return Ok((next, StepOutcome::Idle)),
        PhasePlan::Complete => {
            complete(&mut next, action);
            return Ok((next.touch(), StepOutcome::Completed { action }));
        }
        PhasePlan::Enter(phase) => {
            next.phase = phase;
            next.status = ProvisioningStatus::Processing;
            let outcome = StepOutcome::Advanced {
                from: server.phase,
                to: phase,
            };
            return Ok((next.touch(), outcome));
        }
        PhasePlan::Work {
            work,
            direction,
            next,
        } => (work, direction, next),
    };

    next.status = ProvisioningStatus::Processing;
    let provisioner = ServerProvisioner::new(ctx.kube, ctx.proxy, ctx.options);
    let outcome = match (work, direction) {
        (PhaseWork::Controller, Direction::Forward) => provisioner.ensure_controller(server).await?,
        (PhaseWork::Controller, Direction::Teardown) => provisioner.remove_controller(server).await?,
        (PhaseWork::Service, Direction::Forward) => provisioner.ensure_service(server).await?,
        (PhaseWork::Service, Direction::Teardown) => provisioner.remove_service(server).await?,
        (PhaseWork::Configuration, Direction::Forward) => {
            provisioner.initialize_configuration(server).await?
        }
        // Configuration leaves nothing behind in the cluster.
        (PhaseWork::Configuration, Direction::Teardown) => WorkOutcome::Settled(None),
        (PhaseWork::Ingress, Direction::Forward) => provisioner.ensure_ingress(server).await?,
        (PhaseWork::Ingress, Direction::Teardown) => provisioner.remove_ingress(server).await?,
    };

    let outcome = match outcome {
        WorkOutcome::Created(_) | WorkOutcome::Deleted(_) => StepOutcome::Acted {
            phase: server.phase,
            detail: outcome.describe(),
        },
        WorkOutcome::Waiting(kind) => StepOutcome::Waiting {
            phase: server.phase,
            kind,
        },
        WorkOutcome::Settled(endpoint) => {
            if let Some(endpoint) = endpoint {
                next.ingress_ip = Some(endpoint.ip);
                next.ingress_port = Some(endpoint.port);
            }
            if work == PhaseWork::Ingress && direction == Direction::Teardown {
                next.ingress_ip = None;
                next.ingress_port = None;
            }
            next.phase = target;
            if target == direction.terminal() {
                complete(&mut next, action);
                StepOutcome::Completed { action }
            } else {
                StepOutcome::Advanced {
                    from: server.phase,
                    to: target,
                }
            }
        }
    };
    Ok((next.touch(), outcome))
}

/// Terminal bookkeeping: the action is reset and the status reflects it.
fn complete(server: &mut DatabaseServer, action: ProvisioningAction) {
    match Direction::for_action(action) {
        Some(Direction::Teardown) => {
            server.phase = ServerPhase::None;
            server.status = ProvisioningStatus::Deprovisioned;
            server.ingress_ip = None;
            server.ingress_port = None;
        }
        Some(Direction::Forward) | None => {
            server.phase = ServerPhase::Done;
            server.status = ProvisioningStatus::Ready;
        }
    }
    server.action = ProvisioningAction::None;
    server.last_error = None;
}
