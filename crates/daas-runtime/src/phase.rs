//! Ordered provisioning phases and the rule that picks the next step.
//!
//! Planning is pure: [`plan`] looks only at the desired action and the
//! current phase. Whether the phase's object exists or is ready is decided by
//! the caller, which then moves at most one phase per step.

use serde::{Deserialize, Serialize};

use crate::model::ProvisioningAction;

#[derive(
    Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum ServerPhase {
    #[default]
    None = 0,
    ReplicationController = 1,
    Service = 2,
    InitializeConfiguration = 3,
    Ingress = 4,
    Done = 5,
}

impl ServerPhase {
    pub const ALL: [ServerPhase; 6] = [
        ServerPhase::None,
        ServerPhase::ReplicationController,
        ServerPhase::Service,
        ServerPhase::InitializeConfiguration,
        ServerPhase::Ingress,
        ServerPhase::Done,
    ];

    pub fn ordinal(self) -> u8 {
        self as u8
    }

    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        Self::ALL.get(usize::from(ordinal)).copied()
    }

    pub fn next(self) -> Option<Self> {
        Self::from_ordinal(self.ordinal() + 1)
    }

    pub fn previous(self) -> Option<Self> {
        self.ordinal().checked_sub(1).and_then(Self::from_ordinal)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServerPhase::None => "none",
            ServerPhase::ReplicationController => "replication_controller",
            ServerPhase::Service => "service",
            ServerPhase::InitializeConfiguration => "initialize_configuration",
            ServerPhase::Ingress => "ingress",
            ServerPhase::Done => "done",
        }
    }

    pub fn display_label(&self) -> &'static str {
        match self {
            ServerPhase::None => "None",
            ServerPhase::ReplicationController => "Replication controller",
            ServerPhase::Service => "Service",
            ServerPhase::InitializeConfiguration => "Initialize configuration",
            ServerPhase::Ingress => "Ingress",
            ServerPhase::Done => "Done",
        }
    }

    pub fn from_slug(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        Self::ALL
            .into_iter()
            .find(|phase| phase.as_str() == normalized)
    }
}

impl std::fmt::Display for ServerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Create objects, `None` towards `Done`.
    Forward,
    /// Delete objects, `Done` towards `None`.
    Teardown,
}

impl Direction {
    pub fn for_action(action: ProvisioningAction) -> Option<Self> {
        match action {
            ProvisioningAction::None => None,
            ProvisioningAction::Provision | ProvisioningAction::Reconfigure => {
                Some(Direction::Forward)
            }
            ProvisioningAction::Deprovision => Some(Direction::Teardown),
        }
    }

    pub fn terminal(self) -> ServerPhase {
        match self {
            Direction::Forward => ServerPhase::Done,
            Direction::Teardown => ServerPhase::None,
        }
    }
}

/// What a phase operates on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhaseWork {
    /// Data volume claim plus the replication controller that mounts it.
    Controller,
    Service,
    /// The one-shot server initialization call through the proxy.
    Configuration,
    Ingress,
}

impl PhaseWork {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseWork::Controller => "replication_controller",
            PhaseWork::Service => "service",
            PhaseWork::Configuration => "configuration",
            PhaseWork::Ingress => "ingress",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhasePlan {
    /// No pending action.
    Idle,
    /// Already at the terminal phase for the action.
    Complete,
    /// Move to another phase without touching any object.
    Enter(ServerPhase),
    /// Drive `work` in `direction`; once it settles, move to `next`.
    Work {
        work: PhaseWork,
        direction: Direction,
        next: ServerPhase,
    },
}

pub fn plan(action: ProvisioningAction, phase: ServerPhase) -> PhasePlan {
    let Some(direction) = Direction::for_action(action) else {
        return PhasePlan::Idle;
    };
    match direction {
        Direction::Forward => plan_forward(action, phase),
        Direction::Teardown => plan_teardown(phase),
    }
}

fn plan_forward(action: ProvisioningAction, phase: ServerPhase) -> PhasePlan {
    let forward = |work, next| PhasePlan::Work {
        work,
        direction: Direction::Forward,
        next,
    };
    match phase {
        ServerPhase::None => forward(PhaseWork::Controller, ServerPhase::ReplicationController),
        ServerPhase::ReplicationController => forward(PhaseWork::Controller, ServerPhase::Service),
        ServerPhase::Service => forward(PhaseWork::Service, ServerPhase::InitializeConfiguration),
        ServerPhase::InitializeConfiguration => {
            forward(PhaseWork::Configuration, ServerPhase::Ingress)
        }
        ServerPhase::Ingress => forward(PhaseWork::Ingress, ServerPhase::Done),
        ServerPhase::Done => match action {
            ProvisioningAction::Reconfigure => PhasePlan::Enter(ServerPhase::InitializeConfiguration),
            _ => PhasePlan::Complete,
        },
    }
}

fn plan_teardown(phase: ServerPhase) -> PhasePlan {
    let teardown = |work, next| PhasePlan::Work {
        work,
        direction: Direction::Teardown,
        next,
    };
    match phase {
        ServerPhase::Done => PhasePlan::Enter(ServerPhase::Ingress),
        ServerPhase::Ingress => teardown(PhaseWork::Ingress, ServerPhase::Service),
        ServerPhase::InitializeConfiguration => PhasePlan::Enter(ServerPhase::Service),
        ServerPhase::Service => teardown(PhaseWork::Service, ServerPhase::ReplicationController),
        ServerPhase::ReplicationController => teardown(PhaseWork::Controller, ServerPhase::None),
        // A provision that failed before leaving `None` may still have left a
        // claim or controller behind.
        ServerPhase::None => teardown(PhaseWork::Controller, ServerPhase::None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_are_strictly_ordered() {
        for pair in ServerPhase::ALL.windows(2) {
            assert!(pair[0] < pair[1]);
            assert_eq!(pair[0].next(), Some(pair[1]));
            assert_eq!(pair[1].previous(), Some(pair[0]));
        }
        assert_eq!(ServerPhase::Done.next(), None);
        assert_eq!(ServerPhase::None.previous(), None);
        assert_eq!(
            ServerPhase::from_slug("Initialize-Configuration"),
            Some(ServerPhase::InitializeConfiguration)
        );
    }

    #[test]
    fn idle_without_action() {
        for phase in ServerPhase::ALL {
            assert_eq!(plan(ProvisioningAction::None, phase), PhasePlan::Idle);
        }
    }

    #[test]
    fn provision_advances_one_phase_at_a_time() {
        for phase in ServerPhase::ALL {
            match plan(ProvisioningAction::Provision, phase) {
                PhasePlan::Work {
                    direction, next, ..
                } => {
                    assert_eq!(direction, Direction::Forward);
                    assert_eq!(Some(next), phase.next());
                }
                PhasePlan::Complete => assert_eq!(phase, ServerPhase::Done),
                other => panic!("unexpected plan {other:?} for {phase}"),
            }
        }
    }

    #[test]
    fn ready_service_leads_to_initialization() {
        assert_eq!(
            plan(ProvisioningAction::Provision, ServerPhase::Service),
            PhasePlan::Work {
                work: PhaseWork::Service,
                direction: Direction::Forward,
                next: ServerPhase::InitializeConfiguration,
            }
        );
    }

    #[test]
    fn reconfigure_reenters_at_initialization() {
        assert_eq!(
            plan(ProvisioningAction::Reconfigure, ServerPhase::Done),
            PhasePlan::Enter(ServerPhase::InitializeConfiguration)
        );
        assert!(matches!(
            plan(ProvisioningAction::Reconfigure, ServerPhase::InitializeConfiguration),
            PhasePlan::Work {
                work: PhaseWork::Configuration,
                ..
            }
        ));
    }

    #[test]
    fn teardown_visits_objects_in_reverse() {
        let mut phase = ServerPhase::Done;
        let mut visited = Vec::new();
        loop {
            match plan(ProvisioningAction::Deprovision, phase) {
                PhasePlan::Enter(next) => phase = next,
                PhasePlan::Work {
                    work,
                    direction,
                    next,
                } => {
                    assert_eq!(direction, Direction::Teardown);
                    visited.push(work);
                    phase = next;
                    if phase == Direction::Teardown.terminal() {
                        break;
                    }
                }
                other => panic!("unexpected plan {other:?}"),
            }
        }
        assert_eq!(
            visited,
            vec![PhaseWork::Ingress, PhaseWork::Service, PhaseWork::Controller]
        );
        assert_eq!(phase, Direction::Teardown.terminal());
    }
}
