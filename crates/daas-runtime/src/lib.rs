//! Domain model, phase planning and failure taxonomy for tenant database servers.

pub mod error;
pub mod model;
pub mod phase;

pub use error::{ProvisioningError, SqlExecutionError};
pub use model::{
    DatabaseId, DatabaseInstance, DatabaseServer, DatabaseServerKind, ProvisioningAction,
    ProvisioningStatus, ServerId,
};
pub use phase::{plan, Direction, PhasePlan, PhaseWork, ServerPhase};
