use std::time::Duration;

use thiserror::Error;

use cutover_core::{GroupId, ShiftId, WeightError};
use cutover_routing::RoutingError;
use cutover_state::StateError;

use crate::hooks::LifecycleCheckpoint;

pub type ShiftResult<T> = Result<T, ShiftError>;

#[derive(Debug, Error)]
pub enum ShiftError {
    #[error(transparent)]
    InvalidWeight(#[from] WeightError),

    #[error("group {0} already has a shift in progress")]
    ShiftInProgress(GroupId),

    #[error("group {0} is failed and needs an operator reset")]
    RequiresIntervention(GroupId),

    #[error("group {0} has no active shift")]
    NoActiveShift(GroupId),

    #[error("unknown shift {shift} for group {group}")]
    UnknownShift { group: GroupId, shift: ShiftId },

    #[error("unknown deployment config: {0}")]
    UnknownConfig(String),

    #[error("validation rejected at {checkpoint}: {reason}")]
    ValidationRejected {
        checkpoint: LifecycleCheckpoint,
        reason: String,
    },

    #[error("shift cancelled by operator")]
    Cancelled,

    #[error("bake wait overran its deadline by {}s", .overrun.as_secs())]
    BakeOverrun { overrun: Duration },

    #[error("rollback failed after {attempts} attempts: {reason}")]
    RollbackFailed { attempts: u32, reason: String },

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    State(#[from] StateError),
}
