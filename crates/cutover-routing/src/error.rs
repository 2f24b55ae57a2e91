use thiserror::Error;

use cutover_core::WeightError;

pub type RoutingResult<T> = Result<T, RoutingError>;

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error(transparent)]
    InvalidWeight(#[from] WeightError),

    #[error("weight write for pair {pair} failed: {reason}")]
    WriteFailed { pair: String, reason: String },

    #[error("rule priority update failed: {0}")]
    RulesFailed(String),
}

impl RoutingError {
    /// Whether retrying the same write may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, RoutingError::WriteFailed { .. } | RoutingError::RulesFailed(_))
    }
}
