use std::time::Duration;

use thiserror::Error;

use cutover_core::{GroupId, RunId, ServiceRef};
use cutover_rollout::ShiftError;
use cutover_state::StateError;

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid pipeline {name}: {reason}")]
    InvalidDefinition { name: String, reason: String },

    #[error("unknown group: {0}")]
    UnknownGroup(GroupId),

    #[error("run not found: {0}")]
    RunNotFound(RunId),

    #[error("run {0} is not awaiting approval")]
    NoPendingApproval(RunId),

    #[error("approval rejected: {}", .comment.as_deref().unwrap_or("no comment"))]
    ApprovalRejected { comment: Option<String> },

    #[error("approval not given within {}s", .0.as_secs())]
    ApprovalTimedOut(Duration),

    #[error("no artifacts committed before stage {0}")]
    MissingArtifacts(String),

    #[error("revision on {service} not ready after {}s", .waited.as_secs())]
    RevisionNotReady { service: ServiceRef, waited: Duration },

    #[error("artifact source: {0}")]
    Source(String),

    #[error(transparent)]
    Shift(#[from] ShiftError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),
}
