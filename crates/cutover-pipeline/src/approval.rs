//! Manual approval gate between pipeline stages.
//!
//! An approval stage registers its run with the gate and waits; an
//! operator's signal (usually through the REST API) completes the wait.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, info};

use cutover_core::RunId;

use crate::error::{PipelineError, PipelineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    Reject,
}

/// An operator's answer to a pending approval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalSignal {
    pub decision: ApprovalDecision,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub actor: Option<String>,
}

impl ApprovalSignal {
    pub fn approve() -> Self {
        Self {
            decision: ApprovalDecision::Approve,
            comment: None,
            actor: None,
        }
    }

    pub fn reject(comment: impl Into<String>) -> Self {
        Self {
            decision: ApprovalDecision::Reject,
            comment: Some(comment.into()),
            actor: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Approved(ApprovalSignal),
    Rejected(ApprovalSignal),
    TimedOut,
    /// The gate dropped the pending approval without an answer.
    Abandoned,
}

/// Pending approvals keyed by run.
#[derive(Clone, Default)]
pub struct ApprovalGate {
    pending: Arc<Mutex<HashMap<RunId, oneshot::Sender<ApprovalSignal>>>>,
}

impl ApprovalGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an approval for `run_id`. Replaces any earlier one for the run.
    pub fn register(&self, run_id: &str) -> oneshot::Receiver<ApprovalSignal> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("approvals lock")
            .insert(run_id.to_string(), tx);
        rx
    }

    /// Deliver an operator's decision.
    pub fn signal(&self, run_id: &str, signal: ApprovalSignal) -> PipelineResult<()> {
        let tx = self
            .pending
            .lock()
            .expect("approvals lock")
            .remove(run_id)
            .ok_or_else(|| PipelineError::NoPendingApproval(run_id.to_string()))?;
        info!(
            run = run_id,
            decision = ?signal.decision,
            actor = signal.actor.as_deref().unwrap_or("unknown"),
            "approval signalled"
        );
        tx.send(signal)
            .map_err(|_| PipelineError::NoPendingApproval(run_id.to_string()))
    }

    /// Drop the pending approval for `run_id` without a decision.
    ///
    /// A waiter sees [`ApprovalOutcome::Abandoned`]. Returns whether an
    /// approval was pending.
    pub fn cancel(&self, run_id: &str) -> bool {
        let removed = self
            .pending
            .lock()
            .expect("approvals lock")
            .remove(run_id)
            .is_some();
        if removed {
            debug!(run = run_id, "pending approval withdrawn");
        }
        removed
    }

    /// Runs currently waiting for a decision.
    pub fn pending(&self) -> Vec<RunId> {
        let mut runs: Vec<RunId> = self
            .pending
            .lock()
            .expect("approvals lock")
            .keys()
            .cloned()
            .collect();
        runs.sort();
        runs
    }

    pub fn is_pending(&self, run_id: &str) -> bool {
        self.pending
            .lock()
            .expect("approvals lock")
            .contains_key(run_id)
    }

    /// Wait for the decision on `run_id`, at most `timeout` when set.
    pub async fn wait(
        &self,
        run_id: &str,
        rx: oneshot::Receiver<ApprovalSignal>,
        timeout: Option<Duration>,
    ) -> ApprovalOutcome {
        let received = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.pending.lock().expect("approvals lock").remove(run_id);
                    return ApprovalOutcome::TimedOut;
                }
            },
            None => rx.await,
        };

        match received {
            Ok(signal) if signal.decision == ApprovalDecision::Approve => {
                ApprovalOutcome::Approved(signal)
            }
            Ok(signal) => ApprovalOutcome::Rejected(signal),
            Err(_) => ApprovalOutcome::Abandoned,
        }
    }
}
