//! Domain types for the Cutover state store.
//!
//! These are the persisted shapes of deployment groups, archived shifts,
//! and pipeline runs. All types serialize to JSON for storage in redb.

use serde::{Deserialize, Serialize};

use cutover_core::{GroupId, RevisionArtifacts, RunId, ServiceRef, ShiftId, TargetRef, Weights};

use crate::error::{StateError, StateResult};

// ── Deployment groups ─────────────────────────────────────────────

/// Lifecycle of a deployment group's current (or last) shift.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ShiftState {
    /// No shift has run yet, or an operator reset the group.
    Idle,
    /// A shift is moving traffic.
    Shifting,
    /// The last shift completed; the new revision carries all traffic.
    Succeeded,
    /// The last shift was aborted and traffic was restored.
    RolledBack { reason: String },
    /// The last shift could not restore traffic. Needs an operator.
    Failed { reason: String },
}

impl ShiftState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ShiftState::Succeeded | ShiftState::RolledBack { .. } | ShiftState::Failed { .. }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            ShiftState::Idle => "idle",
            ShiftState::Shifting => "shifting",
            ShiftState::Succeeded => "succeeded",
            ShiftState::RolledBack { .. } => "rolled_back",
            ShiftState::Failed { .. } => "failed",
        }
    }
}

/// Role assignment and weights of a target pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairSnapshot {
    pub primary: TargetRef,
    pub secondary: TargetRef,
    pub weights: Weights,
}

impl PairSnapshot {
    /// Fresh pair: all traffic on the primary.
    pub fn new(primary: TargetRef, secondary: TargetRef) -> Self {
        Self {
            primary,
            secondary,
            weights: Weights::all_primary(),
        }
    }

    /// Exchange roles. Each target keeps the traffic it carries.
    pub fn swapped(&self) -> Self {
        Self {
            primary: self.secondary.clone(),
            secondary: self.primary.clone(),
            weights: self.weights.swapped(),
        }
    }

    /// `(target, weight)` entries as pushed to the routing layer.
    pub fn weighted_targets(&self) -> [(TargetRef, u32); 2] {
        [
            (self.primary.clone(), self.weights.primary),
            (self.secondary.clone(), self.weights.secondary),
        ]
    }
}

/// Persisted state of one deployment group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRecord {
    pub group_id: GroupId,
    pub service: ServiceRef,
    pub state: ShiftState,
    pub pair: PairSnapshot,
    pub active_shift_id: Option<ShiftId>,
    /// Revision being shifted while `state` is `Shifting`.
    pub revision: Option<String>,
    /// Unix timestamp (seconds) when the bake wait ends.
    pub bake_deadline: Option<u64>,
    pub updated_at: u64,
}

impl GroupRecord {
    pub fn table_key(&self) -> String {
        self.group_id.clone()
    }
}

/// A finished shift, archived per group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShiftRecord {
    pub shift_id: ShiftId,
    pub group_id: GroupId,
    pub revision: String,
    pub config_name: String,
    /// Target that held traffic before the shift.
    pub from: TargetRef,
    /// Target the shift moved traffic to.
    pub to: TargetRef,
    /// Terminal state the shift ended in.
    pub outcome: ShiftState,
    pub started_at: u64,
    pub finished_at: u64,
}

impl ShiftRecord {
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.group_id, self.shift_id)
    }
}

// ── Pipeline runs ─────────────────────────────────────────────────

/// What a pipeline stage does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageKind {
    /// Fetch revision artifacts. No infrastructure side effects.
    Source,
    /// Shift traffic for one deployment group.
    Deploy { group: GroupId },
    /// Wait for an operator's decision.
    Approval,
}

/// Why a stage failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The stage could not do its work (source fetch, readiness, conflicts).
    Error,
    /// The shift was aborted and traffic is back on the previous revision.
    RolledBack,
    /// The shift could not restore traffic; weights may be partially shifted.
    Inconsistent,
    /// An operator rejected the approval.
    Rejected,
    /// The approval was not answered in time.
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    AwaitingApproval,
    Succeeded,
    Failed { kind: FailureKind, reason: String },
}

/// One stage of a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub name: String,
    pub kind: StageKind,
    pub status: StageStatus,
    /// Output artifacts; immutable once committed.
    pub artifacts: Option<RevisionArtifacts>,
    /// Shift started by a deploy stage.
    pub shift_id: Option<ShiftId>,
    pub started_at: Option<u64>,
    pub finished_at: Option<u64>,
}

impl StageRecord {
    pub fn pending(name: impl Into<String>, kind: StageKind) -> Self {
        Self {
            name: name.into(),
            kind,
            status: StageStatus::Pending,
            artifacts: None,
            shift_id: None,
            started_at: None,
            finished_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed { stage: String, kind: FailureKind },
}

/// One end-to-end execution of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRunRecord {
    pub run_id: RunId,
    pub pipeline: String,
    pub status: RunStatus,
    pub current_stage_index: usize,
    pub stages: Vec<StageRecord>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl PipelineRunRecord {
    pub fn table_key(&self) -> String {
        self.run_id.clone()
    }

    pub fn is_finished(&self) -> bool {
        !matches!(self.status, RunStatus::Running)
    }

    /// Artifacts committed by the first stage that produced any.
    pub fn artifacts(&self) -> Option<&RevisionArtifacts> {
        self.stages.iter().find_map(|s| s.artifacts.as_ref())
    }

    /// Commit a stage's output artifacts. A stage commits at most once.
    pub fn commit_artifacts(
        &mut self,
        stage_index: usize,
        artifacts: RevisionArtifacts,
    ) -> StateResult<()> {
        let stage = self
            .stages
            .get_mut(stage_index)
            .ok_or_else(|| StateError::NotFound(format!("{}#{stage_index}", self.run_id)))?;
        if stage.artifacts.is_some() {
            return Err(StateError::Immutable(format!(
                "{} stage {} already committed artifacts",
                self.run_id, stage.name
            )));
        }
        stage.artifacts = Some(artifacts);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn artifacts(image: &str) -> RevisionArtifacts {
        RevisionArtifacts::new(image, serde_json::json!({}), BTreeMap::new())
    }

    fn run() -> PipelineRunRecord {
        PipelineRunRecord {
            run_id: "run-1".to_string(),
            pipeline: "p".to_string(),
            status: RunStatus::Running,
            current_stage_index: 0,
            stages: vec![
                StageRecord::pending("Source", StageKind::Source),
                StageRecord::pending("Approve", StageKind::Approval),
            ],
            created_at: 1000,
            updated_at: 1000,
        }
    }

    #[test]
    fn artifacts_commit_once() {
        let mut run = run();
        run.commit_artifacts(0, artifacts("v1")).unwrap();
        let err = run.commit_artifacts(0, artifacts("v2")).unwrap_err();
        assert!(matches!(err, StateError::Immutable(_)));
        assert_eq!(
            err.to_string(),
            "immutable record: run-1 stage Source already committed artifacts"
        );
        assert_eq!(run.artifacts().unwrap().image, "v1");
    }

    #[test]
    fn commit_to_missing_stage_fails() {
        let mut run = run();
        assert!(matches!(
            run.commit_artifacts(9, artifacts("v1")),
            Err(StateError::NotFound(_))
        ));
    }

    #[test]
    fn pair_swap_keeps_traffic_on_the_same_target() {
        let mut pair = PairSnapshot::new(TargetRef::new("a"), TargetRef::new("b"));
        pair.weights = Weights::all_secondary();
        let swapped = pair.swapped();
        assert_eq!(swapped.primary, TargetRef::new("b"));
        assert_eq!(swapped.weights, Weights::all_primary());
        assert_eq!(swapped.swapped(), pair);
    }

    #[test]
    fn terminal_states() {
        assert!(!ShiftState::Idle.is_terminal());
        assert!(!ShiftState::Shifting.is_terminal());
        assert!(ShiftState::Succeeded.is_terminal());
        assert!(
            ShiftState::Failed {
                reason: "x".to_string()
            }
            .is_terminal()
        );
    }
}
