//! Pipeline definitions, the ordered stages a run walks through.

use std::collections::HashSet;

use cutover_core::config::PipelineConfig;
use cutover_core::epoch_secs;
use cutover_state::{PipelineRunRecord, RunStatus, StageKind, StageRecord};

use crate::error::{PipelineError, PipelineResult};

#[derive(Debug, Clone, PartialEq)]
pub struct StageDefinition {
    pub name: String,
    pub kind: StageKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineDefinition {
    pub name: String,
    pub stages: Vec<StageDefinition>,
}

impl PipelineDefinition {
    /// `Source → Deploy(latest) → Approval → Deploy(stable)`.
    pub fn multi_stage(name: impl Into<String>, latest: &str, stable: &str) -> Self {
        let stage = |name: &str, kind: StageKind| StageDefinition {
            name: name.to_string(),
            kind,
        };
        Self {
            name: name.into(),
            stages: vec![
                stage("Source", StageKind::Source),
                stage(
                    &format!("{latest}Deploy"),
                    StageKind::Deploy {
                        group: latest.to_string(),
                    },
                ),
                stage("Approve", StageKind::Approval),
                stage(
                    &format!("{stable}Deploy"),
                    StageKind::Deploy {
                        group: stable.to_string(),
                    },
                ),
            ],
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::multi_stage(&config.name, &config.latest_group, &config.stable_group)
    }

    /// Check the stage list against the known deployment groups.
    ///
    /// A pipeline starts with its only source stage, names each stage
    /// once, and deploys each known group at most once.
    pub fn validate(&self, groups: &HashSet<&str>) -> PipelineResult<()> {
        let invalid = |reason: String| PipelineError::InvalidDefinition {
            name: self.name.clone(),
            reason,
        };

        match self.stages.first() {
            Some(first) if first.kind == StageKind::Source => {}
            _ => return Err(invalid("first stage must be a source stage".to_string())),
        }

        let mut names = HashSet::new();
        let mut deployed = HashSet::new();
        for (index, stage) in self.stages.iter().enumerate() {
            if !names.insert(stage.name.as_str()) {
                return Err(invalid(format!("duplicate stage name {}", stage.name)));
            }
            match &stage.kind {
                StageKind::Source if index > 0 => {
                    return Err(invalid(format!("stage {} is a second source", stage.name)));
                }
                StageKind::Deploy { group } => {
                    if !groups.contains(group.as_str()) {
                        return Err(PipelineError::UnknownGroup(group.clone()));
                    }
                    if !deployed.insert(group.as_str()) {
                        return Err(invalid(format!("group {group} is deployed twice")));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// A fresh run with every stage pending.
    pub fn new_run(&self, run_id: impl Into<String>) -> PipelineRunRecord {
        let now = epoch_secs();
        PipelineRunRecord {
            run_id: run_id.into(),
            pipeline: self.name.clone(),
            status: RunStatus::Running,
            current_stage_index: 0,
            stages: self
                .stages
                .iter()
                .map(|s| StageRecord::pending(&s.name, s.kind.clone()))
                .collect(),
            created_at: now,
            updated_at: now,
        }
    }
}
