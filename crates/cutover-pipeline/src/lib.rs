//! Multi-stage rollout pipelines.
//!
//! A pipeline run walks an ordered list of stages:
//!
//! ```text
//! Source → Deploy(latest) → Approval → Deploy(stable)
//! ```
//!
//! The source stage fetches and commits the revision artifacts, deploy
//! stages hand them to a [`DeploymentGroup`](cutover_rollout::DeploymentGroup)
//! and wait for the shift to finish, and the approval stage blocks until an
//! operator signals a decision through the [`ApprovalGate`]. The first
//! failing stage fails the run; later stages never execute.

pub mod approval;
pub mod error;
pub mod orchestrator;
pub mod source;
pub mod stage;

pub use approval::{ApprovalDecision, ApprovalGate, ApprovalOutcome, ApprovalSignal};
pub use error::{PipelineError, PipelineResult};
pub use orchestrator::{Orchestrator, OrchestratorSettings};
pub use source::{ArtifactSource, DirectorySource, StaticSource};
pub use stage::PipelineDefinition;
