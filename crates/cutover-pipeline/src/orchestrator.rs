//! Sequences pipeline stages across deployment groups.
//!
//! Runs are persisted after every stage transition. A run that was cut
//! short by a restart continues from its current stage: committed
//! artifacts are reused and a deploy stage whose shift had already been
//! accepted waits for that shift instead of starting another one.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use cutover_core::{CutoverConfig, GroupId, RunId, ServiceRef, epoch_secs, parse_duration};
use cutover_rollout::{DeploymentGroup, ServiceScheduler, ShiftOutcome};
use cutover_state::{
    FailureKind, PipelineRunRecord, RunStatus, ShiftState, StageKind, StageStatus, StateStore,
};

use crate::approval::{ApprovalGate, ApprovalOutcome, ApprovalSignal};
use crate::error::{PipelineError, PipelineResult};
use crate::source::ArtifactSource;
use crate::stage::PipelineDefinition;

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    /// `None` waits for an approval indefinitely.
    pub approval_timeout: Option<Duration>,
    pub readiness_timeout: Duration,
    pub readiness_poll: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            approval_timeout: None,
            readiness_timeout: Duration::from_secs(5 * 60),
            readiness_poll: Duration::from_secs(5),
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &CutoverConfig) -> Self {
        let defaults = Self::default();
        let pipeline = config.pipeline.as_ref();
        let duration = |value: Option<&String>, default: Duration| {
            value
                .and_then(|v| parse_duration(v))
                .unwrap_or(default)
        };
        Self {
            approval_timeout: config.approval_timeout(),
            readiness_timeout: duration(
                pipeline.and_then(|p| p.readiness_timeout.as_ref()),
                defaults.readiness_timeout,
            ),
            readiness_poll: duration(
                pipeline.and_then(|p| p.readiness_poll.as_ref()),
                defaults.readiness_poll,
            ),
        }
    }
}

/// Why a stage did not succeed.
struct StageFailure {
    kind: FailureKind,
    reason: String,
}

impl StageFailure {
    fn new(kind: FailureKind, reason: impl ToString) -> Self {
        Self {
            kind,
            reason: reason.to_string(),
        }
    }
}

impl From<PipelineError> for StageFailure {
    fn from(e: PipelineError) -> Self {
        StageFailure::new(FailureKind::Error, e)
    }
}

type StageResult = Result<(), StageFailure>;

pub struct Orchestrator {
    definition: PipelineDefinition,
    groups: HashMap<GroupId, Arc<DeploymentGroup>>,
    source: Arc<dyn ArtifactSource>,
    scheduler: Arc<dyn ServiceScheduler>,
    approvals: ApprovalGate,
    store: StateStore,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        definition: PipelineDefinition,
        groups: Vec<Arc<DeploymentGroup>>,
        source: Arc<dyn ArtifactSource>,
        scheduler: Arc<dyn ServiceScheduler>,
        store: StateStore,
        settings: OrchestratorSettings,
    ) -> PipelineResult<Self> {
        let groups: HashMap<GroupId, Arc<DeploymentGroup>> = groups
            .into_iter()
            .map(|g| (g.id().to_string(), g))
            .collect();
        let known: HashSet<&str> = groups.keys().map(String::as_str).collect();
        definition.validate(&known)?;

        Ok(Self {
            definition,
            groups,
            source,
            scheduler,
            approvals: ApprovalGate::new(),
            store,
            settings,
        })
    }

    pub fn definition(&self) -> &PipelineDefinition {
        &self.definition
    }

    pub fn approvals(&self) -> &ApprovalGate {
        &self.approvals
    }

    pub fn group(&self, id: &str) -> Option<&Arc<DeploymentGroup>> {
        self.groups.get(id)
    }

    /// Groups sorted by id.
    pub fn groups(&self) -> Vec<Arc<DeploymentGroup>> {
        let mut groups: Vec<_> = self.groups.values().cloned().collect();
        groups.sort_by(|a, b| a.id().cmp(b.id()));
        groups
    }

    pub fn get_run(&self, run_id: &str) -> PipelineResult<Option<PipelineRunRecord>> {
        Ok(self.store.get_run(run_id)?)
    }

    pub fn list_runs(&self) -> PipelineResult<Vec<PipelineRunRecord>> {
        Ok(self.store.list_runs()?)
    }

    /// Persist a new run with every stage pending.
    pub fn create_run(&self) -> PipelineResult<PipelineRunRecord> {
        let run = self.definition.new_run(Uuid::new_v4().to_string());
        self.store.put_run(&run)?;
        info!(run = %run.run_id, pipeline = %run.pipeline, "pipeline run created");
        Ok(run)
    }

    /// Create a run and drive it to completion.
    pub async fn run(&self) -> PipelineResult<PipelineRunRecord> {
        let run = self.create_run()?;
        self.execute(&run.run_id).await
    }

    /// Create a run and drive it on a background task.
    pub fn trigger(self: &Arc<Self>) -> PipelineResult<PipelineRunRecord> {
        let run = self.create_run()?;
        self.spawn_execute(run.run_id.clone());
        Ok(run)
    }

    /// Continue every run that had not finished, each on its own task.
    pub fn resume_unfinished(self: &Arc<Self>) -> PipelineResult<Vec<RunId>> {
        let runs = self.store.list_unfinished_runs()?;
        let ids: Vec<RunId> = runs.into_iter().map(|r| r.run_id).collect();
        for run_id in &ids {
            info!(run = %run_id, "resuming pipeline run");
            self.spawn_execute(run_id.clone());
        }
        Ok(ids)
    }

    /// Forward an operator's approval decision to a waiting run.
    pub fn signal_approval(&self, run_id: &str, signal: ApprovalSignal) -> PipelineResult<()> {
        self.approvals.signal(run_id, signal)
    }

    fn spawn_execute(self: &Arc<Self>, run_id: RunId) {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = orchestrator.execute(&run_id).await {
                error!(run = %run_id, error = %e, "pipeline run aborted");
            }
        });
    }

    /// Drive a run from its current stage until it finishes.
    pub async fn execute(&self, run_id: &str) -> PipelineResult<PipelineRunRecord> {
        let mut run = self
            .store
            .get_run(run_id)?
            .ok_or_else(|| PipelineError::RunNotFound(run_id.to_string()))?;

        while !run.is_finished() {
            let index = run.current_stage_index;
            if index >= run.stages.len() {
                run.status = RunStatus::Succeeded;
                self.save(&mut run)?;
                break;
            }

            let stage = &mut run.stages[index];
            stage.status = StageStatus::Running;
            stage.started_at.get_or_insert_with(epoch_secs);
            let name = stage.name.clone();
            let kind = stage.kind.clone();
            self.save(&mut run)?;
            info!(run = %run.run_id, stage = %name, "stage started");

            let result = match &kind {
                StageKind::Source => self.source_stage(&mut run, index).await,
                StageKind::Deploy { group } => self.deploy_stage(&mut run, index, group).await,
                StageKind::Approval => self.approval_stage(&mut run, index).await,
            };

            let stage = &mut run.stages[index];
            stage.finished_at = Some(epoch_secs());
            match result {
                Ok(()) => {
                    stage.status = StageStatus::Succeeded;
                    run.current_stage_index += 1;
                    if run.current_stage_index == run.stages.len() {
                        run.status = RunStatus::Succeeded;
                        info!(run = %run.run_id, "pipeline run succeeded");
                    } else {
                        info!(run = %run.run_id, stage = %name, "stage succeeded");
                    }
                }
                Err(failure) => {
                    stage.status = StageStatus::Failed {
                        kind: failure.kind,
                        reason: failure.reason.clone(),
                    };
                    run.status = RunStatus::Failed {
                        stage: name.clone(),
                        kind: failure.kind,
                    };
                    warn!(
                        run = %run.run_id,
                        stage = %name,
                        kind = ?failure.kind,
                        reason = %failure.reason,
                        "pipeline run failed"
                    );
                }
            }
            self.save(&mut run)?;
        }

        Ok(run)
    }

    fn save(&self, run: &mut PipelineRunRecord) -> PipelineResult<()> {
        run.updated_at = epoch_secs();
        self.store.put_run(run)?;
        Ok(())
    }

    /// Fetch and commit the revision. Committed artifacts are never refetched.
    async fn source_stage(&self, run: &mut PipelineRunRecord, index: usize) -> StageResult {
        if run.stages[index].artifacts.is_some() {
            return Ok(());
        }
        let artifacts = self
            .source
            .fetch_revision()
            .await
            .map_err(|e| StageFailure::new(FailureKind::Error, PipelineError::Source(format!("{e:#}"))))?;
        info!(run = %run.run_id, revision = %artifacts.revision, "artifacts committed");
        run.commit_artifacts(index, artifacts)
            .map_err(PipelineError::from)?;
        self.save(run)?;
        Ok(())
    }

    async fn approval_stage(&self, run: &mut PipelineRunRecord, index: usize) -> StageResult {
        let rx = self.approvals.register(&run.run_id);
        run.stages[index].status = StageStatus::AwaitingApproval;
        if let Err(e) = self.save(run) {
            self.approvals.cancel(&run.run_id);
            return Err(e.into());
        }
        info!(run = %run.run_id, timeout = ?self.settings.approval_timeout, "awaiting approval");

        match self
            .approvals
            .wait(&run.run_id, rx, self.settings.approval_timeout)
            .await
        {
            ApprovalOutcome::Approved(signal) => {
                info!(run = %run.run_id, actor = ?signal.actor, "approved");
                Ok(())
            }
            ApprovalOutcome::Rejected(signal) => Err(StageFailure::new(
                FailureKind::Rejected,
                PipelineError::ApprovalRejected {
                    comment: signal.comment,
                },
            )),
            ApprovalOutcome::TimedOut => Err(StageFailure::new(
                FailureKind::TimedOut,
                PipelineError::ApprovalTimedOut(self.settings.approval_timeout.unwrap_or_default()),
            )),
            ApprovalOutcome::Abandoned => Err(StageFailure::new(
                FailureKind::Error,
                "approval abandoned",
            )),
        }
    }

    /// Take the group's shift slot, register the revision on its idle
    /// target, wait for it, then shift.
    ///
    /// The slot is held from the start so no other shift can be carrying
    /// traffic to the target while its revision is replaced.
    async fn deploy_stage(
        &self,
        run: &mut PipelineRunRecord,
        index: usize,
        group_id: &str,
    ) -> StageResult {
        let group = self
            .groups
            .get(group_id)
            .ok_or_else(|| PipelineError::UnknownGroup(group_id.to_string()))?;

        if let Some(shift_id) = run.stages[index].shift_id.clone() {
            info!(run = %run.run_id, group = group_id, shift = %shift_id, "waiting for resumed shift");
            let state = group.wait_for(&shift_id).await.map_err(PipelineError::from)?;
            return shift_state_result(state);
        }

        let artifacts = run
            .artifacts()
            .cloned()
            .ok_or_else(|| PipelineError::MissingArtifacts(run.stages[index].name.clone()))?;
        let ticket = group
            .begin(&artifacts.revision)
            .map_err(PipelineError::from)?;

        let target = group.pair().secondary();
        let prepared = match self
            .scheduler
            .register_revision(
                group.service(),
                &target,
                &artifacts,
                artifacts.app_spec_for(group_id),
            )
            .await
        {
            Ok(()) => self.await_ready(group.service()).await,
            Err(e) => Err(PipelineError::from(e)),
        };
        if let Err(e) = prepared {
            if let Err(release) = group.abandon(ticket) {
                warn!(run = %run.run_id, group = group_id, error = %release, "failed to release group");
            }
            return Err(e.into());
        }

        run.stages[index].shift_id = Some(ticket.shift_id().to_string());
        self.save(run)?;

        let outcome = group.drive(ticket).await.map_err(PipelineError::from)?;
        match outcome {
            ShiftOutcome::Succeeded => Ok(()),
            ShiftOutcome::RolledBack { reason } => {
                Err(StageFailure::new(FailureKind::RolledBack, reason))
            }
            ShiftOutcome::Failed { reason } => {
                Err(StageFailure::new(FailureKind::Inconsistent, reason))
            }
        }
    }

    async fn await_ready(&self, service: &ServiceRef) -> PipelineResult<()> {
        let started = Instant::now();
        loop {
            if self.scheduler.revision_ready(service).await? {
                return Ok(());
            }
            let waited = started.elapsed();
            if waited >= self.settings.readiness_timeout {
                return Err(PipelineError::RevisionNotReady {
                    service: service.clone(),
                    waited,
                });
            }
            tokio::time::sleep(self.settings.readiness_poll).await;
        }
    }
}

fn shift_state_result(state: ShiftState) -> StageResult {
    match state {
        ShiftState::Succeeded => Ok(()),
        ShiftState::RolledBack { reason } => Err(StageFailure::new(FailureKind::RolledBack, reason)),
        ShiftState::Failed { reason } => Err(StageFailure::new(FailureKind::Inconsistent, reason)),
        ShiftState::Idle | ShiftState::Shifting => Err(StageFailure::new(
            FailureKind::Error,
            "shift ended without a terminal state",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use cutover_core::{DeploymentConfig, RevisionArtifacts, TargetRef, Weights};
    use cutover_routing::{LocalRouter, RoutingTargetPair};
    use cutover_rollout::{
        AllowAll, FnValidator, HookDecision, LifecycleCheckpoint, LifecycleValidator,
        LocalScheduler, TrafficShifter,
    };

    use crate::source::StaticSource;

    struct Fixture {
        router: LocalRouter,
        scheduler: LocalScheduler,
        store: StateStore,
        latest: Arc<DeploymentGroup>,
        stable: Arc<DeploymentGroup>,
    }

    fn artifacts() -> RevisionArtifacts {
        let mut specs = BTreeMap::new();
        specs.insert("latest".to_string(), "version: 0.0 # latest".to_string());
        specs.insert("stable".to_string(), "version: 0.0 # stable".to_string());
        RevisionArtifacts::new(
            "registry/app:v2",
            serde_json::json!({"containerDefinitions": [{"image": "<ImageURI>"}]}),
            specs,
        )
    }

    fn deployment_group(
        id: &str,
        router: &LocalRouter,
        store: &StateStore,
        validator: Arc<dyn LifecycleValidator>,
    ) -> Arc<DeploymentGroup> {
        let pair = RoutingTargetPair::new(
            id,
            TargetRef::new(format!("{id}-a")),
            TargetRef::new(format!("{id}-b")),
            Arc::new(router.clone()),
        );
        Arc::new(
            DeploymentGroup::new(
                id,
                ServiceRef::new("main", id),
                DeploymentConfig::new("Canary50Percent2Minutes", 50, 2),
                pair,
                validator,
                TrafficShifter::default(),
            )
            .with_store(store.clone()),
        )
    }

    fn fixture(latest_validator: Arc<dyn LifecycleValidator>) -> Fixture {
        let router = LocalRouter::new();
        let store = StateStore::open_in_memory().unwrap();
        Fixture {
            latest: deployment_group("latest", &router, &store, latest_validator),
            stable: deployment_group("stable", &router, &store, Arc::new(AllowAll)),
            scheduler: LocalScheduler::new(),
            router,
            store,
        }
    }

    fn orchestrator_with(
        fx: &Fixture,
        source: Arc<dyn ArtifactSource>,
        settings: OrchestratorSettings,
    ) -> Arc<Orchestrator> {
        Arc::new(
            Orchestrator::new(
                PipelineDefinition::multi_stage("multi-stage-canary", "latest", "stable"),
                vec![fx.latest.clone(), fx.stable.clone()],
                source,
                Arc::new(fx.scheduler.clone()),
                fx.store.clone(),
                settings,
            )
            .unwrap(),
        )
    }

    fn orchestrator(fx: &Fixture) -> Arc<Orchestrator> {
        orchestrator_with(
            fx,
            Arc::new(StaticSource::new(artifacts())),
            OrchestratorSettings::default(),
        )
    }

    /// Start a run in the background and wait until it asks for approval.
    async fn run_until_approval(
        orch: &Arc<Orchestrator>,
    ) -> (RunId, tokio::task::JoinHandle<PipelineResult<PipelineRunRecord>>) {
        let run = orch.create_run().unwrap();
        let run_id = run.run_id.clone();
        let driver = orch.clone();
        let id = run_id.clone();
        let handle = tokio::spawn(async move { driver.execute(&id).await });
        while !orch.approvals().is_pending(&run_id) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        (run_id, handle)
    }

    struct CountingSource {
        fetches: AtomicU32,
    }

    #[async_trait]
    impl ArtifactSource for CountingSource {
        async fn fetch_revision(&self) -> anyhow::Result<RevisionArtifacts> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(artifacts())
        }
    }

    struct BrokenSource;

    #[async_trait]
    impl ArtifactSource for BrokenSource {
        async fn fetch_revision(&self) -> anyhow::Result<RevisionArtifacts> {
            anyhow::bail!("repository unreachable")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn approved_run_deploys_both_groups() {
        let fx = fixture(Arc::new(AllowAll));
        let orch = orchestrator(&fx);

        let (run_id, handle) = run_until_approval(&orch).await;
        assert_eq!(fx.latest.pair().primary(), TargetRef::new("latest-b"));
        assert_eq!(fx.stable.state(), ShiftState::Idle);
        let waiting = orch.get_run(&run_id).unwrap().unwrap();
        assert_eq!(waiting.stages[2].status, StageStatus::AwaitingApproval);

        orch.signal_approval(&run_id, ApprovalSignal::approve()).unwrap();
        let run = handle.await.unwrap().unwrap();

        assert_eq!(run.status, RunStatus::Succeeded);
        assert!(run.stages.iter().all(|s| s.status == StageStatus::Succeeded));
        assert_eq!(fx.stable.pair().primary(), TargetRef::new("stable-b"));
        assert_eq!(fx.stable.pair().weights(), Weights::all_primary());

        let stable = fx.scheduler.service(fx.stable.service()).unwrap();
        assert_eq!(stable.target, Some(TargetRef::new("stable-b")));
        assert_eq!(stable.app_spec.as_deref(), Some("version: 0.0 # stable"));
        assert_eq!(stable.revision.as_deref(), Some(artifacts().revision.as_str()));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_approval_never_touches_stable() {
        let fx = fixture(Arc::new(AllowAll));
        let orch = orchestrator(&fx);

        let (run_id, handle) = run_until_approval(&orch).await;
        orch.signal_approval(&run_id, ApprovalSignal::reject("latency regression"))
            .unwrap();
        let run = handle.await.unwrap().unwrap();

        assert_eq!(
            run.status,
            RunStatus::Failed {
                stage: "Approve".to_string(),
                kind: FailureKind::Rejected,
            }
        );
        assert_eq!(run.stages[3].status, StageStatus::Pending);
        assert_eq!(fx.stable.state(), ShiftState::Idle);
        assert!(fx.router.history("stable").is_empty());
        assert!(fx.scheduler.service(fx.stable.service()).is_none());

        // Earlier stages are not reverted.
        assert_eq!(fx.latest.pair().primary(), TargetRef::new("latest-b"));
        assert_eq!(fx.store.get_run(&run_id).unwrap().unwrap(), run);
    }

    #[tokio::test(start_paused = true)]
    async fn rolled_back_shift_fails_the_deploy_stage() {
        let reject = FnValidator::new(|checkpoint, _| async move {
            if checkpoint == LifecycleCheckpoint::AfterAllowTraffic {
                HookDecision::reject("5xx rate above threshold")
            } else {
                HookDecision::Allow
            }
        });
        let fx = fixture(Arc::new(reject));
        let orch = orchestrator(&fx);

        let run = orch.run().await.unwrap();

        assert_eq!(
            run.status,
            RunStatus::Failed {
                stage: "latestDeploy".to_string(),
                kind: FailureKind::RolledBack,
            }
        );
        assert!(run.stages[1].shift_id.is_some());
        assert_eq!(run.stages[2].status, StageStatus::Pending);
        assert!(orch.approvals().pending().is_empty());
        assert_eq!(fx.latest.pair().weights(), Weights::all_primary());
        assert_eq!(fx.latest.pair().primary(), TargetRef::new("latest-a"));
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_approval_times_out() {
        let fx = fixture(Arc::new(AllowAll));
        let orch = orchestrator_with(
            &fx,
            Arc::new(StaticSource::new(artifacts())),
            OrchestratorSettings {
                approval_timeout: Some(Duration::from_secs(72 * 3600)),
                ..Default::default()
            },
        );

        let run = orch.run().await.unwrap();

        assert_eq!(
            run.status,
            RunStatus::Failed {
                stage: "Approve".to_string(),
                kind: FailureKind::TimedOut,
            }
        );
        assert!(orch.approvals().pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn source_failure_stops_the_run() {
        let fx = fixture(Arc::new(AllowAll));
        let orch = orchestrator_with(&fx, Arc::new(BrokenSource), OrchestratorSettings::default());

        let run = orch.run().await.unwrap();

        assert!(matches!(
            &run.status,
            RunStatus::Failed { stage, kind: FailureKind::Error } if stage == "Source"
        ));
        match &run.stages[0].status {
            StageStatus::Failed { reason, .. } => assert!(reason.contains("repository unreachable")),
            other => panic!("unexpected status {other:?}"),
        }
        assert!(fx.router.history("latest").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn revision_that_never_becomes_ready_moves_no_traffic() {
        let fx = fixture(Arc::new(AllowAll));
        fx.scheduler.set_ready_after(u32::MAX);
        let orch = orchestrator_with(
            &fx,
            Arc::new(StaticSource::new(artifacts())),
            OrchestratorSettings {
                readiness_timeout: Duration::from_secs(60),
                readiness_poll: Duration::from_secs(5),
                ..Default::default()
            },
        );

        let run = orch.run().await.unwrap();

        assert!(matches!(
            &run.status,
            RunStatus::Failed { stage, kind: FailureKind::Error } if stage == "latestDeploy"
        ));
        assert!(run.stages[1].shift_id.is_none());
        assert!(fx.router.history("latest").is_empty());
        assert_eq!(fx.latest.state(), ShiftState::Idle);

        // The slot taken for the shift is released without archiving anything.
        assert!(fx.latest.active_shift_id().is_none());
        assert!(fx.latest.shifts().is_empty());
        let record = fx.store.get_group("latest").unwrap().unwrap();
        assert_eq!(record.state, ShiftState::Idle);
        assert!(record.active_shift_id.is_none());
        assert!(fx.latest.begin("rev-next").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn busy_group_keeps_its_target_revision() {
        let fx = fixture(Arc::new(AllowAll));
        let orch = orchestrator(&fx);
        let held = fx.latest.begin("rev-inflight").unwrap();

        let run = orch.run().await.unwrap();

        assert_eq!(
            run.status,
            RunStatus::Failed {
                stage: "latestDeploy".to_string(),
                kind: FailureKind::Error,
            }
        );
        match &run.stages[1].status {
            StageStatus::Failed { reason, .. } => assert!(reason.contains("in progress")),
            other => panic!("unexpected status {other:?}"),
        }
        assert!(fx.scheduler.service(fx.latest.service()).is_none());
        assert_eq!(fx.latest.active_shift_id().as_deref(), Some(held.shift_id()));
        assert_eq!(fx.latest.state(), ShiftState::Shifting);
        assert!(fx.router.history("latest").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn resumed_run_reuses_committed_artifacts() {
        let fx = fixture(Arc::new(AllowAll));
        let source = Arc::new(CountingSource {
            fetches: AtomicU32::new(0),
        });
        let orch = orchestrator_with(&fx, source.clone(), OrchestratorSettings::default());

        // A run that committed its artifacts and then stopped.
        let mut run = orch.definition().new_run("run-restarted");
        run.commit_artifacts(0, artifacts()).unwrap();
        run.stages[0].status = StageStatus::Succeeded;
        run.current_stage_index = 0;
        fx.store.put_run(&run).unwrap();

        let resumed = orch.resume_unfinished().unwrap();
        assert_eq!(resumed, vec!["run-restarted".to_string()]);
        while !orch.approvals().is_pending("run-restarted") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(source.fetches.load(Ordering::SeqCst), 0);
        orch.signal_approval("run-restarted", ApprovalSignal::reject("stop here"))
            .unwrap();
        while !orch.get_run("run-restarted").unwrap().unwrap().is_finished() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(fx.latest.pair().primary(), TargetRef::new("latest-b"));
    }
}
