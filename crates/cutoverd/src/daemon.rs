//! Daemon assembly. Builds groups, validators and the orchestrator
//! from `cutover.toml`, recovers persisted state, and serves the API.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use tracing::{error, info, warn};

use cutover_core::config::GroupConfig;
use cutover_core::{CutoverConfig, ServiceRef};
use cutover_pipeline::{
    DirectorySource, Orchestrator, OrchestratorSettings, PipelineDefinition,
};
use cutover_rollout::{
    ChainValidator, ConfigCatalog, DeploymentGroup, HttpHookValidator, LifecycleCheckpoint,
    LifecycleValidator, LocalScheduler, RulePromotionHook, Scoped, ShifterSettings,
    TrafficShifter,
};
use cutover_routing::{LocalRouter, RoutingTargetPair};
use cutover_state::StateStore;

/// Every subsystem the daemon runs.
pub struct Daemon {
    pub store: StateStore,
    pub router: LocalRouter,
    pub scheduler: LocalScheduler,
    pub orchestrator: Arc<Orchestrator>,
}

/// Wire groups, validators and the pipeline together.
pub fn assemble(config: &CutoverConfig, store: StateStore) -> anyhow::Result<Daemon> {
    let Some(pipeline) = &config.pipeline else {
        bail!("a [pipeline] section is required to run the daemon");
    };
    let Some(source) = &config.source else {
        bail!("a [source] section is required to run the daemon");
    };

    let router = LocalRouter::new();
    let scheduler = LocalScheduler::new();
    let catalog = ConfigCatalog::new(&config.deployment_configs)?;
    let settings = ShifterSettings::from_config(&config.rollout.clone().unwrap_or_default());

    let mut groups = Vec::with_capacity(config.groups.len());
    for group_cfg in &config.groups {
        let deployment = catalog.resolve(&group_cfg.deployment_config)?;
        let (primary, secondary) = group_cfg.target_refs();
        let pair = RoutingTargetPair::new(
            group_cfg.id.as_str(),
            primary,
            secondary,
            Arc::new(router.clone()),
        );
        let validator = build_validator(group_cfg, &router, &scheduler)
            .with_context(|| format!("group {}", group_cfg.id))?;

        let group = DeploymentGroup::new(
            group_cfg.id.as_str(),
            group_cfg.service_ref(),
            deployment,
            pair,
            validator,
            TrafficShifter::new(settings.clone()),
        )
        .with_store(store.clone());
        info!(
            group = %group_cfg.id,
            service = %group_cfg.service_ref(),
            config = %group_cfg.deployment_config,
            "deployment group configured"
        );
        groups.push(Arc::new(group));
    }

    let orchestrator = Orchestrator::new(
        PipelineDefinition::from_config(pipeline),
        groups,
        Arc::new(DirectorySource::from_config(source)),
        Arc::new(scheduler.clone()),
        store.clone(),
        OrchestratorSettings::from_config(config),
    )?;

    Ok(Daemon {
        store,
        router,
        scheduler,
        orchestrator: Arc::new(orchestrator),
    })
}

/// The group's validator chain: HTTP hook first, then rule promotion.
fn build_validator(
    group: &GroupConfig,
    router: &LocalRouter,
    scheduler: &LocalScheduler,
) -> anyhow::Result<Arc<dyn LifecycleValidator>> {
    let mut chain = ChainValidator::new();

    if let Some(hook) = &group.hook {
        let http: Arc<dyn LifecycleValidator> =
            Arc::new(HttpHookValidator::new(&hook.address, &hook.path));
        chain = match &hook.checkpoints {
            Some(names) => {
                let checkpoints = parse_checkpoints(names)?;
                chain.with(Arc::new(Scoped::new(checkpoints, http)))
            }
            None => chain.with(http),
        };
    }

    if let Some(promotion) = &group.promotion {
        let checkpoint: LifecycleCheckpoint = promotion
            .checkpoint
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?;
        let priorities = promotion
            .rules
            .iter()
            .map(|r| (r.rule.clone(), r.priority))
            .collect();
        let mut hook = RulePromotionHook::new(checkpoint, Arc::new(router.clone()), priorities);
        if let Some(retired) = &promotion.scale_down {
            hook = hook.with_scale_down(
                Arc::new(scheduler.clone()),
                ServiceRef::new(&retired.cluster, &retired.service),
            );
        }
        chain = chain.with(Arc::new(hook));
    }

    Ok(Arc::new(chain))
}

fn parse_checkpoints(names: &[String]) -> anyhow::Result<Vec<LifecycleCheckpoint>> {
    names
        .iter()
        .map(|n| n.parse().map_err(|e: String| anyhow::anyhow!(e)))
        .collect()
}

/// Recover every group and keep driving shifts caught in their bake wait.
///
/// Returns how many shifts were resumed.
pub async fn recover_groups(orchestrator: &Orchestrator) -> anyhow::Result<usize> {
    let mut resumed = 0;
    for group in orchestrator.groups() {
        let Some(ticket) = group.recover().await? else {
            continue;
        };
        info!(group = %group.id(), shift = %ticket.shift_id(), "driving recovered shift");
        resumed += 1;
        tokio::spawn(async move {
            match group.drive(ticket).await {
                Ok(outcome) => info!(group = %group.id(), ?outcome, "recovered shift finished"),
                Err(e) => error!(group = %group.id(), error = %e, "recovered shift failed"),
            }
        });
    }
    Ok(resumed)
}

/// Run the daemon until Ctrl-C.
pub async fn run_daemon(config: CutoverConfig, port: u16, data_dir: PathBuf) -> anyhow::Result<()> {
    info!("cutover daemon starting");

    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("cutover.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let daemon = assemble(&config, store)?;

    // Groups first: a resumed run may be waiting on a recovered shift.
    let shifts = recover_groups(&daemon.orchestrator).await?;
    let runs = daemon.orchestrator.resume_unfinished()?;
    info!(
        groups = daemon.orchestrator.groups().len(),
        resumed_shifts = shifts,
        resumed_runs = runs.len(),
        "state recovered"
    );

    let router = cutover_api::build_router(daemon.store.clone(), daemon.orchestrator.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
        })
        .await?;

    info!("cutover daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use cutover_core::{TargetRef, Weights};
    use cutover_pipeline::ApprovalSignal;
    use cutover_state::{RunStatus, ShiftState};

    fn config_toml(source_dir: &std::path::Path, extra: &str) -> String {
        format!(
            r#"
[source]
path = "{}"
image = "registry/app:v2"

[pipeline]
name = "multi-stage-canary"
latest_group = "latest"
stable_group = "stable"
readiness_poll = "1s"

[[groups]]
id = "latest"
cluster = "main"
service = "latest"
targets = ["latest-a", "latest-b"]
deployment_config = "AllAtOnce"

[[groups]]
id = "stable"
cluster = "main"
service = "stable"
targets = ["stable-a", "stable-b"]
deployment_config = "Canary10Percent5Minutes"
{extra}
"#,
            source_dir.display()
        )
    }

    fn source_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("taskdef.json"),
            r#"{"containerDefinitions": [{"image": "<ImageURI>"}]}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("appspec-stable.yaml"), "version: 0.0").unwrap();
        dir
    }

    fn assemble_str(toml: &str, store: StateStore) -> anyhow::Result<Daemon> {
        let config = CutoverConfig::from_toml_str(toml)?;
        assemble(&config, store)
    }

    #[tokio::test]
    async fn recovery_pushes_all_primary_weights() {
        let dir = source_dir();
        let daemon =
            assemble_str(&config_toml(dir.path(), ""), StateStore::open_in_memory().unwrap())
                .unwrap();

        assert_eq!(recover_groups(&daemon.orchestrator).await.unwrap(), 0);
        assert_eq!(
            daemon.router.weights_for("stable").unwrap(),
            vec![(TargetRef::new("stable-a"), 100), (TargetRef::new("stable-b"), 0)]
        );
        let group = daemon.orchestrator.group("stable").unwrap();
        assert_eq!(group.config().name, "Canary10Percent5Minutes");
    }

    #[test]
    fn pipeline_section_is_required() {
        let toml = r#"
[[groups]]
id = "latest"
cluster = "main"
service = "latest"
targets = ["a", "b"]
deployment_config = "AllAtOnce"
"#;
        let err = assemble_str(toml, StateStore::open_in_memory().unwrap())
            .err()
            .unwrap();
        assert!(err.to_string().contains("[pipeline]"));
    }

    #[test]
    fn unknown_hook_checkpoint_is_rejected() {
        let dir = source_dir();
        let extra = r#"
[groups.hook]
address = "127.0.0.1:9000"
path = "/hooks"
checkpoints = ["AfterEverything"]
"#;
        assert!(
            assemble_str(&config_toml(dir.path(), extra), StateStore::open_in_memory().unwrap())
                .is_err()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn pipeline_promotes_rules_and_retires_the_old_service() {
        let dir = source_dir();
        let extra = r#"
[groups.promotion]
checkpoint = "AfterAllowTraffic"
rules = [{ rule = "stable-rule", priority = 1 }, { rule = "latest-rule", priority = 2 }]
scale_down = { cluster = "main", service = "legacy" }
"#;
        let daemon =
            assemble_str(&config_toml(dir.path(), extra), StateStore::open_in_memory().unwrap())
                .unwrap();
        let orchestrator = daemon.orchestrator.clone();
        recover_groups(&orchestrator).await.unwrap();

        let run = orchestrator.trigger().unwrap();
        while !orchestrator.approvals().is_pending(&run.run_id) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        orchestrator
            .signal_approval(&run.run_id, ApprovalSignal::approve())
            .unwrap();
        loop {
            let current = orchestrator.get_run(&run.run_id).unwrap().unwrap();
            if current.is_finished() {
                assert_eq!(current.status, RunStatus::Succeeded);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let rules = daemon.router.rule_priorities();
        assert_eq!(rules.get("stable-rule"), Some(&1));
        assert_eq!(rules.get("latest-rule"), Some(&2));
        let legacy = daemon
            .scheduler
            .service(&ServiceRef::new("main", "legacy"))
            .unwrap();
        assert_eq!(legacy.desired_count, Some(0));

        let stable = orchestrator.group("stable").unwrap();
        assert_eq!(stable.state(), ShiftState::Succeeded);
        assert_eq!(stable.pair().weights(), Weights::all_primary());
        assert_eq!(stable.pair().primary(), TargetRef::new("stable-b"));
    }

    #[tokio::test(start_paused = true)]
    async fn restart_resumes_a_shift_in_its_bake_wait() {
        let dir = source_dir();
        let store = StateStore::open_in_memory().unwrap();
        let toml = config_toml(dir.path(), "");

        // First daemon: the stable shift reaches its 5 minute bake wait.
        let first = assemble_str(&toml, store.clone()).unwrap();
        recover_groups(&first.orchestrator).await.unwrap();
        let stable = first.orchestrator.group("stable").unwrap().clone();
        let shifting = stable.clone();
        let handle = tokio::spawn(async move { shifting.shift("rev-2").await });
        while stable.record().bake_deadline.is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();

        // Second daemon over the same store.
        let second = assemble_str(&toml, store).unwrap();
        assert_eq!(recover_groups(&second.orchestrator).await.unwrap(), 1);
        let group = second.orchestrator.group("stable").unwrap();
        let shift_id = group.active_shift_id().unwrap();
        assert_eq!(
            second.router.weights_for("stable").unwrap(),
            vec![(TargetRef::new("stable-a"), 90), (TargetRef::new("stable-b"), 10)]
        );

        let state = group.wait_for(&shift_id).await.unwrap();
        assert_eq!(state, ShiftState::Succeeded);
        assert_eq!(group.pair().primary(), TargetRef::new("stable-b"));
    }
}
