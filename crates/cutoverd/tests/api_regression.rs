//! API regression tests.
//!
//! Drives the full router over in-memory state: group status, shift
//! cancellation, pipeline runs and approval signals.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use cutover_api::build_router;
use cutover_core::{DeploymentConfig, RevisionArtifacts, ServiceRef, TargetRef};
use cutover_pipeline::{Orchestrator, OrchestratorSettings, PipelineDefinition, StaticSource};
use cutover_rollout::{AllowAll, DeploymentGroup, LocalScheduler, TrafficShifter};
use cutover_routing::{LocalRouter, RoutingTargetPair};
use cutover_state::StateStore;

struct Harness {
    router: Router,
    traffic: LocalRouter,
    orchestrator: Arc<Orchestrator>,
}

fn harness() -> Harness {
    let store = StateStore::open_in_memory().unwrap();
    let traffic = LocalRouter::new();
    let group = |id: &str, config: DeploymentConfig| {
        let pair = RoutingTargetPair::new(
            id,
            TargetRef::new(format!("{id}-a")),
            TargetRef::new(format!("{id}-b")),
            Arc::new(traffic.clone()),
        );
        Arc::new(
            DeploymentGroup::new(
                id,
                ServiceRef::new("main", id),
                config,
                pair,
                Arc::new(AllowAll),
                TrafficShifter::default(),
            )
            .with_store(store.clone()),
        )
    };
    let groups = vec![
        group("latest", DeploymentConfig::new("Canary50Percent2Minutes", 50, 2)),
        group("stable", DeploymentConfig::new("AllAtOnce", 100, 0)),
    ];

    let artifacts = RevisionArtifacts::new(
        "registry/app:v2",
        serde_json::json!({"containerDefinitions": [{"image": "<ImageURI>"}]}),
        BTreeMap::new(),
    );
    let orchestrator = Arc::new(
        Orchestrator::new(
            PipelineDefinition::multi_stage("multi-stage-canary", "latest", "stable"),
            groups,
            Arc::new(StaticSource::new(artifacts)),
            Arc::new(LocalScheduler::new()),
            store.clone(),
            OrchestratorSettings::default(),
        )
        .unwrap(),
    );

    Harness {
        router: build_router(store, orchestrator.clone()),
        traffic,
        orchestrator,
    }
}

async fn send(
    router: &Router,
    method: &str,
    uri: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let mut req = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            req = req.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).unwrap())
        }
        None => Body::empty(),
    };
    let resp = router.clone().oneshot(req.body(body).unwrap()).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

async fn wait_for_approval(orchestrator: &Orchestrator, run_id: &str) {
    while !orchestrator.approvals().is_pending(run_id) {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_for_finish(router: &Router, run_id: &str) -> serde_json::Value {
    loop {
        let (status, body) = send(router, "GET", &format!("/api/v1/runs/{run_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        if body["data"]["status"]["status"] != "running" {
            return body["data"].clone();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn api_lists_groups_at_full_primary() {
    let h = harness();

    let (status, body) = send(&h.router, "GET", "/api/v1/groups", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"].as_array().unwrap().len(), 2);

    let (status, body) = send(&h.router, "GET", "/api/v1/groups/latest", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["primary"], "latest-a");
    assert_eq!(body["data"]["weights"]["primary"], 100);
    assert_eq!(body["data"]["weights"]["secondary"], 0);
    assert_eq!(body["data"]["deployment_config"], "Canary50Percent2Minutes");
}

#[tokio::test]
async fn api_unknown_group_is_not_found() {
    let h = harness();

    let (status, body) = send(&h.router, "GET", "/api/v1/groups/canary", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "group not found");

    let (status, _) = send(&h.router, "POST", "/api/v1/groups/canary/reset", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn api_cancel_without_shift_conflicts() {
    let h = harness();
    let (status, body) = send(&h.router, "POST", "/api/v1/groups/stable/cancel", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("no active shift"));
}

#[tokio::test(start_paused = true)]
async fn api_run_through_approval() {
    let h = harness();

    let (status, body) = send(&h.router, "POST", "/api/v1/runs", None).await;
    assert_eq!(status, StatusCode::CREATED);
    let run_id = body["data"]["run_id"].as_str().unwrap().to_string();
    assert_eq!(body["data"]["stages"].as_array().unwrap().len(), 4);

    wait_for_approval(&h.orchestrator, &run_id).await;
    let (_, body) = send(&h.router, "GET", "/api/v1/approvals", None).await;
    assert_eq!(body["data"][0], run_id.as_str());

    let (status, _) = send(
        &h.router,
        "POST",
        &format!("/api/v1/runs/{run_id}/approval"),
        Some(serde_json::json!({"decision": "approve", "actor": "oncall"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let run = wait_for_finish(&h.router, &run_id).await;
    assert_eq!(run["status"]["status"], "succeeded");

    let (_, body) = send(&h.router, "GET", "/api/v1/groups/stable", None).await;
    assert_eq!(body["data"]["primary"], "stable-b");
    assert_eq!(body["data"]["state"], "succeeded");

    let (_, body) = send(&h.router, "GET", "/api/v1/groups/latest/shifts", None).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
    assert_eq!(body["data"][0]["outcome"]["state"], "succeeded");

    let (_, body) = send(&h.router, "GET", "/api/v1/runs", None).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn api_rejection_leaves_stable_untouched() {
    let h = harness();

    let (_, body) = send(&h.router, "POST", "/api/v1/runs", None).await;
    let run_id = body["data"]["run_id"].as_str().unwrap().to_string();
    wait_for_approval(&h.orchestrator, &run_id).await;

    let (status, _) = send(
        &h.router,
        "POST",
        &format!("/api/v1/runs/{run_id}/approval"),
        Some(serde_json::json!({"decision": "reject", "comment": "p99 regression"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let run = wait_for_finish(&h.router, &run_id).await;
    assert_eq!(run["status"]["status"], "failed");
    assert_eq!(run["status"]["stage"], "Approve");
    assert!(h.traffic.history("stable").is_empty());
}

#[tokio::test(start_paused = true)]
async fn api_cancel_rolls_back_the_latest_shift() {
    let h = harness();

    let (_, body) = send(&h.router, "POST", "/api/v1/runs", None).await;
    let run_id = body["data"]["run_id"].as_str().unwrap().to_string();

    let group = h.orchestrator.group("latest").unwrap().clone();
    while group.record().bake_deadline.is_none() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let (status, body) = send(&h.router, "POST", "/api/v1/groups/latest/cancel", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"]["shift_id"].is_string());

    let run = wait_for_finish(&h.router, &run_id).await;
    assert_eq!(run["status"]["stage"], "latestDeploy");
    assert_eq!(run["status"]["kind"], "rolled_back");
    assert_eq!(
        h.traffic.weights_for("latest").unwrap(),
        vec![(TargetRef::new("latest-a"), 100), (TargetRef::new("latest-b"), 0)]
    );
}
