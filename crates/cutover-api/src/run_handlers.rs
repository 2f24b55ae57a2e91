//! REST API handlers for pipeline runs and approvals.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;

use cutover_pipeline::{ApprovalSignal, PipelineError};

use crate::ApiState;
use crate::handlers::{ApiResponse, error_response};

/// GET /api/v1/runs
pub async fn list_runs(State(state): State<ApiState>) -> impl IntoResponse {
    match state.orchestrator.list_runs() {
        Ok(runs) => ApiResponse::ok(runs).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// GET /api/v1/runs/:id
pub async fn get_run(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.orchestrator.get_run(&id) {
        Ok(Some(run)) => ApiResponse::ok(run).into_response(),
        Ok(None) => error_response("run not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// POST /api/v1/runs
pub async fn trigger_run(State(state): State<ApiState>) -> impl IntoResponse {
    match state.orchestrator.trigger() {
        Ok(run) => (StatusCode::CREATED, ApiResponse::ok(run)).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// POST /api/v1/runs/:id/approval
pub async fn signal_approval(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(signal): Json<ApprovalSignal>,
) -> impl IntoResponse {
    match state.orchestrator.get_run(&id) {
        Ok(Some(_)) => {}
        Ok(None) => return error_response("run not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => {
            return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
                .into_response();
        }
    }

    let decision = signal.decision;
    match state.orchestrator.signal_approval(&id, signal) {
        Ok(()) => ApiResponse::ok(serde_json::json!({ "run_id": id, "decision": decision }))
            .into_response(),
        Err(e @ PipelineError::NoPendingApproval(_)) => {
            error_response(&e.to_string(), StatusCode::CONFLICT).into_response()
        }
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// GET /api/v1/approvals
pub async fn list_approvals(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.orchestrator.approvals().pending()).into_response()
}
