//! Group handlers.
//!
//! Groups live in the orchestrator; archived shifts are read from the
//! state store so they survive restarts.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;

use cutover_core::{ServiceRef, TargetRef, Weights};
use cutover_rollout::{DeploymentGroup, ShiftError};
use cutover_state::ShiftState;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
pub(crate) struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub(crate) fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

pub(crate) fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

pub(crate) fn shift_error_status(e: &ShiftError) -> StatusCode {
    match e {
        ShiftError::ShiftInProgress(_)
        | ShiftError::RequiresIntervention(_)
        | ShiftError::NoActiveShift(_) => StatusCode::CONFLICT,
        ShiftError::UnknownShift { .. } | ShiftError::UnknownConfig(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Serializable group status for API responses.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct GroupStatus {
    pub group_id: String,
    pub service: ServiceRef,
    pub deployment_config: String,
    #[serde(flatten)]
    pub state: ShiftState,
    pub primary: TargetRef,
    pub secondary: TargetRef,
    pub weights: Weights,
    pub active_shift_id: Option<String>,
    pub revision: Option<String>,
    pub bake_deadline: Option<u64>,
    pub updated_at: u64,
}

impl From<&DeploymentGroup> for GroupStatus {
    fn from(group: &DeploymentGroup) -> Self {
        let record = group.record();
        Self {
            group_id: record.group_id,
            service: record.service,
            deployment_config: group.config().name.clone(),
            state: record.state,
            primary: record.pair.primary,
            secondary: record.pair.secondary,
            weights: record.pair.weights,
            active_shift_id: record.active_shift_id,
            revision: record.revision,
            bake_deadline: record.bake_deadline,
            updated_at: record.updated_at,
        }
    }
}

/// GET /api/v1/groups
pub async fn list_groups(State(state): State<ApiState>) -> impl IntoResponse {
    let groups: Vec<GroupStatus> = state
        .orchestrator
        .groups()
        .iter()
        .map(|g| GroupStatus::from(g.as_ref()))
        .collect();
    ApiResponse::ok(groups).into_response()
}

/// GET /api/v1/groups/:id
pub async fn get_group(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.group(&id) {
        Some(group) => ApiResponse::ok(GroupStatus::from(group.as_ref())).into_response(),
        None => error_response("group not found", StatusCode::NOT_FOUND).into_response(),
    }
}

/// GET /api/v1/groups/:id/shifts
pub async fn list_shifts(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if state.orchestrator.group(&id).is_none() {
        return error_response("group not found", StatusCode::NOT_FOUND).into_response();
    }
    match state.store.list_shifts_for_group(&id) {
        Ok(shifts) => ApiResponse::ok(shifts).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// POST /api/v1/groups/:id/cancel
pub async fn cancel_shift(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let Some(group) = state.orchestrator.group(&id) else {
        return error_response("group not found", StatusCode::NOT_FOUND).into_response();
    };
    match group.cancel() {
        Ok(shift_id) => {
            tracing::info!(group = %id, shift = %shift_id, "cancel requested over API");
            ApiResponse::ok(serde_json::json!({ "shift_id": shift_id })).into_response()
        }
        Err(e) => error_response(&e.to_string(), shift_error_status(&e)).into_response(),
    }
}

/// POST /api/v1/groups/:id/reset
pub async fn reset_group(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let Some(group) = state.orchestrator.group(&id) else {
        return error_response("group not found", StatusCode::NOT_FOUND).into_response();
    };
    match group.reset().await {
        Ok(()) => ApiResponse::ok(GroupStatus::from(group.as_ref())).into_response(),
        Err(e) => error_response(&e.to_string(), shift_error_status(&e)).into_response(),
    }
}
