//! REST API for the cutover daemon.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/groups` | List deployment groups |
//! | GET | `/api/v1/groups/:id` | Get a group's state, pair and weights |
//! | GET | `/api/v1/groups/:id/shifts` | List the group's archived shifts |
//! | POST | `/api/v1/groups/:id/cancel` | Cancel the active shift |
//! | POST | `/api/v1/groups/:id/reset` | Reset a failed group |
//! | GET | `/api/v1/runs` | List pipeline runs |
//! | POST | `/api/v1/runs` | Trigger a pipeline run |
//! | GET | `/api/v1/runs/:id` | Get a run and its stages |
//! | POST | `/api/v1/runs/:id/approval` | Approve or reject a waiting run |
//! | GET | `/api/v1/approvals` | Runs waiting for approval |

pub mod handlers;
pub mod run_handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use cutover_pipeline::Orchestrator;
use cutover_state::StateStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub orchestrator: Arc<Orchestrator>,
}

/// Build the complete API router.
pub fn build_router(store: StateStore, orchestrator: Arc<Orchestrator>) -> Router {
    let state = ApiState {
        store,
        orchestrator,
    };

    let api_routes = Router::new()
        .route("/groups", get(handlers::list_groups))
        .route("/groups/{id}", get(handlers::get_group))
        .route("/groups/{id}/shifts", get(handlers::list_shifts))
        .route("/groups/{id}/cancel", post(handlers::cancel_shift))
        .route("/groups/{id}/reset", post(handlers::reset_group))
        .route(
            "/runs",
            get(run_handlers::list_runs).post(run_handlers::trigger_run),
        )
        .route("/runs/{id}", get(run_handlers::get_run))
        .route("/runs/{id}/approval", post(run_handlers::signal_approval))
        .route("/approvals", get(run_handlers::list_approvals))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
