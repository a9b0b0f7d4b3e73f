//! # Project API
//!
//! Runs, plans and settings per project, plus the action items meetings
//! leave behind.

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use supermon_core::state::{ActionItem, ProjectId, ProjectPlan, ProjectSettings, RunStatusReport};

use super::{ApiError, ApiResult, ErrorBody};
use crate::SharedState;

#[derive(Debug, Deserialize)]
pub struct ActionItemQuery {
    #[serde(default)]
    pub project_id: Option<ProjectId>,
}

pub fn project_routes() -> Router<SharedState> {
    Router::new()
        .route("/:project_id/runs", get(list_runs))
        .route("/:project_id/plan", get(get_plan))
        .route("/:project_id/settings", get(get_settings).put(put_settings))
}

pub fn action_item_routes() -> Router<SharedState> {
    Router::new()
        .route("/", get(list_action_items))
        .route("/:id/resolve", post(resolve_action_item))
}

/// All runs of a project, newest first
#[utoipa::path(
    get,
    path = "/api/v1/projects/{project_id}/runs",
    tag = "projects",
    params(("project_id" = i64, Path, description = "Project identifier")),
    responses((status = 200, description = "Run status reports"))
)]
pub async fn list_runs(
    State(state): State<SharedState>,
    Path(project_id): Path<ProjectId>,
) -> ApiResult<Vec<RunStatusReport>> {
    let runs = state.orchestrator.store().list_runs(project_id)?;
    Ok(Json(runs.iter().map(|r| r.report()).collect()))
}

/// Requirements, epics, stories and meeting of the latest planned run
#[utoipa::path(
    get,
    path = "/api/v1/projects/{project_id}/plan",
    tag = "projects",
    params(("project_id" = i64, Path, description = "Project identifier")),
    responses(
        (status = 200, description = "Project plan"),
        (status = 404, description = "No run has produced a plan yet", body = ErrorBody)
    )
)]
pub async fn get_plan(
    State(state): State<SharedState>,
    Path(project_id): Path<ProjectId>,
) -> ApiResult<ProjectPlan> {
    state
        .plans
        .plan_for_project(project_id)?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no plan for project {}", project_id)))
}

#[utoipa::path(
    get,
    path = "/api/v1/projects/{project_id}/settings",
    tag = "projects",
    params(("project_id" = i64, Path, description = "Project identifier")),
    responses((status = 200, description = "Stakeholders, business weights and channel"))
)]
pub async fn get_settings(
    State(state): State<SharedState>,
    Path(project_id): Path<ProjectId>,
) -> ApiResult<ProjectSettings> {
    Ok(Json(state.settings.load(project_id)?))
}

/// Replace a project's settings. Runs already in flight keep the settings
/// they started a stage with.
#[utoipa::path(
    put,
    path = "/api/v1/projects/{project_id}/settings",
    tag = "projects",
    params(("project_id" = i64, Path, description = "Project identifier")),
    responses(
        (status = 200, description = "Settings saved"),
        (status = 400, description = "Invalid settings", body = ErrorBody)
    )
)]
pub async fn put_settings(
    State(state): State<SharedState>,
    Path(project_id): Path<ProjectId>,
    Json(settings): Json<ProjectSettings>,
) -> ApiResult<ProjectSettings> {
    if let Some((category, weight)) = settings
        .business_weights
        .iter()
        .find(|(_, w)| !w.is_finite() || **w < 0.0)
    {
        return Err(ApiError::BadRequest(format!(
            "business weight for {} must be a non-negative number, got {}",
            category, weight
        )));
    }

    state.settings.save(project_id, &settings)?;
    tracing::info!(project_id, stakeholders = settings.stakeholders.len(), "Project settings updated");
    Ok(Json(settings))
}

#[utoipa::path(
    get,
    path = "/api/v1/action-items",
    tag = "action-items",
    params(("project_id" = Option<i64>, Query, description = "Restrict to one project")),
    responses((status = 200, description = "Action items ordered by due date"))
)]
pub async fn list_action_items(
    State(state): State<SharedState>,
    Query(query): Query<ActionItemQuery>,
) -> ApiResult<Vec<ActionItem>> {
    Ok(Json(state.plans.action_items(query.project_id)?))
}

/// Mark an action item done; it receives no further reminders
#[utoipa::path(
    post,
    path = "/api/v1/action-items/{id}/resolve",
    tag = "action-items",
    params(("id" = String, Path, description = "Action item identifier")),
    responses(
        (status = 200, description = "Item resolved"),
        (status = 404, description = "Unknown item", body = ErrorBody),
        (status = 409, description = "Item already resolved or expired", body = ErrorBody)
    )
)]
pub async fn resolve_action_item(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<ActionItem> {
    Ok(Json(state.plans.resolve_action_item(&id)?))
}
