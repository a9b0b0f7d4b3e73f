//! # HTTP API
//!
//! Versioned JSON endpoints over the orchestrator, plan store and
//! follow-up scheduler.

pub mod projects;
pub mod system;
pub mod workflows;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use utoipa::{OpenApi, ToSchema};

use supermon_core::error::{StoreError, WorkflowError};

use crate::SharedState;

/// JSON error body
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    pub error: String,
}

/// Failure of an API call, mapped onto an HTTP status
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Conflict(String),
    BadRequest(String),
    Internal(String),
}

impl From<WorkflowError> for ApiError {
    fn from(err: WorkflowError) -> Self {
        if err.is_not_found() {
            ApiError::NotFound(err.to_string())
        } else if err.is_conflict() {
            ApiError::Conflict(err.to_string())
        } else {
            ApiError::Internal(err.to_string())
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        WorkflowError::from(err).into()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(format!("{:#}", err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            ApiError::NotFound(e) => (StatusCode::NOT_FOUND, e),
            ApiError::Conflict(e) => (StatusCode::CONFLICT, e),
            ApiError::BadRequest(e) => (StatusCode::BAD_REQUEST, e),
            ApiError::Internal(e) => {
                tracing::error!(error = %e, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, e)
            }
        };
        (status, Json(ErrorBody { error })).into_response()
    }
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "SuperMon API",
        version = "1.0.0",
        description = "SDLC workflow orchestration: runs, plans, action items and adapters"
    ),
    paths(
        workflows::trigger_workflow,
        workflows::get_run,
        workflows::resume_run,
        workflows::cancel_run,
        projects::list_runs,
        projects::get_plan,
        projects::get_settings,
        projects::put_settings,
        projects::list_action_items,
        projects::resolve_action_item,
        system::list_agents,
        system::list_adapters,
        system::get_config,
        system::patch_config,
        system::health,
    ),
    components(
        schemas(
            ErrorBody,
            workflows::TriggerRequest,
            workflows::TriggerResponse,
            workflows::ResumeRequest,
            workflows::CancelRequest,
            workflows::CancelResponse,
            system::HealthResponse,
        )
    ),
    tags(
        (name = "workflows", description = "Run triggering, status and control"),
        (name = "projects", description = "Runs, plans and settings per project"),
        (name = "action-items", description = "Meeting action items and follow-up"),
        (name = "system", description = "Agents, adapters, configuration and health")
    )
)]
pub struct ApiDoc;

async fn serve_openapi() -> impl IntoResponse {
    Json(ApiDoc::openapi())
}

/// All routes, state attached by the caller
pub fn router() -> Router<SharedState> {
    Router::new()
        .nest("/api/v1/workflows", workflows::routes())
        .nest("/api/v1/projects", projects::project_routes())
        .nest("/api/v1/action-items", projects::action_item_routes())
        .route("/api/v1/agents", get(system::list_agents))
        .route("/api/v1/adapters", get(system::list_adapters))
        .route("/api/v1/config", get(system::get_config).patch(system::patch_config))
        .route("/api/v1/openapi.json", get(serve_openapi))
        .route("/health", get(system::health))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let not_found: ApiError = StoreError::RunNotFound("r1".into()).into();
        assert_eq!(not_found.into_response().status(), StatusCode::NOT_FOUND);

        let conflict: ApiError = WorkflowError::Conflict(42).into();
        assert_eq!(conflict.into_response().status(), StatusCode::CONFLICT);

        let terminal: ApiError = StoreError::RunTerminal("r1".into()).into();
        assert_eq!(terminal.into_response().status(), StatusCode::CONFLICT);

        let other: ApiError = StoreError::LockPoisoned("boom".into()).into();
        assert_eq!(other.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_openapi_lists_workflow_routes() {
        let doc = ApiDoc::openapi();
        let json = serde_json::to_value(&doc).unwrap();
        assert!(json["paths"]["/api/v1/workflows"]["post"].is_object());
        assert!(json["paths"]["/api/v1/workflows/{run_id}"]["get"].is_object());
    }
}
