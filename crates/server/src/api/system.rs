//! # System API

use axum::{extract::State, Json};
use serde::Serialize;
use serde_json::Value;
use utoipa::ToSchema;

use supermon_core::adapters::AdapterStatus;
use supermon_core::config::WorkflowConfig;
use supermon_core::workflow::AgentDescriptor;

use super::{ApiError, ApiResult, ErrorBody};
use crate::SharedState;

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Runs not yet completed or failed
    pub active_runs: usize,
}

/// Saved configuration; the running engine picks it up on restart
#[derive(Debug, Serialize)]
pub struct ConfigUpdate {
    pub config: WorkflowConfig,
    pub applies_on_restart: bool,
}

/// Agent roles with their stages and permitted capabilities
#[utoipa::path(
    get,
    path = "/api/v1/agents",
    tag = "system",
    responses((status = 200, description = "Agent roles"))
)]
pub async fn list_agents(State(state): State<SharedState>) -> Json<Vec<AgentDescriptor>> {
    Json(state.orchestrator.agents().describe())
}

/// Connection status of every registered adapter
#[utoipa::path(
    get,
    path = "/api/v1/adapters",
    tag = "system",
    responses((status = 200, description = "Adapter connection status"))
)]
pub async fn list_adapters(State(state): State<SharedState>) -> Json<Vec<AdapterStatus>> {
    Json(state.orchestrator.adapters().connection_status().await)
}

#[utoipa::path(
    get,
    path = "/api/v1/config",
    tag = "system",
    responses((status = 200, description = "Workflow configuration"))
)]
pub async fn get_config(State(state): State<SharedState>) -> Json<WorkflowConfig> {
    Json(state.config.read().await.clone())
}

/// Merge a partial configuration and save it
#[utoipa::path(
    patch,
    path = "/api/v1/config",
    tag = "system",
    responses(
        (status = 200, description = "Configuration saved"),
        (status = 400, description = "Patch does not fit the configuration schema", body = ErrorBody)
    )
)]
pub async fn patch_config(
    State(state): State<SharedState>,
    Json(patch): Json<Value>,
) -> ApiResult<ConfigUpdate> {
    let mut config = state.config.write().await;
    let mut updated = config.clone();
    updated
        .merge(&patch)
        .map_err(|e| ApiError::BadRequest(format!("{:#}", e)))?;
    updated.save(&state.config_path)?;
    *config = updated.clone();

    tracing::info!(path = %state.config_path.display(), "Configuration saved");
    Ok(Json(ConfigUpdate {
        config: updated,
        applies_on_restart: true,
    }))
}

#[utoipa::path(
    get,
    path = "/health",
    tag = "system",
    responses((status = 200, description = "Server is up", body = HealthResponse))
)]
pub async fn health(State(state): State<SharedState>) -> ApiResult<HealthResponse> {
    let active_runs = state.orchestrator.store().list_active_runs()?.len();
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_runs,
    }))
}
