//! # Workflow API
//!
//! Trigger runs, read their status, resume or cancel them, and stream
//! workflow events.

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_stream::StreamExt;
use utoipa::ToSchema;

use supermon_core::state::RunStatusReport;

use super::{ApiError, ApiResult, ErrorBody};
use crate::{spawn_drive, SharedState};

#[derive(Debug, Deserialize, ToSchema)]
pub struct TriggerRequest {
    pub project_id: i64,
    /// Conversation on the messaging platform, e.g. `slack:C042`
    pub conversation_ref: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TriggerResponse {
    pub run_id: String,
    /// The trigger joined the project's active run
    pub coalesced: bool,
    /// A stalled run was reopened by this trigger
    pub resumed: bool,
    pub status: String,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct ResumeRequest {
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct CancelRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CancelResponse {
    pub run_id: String,
    /// The run is mid-stage; cancellation applies once that stage commits
    pub deferred: bool,
    pub status: String,
}

pub fn routes() -> Router<SharedState> {
    Router::new()
        .route("/", post(trigger_workflow))
        .route("/events", get(events))
        .route("/:run_id", get(get_run))
        .route("/:run_id/resume", post(resume_run))
        .route("/:run_id/cancel", post(cancel_run))
}

/// Start a run, or join the project's active one. The run is driven in
/// the background.
#[utoipa::path(
    post,
    path = "/api/v1/workflows",
    tag = "workflows",
    request_body = TriggerRequest,
    responses(
        (status = 200, description = "Run created or joined", body = TriggerResponse),
        (status = 400, description = "Missing conversation reference", body = ErrorBody),
        (status = 409, description = "Project busy, retry later", body = ErrorBody)
    )
)]
pub async fn trigger_workflow(
    State(state): State<SharedState>,
    Json(req): Json<TriggerRequest>,
) -> ApiResult<TriggerResponse> {
    let conversation_ref = req.conversation_ref.trim();
    if conversation_ref.is_empty() {
        return Err(ApiError::BadRequest("conversation_ref must not be empty".into()));
    }

    let outcome = state
        .orchestrator
        .trigger_workflow(req.project_id, conversation_ref)
        .await?;
    spawn_drive(&state.orchestrator, outcome.run_id.clone());

    Ok(Json(TriggerResponse {
        run_id: outcome.run_id,
        coalesced: outcome.coalesced,
        resumed: outcome.resumed,
        status: outcome.status.to_string(),
    }))
}

/// Status, current stage and attempt history of a run
#[utoipa::path(
    get,
    path = "/api/v1/workflows/{run_id}",
    tag = "workflows",
    params(("run_id" = String, Path, description = "Run identifier")),
    responses(
        (status = 200, description = "Run status report"),
        (status = 404, description = "Unknown run", body = ErrorBody)
    )
)]
pub async fn get_run(
    State(state): State<SharedState>,
    Path(run_id): Path<String>,
) -> ApiResult<RunStatusReport> {
    Ok(Json(state.orchestrator.get_run_status(&run_id)?))
}

/// Reopen a stalled run and drive it again
#[utoipa::path(
    post,
    path = "/api/v1/workflows/{run_id}/resume",
    tag = "workflows",
    params(("run_id" = String, Path, description = "Run identifier")),
    request_body = ResumeRequest,
    responses(
        (status = 200, description = "Run resumed"),
        (status = 404, description = "Unknown run", body = ErrorBody),
        (status = 409, description = "Run is not stalled", body = ErrorBody)
    )
)]
pub async fn resume_run(
    State(state): State<SharedState>,
    Path(run_id): Path<String>,
    body: Option<Json<ResumeRequest>>,
) -> ApiResult<RunStatusReport> {
    let req = body.map(|Json(b)| b).unwrap_or_default();
    let report = state.orchestrator.resume(&run_id, req.note.as_deref()).await?;
    spawn_drive(&state.orchestrator, run_id);
    Ok(Json(report))
}

/// Cancel a run; a run mid-stage stops after that stage commits
#[utoipa::path(
    post,
    path = "/api/v1/workflows/{run_id}/cancel",
    tag = "workflows",
    params(("run_id" = String, Path, description = "Run identifier")),
    request_body = CancelRequest,
    responses(
        (status = 200, description = "Run cancelled or cancellation deferred", body = CancelResponse),
        (status = 404, description = "Unknown run", body = ErrorBody),
        (status = 409, description = "Run already finished", body = ErrorBody)
    )
)]
pub async fn cancel_run(
    State(state): State<SharedState>,
    Path(run_id): Path<String>,
    body: Option<Json<CancelRequest>>,
) -> ApiResult<CancelResponse> {
    let req = body.map(|Json(b)| b).unwrap_or_default();
    let outcome = state
        .orchestrator
        .request_cancel(&run_id, req.reason.as_deref())
        .await?;
    Ok(Json(CancelResponse {
        run_id: outcome.run_id,
        deferred: outcome.deferred,
        status: outcome.status.to_string(),
    }))
}

/// SSE stream of workflow events with a heartbeat every 15 seconds
async fn events(
    State(state): State<SharedState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.event_tx.subscribe()).filter_map(|item| to_sse(item).map(Ok));

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    )
}

/// One SSE frame per event. A subscriber that fell behind gets a comment
/// saying how much it missed; an event that cannot be encoded is dropped.
fn to_sse<T: Serialize>(item: Result<T, BroadcastStreamRecvError>) -> Option<Event> {
    match item {
        Ok(event) => match serde_json::to_string(&event) {
            Ok(json) => Some(Event::default().event("workflow").data(json)),
            Err(e) => {
                tracing::warn!(error = %e, "Dropping workflow event that failed to serialize");
                None
            }
        },
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            Some(Event::default().comment(format!("skipped {} events", skipped)))
        }
    }
}
