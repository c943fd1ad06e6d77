//! Video and metadata-enrichment API: async job submission plus task
//! polling.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use kiln_core::queue::TaskState;

use crate::state::AppState;

type RouteError = (StatusCode, Json<Value>);

fn server_error(detail: impl Into<String>) -> RouteError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "detail": detail.into() })),
    )
}

/// Submit a video slicing job; always async.
pub async fn slice(
    State(state): State<Arc<AppState>>,
    Json(request): Json<Value>,
) -> Result<(StatusCode, Json<Value>), RouteError> {
    let queue = state.video_settings.queues.video_queue.clone();
    let task_id = state
        .broker
        .dispatch(&queue, "video.process", request)
        .await
        .map_err(|err| server_error(format!("failed to enqueue video job: {err}")))?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "task_id": task_id, "status": "accepted" })),
    ))
}

/// Submit a manifest-enrichment job.
pub async fn enrich(
    State(state): State<Arc<AppState>>,
    Json(request): Json<Value>,
) -> Result<(StatusCode, Json<Value>), RouteError> {
    let task_id = state
        .broker
        .dispatch(&state.meta_queue, "meta.process", request)
        .await
        .map_err(|err| server_error(format!("failed to enqueue enrichment: {err}")))?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "task_id": task_id, "status": "accepted" })),
    ))
}

/// Poll a task by id: worker states translate to
/// `PENDING`/`SUCCESS`/`FAILURE`.
pub async fn task_status(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> (StatusCode, Json<Value>) {
    match state.broker.state(&task_id) {
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "task_id": task_id, "state": "PENDING", "detail": "unknown task id" })),
        ),
        Some(TaskState::Pending) => (
            StatusCode::OK,
            Json(json!({ "task_id": task_id, "state": "PENDING" })),
        ),
        Some(TaskState::Success(result)) => (
            StatusCode::OK,
            Json(json!({ "task_id": task_id, "state": "SUCCESS", "result": result })),
        ),
        Some(TaskState::Failure(message)) => (
            StatusCode::OK,
            Json(json!({ "task_id": task_id, "state": "FAILURE", "error": message })),
        ),
    }
}
