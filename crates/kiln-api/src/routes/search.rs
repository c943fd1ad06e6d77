//! Search and index-management API: every operation runs as a queued task
//! and the route answers with a task id.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use kiln_search::search::weights_from_ratio;

use crate::state::AppState;

type RouteError = (StatusCode, Json<Value>);

fn server_error(detail: impl Into<String>) -> RouteError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "detail": detail.into() })),
    )
}

async fn dispatch(
    state: &AppState,
    queue: &str,
    task_name: &str,
    payload: Value,
) -> Result<(StatusCode, Json<Value>), RouteError> {
    let task_id = state
        .broker
        .dispatch(queue, task_name, payload)
        .await
        .map_err(|err| server_error(format!("failed to enqueue {task_name}: {err}")))?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "task_id": task_id, "status": "accepted" })),
    ))
}

macro_rules! index_route {
    ($name:ident, $task:literal) => {
        pub async fn $name(
            State(state): State<Arc<AppState>>,
            Json(payload): Json<Value>,
        ) -> Result<(StatusCode, Json<Value>), RouteError> {
            let queue = state.index_control.settings().queue.index_queue.clone();
            dispatch(&state, &queue, $task, payload).await
        }
    };
}

index_route!(create_index, "es_schema.create_index");
index_route!(alias_switch, "es_schema.alias_switch");
index_route!(bulk_ingest, "es_schema.bulk_ingest");
index_route!(ingest_docindex, "es_schema.ingest_docindex");
index_route!(rebuild_full, "es_schema.rebuild_full");
index_route!(rebuild_partial, "es_schema.rebuild_partial");

pub async fn text_search(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<Value>,
) -> Result<(StatusCode, Json<Value>), RouteError> {
    let queue = state.search.settings().queue.search_queue.clone();
    dispatch(&state, &queue, "es_search.text_search", payload).await
}

pub async fn vector_search(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<Value>,
) -> Result<(StatusCode, Json<Value>), RouteError> {
    let queue = state.search.settings().queue.search_queue.clone();
    dispatch(&state, &queue, "es_search.vector_search", payload).await
}

/// Hybrid search. A `vector_ratio` field normalizes to
/// `(text_weight, vector_weight) = (1 - r, r)` unless explicit weights are
/// given.
pub async fn hybrid_search(
    State(state): State<Arc<AppState>>,
    Json(mut payload): Json<Value>,
) -> Result<(StatusCode, Json<Value>), RouteError> {
    if let Some(ratio) = payload["vector_ratio"].as_f64() {
        if payload.get("text_weight").is_none() && payload.get("vector_weight").is_none() {
            let (text_weight, vector_weight) = weights_from_ratio(ratio);
            payload["text_weight"] = json!(text_weight);
            payload["vector_weight"] = json!(vector_weight);
        }
    }
    let queue = state.search.settings().queue.search_queue.clone();
    dispatch(&state, &queue, "es_search.hybrid_search", payload).await
}
