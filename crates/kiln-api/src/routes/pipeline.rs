//! Pipeline API: artifact upload and slicing recommendation.

use std::sync::Arc;

use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};
use uuid::Uuid;

use kiln_pipeline::PipelineRequest;

use crate::state::AppState;

type RouteError = (StatusCode, Json<Value>);

fn bad_request(detail: impl Into<String>) -> RouteError {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "detail": detail.into() })),
    )
}

fn server_error(detail: impl Into<String>) -> RouteError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "detail": detail.into() })),
    )
}

/// Store an uploaded file under `uploads/<rand>_<name>` in the default
/// bucket.
pub async fn upload(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<Value>, RouteError> {
    let mut stored: Option<(String, String)> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| bad_request(format!("invalid multipart body: {err}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field
            .file_name()
            .map(str::to_string)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| bad_request("filename is required"))?;
        let safe_name = std::path::Path::new(&filename)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload.bin".into());
        let bytes = field
            .bytes()
            .await
            .map_err(|err| bad_request(format!("failed to read upload: {err}")))?;

        let client = state
            .gateway
            .default_client()
            .map_err(|err| server_error(format!("storage unavailable: {err}")))?;
        client
            .ensure_bucket()
            .await
            .map_err(|err| server_error(format!("bucket check failed: {err}")))?;

        let tmp = tempfile::NamedTempFile::new()
            .map_err(|err| server_error(format!("temp file failed: {err}")))?;
        tokio::fs::write(tmp.path(), &bytes)
            .await
            .map_err(|err| server_error(format!("temp write failed: {err}")))?;

        let object_key = format!("uploads/{}_{safe_name}", Uuid::new_v4().simple());
        client
            .put_object(tmp.path(), &object_key)
            .await
            .map_err(|err| server_error(format!("upload failed: {err}")))?;
        stored = Some((client.bucket().to_string(), object_key));
        break;
    }

    let Some((bucket, object_key)) = stored else {
        return Err(bad_request("multipart field 'file' is required"));
    };
    Ok(Json(json!({ "bucket": bucket, "object_key": object_key })))
}

/// Run the conversion→probe pipeline, sync or async per the request flag.
pub async fn recommend(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PipelineRequest>,
) -> Result<(StatusCode, Json<Value>), RouteError> {
    if request.files.is_empty() {
        return Err(bad_request("files is required"));
    }

    let async_mode = request.async_mode;
    let queue = state.orchestrator.settings().pipeline_queue.clone();
    let payload = serde_json::to_value(&request)
        .map_err(|err| server_error(format!("invalid request: {err}")))?;
    let task_id = state
        .broker
        .dispatch(&queue, "pipeline.run_document_pipeline", payload)
        .await
        .map_err(|err| server_error(format!("failed to enqueue pipeline: {err}")))?;

    if async_mode {
        return Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "task_id": task_id, "status": "accepted" })),
        ));
    }

    // Blocking wait bounded by conversion + probe timeouts; a timeout does
    // not revoke the in-flight work, results stay discoverable by task id.
    let result = state
        .broker
        .wait(&task_id, state.orchestrator.sync_timeout())
        .await
        .map_err(|err| server_error(err.to_string()))?;

    Ok((
        StatusCode::OK,
        Json(json!({
            "task_id": task_id,
            "status": "success",
            "result": result,
        })),
    ))
}
