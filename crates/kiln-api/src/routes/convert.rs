//! Conversion API: job submission, format listing, dependency health.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::error;
use uuid::Uuid;

use kiln_core::config::StorageOverride;
use kiln_core::job::{ConversionJob, FileSpec, Priority};
use kiln_core::metrics::record_task_accepted;

use crate::errors::ApiError;
use crate::state::AppState;

/// Source formats that accept a `page_limit`.
const PAGED_FORMATS: [&str; 5] = ["doc", "docx", "ppt", "pptx", "html"];

/// Audio/video source formats that accept a `duration_seconds`.
const AV_FORMATS: [&str; 12] = [
    "wav", "flac", "ogg", "aac", "mp3", "gif", "avi", "mov", "mkv", "flv", "wmv", "mp4",
];

#[derive(Debug, Deserialize)]
pub struct ConvertRequest {
    #[allow(dead_code)]
    pub task_name: Option<String>,
    #[serde(default)]
    pub files: Vec<FileSpec>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub callback_url: Option<String>,
    #[serde(default)]
    pub storage: Option<StorageOverride>,
    /// `"sync"` runs the single-file batch in-process with no enqueue.
    #[serde(default)]
    pub mode: Option<String>,
}

impl ConvertRequest {
    fn is_sync(&self) -> bool {
        self.mode.as_deref() == Some("sync")
    }
}

/// Validate limits and formats, resolving absent targets via the registry
/// and the configured mappings.
fn validate_request(state: &AppState, request: &mut ConvertRequest) -> Result<(), ApiError> {
    let limits = &state.settings.file_limits;
    if request.files.is_empty() {
        return Err(ApiError::new("ERR_FORMAT_UNSUPPORTED"));
    }
    if request.files.len() > limits.max_files_per_task {
        return Err(ApiError::new("ERR_BATCH_LIMIT_EXCEEDED"));
    }
    let total_size: f64 = request.files.iter().map(|f| f.size_mb).sum();
    if total_size > limits.max_total_upload_size_mb as f64 {
        return Err(ApiError::new("ERR_BATCH_LIMIT_EXCEEDED"));
    }
    if request.is_sync() && request.files.len() != 1 {
        return Err(ApiError::with_detail(
            "ERR_BATCH_LIMIT_EXCEEDED",
            "Sync mode accepts exactly one file",
        ));
    }

    let registry = state.worker.registry();
    for file in &mut request.files {
        file.validate_locator()
            .map_err(|err| ApiError::with_detail("ERR_FORMAT_UNSUPPORTED", err.to_string()))?;

        let source = file.source_format.trim().to_lowercase();
        if source.is_empty() {
            return Err(ApiError::with_detail(
                "ERR_FORMAT_UNSUPPORTED",
                format!("Missing source format (source={})", file.locator_label()),
            ));
        }
        if file.size_mb > limits.limit_for(&source) as f64 {
            return Err(ApiError::new("ERR_FILE_TOO_LARGE"));
        }

        if file.page_limit.is_some() && file.duration_seconds.is_some() {
            return Err(ApiError::with_detail(
                "ERR_FORMAT_UNSUPPORTED",
                "page_limit and duration_seconds cannot both be set",
            ));
        }
        if file.page_limit.is_some() && !PAGED_FORMATS.contains(&source.as_str()) {
            return Err(ApiError::with_detail(
                "ERR_FORMAT_UNSUPPORTED",
                format!("page_limit is not applicable to {source}"),
            ));
        }
        if file.duration_seconds.is_some() && !AV_FORMATS.contains(&source.as_str()) {
            return Err(ApiError::with_detail(
                "ERR_FORMAT_UNSUPPORTED",
                format!("duration_seconds is not applicable to {source}"),
            ));
        }

        // Absent target: first registry pairing, then configured mappings.
        let target = match &file.target_format {
            Some(target) if !target.trim().is_empty() => target.trim().to_lowercase(),
            _ => {
                let defaulted = registry.first_target_for(&source).or_else(|| {
                    state
                        .settings
                        .convert_formats
                        .iter()
                        .find(|f| f.source.to_lowercase() == source)
                        .map(|f| f.target.to_lowercase())
                });
                match defaulted {
                    Some(target) => {
                        file.target_format = Some(target.clone());
                        target
                    }
                    None => {
                        return Err(ApiError::with_detail(
                            "ERR_FORMAT_UNSUPPORTED",
                            format!(
                                "No target format for {source} (source={})",
                                file.locator_label()
                            ),
                        ))
                    }
                }
            }
        };

        let supported = source == target
            || registry.contains(&source, &target)
            || state.settings.convert_formats.iter().any(|f| {
                f.source.to_lowercase() == source && f.target.to_lowercase() == target
            });
        if !supported {
            return Err(ApiError::with_detail(
                "ERR_FORMAT_UNSUPPORTED",
                format!(
                    "Unsupported format {source}->{target} (source={})",
                    file.locator_label()
                ),
            ));
        }
    }
    Ok(())
}

pub async fn submit_conversion(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    Json(mut request): Json<ConvertRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    state.validator.authenticate(&headers, &query)?;
    validate_request(&state, &mut request)?;

    let task_id = Uuid::new_v4().to_string();
    let job = ConversionJob {
        task_id: Some(task_id.clone()),
        files: request.files.clone(),
        priority: request.priority,
        callback_url: request.callback_url.clone(),
        storage: request.storage.clone(),
    };
    record_task_accepted(request.priority.as_str());

    if request.is_sync() {
        let result = state.worker.handle_batch(job).await;
        return Ok((
            StatusCode::OK,
            Json(json!({
                "status": "success",
                "task_id": task_id,
                "results": result.results,
            })),
        ));
    }

    let payload = serde_json::to_value(&job).map_err(|err| {
        error!("Failed to serialize job {task_id}: {err}");
        ApiError::new("ERR_TASK_FAILED")
    })?;
    let queue = state.settings.queues.default_queue.clone();
    state
        .broker
        .dispatch_with_id(&queue, "conversion.handle_batch", payload, task_id.clone())
        .await
        .map_err(|err| {
            error!("Failed to enqueue task {task_id}: {err}");
            ApiError::new("ERR_TASK_FAILED")
        })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "accepted",
            "task_id": task_id,
            "message": "Task accepted and scheduled for conversion",
        })),
    ))
}

pub async fn list_formats(State(state): State<Arc<AppState>>) -> Json<Value> {
    let mut formats: Vec<Value> = state
        .worker
        .registry()
        .descriptors()
        .into_iter()
        .map(|d| {
            json!({
                "source": d.source_format,
                "target": d.target_format,
                "plugin": d.slug,
            })
        })
        .collect();
    if formats.is_empty() {
        formats = state
            .settings
            .convert_formats
            .iter()
            .map(|f| json!({ "source": f.source, "target": f.target, "plugin": f.plugin }))
            .collect();
    }
    Json(json!({ "formats": formats }))
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let object_store = match state.gateway.default_client() {
        Ok(client) => client.probe().await,
        Err(err) => format!("error:{err}"),
    };
    let queues = state.broker.active_queues();
    let workers = if queues.is_empty() {
        "no-worker".to_string()
    } else {
        format!("ok:{}", queues.len())
    };

    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "dependencies": {
            "broker": "ok",
            "object_store": object_store,
            "workers": workers,
        },
    }))
}
