//! Conversion worker: consumes `conversion.handle_batch` jobs.
//!
//! Files are processed sequentially and results retain input order. Failures
//! never escape a file: every per-file problem becomes a `failed` (or
//! `ignored`) record and the batch returns normally.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ConverterSettings;
use crate::error::{KilnError, Result};
use crate::job::{ConversionJob, FileResult, FileSpec, JobResult, ResultStatus};
use crate::metrics::record_task_completed;
use crate::plugins::{ConversionInput, ConvertMetadata, PluginRegistry};
use crate::queue::{handler, TaskBroker};
use crate::storage::{S3Client, StoreGateway};

/// A format value of `None`, blank, `"null"` or `"none"` counts as missing.
fn is_missing_format(value: Option<&str>) -> bool {
    match value {
        None => true,
        Some(raw) => {
            let normalized = raw.trim().to_lowercase();
            normalized.is_empty() || normalized == "null" || normalized == "none"
        }
    }
}

fn norm_format(value: Option<&str>) -> String {
    value.unwrap_or_default().trim().to_lowercase()
}

/// Best-effort filename for result payloads: explicit filename, then the
/// materialized input, then object-key or URL basenames.
fn guess_filename(spec: &FileSpec, input_path: Option<&Path>) -> Option<String> {
    if let Some(filename) = &spec.filename {
        return Some(filename.clone());
    }
    if let Some(path) = input_path {
        if let Some(name) = path.file_name() {
            return Some(name.to_string_lossy().into_owned());
        }
    }
    if let Some(object_key) = &spec.object_key {
        if let Some(name) = Path::new(object_key).file_name() {
            return Some(name.to_string_lossy().into_owned());
        }
    }
    if let Some(input_url) = &spec.input_url {
        if let Ok(parsed) = url::Url::parse(input_url) {
            if let Some(name) = Path::new(parsed.path()).file_name() {
                let name = name.to_string_lossy();
                if !name.is_empty() {
                    return Some(name.into_owned());
                }
            }
        }
    }
    None
}

pub struct ConversionWorker {
    settings: ConverterSettings,
    gateway: Arc<StoreGateway>,
    registry: Arc<PluginRegistry>,
}

impl ConversionWorker {
    pub fn new(
        settings: ConverterSettings,
        gateway: Arc<StoreGateway>,
        registry: Arc<PluginRegistry>,
    ) -> Self {
        Self {
            settings,
            gateway,
            registry,
        }
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    /// Register the batch handler on the conversion queue.
    pub fn register_tasks(self: &Arc<Self>, broker: &TaskBroker, queue: &str) -> Result<()> {
        let worker = Arc::clone(self);
        broker.register(
            queue,
            "conversion.handle_batch",
            handler(move |_broker, payload| {
                let worker = Arc::clone(&worker);
                async move {
                    let job: ConversionJob = serde_json::from_value(payload)?;
                    let result = worker.handle_batch(job).await;
                    Ok(serde_json::to_value(result)?)
                }
            }),
        )
    }

    /// Process a batch. Per-job storage overrides yield a fresh short-lived
    /// client; the cached default client is never shared with them.
    pub async fn handle_batch(&self, job: ConversionJob) -> JobResult {
        let task_id = job.task_id.clone();
        debug!(
            "Starting conversion task {:?} with {} files",
            task_id,
            job.files.len()
        );

        let client = match self.gateway.client_for(job.storage.as_ref()) {
            Ok(client) => client,
            Err(err) => {
                let results = job
                    .files
                    .iter()
                    .map(|file| {
                        record_task_completed("failed");
                        FileResult::failed(
                            &file.source_format,
                            file.target_format.as_deref(),
                            format!("Storage configuration invalid: {err}"),
                            guess_filename(file, None),
                        )
                    })
                    .collect();
                return JobResult { task_id, results };
            }
        };

        let mut results = Vec::with_capacity(job.files.len());
        for file in &job.files {
            let result = self.handle_file(file, task_id.as_deref(), &client).await;
            record_task_completed(result.status.as_str());
            results.push(result);
        }

        JobResult { task_id, results }
    }

    async fn handle_file(
        &self,
        spec: &FileSpec,
        task_id: Option<&str>,
        client: &S3Client,
    ) -> FileResult {
        let source_raw = spec.source_format.clone();
        let target_raw = spec.target_format.clone();

        if is_missing_format(Some(&source_raw)) {
            warn!("Missing source format for file {}", spec.locator_label());
            return FileResult::ignored(
                &source_raw,
                target_raw.as_deref(),
                "no source_format provided".into(),
                guess_filename(spec, None),
            );
        }

        let source_norm = norm_format(Some(&source_raw));
        let missing_target = is_missing_format(target_raw.as_deref());
        // Empty target behaves as the source, for passthrough lookup only.
        let target_norm = if missing_target {
            source_norm.clone()
        } else {
            norm_format(target_raw.as_deref())
        };

        if source_norm == target_norm {
            return self.passthrough(spec, task_id, client, &source_raw, target_raw.as_deref()).await;
        }

        if !self.registry.contains(&source_norm, &target_norm) {
            let reason = KilnError::UnsupportedFormat {
                source_format: source_raw.clone(),
                target_format: target_raw.clone().unwrap_or_default(),
                locator: spec.locator_label(),
            }
            .to_string();
            warn!("{reason}");
            return FileResult::failed(
                &source_raw,
                target_raw.as_deref(),
                reason,
                guess_filename(spec, None),
            );
        }

        let input_path = match self.gateway.materialize(spec, client).await {
            Ok(path) => path,
            Err(err) => {
                return FileResult::failed(
                    &source_raw,
                    target_raw.as_deref(),
                    format!(
                        "Input preparation failed (source={}): {err}",
                        spec.locator_label()
                    ),
                    guess_filename(spec, None),
                );
            }
        };
        let result_filename = guess_filename(spec, Some(input_path.as_path()));

        let conversion_input = ConversionInput {
            source_format: source_norm.clone(),
            target_format: target_norm.clone(),
            input_path: input_path.clone(),
            input_url: spec.input_url.clone(),
            object_key: spec.object_key.clone(),
            metadata: ConvertMetadata {
                page_limit: spec.page_limit,
                duration_seconds: spec.duration_seconds,
            },
        };

        // The registry was checked above; a concurrent mutation is impossible
        // because it is immutable after startup.
        let plugin = match self
            .registry
            .get(&source_norm, &target_norm, &spec.locator_label())
        {
            Ok(plugin) => plugin,
            Err(err) => {
                return FileResult::failed(
                    &source_raw,
                    target_raw.as_deref(),
                    err.to_string(),
                    result_filename,
                );
            }
        };

        match plugin.convert(conversion_input).await {
            Ok(output) => {
                let output_path = output.output_path.clone();
                let object_key = match output.object_key {
                    Some(key) => Some(key),
                    None => {
                        self.upload_output(output_path.as_deref(), task_id, client)
                            .await
                    }
                };

                let (external_fileid, external_output_fileid) = self
                    .mirror_to_attach_store(spec, &input_path, output_path.as_deref())
                    .await;
                let download_url = object_key.as_deref().map(|key| client.download_url(key));
                self.store_test_artifact(output_path.as_deref(), task_id).await;

                FileResult {
                    source: source_raw,
                    target: target_raw,
                    status: ResultStatus::Success,
                    output_path: output_path.map(|p| p.display().to_string()),
                    object_key,
                    download_url,
                    external_fileid,
                    external_output_fileid,
                    filename: result_filename,
                    metadata: output.metadata,
                    reason: None,
                }
            }
            Err(err) => {
                warn!("Conversion failed for {source_raw} -> {target_norm}: {err}");
                FileResult::failed(&source_raw, target_raw.as_deref(), err.to_string(), result_filename)
            }
        }
    }

    /// Same source and target: upload the materialized input unchanged.
    async fn passthrough(
        &self,
        spec: &FileSpec,
        task_id: Option<&str>,
        client: &S3Client,
        source_raw: &str,
        target_raw: Option<&str>,
    ) -> FileResult {
        let input_path = match self.gateway.materialize(spec, client).await {
            Ok(path) if path.is_dir() => {
                return FileResult::failed(
                    source_raw,
                    target_raw,
                    format!(
                        "Input preparation failed (source={}): input path is a directory",
                        spec.locator_label()
                    ),
                    guess_filename(spec, None),
                );
            }
            Ok(path) => path,
            Err(err) => {
                return FileResult::failed(
                    source_raw,
                    target_raw,
                    format!(
                        "Input preparation failed (source={}): {err}",
                        spec.locator_label()
                    ),
                    guess_filename(spec, None),
                );
            }
        };

        let result_filename = guess_filename(spec, Some(input_path.as_path()));
        let object_key = self
            .upload_output(Some(input_path.as_path()), task_id, client)
            .await;
        let (external_fileid, external_output_fileid) = self
            .mirror_to_attach_store(spec, &input_path, Some(input_path.as_path()))
            .await;
        let download_url = object_key.as_deref().map(|key| client.download_url(key));
        self.store_test_artifact(Some(input_path.as_path()), task_id).await;

        FileResult {
            source: source_raw.to_string(),
            target: target_raw.map(str::to_string),
            status: ResultStatus::Success,
            output_path: Some(input_path.display().to_string()),
            object_key,
            download_url,
            external_fileid,
            external_output_fileid,
            filename: result_filename,
            metadata: json!({"passthrough": true}),
            reason: None,
        }
    }

    /// Upload under `converted/<task>/<name>`; a failed upload logs and
    /// leaves the key empty rather than failing the file.
    async fn upload_output(
        &self,
        path: Option<&Path>,
        task_id: Option<&str>,
        client: &S3Client,
    ) -> Option<String> {
        let path = path?;
        if !path.exists() || path.is_dir() {
            return None;
        }
        let name = path.file_name()?.to_string_lossy().into_owned();
        let folder = task_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let object_key = format!("converted/{folder}/{name}");
        match client.put_object(path, &object_key).await {
            Ok(()) => Some(object_key),
            Err(err) => {
                warn!("Failed to upload output {}: {err}", path.display());
                None
            }
        }
    }

    /// Best-effort mirroring of input and output to the attach-id store for
    /// legacy consumers; failures are logged and never fail the file.
    async fn mirror_to_attach_store(
        &self,
        spec: &FileSpec,
        input_path: &Path,
        output_path: Option<&Path>,
    ) -> (Option<String>, Option<String>) {
        let attach = self.gateway.attach_client();

        let input_fileid = match &spec.attach_id {
            Some(existing) => Some(existing.clone()),
            None => match attach.upload(input_path, spec.filename.as_deref()).await {
                Ok(result) => result.fileid,
                Err(err) => {
                    warn!("Attach-store input upload failed for {}: {err}", input_path.display());
                    None
                }
            },
        };

        let output_fileid = match output_path {
            Some(path) if path.exists() && !path.is_dir() => {
                match attach.upload(path, None).await {
                    Ok(result) => result.fileid,
                    Err(err) => {
                        warn!("Attach-store output upload failed for {}: {err}", path.display());
                        None
                    }
                }
            }
            _ => None,
        };

        (input_fileid, output_fileid)
    }

    /// Copy the output into the shared test-artifacts directory when that
    /// mode is configured.
    async fn store_test_artifact(&self, path: Option<&Path>, task_id: Option<&str>) {
        let Some(dir) = &self.settings.test_artifacts_dir else {
            return;
        };
        let Some(path) = path.filter(|p| p.exists()) else {
            return;
        };
        let dir = PathBuf::from(dir);
        if let Err(err) = tokio::fs::create_dir_all(&dir).await {
            debug!("Unable to create test-artifacts dir: {err}");
            return;
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "artifact".into());
        let dest_name = match task_id {
            Some(task) => format!("{task}_{name}"),
            None => name,
        };
        if let Err(err) = tokio::fs::copy(path, dir.join(dest_name)).await {
            debug!("Unable to persist test artifact: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AttachStoreSettings, StorageSettings};
    use crate::plugins::{ConversionOutput, Plugin};
    use tempfile::TempDir;

    fn worker_with(tmp: &TempDir, registry: PluginRegistry) -> Arc<ConversionWorker> {
        let mut settings = ConverterSettings::default();
        settings.work_dir = tmp.path().join("work").to_string_lossy().into_owned();
        // An unroutable endpoint keeps upload attempts cheap failures.
        let mut storage = StorageSettings::default();
        storage.endpoint = "http://127.0.0.1:1".into();
        storage.timeout_sec = 1;
        let mut attach = AttachStoreSettings::default();
        attach.base_url = "http://127.0.0.1:1".into();
        attach.timeout_sec = 1;
        settings.storage = storage.clone();
        settings.attach_store = attach.clone();
        let gateway = Arc::new(StoreGateway::new(storage, attach, tmp.path().join("work")));
        Arc::new(ConversionWorker::new(settings, gateway, Arc::new(registry)))
    }

    fn copy_plugin() -> PluginRegistry {
        let mut registry = PluginRegistry::new();
        registry
            .register(Plugin::new("doc-to-pdf", "doc", "pdf", |input| async move {
                let output_path = input.input_path.with_extension("pdf");
                tokio::fs::copy(&input.input_path, &output_path).await?;
                Ok(ConversionOutput {
                    output_path: Some(output_path),
                    object_key: None,
                    metadata: json!({"note": "test"}),
                })
            }))
            .unwrap();
        registry
    }

    fn local_file_spec(tmp: &TempDir, name: &str, source: &str, target: Option<&str>) -> FileSpec {
        let path = tmp.path().join(name);
        std::fs::write(&path, b"content").unwrap();
        FileSpec {
            source_format: source.into(),
            target_format: target.map(str::to_string),
            local_path: Some(path.to_string_lossy().into_owned()),
            ..Default::default()
        }
    }

    #[test]
    fn test_missing_format_detection() {
        assert!(is_missing_format(None));
        assert!(is_missing_format(Some("")));
        assert!(is_missing_format(Some("  NULL ")));
        assert!(is_missing_format(Some("none")));
        assert!(!is_missing_format(Some("pdf")));
    }

    #[test]
    fn test_guess_filename_priority() {
        let spec = FileSpec {
            input_url: Some("https://h/docs/report.doc?sig=1".into()),
            ..Default::default()
        };
        assert_eq!(guess_filename(&spec, None).as_deref(), Some("report.doc"));

        let with_path = guess_filename(&spec, Some(Path::new("/tmp/x_y/in.doc")));
        assert_eq!(with_path.as_deref(), Some("in.doc"));
    }

    #[tokio::test]
    async fn test_missing_source_is_ignored_record() {
        let tmp = TempDir::new().unwrap();
        let worker = worker_with(&tmp, PluginRegistry::new());
        let job = ConversionJob {
            files: vec![FileSpec {
                source_format: "".into(),
                target_format: Some("pdf".into()),
                input_url: Some("https://h/in.doc".into()),
                ..Default::default()
            }],
            ..Default::default()
        };
        let result = worker.handle_batch(job).await;
        assert_eq!(result.results.len(), 1);
        assert_eq!(result.results[0].status, ResultStatus::Ignored);
    }

    #[tokio::test]
    async fn test_unsupported_pair_fails_with_locator() {
        let tmp = TempDir::new().unwrap();
        let worker = worker_with(&tmp, PluginRegistry::new());
        let job = ConversionJob {
            files: vec![FileSpec {
                source_format: "doc".into(),
                target_format: Some("mp4".into()),
                input_url: Some("https://h/in.doc".into()),
                ..Default::default()
            }],
            ..Default::default()
        };
        let result = worker.handle_batch(job).await;
        let record = &result.results[0];
        assert_eq!(record.status, ResultStatus::Failed);
        assert!(record.reason.as_deref().unwrap().contains("https://h/in.doc"));
    }

    #[tokio::test]
    async fn test_passthrough_never_invokes_plugin() {
        let tmp = TempDir::new().unwrap();
        // Registry intentionally empty: a plugin call would fail the file.
        let worker = worker_with(&tmp, PluginRegistry::new());
        let job = ConversionJob {
            task_id: Some("t1".into()),
            files: vec![local_file_spec(&tmp, "in.pdf", "pdf", Some("pdf"))],
            ..Default::default()
        };
        let result = worker.handle_batch(job).await;
        let record = &result.results[0];
        assert_eq!(record.status, ResultStatus::Success);
        assert_eq!(record.metadata["passthrough"], true);
    }

    #[tokio::test]
    async fn test_empty_target_behaves_as_passthrough() {
        let tmp = TempDir::new().unwrap();
        let worker = worker_with(&tmp, copy_plugin());
        let job = ConversionJob {
            files: vec![local_file_spec(&tmp, "in.doc", "doc", None)],
            ..Default::default()
        };
        let result = worker.handle_batch(job).await;
        let record = &result.results[0];
        assert_eq!(record.status, ResultStatus::Success);
        assert_eq!(record.metadata["passthrough"], true);
    }

    #[tokio::test]
    async fn test_conversion_produces_output_record() {
        let tmp = TempDir::new().unwrap();
        let worker = worker_with(&tmp, copy_plugin());
        let job = ConversionJob {
            task_id: Some("t2".into()),
            files: vec![local_file_spec(&tmp, "in.doc", "doc", Some("pdf"))],
            ..Default::default()
        };
        let result = worker.handle_batch(job).await;
        let record = &result.results[0];
        assert_eq!(record.status, ResultStatus::Success);
        assert!(record.output_path.as_deref().unwrap().ends_with("in.pdf"));
        assert_eq!(record.filename.as_deref(), Some("in.doc"));
        // Upload fails against the unroutable endpoint; the file still
        // succeeds, with no object key.
        assert!(record.object_key.is_none());
    }

    #[tokio::test]
    async fn test_results_retain_input_order() {
        let tmp = TempDir::new().unwrap();
        let worker = worker_with(&tmp, copy_plugin());
        let job = ConversionJob {
            files: vec![
                local_file_spec(&tmp, "a.doc", "doc", Some("pdf")),
                FileSpec {
                    source_format: "doc".into(),
                    target_format: Some("mp4".into()),
                    input_url: Some("https://h/b.doc".into()),
                    ..Default::default()
                },
                local_file_spec(&tmp, "c.doc", "doc", Some("pdf")),
            ],
            ..Default::default()
        };
        let result = worker.handle_batch(job).await;
        assert_eq!(result.results.len(), 3);
        assert_eq!(result.results[0].status, ResultStatus::Success);
        assert_eq!(result.results[1].status, ResultStatus::Failed);
        assert_eq!(result.results[2].status, ResultStatus::Success);
    }

    #[tokio::test]
    async fn test_test_artifacts_copy() {
        let tmp = TempDir::new().unwrap();
        let artifacts = tmp.path().join("artifacts");
        let registry = copy_plugin();
        let worker = {
            let mut settings = ConverterSettings::default();
            settings.work_dir = tmp.path().join("work").to_string_lossy().into_owned();
            settings.test_artifacts_dir = Some(artifacts.to_string_lossy().into_owned());
            let mut storage = StorageSettings::default();
            storage.endpoint = "http://127.0.0.1:1".into();
            storage.timeout_sec = 1;
            let mut attach = AttachStoreSettings::default();
            attach.base_url = "http://127.0.0.1:1".into();
            attach.timeout_sec = 1;
            settings.storage = storage.clone();
            settings.attach_store = attach.clone();
            let gateway = Arc::new(StoreGateway::new(storage, attach, tmp.path().join("work")));
            Arc::new(ConversionWorker::new(settings, gateway, Arc::new(registry)))
        };
        let job = ConversionJob {
            task_id: Some("t3".into()),
            files: vec![local_file_spec(&tmp, "in.doc", "doc", Some("pdf"))],
            ..Default::default()
        };
        let result = worker.handle_batch(job).await;
        assert_eq!(result.results[0].status, ResultStatus::Success);
        assert!(artifacts.join("t3_in.pdf").exists());
    }
}
