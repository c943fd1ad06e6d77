//! Pipeline orchestrator: composes conversion and probing across the
//! conversion, pipeline, and probe queues.
//!
//! The orchestrator is the only component that crosses queues: conversion
//! batches run on the conversion queue, artifact sampling on the pipeline
//! queue, and signal extraction / strategy recommendation on the probe
//! queue. A batch where every file is already a stored PDF skips conversion
//! entirely and probes a synthesized stub result.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use kiln_core::config::StorageOverride;
use kiln_core::job::{ConversionJob, FileSpec, Priority};
use kiln_core::queue::{handler, TaskBroker};
use kiln_core::storage::StoreGateway;
use kiln_core::{KilnError, Result};

use crate::config::{PipelineSettings, ProbeSettings};
use crate::probe::{extract_signals, recommend_strategy, CustomDelimiterConfig, Profile};
use crate::sampling::{is_markdown_artifact, sample_markdown, sample_pdf};

/// Formats that read better as Markdown than as rendered PDF.
const TEXTUAL_FORMATS: [&str; 8] = [
    "html",
    "txt",
    "text/plain",
    "md",
    "markdown",
    "text/markdown",
    "xlsx",
    "xls",
];

pub fn normalize_format(fmt: Option<&str>) -> String {
    fmt.unwrap_or_default().trim().to_lowercase()
}

/// Map MIME-ish aliases onto canonical source formats.
pub fn normalize_source_format(fmt: Option<&str>) -> String {
    let raw = normalize_format(fmt);
    match raw.as_str() {
        "application/pdf" => "pdf".into(),
        "text/html" | "application/xhtml+xml" | "htm" => "html".into(),
        "plain" => "text/plain".into(),
        other => other.to_string(),
    }
}

pub fn normalize_target_format(fmt: Option<&str>) -> String {
    let normalized = normalize_format(fmt);
    if normalized.is_empty() {
        "pdf".into()
    } else {
        normalized
    }
}

/// Prefer-markdown rule: textual sources headed for PDF convert to Markdown
/// instead.
pub fn prefer_markdown_target(source_format: &str, target_format: Option<&str>) -> String {
    let target = normalize_target_format(target_format);
    if TEXTUAL_FORMATS.contains(&source_format) && target == "pdf" {
        "md".into()
    } else {
        target
    }
}

/// Request shape for the pipeline entry points.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineRequest {
    #[serde(default)]
    pub files: Vec<FileSpec>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<CustomDelimiterConfig>,
    #[serde(default)]
    pub async_mode: bool,
}

pub struct Orchestrator {
    settings: PipelineSettings,
    probe_settings: ProbeSettings,
    gateway: Arc<StoreGateway>,
}

impl Orchestrator {
    pub fn new(
        settings: PipelineSettings,
        probe_settings: ProbeSettings,
        gateway: Arc<StoreGateway>,
    ) -> Self {
        Self {
            settings,
            probe_settings,
            gateway,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Total bound for a blocking pipeline wait.
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.conversion_timeout_sec + self.settings.probe_timeout_sec)
    }

    /// Register orchestration tasks on the pipeline queue and probe tasks on
    /// the probe queue.
    pub fn register_tasks(self: &Arc<Self>, broker: &TaskBroker) -> Result<()> {
        let orchestrator = Arc::clone(self);
        broker.register(
            &self.settings.pipeline_queue,
            "pipeline.run_document_pipeline",
            handler(move |broker, payload| {
                let orchestrator = Arc::clone(&orchestrator);
                async move {
                    let request: PipelineRequest = serde_json::from_value(payload)?;
                    orchestrator.run_document_pipeline(&broker, request).await
                }
            }),
        )?;

        let orchestrator = Arc::clone(self);
        broker.register(
            &self.settings.pipeline_queue,
            "pipeline.extract_and_probe",
            handler(move |broker, payload| {
                let orchestrator = Arc::clone(&orchestrator);
                async move {
                    orchestrator
                        .extract_and_probe(&broker, payload, &CustomDelimiterConfig::default())
                        .await
                }
            }),
        )?;

        broker.register(
            &self.settings.probe_queue,
            "probe.extract_signals",
            handler(|_broker, payload| async move {
                let samples: Vec<String> =
                    serde_json::from_value(payload["samples"].clone()).unwrap_or_default();
                let profile = extract_signals(&samples)?.rounded();
                Ok(serde_json::to_value(profile)?)
            }),
        )?;

        let probe_settings = self.probe_settings.clone();
        broker.register(
            &self.settings.probe_queue,
            "probe.recommend_strategy",
            handler(move |_broker, payload| {
                let probe_settings = probe_settings.clone();
                async move {
                    let profile: Profile = serde_json::from_value(payload["profile"].clone())?;
                    let samples: Vec<String> =
                        serde_json::from_value(payload["samples"].clone()).unwrap_or_default();
                    let emit_candidates =
                        payload["emit_candidates"].as_bool().unwrap_or(false);
                    let source_format = payload["source_format"].as_str().map(str::to_string);
                    let custom: CustomDelimiterConfig = payload
                        .get("custom")
                        .cloned()
                        .filter(|value| !value.is_null())
                        .map(serde_json::from_value)
                        .transpose()?
                        .unwrap_or_default();
                    let recommendation = recommend_strategy(
                        &profile,
                        &samples,
                        &custom,
                        emit_candidates,
                        source_format.as_deref(),
                        &probe_settings,
                    );
                    Ok(serde_json::to_value(recommendation)?)
                }
            }),
        )?;

        Ok(())
    }

    /// Full pipeline: normalize, convert (or passthrough), sample, probe.
    pub async fn run_document_pipeline(
        &self,
        broker: &TaskBroker,
        request: PipelineRequest,
    ) -> Result<Value> {
        let mut files = request.files.clone();
        for file in &mut files {
            file.source_format = normalize_source_format(Some(&file.source_format));
            file.target_format = Some(prefer_markdown_target(
                &file.source_format,
                file.target_format.as_deref(),
            ));
            if file.page_limit.is_none() {
                file.page_limit = Some(self.settings.sample_pages as u32);
            }
        }

        let all_pdf_passthrough = !files.is_empty()
            && files.iter().all(|file| {
                file.source_format == "pdf"
                    && file.target_format.as_deref().unwrap_or("pdf") == "pdf"
                    && file.object_key.is_some()
            });

        let custom = request.custom.clone().unwrap_or_default();

        if all_pdf_passthrough {
            info!("All files are stored PDFs; skipping conversion dispatch");
            let stub = json!({
                "task_id": Value::Null,
                "results": files
                    .iter()
                    .map(|file| {
                        json!({
                            "source": file.source_format,
                            "target": file.target_format,
                            "status": "success",
                            "object_key": file.object_key,
                            "output_path": Value::Null,
                            "metadata": {"note": "passthrough pdf"},
                        })
                    })
                    .collect::<Vec<_>>(),
            });
            return self.extract_and_probe(broker, stub, &custom).await;
        }

        let job = ConversionJob {
            task_id: None,
            files,
            priority: request.priority,
            callback_url: request.callback_url.clone(),
            storage: request.storage.clone(),
        };
        let conversion_result = broker
            .call(
                &self.settings.conversion_queue,
                "conversion.handle_batch",
                serde_json::to_value(&job)?,
                Duration::from_secs(self.settings.conversion_timeout_sec),
            )
            .await?;

        self.extract_and_probe(broker, conversion_result, &custom).await
    }

    /// Pick the first successful conversion artifact, sample it, and run the
    /// probe tasks on the probe queue.
    pub async fn extract_and_probe(
        &self,
        broker: &TaskBroker,
        conversion_result: Value,
        custom: &CustomDelimiterConfig,
    ) -> Result<Value> {
        let empty = Vec::new();
        let results = conversion_result["results"].as_array().unwrap_or(&empty);
        let picked = results.iter().find(|item| {
            item["status"].as_str() == Some("success")
                && (item["object_key"].is_string() || item["output_path"].is_string())
        });
        let Some(picked) = picked else {
            return Err(KilnError::Other(
                "No successful conversion result with object_key/output_path".into(),
            ));
        };

        let artifact_path = self.materialize_artifact(picked).await?;
        let source_format = picked["source"].as_str().map(normalize_source_format_str);
        let target_format = picked["target"]
            .as_str()
            .map(str::to_string)
            .or_else(|| {
                artifact_path
                    .extension()
                    .map(|ext| ext.to_string_lossy().into_owned())
            });

        let (samples, selected_pages) =
            if is_markdown_artifact(target_format.as_deref(), &artifact_path) {
                let content = tokio::fs::read_to_string(&artifact_path)
                    .await
                    .unwrap_or_default();
                sample_markdown(
                    &content,
                    self.settings.sample_pages,
                    self.settings.sample_char_limit,
                )
            } else {
                sample_pdf(
                    &artifact_path,
                    self.settings.sample_pages,
                    self.settings.sample_page_ratio,
                    self.settings.sample_char_limit,
                )?
            };

        let total_len: usize = samples.iter().map(|s| s.chars().count()).sum();
        debug!(
            pages = ?selected_pages,
            sample_length = total_len,
            artifact = %artifact_path.display(),
            "Probe samples ready"
        );

        let probe_timeout = Duration::from_secs(self.settings.probe_timeout_sec);
        let profile_value = broker
            .call(
                &self.settings.probe_queue,
                "probe.extract_signals",
                json!({ "samples": samples }),
                probe_timeout,
            )
            .await?;
        let profile: Profile = serde_json::from_value(profile_value)?;
        let profile = profile.rounded();

        let recommendation = broker
            .call(
                &self.settings.probe_queue,
                "probe.recommend_strategy",
                json!({
                    "profile": profile,
                    "samples": samples,
                    "emit_candidates": true,
                    "source_format": source_format,
                    "custom": custom,
                }),
                probe_timeout,
            )
            .await?;

        info!(
            strategy = recommendation["strategy_id"].as_str().unwrap_or_default(),
            "Probe recommendation ready"
        );

        Ok(json!({
            "conversion": conversion_result,
            "profile": profile,
            "recommendation": recommendation,
        }))
    }

    /// Local artifact path for a conversion record: the worker-local output
    /// path when it still exists, else a fresh download by object key.
    async fn materialize_artifact(&self, picked: &Value) -> Result<PathBuf> {
        if let Some(output_path) = picked["output_path"].as_str() {
            let candidate = PathBuf::from(output_path);
            if candidate.exists() {
                return Ok(candidate);
            }
        }
        let Some(object_key) = picked["object_key"].as_str() else {
            return Err(KilnError::Other(
                "Missing object_key for converted artifact".into(),
            ));
        };

        let suffix = std::path::Path::new(object_key)
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default();
        let dest = tempfile::Builder::new()
            .prefix("probe-artifact-")
            .suffix(&suffix)
            .tempfile()?
            .into_temp_path()
            .keep()
            .map_err(|e| KilnError::Other(format!("Failed to keep temp artifact: {e}")))?;

        let client = self.gateway.default_client()?;
        client.get_object(object_key, &dest).await?;
        Ok(dest)
    }
}

fn normalize_source_format_str(fmt: &str) -> String {
    normalize_source_format(Some(fmt))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::config::{AttachStoreSettings, StorageSettings};
    use kiln_core::plugins::PluginRegistry;
    use kiln_core::worker::ConversionWorker;
    use tempfile::TempDir;

    #[test]
    fn test_normalize_source_format() {
        assert_eq!(normalize_source_format(Some("application/pdf")), "pdf");
        assert_eq!(normalize_source_format(Some("HTM")), "html");
        assert_eq!(normalize_source_format(Some(" DOCX ")), "docx");
        assert_eq!(normalize_source_format(None), "");
    }

    #[test]
    fn test_prefer_markdown_target() {
        assert_eq!(prefer_markdown_target("html", Some("pdf")), "md");
        assert_eq!(prefer_markdown_target("xlsx", None), "md");
        assert_eq!(prefer_markdown_target("doc", Some("pdf")), "pdf");
        assert_eq!(prefer_markdown_target("html", Some("docx")), "docx");
    }

    fn test_stack(tmp: &TempDir) -> (TaskBroker, Arc<Orchestrator>) {
        let mut storage = StorageSettings::default();
        storage.endpoint = "http://127.0.0.1:1".into();
        storage.timeout_sec = 1;
        let mut attach = AttachStoreSettings::default();
        attach.base_url = "http://127.0.0.1:1".into();
        attach.timeout_sec = 1;
        let gateway = Arc::new(StoreGateway::new(
            storage.clone(),
            attach.clone(),
            tmp.path().join("work"),
        ));

        let mut converter_settings = kiln_core::config::ConverterSettings::default();
        converter_settings.storage = storage;
        converter_settings.attach_store = attach;
        converter_settings.work_dir = tmp.path().join("work").to_string_lossy().into_owned();
        let worker = Arc::new(ConversionWorker::new(
            converter_settings,
            Arc::clone(&gateway),
            Arc::new(PluginRegistry::new()),
        ));

        let orchestrator = Arc::new(Orchestrator::new(
            PipelineSettings::default(),
            ProbeSettings::default(),
            gateway,
        ));

        let broker = TaskBroker::new(2, 2, Duration::from_secs(30));
        worker.register_tasks(&broker, "conversion").unwrap();
        orchestrator.register_tasks(&broker).unwrap();
        broker.start();
        (broker, orchestrator)
    }

    #[tokio::test]
    async fn test_passthrough_fast_path_probes_stub() {
        let tmp = TempDir::new().unwrap();
        let (broker, orchestrator) = test_stack(&tmp);

        // The stub references a worker-local markdown artifact so no object
        // store download is needed.
        let artifact = tmp.path().join("x.md");
        std::fs::write(&artifact, "# Title\n\nBody paragraph for probing.").unwrap();

        let stub = json!({
            "task_id": null,
            "results": [{
                "source": "pdf",
                "target": "md",
                "status": "success",
                "object_key": "x.pdf",
                "output_path": artifact.to_string_lossy(),
                "metadata": {"note": "passthrough pdf"},
            }],
        });
        let result = orchestrator
            .extract_and_probe(&broker, stub, &CustomDelimiterConfig::default())
            .await
            .unwrap();
        assert!(result["recommendation"]["strategy_id"].is_string());
        assert_eq!(
            result["conversion"]["results"][0]["metadata"]["note"],
            "passthrough pdf"
        );
        assert!(result["profile"]["heading_ratio"].is_number());
    }

    #[tokio::test]
    async fn test_pipeline_skips_conversion_for_stored_pdfs() {
        let tmp = TempDir::new().unwrap();
        let (broker, orchestrator) = test_stack(&tmp);

        // object_key download will fail against the unroutable endpoint, so
        // observing *that* failure (rather than a conversion failure) proves
        // no conversion was dispatched.
        let request = PipelineRequest {
            files: vec![FileSpec {
                source_format: "pdf".into(),
                target_format: Some("pdf".into()),
                object_key: Some("x.pdf".into()),
                ..Default::default()
            }],
            ..Default::default()
        };
        let err = orchestrator
            .run_document_pipeline(&broker, request)
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(
            !message.contains("No successful conversion result"),
            "stub result should have been probed, got: {message}"
        );
    }

    #[tokio::test]
    async fn test_no_successful_result_errors() {
        let tmp = TempDir::new().unwrap();
        let (broker, orchestrator) = test_stack(&tmp);
        let conversion = json!({"task_id": "t", "results": [{"status": "failed"}]});
        let err = orchestrator
            .extract_and_probe(&broker, conversion, &CustomDelimiterConfig::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("No successful conversion result"));
    }

    #[tokio::test]
    async fn test_custom_delimiter_flows_to_recommendation() {
        let tmp = TempDir::new().unwrap();
        let (broker, orchestrator) = test_stack(&tmp);

        let artifact = tmp.path().join("delim.md");
        std::fs::write(&artifact, "---a---b---c---d---").unwrap();
        let stub = json!({
            "task_id": null,
            "results": [{
                "source": "txt",
                "target": "md",
                "status": "success",
                "object_key": "delim.md",
                "output_path": artifact.to_string_lossy(),
                "metadata": {},
            }],
        });
        let custom = CustomDelimiterConfig {
            enable: true,
            delimiters: vec!["---".into()],
            min_segments: 2,
            ..Default::default()
        };
        let result = orchestrator
            .extract_and_probe(&broker, stub, &custom)
            .await
            .unwrap();
        assert_eq!(
            result["recommendation"]["strategy_id"],
            "custom_delimiter_split"
        );
        assert_eq!(result["recommendation"]["mode_id"], 1);
        assert_eq!(result["recommendation"]["mode"], "direct_delimiter");
    }
}
