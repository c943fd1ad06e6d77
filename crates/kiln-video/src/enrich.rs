//! Metadata enricher: walks a manifest's chunks, asks the chat-completion
//! collaborator for structured metadata, and rolls the results up to the
//! document level.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use kiln_core::llm::{ChatClient, ChatOptions};
use kiln_core::queue::{handler, TaskBroker};
use kiln_core::storage::StoreGateway;
use kiln_core::{KilnError, Result};

use crate::config::MetaSettings;
use crate::manifest::{Chunk, Manifest, TextSegment};

const SYSTEM_PROMPT: &str = "You are a document metadata extraction assistant. Respond with \
a single JSON object holding summary (string), tags (string list), keywords (string list) \
and questions (string list). Output nothing besides the JSON object.";

pub struct MetaEnricher {
    settings: MetaSettings,
    gateway: Arc<StoreGateway>,
    chat: ChatClient,
}

impl MetaEnricher {
    pub fn new(settings: MetaSettings, gateway: Arc<StoreGateway>) -> Self {
        let chat = ChatClient::new(settings.chat.clone());
        Self {
            settings,
            gateway,
            chat,
        }
    }

    pub fn register_tasks(self: &Arc<Self>, broker: &TaskBroker) -> Result<()> {
        let enricher = Arc::clone(self);
        broker.register(
            &self.settings.queue.meta_queue,
            "meta.process",
            handler(move |_broker, payload| {
                let enricher = Arc::clone(&enricher);
                async move { enricher.process(payload).await }
            }),
        )
    }

    /// Load a manifest, enrich it, and store the `.meta.json` sibling.
    pub async fn process(&self, request: Value) -> Result<Value> {
        let task_id = request["task_id"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let workdir = tempfile::tempdir()?;

        let manifest_path = self.load_manifest(&request, workdir.path()).await?;
        let raw = tokio::fs::read_to_string(&manifest_path)
            .await
            .map_err(|e| KilnError::io_with_path(e, &manifest_path))?;
        let mut manifest: Manifest = serde_json::from_str(&raw)?;

        self.enrich_manifest(&mut manifest).await;

        let output_key = request["output_object_key"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| match request["manifest_object_key"].as_str() {
                Some(key) => Path::new(key)
                    .with_file_name("mm-schema.meta.json")
                    .to_string_lossy()
                    .into_owned(),
                None => format!("meta/{task_id}/mm-schema.meta.json"),
            });

        let out_path = workdir.path().join("mm-schema.meta.json");
        tokio::fs::write(&out_path, serde_json::to_string_pretty(&manifest)?)
            .await
            .map_err(|e| KilnError::io_with_path(e, &out_path))?;

        let client = self.gateway.default_client()?;
        client.put_object(&out_path, &output_key).await?;
        let url = client.download_url(&output_key);

        info!(task_id = %task_id, output = %output_key, "Manifest enriched");
        Ok(json!({
            "task_id": task_id,
            "output": {
                "bucket": client.bucket(),
                "object_key": output_key,
                "url": url,
            },
        }))
    }

    async fn load_manifest(&self, request: &Value, workdir: &Path) -> Result<PathBuf> {
        let dest = workdir.join("mm-schema.json");
        if let Some(object_key) = request["manifest_object_key"].as_str() {
            let client = self.gateway.default_client()?;
            client.get_object(object_key, &dest).await?;
            return Ok(dest);
        }
        let url = request["manifest_url"]
            .as_str()
            .or_else(|| request["input_url"].as_str());
        let Some(url) = url else {
            return Err(KilnError::Validation {
                field: "manifest".into(),
                message: "manifest_object_key or manifest_url is required".into(),
            });
        };
        let response = reqwest::get(url).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(KilnError::Upstream {
                service: "manifest-fetch".into(),
                status: status.as_u16(),
                body: format!("GET {url} failed"),
            });
        }
        let bytes = response.bytes().await?;
        tokio::fs::write(&dest, &bytes)
            .await
            .map_err(|e| KilnError::io_with_path(e, &dest))?;
        Ok(dest)
    }

    /// Enrich up to `max_chunks` chunks in place, then aggregate.
    async fn enrich_manifest(&self, manifest: &mut Manifest) {
        let total = manifest.chunks.len();
        let max_chunks = if self.settings.processing.max_chunks == 0 {
            total
        } else {
            self.settings.processing.max_chunks
        };
        let title = manifest.document_metadata.source_info.file_name.clone();
        let title = if title.is_empty() {
            manifest.document_metadata.title.clone()
        } else {
            title
        };

        for (idx, chunk) in manifest.chunks.iter_mut().enumerate() {
            if idx >= max_chunks {
                info!("Skipping chunk {idx} beyond max_chunks={max_chunks}");
                break;
            }
            normalize_text_fields(chunk);
            let prompt = self.render_prompt(chunk, &title);
            match self.extract(&prompt).await {
                Ok(extracted) => {
                    let metadata = chunk.metadata.get_or_insert_with(|| json!({}));
                    metadata["extraction"] = extracted;
                }
                Err(err) => {
                    warn!("Metadata extraction failed for chunk {}: {err}", chunk.chunk_id);
                }
            }
        }

        aggregate_document_metadata(manifest);
        let processing = manifest.processing.get_or_insert_with(|| json!({}));
        processing["metadata_extraction"] = json!({
            "status": "success",
            "processed_chunks": total.min(max_chunks),
        });
    }

    fn render_prompt(&self, chunk: &Chunk, title: &str) -> String {
        let keyframes: Vec<Value> = chunk
            .keyframes
            .iter()
            .map(|kf| json!({ "timestamp": kf.timestamp, "description": kf.description }))
            .collect();
        self.settings
            .processing
            .prompt_template
            .replace("{title}", if title.is_empty() { "untitled" } else { title })
            .replace("{start}", &chunk.temporal.start_time.to_string())
            .replace("{end}", &chunk.temporal.end_time.to_string())
            .replace("{text}", &chunk.content.text.full_text)
            .replace(
                "{keyframes}",
                &serde_json::to_string(&keyframes).unwrap_or_default(),
            )
            .replace(
                "{summary_words}",
                &self.settings.processing.summary_words.to_string(),
            )
    }

    async fn extract(&self, prompt: &str) -> Result<Value> {
        let messages = vec![
            json!({ "role": "system", "content": SYSTEM_PROMPT }),
            json!({ "role": "user", "content": prompt }),
        ];
        let options = ChatOptions {
            response_format: Some(json!({ "type": "json_object" })),
            ..Default::default()
        };
        let response = self.chat.chat(&messages, &options).await?;
        let content = ChatClient::first_content(&response).ok_or_else(|| KilnError::Upstream {
            service: "chat-completion".into(),
            status: 200,
            body: "response missing choices".into(),
        })?;
        Ok(parse_extraction(&content))
    }
}

/// Strict JSON first; anything else becomes a raw-text summary with empty
/// lists.
pub fn parse_extraction(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(value) if value.is_object() => value,
        _ => json!({
            "summary": raw.trim(),
            "tags": [],
            "keywords": [],
            "questions": [],
        }),
    }
}

/// Cross-fill `content.text`: rebuild `full_text` from segments, synthesize
/// a single whole-span segment from `full_text`, and as a last resort use
/// the keyframe descriptions.
pub fn normalize_text_fields(chunk: &mut Chunk) {
    let has_full_text = !chunk.content.text.full_text.trim().is_empty();
    let has_segments = !chunk.content.text.segments.is_empty();

    if !has_full_text && !has_segments {
        let descriptions: Vec<String> = chunk
            .keyframes
            .iter()
            .filter(|kf| !kf.description.is_empty())
            .map(|kf| kf.description.clone())
            .collect();
        if !descriptions.is_empty() {
            chunk.content.text.full_text = descriptions.join(" ");
        }
    }

    if chunk.content.text.full_text.trim().is_empty() && has_segments {
        let rebuilt: String = chunk
            .content
            .text
            .segments
            .iter()
            .map(|seg| seg.text.as_str())
            .collect();
        chunk.content.text.full_text = rebuilt.trim().to_string();
    }

    if !chunk.content.text.full_text.trim().is_empty() && chunk.content.text.segments.is_empty() {
        chunk.content.text.segments = vec![TextSegment {
            index: 0,
            start_time: Some(chunk.temporal.start_time),
            end_time: Some(chunk.temporal.end_time),
            text: chunk.content.text.full_text.clone(),
        }];
    }
}

/// Roll chunk-level extraction up to the document: lists keep first-seen
/// order, summaries join with newlines.
pub fn aggregate_document_metadata(manifest: &mut Manifest) {
    let extractions: Vec<Value> = manifest
        .chunks
        .iter()
        .filter_map(|chunk| chunk.metadata.as_ref())
        .filter_map(|metadata| metadata.get("extraction").cloned())
        .collect();

    let dedup = |key: &str| -> Vec<String> {
        let mut seen: Vec<String> = Vec::new();
        for extraction in &extractions {
            if let Some(items) = extraction[key].as_array() {
                for item in items {
                    if let Some(text) = item.as_str() {
                        if !seen.iter().any(|s| s == text) {
                            seen.push(text.to_string());
                        }
                    }
                }
            }
        }
        seen
    };

    let summaries: Vec<&str> = extractions
        .iter()
        .filter_map(|e| e["summary"].as_str())
        .filter(|s| !s.is_empty())
        .collect();

    manifest.document_metadata.extraction = Some(json!({
        "summary": if summaries.is_empty() { Value::Null } else { json!(summaries.join("\n")) },
        "tags": dedup("tags"),
        "keywords": dedup("keywords"),
        "questions": dedup("questions"),
        "chunks_with_extraction": extractions.len(),
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{ChunkContent, Keyframe, Temporal, TextContent};

    fn chunk_with(text: &str, segments: Vec<TextSegment>, keyframes: Vec<Keyframe>) -> Chunk {
        Chunk {
            chunk_id: "c1".into(),
            temporal: Temporal {
                start_time: 0.0,
                end_time: 30.0,
                duration: 30.0,
                chunk_index: 1,
            },
            content: ChunkContent {
                text: TextContent {
                    full_text: text.into(),
                    segments,
                    language: "en".into(),
                },
                ..Default::default()
            },
            keyframes,
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_extraction_strict() {
        let value = parse_extraction(r#"{"summary": "s", "tags": ["a"]}"#);
        assert_eq!(value["summary"], "s");
    }

    #[test]
    fn test_parse_extraction_fallback() {
        let value = parse_extraction("not json at all");
        assert_eq!(value["summary"], "not json at all");
        assert_eq!(value["tags"], json!([]));
        assert_eq!(value["questions"], json!([]));
    }

    #[test]
    fn test_normalize_builds_segment_from_full_text() {
        let mut chunk = chunk_with("hello", vec![], vec![]);
        normalize_text_fields(&mut chunk);
        assert_eq!(chunk.content.text.segments.len(), 1);
        assert_eq!(chunk.content.text.segments[0].text, "hello");
        assert_eq!(chunk.content.text.segments[0].end_time, Some(30.0));
    }

    #[test]
    fn test_normalize_rebuilds_full_text_from_segments() {
        let segments = vec![
            TextSegment {
                index: 1,
                start_time: Some(0.0),
                end_time: Some(10.0),
                text: "part one ".into(),
            },
            TextSegment {
                index: 2,
                start_time: Some(10.0),
                end_time: Some(30.0),
                text: "part two".into(),
            },
        ];
        let mut chunk = chunk_with("", segments, vec![]);
        normalize_text_fields(&mut chunk);
        assert_eq!(chunk.content.text.full_text, "part one part two");
    }

    #[test]
    fn test_normalize_backfills_from_keyframes() {
        let keyframes = vec![
            Keyframe {
                timestamp: 1.0,
                thumbnail_url: None,
                description: "a desk".into(),
            },
            Keyframe {
                timestamp: 2.0,
                thumbnail_url: None,
                description: "a chart".into(),
            },
        ];
        let mut chunk = chunk_with("", vec![], keyframes);
        normalize_text_fields(&mut chunk);
        assert_eq!(chunk.content.text.full_text, "a desk a chart");
        // A synthesized segment covers the chunk span.
        assert_eq!(chunk.content.text.segments.len(), 1);
    }

    #[test]
    fn test_aggregate_preserves_first_seen_order() {
        let mut manifest = Manifest {
            document_id: "d".into(),
            kb_id: "k".into(),
            kb_type: "t".into(),
            chunks: vec![
                {
                    let mut c = chunk_with("x", vec![], vec![]);
                    c.metadata = Some(json!({"extraction": {
                        "summary": "first",
                        "tags": ["b", "a"],
                        "keywords": [],
                        "questions": ["q1"],
                    }}));
                    c
                },
                {
                    let mut c = chunk_with("y", vec![], vec![]);
                    c.metadata = Some(json!({"extraction": {
                        "summary": "second",
                        "tags": ["a", "c"],
                        "keywords": ["k"],
                        "questions": [],
                    }}));
                    c
                },
            ],
            ..Default::default()
        };
        aggregate_document_metadata(&mut manifest);
        let extraction = manifest.document_metadata.extraction.unwrap();
        assert_eq!(extraction["summary"], "first\nsecond");
        assert_eq!(extraction["tags"], json!(["b", "a", "c"]));
        assert_eq!(extraction["chunks_with_extraction"], 2);
    }

    #[test]
    fn test_aggregate_empty_manifest() {
        let mut manifest = Manifest::default();
        aggregate_document_metadata(&mut manifest);
        let extraction = manifest.document_metadata.extraction.unwrap();
        assert_eq!(extraction["summary"], Value::Null);
        assert_eq!(extraction["chunks_with_extraction"], 0);
    }
}
