//! Video slicing pipeline: segment, slice, caption, assemble the manifest.
//!
//! External-worker failures (ASR, vision) degrade to missing fields in the
//! manifest; failures inside this pipeline (download, probe, slicing,
//! uploads) fail the whole job.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use kiln_core::job::FileSpec;
use kiln_core::queue::{handler, TaskBroker};
use kiln_core::storage::{S3Client, StoreGateway};
use kiln_core::{KilnError, Result};

use crate::config::VideoSettings;
use crate::ffmpeg;
use crate::manifest::{
    Chunk, ChunkContent, DocumentMetadata, DocumentSummary, Keyframe, Manifest, MediaRef,
    ProcessingInfo, SourceInfo, Temporal, TextContent, TextSegment,
};
use crate::segment::{fixed_segments, segments_from_cuts, Segment};

/// Request accepted by `video.process`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VideoSliceRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kb_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kb_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default)]
    pub scene_cut: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene_min_duration_sec: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_sample_fps: Option<f64>,
    /// Per-chunk caption cap; absent or non-positive captions all frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_caption_max: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_prompt: Option<String>,
}

/// An artifact stored through the gateway.
#[derive(Debug, Clone)]
struct StoredObject {
    object_key: String,
    url: String,
}

/// An extracted keyframe: timestamp, stored URL, optional caption.
#[derive(Debug, Clone)]
struct FrameRef {
    timestamp: f64,
    url: String,
    description: Option<String>,
}

pub struct VideoPipeline {
    settings: VideoSettings,
    gateway: Arc<StoreGateway>,
}

impl VideoPipeline {
    pub fn new(settings: VideoSettings, gateway: Arc<StoreGateway>) -> Self {
        Self { settings, gateway }
    }

    pub fn register_tasks(self: &Arc<Self>, broker: &TaskBroker) -> Result<()> {
        let pipeline = Arc::clone(self);
        broker.register(
            &self.settings.queues.video_queue,
            "video.process",
            handler(move |broker, payload| {
                let pipeline = Arc::clone(&pipeline);
                async move {
                    let request: VideoSliceRequest = serde_json::from_value(payload)?;
                    pipeline.process(&broker, request).await
                }
            }),
        )
    }

    async fn upload(&self, client: &S3Client, path: &Path, key: &str) -> Result<StoredObject> {
        client.put_object(path, key).await?;
        Ok(StoredObject {
            object_key: key.to_string(),
            url: client.presigned_get(key, 3600),
        })
    }

    /// Run the whole slicing pipeline and return the stored manifest
    /// envelope.
    pub async fn process(&self, broker: &TaskBroker, request: VideoSliceRequest) -> Result<Value> {
        let task_id = request
            .task_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let started = Instant::now();
        let workdir = tempfile::tempdir()?;
        let client = self.gateway.default_client()?;
        client.ensure_bucket().await?;

        let media_spec = FileSpec {
            source_format: "mp4".into(),
            object_key: request.object_key.clone(),
            input_url: request.input_url.clone(),
            ..Default::default()
        };
        if media_spec.object_key.is_none() && media_spec.input_url.is_none() {
            return Err(KilnError::Validation {
                field: "source".into(),
                message: "input_url or object_key required".into(),
            });
        }
        let video_path = self.gateway.materialize(&media_spec, &client).await?;

        let processing = &self.settings.processing;
        let mut duration = ffmpeg::probe_duration(&video_path).await?;
        if duration <= 0.0 {
            duration = processing.fixed_segment_seconds * 3.0;
        }

        let segment_seconds = request
            .segment_seconds
            .unwrap_or(processing.fixed_segment_seconds);
        let fps = request.frame_sample_fps.unwrap_or(processing.frame_sample_fps);

        let mut segments: Vec<Segment> = Vec::new();
        if request.scene_cut {
            let threshold = request
                .scene_threshold
                .unwrap_or(processing.scene_change_threshold);
            let min_duration = request
                .scene_min_duration_sec
                .unwrap_or(processing.scene_min_duration_sec);
            let cuts = ffmpeg::scene_cut_timestamps(&video_path, threshold).await;
            segments = segments_from_cuts(&cuts, min_duration, duration);
            if segments.is_empty() {
                warn!("Scene cut found no segments; falling back to fixed {segment_seconds:.2}s windows");
            }
        }
        if segments.is_empty() {
            segments = fixed_segments(duration, segment_seconds);
        }
        if segments.is_empty() {
            segments = vec![Segment {
                start: 0.0,
                end: duration,
            }];
        }

        let base_prefix = format!("mm/video/{task_id}");
        let ext = video_path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let original = self
            .upload(&client, &video_path, &format!("{base_prefix}/video/original{ext}"))
            .await?;

        let audio_path = ffmpeg::extract_audio(&video_path, workdir.path()).await?;
        let full_audio = if audio_path.exists() {
            Some(
                self.upload(&client, &audio_path, &format!("{base_prefix}/audio/full.m4a"))
                    .await?,
            )
        } else {
            None
        };

        let mut video_slices = Vec::with_capacity(segments.len());
        let mut audio_slices = Vec::with_capacity(segments.len());
        for (idx, segment) in segments.iter().enumerate() {
            let video_out = workdir.path().join(format!("video_seg_{idx:04}.mp4"));
            ffmpeg::slice_copy(&video_path, segment, &video_out).await?;
            video_slices.push(
                self.upload(
                    &client,
                    &video_out,
                    &format!("{base_prefix}/video/slices/seg_{idx:04}.mp4"),
                )
                .await?,
            );

            let audio_out = workdir.path().join(format!("audio_seg_{idx:04}.m4a"));
            ffmpeg::slice_copy(&audio_path, segment, &audio_out).await?;
            audio_slices.push(
                self.upload(
                    &client,
                    &audio_out,
                    &format!("{base_prefix}/audio/slices/seg_{idx:04}.m4a"),
                )
                .await?,
            );
        }

        let mut frames: Vec<FrameRef> = Vec::new();
        for (idx, (timestamp, path)) in ffmpeg::extract_frames(&video_path, fps, workdir.path())
            .await?
            .into_iter()
            .enumerate()
        {
            let stored = self
                .upload(&client, &path, &format!("{base_prefix}/frames/frame_{idx:06}.jpg"))
                .await?;
            frames.push(FrameRef {
                timestamp,
                url: stored.url,
                description: None,
            });
        }

        let asr_results = self.transcribe_slices(broker, &request, &audio_slices).await;
        self.caption_frames(broker, &request, &segments, &mut frames).await;

        let processing_time = (started.elapsed().as_secs_f64() * 1000.0).round() / 1000.0;
        let manifest = build_manifest(
            &task_id,
            &request,
            duration,
            &segments,
            &original,
            full_audio.as_ref(),
            &video_slices,
            &audio_slices,
            &frames,
            &asr_results,
            processing_time,
        );

        let manifest_path = workdir.path().join("mm-schema.json");
        let manifest_json = serde_json::to_string_pretty(&manifest)?;
        tokio::fs::write(&manifest_path, manifest_json)
            .await
            .map_err(|e| KilnError::io_with_path(e, &manifest_path))?;
        let stored_manifest = self
            .upload(&client, &manifest_path, &format!("{base_prefix}/json/mm-schema.json"))
            .await?;

        info!(
            task_id = %task_id,
            chunks = manifest.chunks.len(),
            "Video manifest stored"
        );

        Ok(json!({
            "task_id": task_id,
            "bucket": client.bucket(),
            "manifest_key": stored_manifest.object_key,
            "manifest_url": stored_manifest.url,
            "prefix": base_prefix,
            "doc": manifest,
        }))
    }

    /// Fan out one ASR task per audio slice, then collect in segment order.
    /// Failures degrade to empty transcripts.
    async fn transcribe_slices(
        &self,
        broker: &TaskBroker,
        request: &VideoSliceRequest,
        audio_slices: &[StoredObject],
    ) -> Vec<Value> {
        let queue = &self.settings.queues.asr_queue;
        let timeout = Duration::from_secs(self.settings.processing.asr_timeout_sec);

        let mut pending = Vec::with_capacity(audio_slices.len());
        for slice in audio_slices {
            let payload = json!({
                "source": {
                    "input_url": slice.url,
                    "language": request.language,
                }
            });
            match broker.dispatch(queue, "asr.transcribe", payload).await {
                Ok(task_id) => pending.push(Some(task_id)),
                Err(err) => {
                    warn!("ASR dispatch failed: {err}");
                    pending.push(None);
                }
            }
        }

        let mut results = Vec::with_capacity(pending.len());
        for task_id in pending {
            let result = match task_id {
                Some(task_id) => match broker.wait(&task_id, timeout).await {
                    Ok(value) => value,
                    Err(err) => {
                        warn!("ASR task failed: {err}");
                        json!({})
                    }
                },
                None => json!({}),
            };
            results.push(result);
        }
        results
    }

    /// Pick frames per chunk, dedup by timestamp, dispatch every caption
    /// task, then collect. Captions land back on the frames.
    async fn caption_frames(
        &self,
        broker: &TaskBroker,
        request: &VideoSliceRequest,
        segments: &[Segment],
        frames: &mut [FrameRef],
    ) {
        let queue = &self.settings.queues.vision_queue;
        let timeout = Duration::from_secs(self.settings.processing.vision_timeout_sec);
        let prompt = request
            .frame_prompt
            .clone()
            .unwrap_or_else(|| self.settings.processing.frame_prompt.clone());

        // Evenly pick up to the cap per chunk so captions cover the whole
        // timeline instead of only its head.
        let mut chosen: Vec<usize> = Vec::new();
        for segment in segments {
            let in_chunk: Vec<usize> = frames
                .iter()
                .enumerate()
                .filter(|(_, f)| f.timestamp >= segment.start && f.timestamp < segment.end)
                .map(|(idx, _)| idx)
                .collect();
            let cap = match request.frame_caption_max {
                None => in_chunk.len(),
                Some(limit) if limit <= 0 => in_chunk.len(),
                Some(limit) => limit as usize,
            };
            chosen.extend(evenly_pick(&in_chunk, cap));
        }

        // Dedup by timestamp so overlapping picks caption once.
        let mut seen: HashMap<u64, usize> = HashMap::new();
        let unique: Vec<usize> = chosen
            .into_iter()
            .filter(|idx| {
                let bits = frames[*idx].timestamp.to_bits();
                if seen.contains_key(&bits) {
                    false
                } else {
                    seen.insert(bits, *idx);
                    true
                }
            })
            .collect();

        let mut pending: Vec<(usize, String)> = Vec::new();
        for idx in unique {
            let payload = json!({
                "source": {
                    "input_url": frames[idx].url,
                    "kind": "image",
                    "prompt": prompt,
                }
            });
            match broker.dispatch(queue, "mm.call", payload).await {
                Ok(task_id) => pending.push((idx, task_id)),
                Err(err) => warn!(
                    "Frame caption dispatch failed (ts={}): {err}",
                    frames[idx].timestamp
                ),
            }
        }

        for (idx, task_id) in pending {
            match broker.wait(&task_id, timeout).await {
                Ok(value) => {
                    if let Some(text) = value["text"].as_str().filter(|t| !t.is_empty()) {
                        frames[idx].description = Some(text.to_string());
                    }
                }
                Err(err) => warn!(
                    "Frame caption collect failed (ts={}): {err}",
                    frames[idx].timestamp
                ),
            }
        }
    }
}

/// Pick up to `limit` items spread evenly over the input order.
fn evenly_pick(items: &[usize], limit: usize) -> Vec<usize> {
    if limit == 0 || items.len() <= limit {
        return items.to_vec();
    }
    let step = ((items.len() as f64 / limit as f64).round() as usize).max(1);
    let mut picked = Vec::with_capacity(limit);
    let mut idx = 0;
    while idx < items.len() && picked.len() < limit {
        picked.push(items[idx]);
        idx += step;
    }
    picked
}

#[allow(clippy::too_many_arguments)]
fn build_manifest(
    task_id: &str,
    request: &VideoSliceRequest,
    duration: f64,
    segments: &[Segment],
    original: &StoredObject,
    full_audio: Option<&StoredObject>,
    video_slices: &[StoredObject],
    audio_slices: &[StoredObject],
    frames: &[FrameRef],
    asr_results: &[Value],
    processing_time: f64,
) -> Manifest {
    let title = request.title.clone().unwrap_or_else(|| {
        Path::new(&original.object_key)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| task_id.to_string())
    });
    let format = Path::new(&original.object_key)
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut chunks = Vec::with_capacity(segments.len());
    for (idx, segment) in segments.iter().enumerate() {
        let seg_duration = segment.duration();
        let asr = asr_results.get(idx).cloned().unwrap_or_else(|| json!({}));
        let full_text = asr["text"].as_str().unwrap_or_default().to_string();
        let language = asr["language"]
            .as_str()
            .map(str::to_string)
            .or_else(|| request.language.clone())
            .unwrap_or_else(|| "unknown".into());
        let text_segments: Vec<TextSegment> = asr["segments"]
            .as_array()
            .map(|segs| {
                segs.iter()
                    .enumerate()
                    .map(|(i, seg)| TextSegment {
                        index: i + 1,
                        start_time: seg["start"].as_f64(),
                        end_time: seg["end"].as_f64(),
                        text: seg["text"].as_str().unwrap_or_default().to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let keyframes: Vec<Keyframe> = frames
            .iter()
            .filter(|f| f.timestamp >= segment.start && f.timestamp < segment.end)
            .map(|f| Keyframe {
                timestamp: f.timestamp,
                thumbnail_url: Some(f.url.clone()),
                description: f.description.clone().unwrap_or_default(),
            })
            .collect();

        chunks.push(Chunk {
            chunk_id: format!("{task_id}_seg_{idx:04}"),
            media_type: "video".into(),
            temporal: Temporal {
                start_time: segment.start,
                end_time: segment.end,
                duration: seg_duration,
                chunk_index: idx + 1,
            },
            content: ChunkContent {
                text: TextContent {
                    full_text,
                    segments: text_segments,
                    language,
                },
                audio: MediaRef {
                    url: audio_slices.get(idx).map(|o| o.url.clone()),
                    format: "m4a".into(),
                    duration: seg_duration,
                },
                video: MediaRef {
                    url: video_slices.get(idx).map(|o| o.url.clone()),
                    format: "mp4".into(),
                    duration: seg_duration,
                },
            },
            keyframes,
            processing: ProcessingInfo {
                status: "success".into(),
                processing_time: Some(processing_time),
                pipeline_version: "kiln-video-1".into(),
            },
            metadata: None,
        });
    }

    let document_summary = (!frames.is_empty()).then(|| DocumentSummary {
        key_points: frames
            .iter()
            .take(5)
            .map(|f| format!("frame@{}", (f.timestamp * 100.0).round() / 100.0))
            .collect(),
    });

    Manifest {
        document_id: request.document_id.clone().unwrap_or_else(|| task_id.to_string()),
        kb_id: request.kb_id.clone().unwrap_or_else(|| "default".into()),
        kb_type: request.kb_type.clone().unwrap_or_else(|| "enterprise".into()),
        document_metadata: DocumentMetadata {
            title: title.clone(),
            format,
            duration,
            total_chunks: chunks.len(),
            source_info: SourceInfo {
                file_name: title,
                storage_url: Some(original.url.clone()),
                bundle_url: None,
            },
            audio: full_audio.map(|a| json!({ "url": a.url })),
            extraction: None,
        },
        vector_status: "pending".into(),
        status: request.status.clone().unwrap_or_else(|| "active".into()),
        chunks,
        document_summary,
        processing: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(key: &str) -> StoredObject {
        StoredObject {
            object_key: key.to_string(),
            url: format!("http://store/{key}"),
        }
    }

    fn frame(ts: f64) -> FrameRef {
        FrameRef {
            timestamp: ts,
            url: format!("http://store/frame_{ts}.jpg"),
            description: None,
        }
    }

    #[test]
    fn test_evenly_pick_under_limit() {
        assert_eq!(evenly_pick(&[1, 2, 3], 5), vec![1, 2, 3]);
        assert_eq!(evenly_pick(&[1, 2, 3], 0), vec![1, 2, 3]);
    }

    #[test]
    fn test_evenly_pick_spreads() {
        let items: Vec<usize> = (0..10).collect();
        let picked = evenly_pick(&items, 3);
        assert_eq!(picked.len(), 3);
        // No head bias: the last pick is well past the midpoint.
        assert!(picked[2] >= 6);
    }

    fn sample_manifest(asr: Vec<Value>) -> Manifest {
        let segments = vec![
            Segment { start: 0.0, end: 30.0 },
            Segment { start: 30.0, end: 50.0 },
        ];
        build_manifest(
            "t1",
            &VideoSliceRequest::default(),
            50.0,
            &segments,
            &stored("mm/video/t1/video/original.mp4"),
            Some(&stored("mm/video/t1/audio/full.m4a")),
            &[stored("v0"), stored("v1")],
            &[stored("a0"), stored("a1")],
            &[frame(2.0), frame(32.0), frame(48.0)],
            &asr,
            1.234,
        )
    }

    #[test]
    fn test_manifest_chunk_segment_parity() {
        let manifest = sample_manifest(vec![]);
        assert_eq!(manifest.document_metadata.total_chunks, 2);
        assert_eq!(manifest.chunks.len(), 2);
        for chunk in &manifest.chunks {
            assert!(chunk.temporal.end_time > chunk.temporal.start_time);
        }
        assert_eq!(manifest.chunks[0].temporal.chunk_index, 1);
        assert_eq!(manifest.chunks[1].temporal.chunk_index, 2);
        assert_eq!(manifest.chunks[1].chunk_id, "t1_seg_0001");
    }

    #[test]
    fn test_manifest_frames_assigned_to_chunks() {
        let manifest = sample_manifest(vec![]);
        assert_eq!(manifest.chunks[0].keyframes.len(), 1);
        assert_eq!(manifest.chunks[1].keyframes.len(), 2);
    }

    #[test]
    fn test_manifest_asr_text_and_segments() {
        let asr = vec![
            json!({
                "text": "hello world",
                "language": "en",
                "segments": [{"start": 0.0, "end": 3.0, "text": "hello world"}],
            }),
            json!({}),
        ];
        let manifest = sample_manifest(asr);
        let first = &manifest.chunks[0].content.text;
        assert_eq!(first.full_text, "hello world");
        assert_eq!(first.language, "en");
        assert_eq!(first.segments[0].index, 1);
        // Degraded second chunk: empty transcript, not a failure.
        let second = &manifest.chunks[1].content.text;
        assert_eq!(second.full_text, "");
        assert_eq!(second.language, "unknown");
    }

    #[test]
    fn test_manifest_key_points_capped_at_five() {
        let frames: Vec<FrameRef> = (0..8).map(|i| frame(i as f64)).collect();
        let manifest = build_manifest(
            "t2",
            &VideoSliceRequest::default(),
            50.0,
            &[Segment { start: 0.0, end: 50.0 }],
            &stored("orig.mp4"),
            None,
            &[stored("v0")],
            &[stored("a0")],
            &frames,
            &[],
            0.5,
        );
        let summary = manifest.document_summary.unwrap();
        assert_eq!(summary.key_points.len(), 5);
        assert_eq!(summary.key_points[0], "frame@0");
    }

    #[test]
    fn test_manifest_audio_url_carried() {
        let manifest = sample_manifest(vec![]);
        assert_eq!(
            manifest.document_metadata.audio.unwrap()["url"],
            "http://store/mm/video/t1/audio/full.m4a"
        );
        assert_eq!(
            manifest.chunks[0].content.audio.url.as_deref(),
            Some("http://store/a0")
        );
    }
}
