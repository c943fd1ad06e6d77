//! mm-schema manifest types: the canonical JSON document describing a media
//! file's slices, text, and keyframes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Temporal {
    pub start_time: f64,
    pub end_time: f64,
    pub duration: f64,
    /// 1-indexed; chunk `i` corresponds to segment `i`.
    pub chunk_index: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TextSegment {
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<f64>,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TextContent {
    #[serde(default)]
    pub full_text: String,
    #[serde(default)]
    pub segments: Vec<TextSegment>,
    #[serde(default)]
    pub language: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub duration: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkContent {
    #[serde(default)]
    pub text: TextContent,
    #[serde(default)]
    pub audio: MediaRef,
    #[serde(default)]
    pub video: MediaRef,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Keyframe {
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessingInfo {
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time: Option<f64>,
    #[serde(default)]
    pub pipeline_version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    #[serde(default)]
    pub media_type: String,
    pub temporal: Temporal,
    #[serde(default)]
    pub content: ChunkContent,
    #[serde(default)]
    pub keyframes: Vec<Keyframe>,
    #[serde(default)]
    pub processing: ProcessingInfo,
    /// Enrichment attaches `extraction` here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceInfo {
    #[serde(default)]
    pub file_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentMetadata {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub total_chunks: usize,
    #[serde(default)]
    pub source_info: SourceInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<Value>,
    /// Document-level enrichment roll-up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentSummary {
    #[serde(default)]
    pub key_points: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    pub document_id: String,
    pub kb_id: String,
    pub kb_type: String,
    pub document_metadata: DocumentMetadata,
    #[serde(default)]
    pub vector_status: String,
    #[serde(default)]
    pub status: String,
    pub chunks: Vec<Chunk>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_summary: Option<DocumentSummary>,
    /// Pipeline bookkeeping appended by post-processing stages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing: Option<Value>,
}
