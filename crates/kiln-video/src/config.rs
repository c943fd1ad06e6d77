//! Settings for the video slicing pipeline (`VIDEO_`), the ASR worker
//! (`ASR_`), the vision worker (`MM_`), and the metadata enricher (`META_`).

use serde::{Deserialize, Serialize};

use kiln_core::config::{load_settings, ChatSettings};
use kiln_core::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoQueueSettings {
    pub video_queue: String,
    pub asr_queue: String,
    pub vision_queue: String,
}

impl Default for VideoQueueSettings {
    fn default() -> Self {
        Self {
            video_queue: "video".into(),
            asr_queue: "video_asr".into(),
            vision_queue: "video_vision".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoProcessingSettings {
    pub frame_sample_fps: f64,
    pub fixed_segment_seconds: f64,
    pub scene_change_threshold: f64,
    pub scene_min_duration_sec: f64,
    /// Per-chunk cap on captioned frames; 0 captions every frame.
    pub frame_caption_max: u32,
    pub asr_timeout_sec: u64,
    pub vision_timeout_sec: u64,
    pub frame_prompt: String,
}

impl Default for VideoProcessingSettings {
    fn default() -> Self {
        Self {
            frame_sample_fps: 0.5,
            fixed_segment_seconds: 30.0,
            scene_change_threshold: 0.35,
            scene_min_duration_sec: 5.0,
            frame_caption_max: 8,
            asr_timeout_sec: 300,
            vision_timeout_sec: 180,
            frame_prompt: "Describe the main subject and scene in one sentence.".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VideoSettings {
    pub queues: VideoQueueSettings,
    pub processing: VideoProcessingSettings,
}

impl VideoSettings {
    pub fn from_env() -> Result<Self> {
        load_settings("VIDEO", None)
    }
}

/// ASR worker settings: the external transcription endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsrSettings {
    pub endpoint: String,
    pub request_timeout_sec: u64,
    pub download_timeout_sec: u64,
    pub language: Option<String>,
}

impl Default for AsrSettings {
    fn default() -> Self {
        Self {
            endpoint: "http://asr-service/transcribe".into(),
            request_timeout_sec: 300,
            download_timeout_sec: 60,
            language: None,
        }
    }
}

impl AsrSettings {
    pub fn from_env() -> Result<Self> {
        load_settings("ASR", None)
    }
}

/// Vision captioning worker settings (`MM_`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VisionSettings {
    pub chat: ChatSettings,
    pub user_prompt: Option<String>,
}

impl VisionSettings {
    pub fn from_env() -> Result<Self> {
        load_settings("MM", None)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaProcessingSettings {
    /// Cap on enriched chunks; 0 enriches all.
    pub max_chunks: usize,
    pub summary_words: usize,
    pub prompt_template: String,
}

impl Default for MetaProcessingSettings {
    fn default() -> Self {
        Self {
            max_chunks: 0,
            summary_words: 60,
            prompt_template: concat!(
                "Document: {title}\n",
                "Chunk span: {start} - {end}\n",
                "Keyframes: {keyframes}\n",
                "Text:\n{text}\n\n",
                "Summarize in about {summary_words} words and propose tags, ",
                "keywords and questions.",
            )
            .into(),
        }
    }
}

/// Metadata enricher settings (`META_`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetaSettings {
    pub chat: ChatSettings,
    pub processing: MetaProcessingSettings,
    pub queue: MetaQueueSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaQueueSettings {
    pub meta_queue: String,
}

impl Default for MetaQueueSettings {
    fn default() -> Self {
        Self {
            meta_queue: "meta".into(),
        }
    }
}

impl MetaSettings {
    pub fn from_env() -> Result<Self> {
        load_settings("META", None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let video = VideoSettings::default();
        assert_eq!(video.queues.asr_queue, "video_asr");
        assert!((video.processing.fixed_segment_seconds - 30.0).abs() < 1e-9);
        assert_eq!(video.processing.frame_caption_max, 8);

        let meta = MetaSettings::default();
        assert_eq!(meta.processing.max_chunks, 0);
        assert!(meta.processing.prompt_template.contains("{title}"));
    }
}
