//! ASR worker: bridges the `video_asr` queue to the external transcription
//! endpoint.

use std::sync::Arc;

use serde_json::{json, Value};

use kiln_core::queue::{handler, TaskBroker};
use kiln_core::{KilnError, Result};

use crate::config::AsrSettings;

pub struct AsrWorker {
    settings: AsrSettings,
    http: reqwest::Client,
}

impl AsrWorker {
    pub fn new(settings: AsrSettings) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(settings.request_timeout_sec))
            .user_agent("kiln-asr")
            .build()
            .expect("failed to build reqwest client");
        Self { settings, http }
    }

    pub fn register_tasks(self: &Arc<Self>, broker: &TaskBroker, queue: &str) -> Result<()> {
        let worker = Arc::clone(self);
        broker.register(
            queue,
            "asr.transcribe",
            handler(move |_broker, payload| {
                let worker = Arc::clone(&worker);
                async move { worker.transcribe(payload).await }
            }),
        )
    }

    /// POST the audio URL to the transcription endpoint and normalize the
    /// response to `{text, language, duration, segments[]}`.
    pub async fn transcribe(&self, payload: Value) -> Result<Value> {
        let source = &payload["source"];
        let Some(input_url) = source["input_url"].as_str() else {
            return Err(KilnError::Validation {
                field: "source.input_url".into(),
                message: "input_url required for transcription".into(),
            });
        };
        let language = source["language"]
            .as_str()
            .map(str::to_string)
            .or_else(|| self.settings.language.clone());

        let response = self
            .http
            .post(&self.settings.endpoint)
            .json(&json!({
                "input_url": input_url,
                "language": language,
            }))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(KilnError::Upstream {
                service: "asr".into(),
                status: status.as_u16(),
                body,
            });
        }
        let body: Value = response.json().await?;
        Ok(normalize_transcript(&body, language.as_deref()))
    }
}

/// Keep only the fields downstream consumers rely on, with sane defaults.
fn normalize_transcript(body: &Value, fallback_language: Option<&str>) -> Value {
    let segments: Vec<Value> = body["segments"]
        .as_array()
        .map(|segs| {
            segs.iter()
                .map(|seg| {
                    json!({
                        "start": seg["start"].as_f64().unwrap_or(0.0),
                        "end": seg["end"].as_f64().unwrap_or(0.0),
                        "text": seg["text"].as_str().unwrap_or_default(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    json!({
        "text": body["text"].as_str().unwrap_or_default(),
        "language": body["language"]
            .as_str()
            .or(fallback_language)
            .unwrap_or_default(),
        "duration": body["duration"].as_f64(),
        "segments": segments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_transcript_defaults() {
        let normalized = normalize_transcript(&json!({}), Some("zh"));
        assert_eq!(normalized["text"], "");
        assert_eq!(normalized["language"], "zh");
        assert_eq!(normalized["segments"], json!([]));
    }

    #[test]
    fn test_normalize_transcript_segments() {
        let body = json!({
            "text": "a b",
            "language": "en",
            "segments": [{"start": 0.5, "end": 2.0, "text": "a b", "noise": 1}],
        });
        let normalized = normalize_transcript(&body, None);
        assert_eq!(normalized["segments"][0]["start"], 0.5);
        assert!(normalized["segments"][0].get("noise").is_none());
    }

    #[tokio::test]
    async fn test_missing_input_url_rejected() {
        let worker = AsrWorker::new(AsrSettings::default());
        let err = worker.transcribe(json!({"source": {}})).await;
        assert!(matches!(err, Err(KilnError::Validation { .. })));
    }
}
