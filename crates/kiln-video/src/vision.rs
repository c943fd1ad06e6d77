//! Vision captioning worker: bridges the `video_vision` queue to the
//! chat-completion collaborator.

use std::sync::Arc;

use serde_json::{json, Value};

use kiln_core::llm::{ChatClient, ChatOptions};
use kiln_core::queue::{handler, TaskBroker};
use kiln_core::Result;

use crate::config::VisionSettings;

/// Captioning instructions: OCR first, then people/scene separation, then
/// salient objects. The per-request hint is advisory.
const SYSTEM_PROMPT: &str = "You are a multimodal OCR and scene-understanding assistant. \
Respond with short bullet points: (1) OCR: every visible text string in visual order; \
(2) separate people/actions from environment/interface/objects, noting when no people \
are present; (3) the salient objects, actions and interface elements, without inventing \
anything not shown.";

pub struct VisionWorker {
    settings: VisionSettings,
    chat: ChatClient,
}

impl VisionWorker {
    pub fn new(settings: VisionSettings) -> Self {
        let chat = ChatClient::new(settings.chat.clone());
        Self { settings, chat }
    }

    pub fn register_tasks(self: &Arc<Self>, broker: &TaskBroker, queue: &str) -> Result<()> {
        let worker = Arc::clone(self);
        broker.register(
            queue,
            "mm.call",
            handler(move |_broker, payload| {
                let worker = Arc::clone(&worker);
                async move { worker.caption(payload).await }
            }),
        )
    }

    /// Caption one media URL. Returns `{text, raw}`.
    pub async fn caption(&self, payload: Value) -> Result<Value> {
        let source = &payload["source"];
        let media_url = source["input_url"].as_str().unwrap_or_default();
        let kind = source["kind"].as_str().unwrap_or("image");
        let hint = source["prompt"]
            .as_str()
            .map(str::to_string)
            .or_else(|| self.settings.user_prompt.clone())
            .unwrap_or_default();

        let messages = build_messages(media_url, kind, &hint);
        let response = self.chat.chat(&messages, &ChatOptions::default()).await?;
        let text = ChatClient::first_content(&response).unwrap_or_default();
        Ok(json!({ "text": text, "raw": response }))
    }
}

fn build_messages(media_url: &str, kind: &str, hint: &str) -> Vec<Value> {
    let mut media_item = json!({
        "type": "image_url",
        "image_url": { "url": media_url },
    });
    if kind == "video" {
        media_item["image_url"]["image_format"] = json!("video");
    }
    let user_text = if hint.is_empty() {
        "Describe this frame.".to_string()
    } else {
        hint.to_string()
    };
    vec![
        json!({ "role": "system", "content": SYSTEM_PROMPT }),
        json!({
            "role": "user",
            "content": [media_item, { "type": "text", "text": user_text }],
        }),
    ]
}
