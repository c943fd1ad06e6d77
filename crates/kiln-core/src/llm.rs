//! Chat-completion collaborator client.
//!
//! Provider-neutral: every LLM-ish dependency (metadata extraction, vision
//! captioning, the generic chat worker) talks to an OpenAI-compatible
//! `/chat/completions` endpoint through this client. Supports both the plain
//! JSON response and the SSE streaming variant stitched into one message.

use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::ChatSettings;
use crate::error::{KilnError, Result};

#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<u32>,
    pub response_format: Option<Value>,
}

pub struct ChatClient {
    settings: ChatSettings,
    http: reqwest::Client,
}

impl ChatClient {
    pub fn new(settings: ChatSettings) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(settings.request_timeout_sec))
            .user_agent("kiln-llm")
            .build()
            .expect("failed to build reqwest client");
        Self { settings, http }
    }

    pub fn model(&self) -> &str {
        &self.settings.model
    }

    fn endpoint(&self) -> String {
        let base = self.settings.api_base.trim_end_matches('/');
        if base.ends_with("/chat/completions") {
            base.to_string()
        } else {
            format!("{base}/chat/completions")
        }
    }

    fn api_key(&self) -> Result<&str> {
        self.settings
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| KilnError::Config {
                message: "Chat-completion api_key is required".into(),
            })
    }

    fn payload(&self, messages: &[Value], options: &ChatOptions, stream: bool) -> Value {
        let mut payload = json!({
            "model": options.model.as_deref().unwrap_or(&self.settings.model),
            "messages": messages,
        });
        if let Some(t) = options.temperature {
            payload["temperature"] = json!(t);
        }
        if let Some(p) = options.top_p {
            payload["top_p"] = json!(p);
        }
        if let Some(m) = options.max_tokens {
            payload["max_tokens"] = json!(m);
        }
        if let Some(rf) = &options.response_format {
            payload["response_format"] = rf.clone();
        }
        if stream {
            payload["stream"] = json!(true);
        }
        payload
    }

    /// One-shot completion. Returns the full response body.
    pub async fn chat(&self, messages: &[Value], options: &ChatOptions) -> Result<Value> {
        let api_key = self.api_key()?;
        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(api_key)
            .json(&self.payload(messages, options, false))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(KilnError::Upstream {
                service: "chat-completion".into(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }

    /// Assistant text of the first choice, if any.
    pub fn first_content(response: &Value) -> Option<String> {
        response
            .get("choices")?
            .get(0)?
            .get("message")?
            .get("content")?
            .as_str()
            .map(str::to_string)
    }

    /// Streaming completion: reads SSE frames, stitches `delta.content`
    /// fragments into one assistant message, stops at the `[DONE]` sentinel.
    pub async fn chat_streamed(&self, messages: &[Value], options: &ChatOptions) -> Result<String> {
        let api_key = self.api_key()?;
        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(api_key)
            .json(&self.payload(messages, options, true))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(KilnError::Upstream {
                service: "chat-completion".into(),
                status: status.as_u16(),
                body,
            });
        }

        let mut content = String::new();
        let mut buffer = String::new();
        let mut stream = response.bytes_stream();
        'outer: while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(newline) = buffer.find('\n') {
                let line = buffer[..newline].trim().to_string();
                buffer.drain(..=newline);
                if let Some(fragment) = parse_sse_line(&line) {
                    match fragment {
                        SseFrame::Done => break 'outer,
                        SseFrame::Delta(text) => content.push_str(&text),
                    }
                }
            }
        }
        debug!("Streamed completion of {} chars", content.len());
        Ok(content)
    }
}

enum SseFrame {
    Delta(String),
    Done,
}

fn parse_sse_line(line: &str) -> Option<SseFrame> {
    let data = line.strip_prefix("data:")?.trim();
    if data == "[DONE]" {
        return Some(SseFrame::Done);
    }
    let value: Value = serde_json::from_str(data).ok()?;
    let delta = value
        .get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()?
        .to_string();
    if delta.is_empty() {
        None
    } else {
        Some(SseFrame::Delta(delta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_normalization() {
        let client = ChatClient::new(ChatSettings {
            api_base: "https://api.example.com/v1".into(),
            ..Default::default()
        });
        assert_eq!(client.endpoint(), "https://api.example.com/v1/chat/completions");

        let already = ChatClient::new(ChatSettings {
            api_base: "https://api.example.com/v1/chat/completions/".into(),
            ..Default::default()
        });
        assert_eq!(already.endpoint(), "https://api.example.com/v1/chat/completions");
    }

    #[test]
    fn test_missing_api_key() {
        let client = ChatClient::new(ChatSettings::default());
        assert!(client.api_key().is_err());
    }

    #[test]
    fn test_first_content() {
        let response = json!({
            "choices": [{"message": {"content": "{\"summary\": \"ok\"}"}}]
        });
        assert_eq!(
            ChatClient::first_content(&response).as_deref(),
            Some("{\"summary\": \"ok\"}")
        );
        assert!(ChatClient::first_content(&json!({"choices": []})).is_none());
    }

    #[test]
    fn test_parse_sse_line() {
        assert!(matches!(parse_sse_line("data: [DONE]"), Some(SseFrame::Done)));
        let frame = parse_sse_line(r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#);
        match frame {
            Some(SseFrame::Delta(text)) => assert_eq!(text, "Hel"),
            _ => panic!("expected delta frame"),
        }
        assert!(parse_sse_line(": keep-alive").is_none());
        assert!(parse_sse_line("").is_none());
    }

    #[test]
    fn test_payload_optional_fields() {
        let client = ChatClient::new(ChatSettings::default());
        let options = ChatOptions {
            temperature: Some(0.2),
            response_format: Some(json!({"type": "json_object"})),
            ..Default::default()
        };
        let payload = client.payload(&[json!({"role": "user", "content": "hi"})], &options, false);
        assert_eq!(payload["temperature"], 0.2);
        assert_eq!(payload["response_format"]["type"], "json_object");
        assert!(payload.get("stream").is_none());
        assert!(payload.get("max_tokens").is_none());
    }
}
