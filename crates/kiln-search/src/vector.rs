//! Vector worker: embeddings and LLM-based reranking through an
//! OpenAI-compatible API (`VECTOR_` settings).

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use kiln_core::config::{load_settings, ChatSettings};
use kiln_core::llm::{ChatClient, ChatOptions};
use kiln_core::queue::{handler, TaskBroker};
use kiln_core::{KilnError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorSettings {
    pub chat: ChatSettings,
    pub embed_model: String,
    pub vector_queue: String,
}

impl Default for VectorSettings {
    fn default() -> Self {
        Self {
            chat: ChatSettings::default(),
            embed_model: "text-embedding-v1".into(),
            vector_queue: "vector".into(),
        }
    }
}

impl VectorSettings {
    pub fn from_env() -> Result<Self> {
        load_settings("VECTOR", None)
    }
}

pub struct VectorWorker {
    settings: VectorSettings,
    chat: ChatClient,
    http: reqwest::Client,
}

impl VectorWorker {
    pub fn new(settings: VectorSettings) -> Self {
        let chat = ChatClient::new(settings.chat.clone());
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(settings.chat.request_timeout_sec))
            .user_agent("kiln-vector")
            .build()
            .expect("failed to build reqwest client");
        Self {
            settings,
            chat,
            http,
        }
    }

    pub fn register_tasks(self: &Arc<Self>, broker: &TaskBroker) -> Result<()> {
        let queue = self.settings.vector_queue.clone();

        let worker = Arc::clone(self);
        broker.register(
            &queue,
            "vector.embed",
            handler(move |_b, payload| {
                let worker = Arc::clone(&worker);
                async move { worker.embed(payload).await }
            }),
        )?;

        let worker = Arc::clone(self);
        broker.register(
            &queue,
            "vector.rerank",
            handler(move |_b, payload| {
                let worker = Arc::clone(&worker);
                async move { worker.rerank(payload).await }
            }),
        )
    }

    fn embeddings_endpoint(&self) -> String {
        let base = self.settings.chat.api_base.trim_end_matches('/');
        if base.ends_with("/embeddings") {
            base.to_string()
        } else {
            format!("{base}/embeddings")
        }
    }

    /// Embed one or more inputs. Returns `{model, data, usage, raw}`.
    pub async fn embed(&self, request: Value) -> Result<Value> {
        let inputs: Vec<String> = match &request["input"] {
            Value::String(s) => vec![s.clone()],
            Value::Array(items) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        };
        if inputs.is_empty() {
            return Err(KilnError::Validation {
                field: "input".into(),
                message: "input list is required".into(),
            });
        }
        let model = request["model"]
            .as_str()
            .unwrap_or(&self.settings.embed_model)
            .to_string();

        let api_key = self.settings.chat.api_key.as_deref().filter(|k| !k.is_empty()).ok_or_else(
            || KilnError::Config {
                message: "Vector api_key is required".into(),
            },
        )?;
        let response = self
            .http
            .post(self.embeddings_endpoint())
            .bearer_auth(api_key)
            .json(&json!({ "model": model, "input": inputs }))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(KilnError::Upstream {
                service: "embeddings".into(),
                status: status.as_u16(),
                body,
            });
        }
        let result: Value = response.json().await?;
        Ok(json!({
            "model": model,
            "data": result["data"],
            "usage": result["usage"],
            "raw": result,
        }))
    }

    /// Rerank passages for a query via a strict-JSON ranking prompt.
    pub async fn rerank(&self, request: Value) -> Result<Value> {
        let query = request["query"].as_str().unwrap_or_default();
        let passages: Vec<String> = request["passages"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        if query.is_empty() || passages.is_empty() {
            return Err(KilnError::Validation {
                field: "query".into(),
                message: "query and passages are required".into(),
            });
        }
        let top_k = request["top_k"].as_u64().unwrap_or(5) as usize;

        let mut prompt = format!(
            "Rank the candidate passages by relevance to the query, highest first. \
Respond with a JSON array whose elements hold index (original position), \
score (0 to 1) and text. Output nothing else.\nQuery: {query}\nCandidates:\n"
        );
        for (idx, passage) in passages.iter().enumerate() {
            prompt.push_str(&format!("[{idx}] {passage}\n"));
        }
        let messages = vec![
            json!({ "role": "system", "content": "You are a strict ranker that outputs only JSON." }),
            json!({ "role": "user", "content": prompt }),
        ];
        let options = ChatOptions {
            response_format: Some(json!({ "type": "json_object" })),
            ..Default::default()
        };
        let response = self.chat.chat(&messages, &options).await?;
        let content = ChatClient::first_content(&response).unwrap_or_else(|| "[]".into());
        let ranked: Vec<Value> = serde_json::from_str::<Value>(&content)
            .ok()
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_else(|| {
                warn!("Failed to parse rerank JSON, returning empty list");
                Vec::new()
            });
        Ok(json!({
            "model": self.chat.model(),
            "ranked": ranked.into_iter().take(top_k).collect::<Vec<_>>(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_embed_requires_input() {
        let worker = VectorWorker::new(VectorSettings::default());
        let err = worker.embed(json!({})).await;
        assert!(matches!(err, Err(KilnError::Validation { .. })));
    }

    #[tokio::test]
    async fn test_rerank_requires_query_and_passages() {
        let worker = VectorWorker::new(VectorSettings::default());
        let err = worker.rerank(json!({ "query": "q" })).await;
        assert!(matches!(err, Err(KilnError::Validation { .. })));
    }

    #[test]
    fn test_embeddings_endpoint_normalization() {
        let worker = VectorWorker::new(VectorSettings::default());
        assert!(worker.embeddings_endpoint().ends_with("/embeddings"));
    }
}
