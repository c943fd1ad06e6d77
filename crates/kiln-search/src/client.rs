//! HTTP client for the search endpoint.
//!
//! Thin request helper plus the index-management verbs. Every operation
//! succeeds only on HTTP 2xx; callers surface status and body on anything
//! else.

use serde_json::{json, Value};
use tracing::debug;

use kiln_core::{KilnError, Result};

use crate::config::EsSettings;

/// Response envelope: status code plus the parsed (or raw-text) body.
#[derive(Debug, Clone)]
pub struct EsResponse {
    pub status: u16,
    pub body: Value,
}

impl EsResponse {
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Into an error carrying status and body for operator diagnosis.
    pub fn into_error(self, operation: &str) -> KilnError {
        KilnError::Upstream {
            service: format!("search-endpoint ({operation})"),
            status: self.status,
            body: self.body.to_string(),
        }
    }
}

pub struct EsClient {
    settings: EsSettings,
    http: reqwest::Client,
    base: String,
}

impl EsClient {
    pub fn new(settings: EsSettings) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(settings.request_timeout_sec))
            .danger_accept_invalid_certs(!settings.verify_ssl)
            .user_agent("kiln-search")
            .build()
            .expect("failed to build reqwest client");
        let base = settings.endpoint.trim_end_matches('/').to_string();
        Self {
            settings,
            http,
            base,
        }
    }

    pub fn settings(&self) -> &EsSettings {
        &self.settings
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        json_body: Option<&Value>,
        ndjson_body: Option<String>,
        params: &[(&str, String)],
    ) -> Result<EsResponse> {
        let url = format!("{}/{}", self.base, path.trim_start_matches('/'));
        debug!("search request {method} {url}");
        let mut request = self.http.request(method, &url);
        if let (Some(username), Some(password)) =
            (&self.settings.username, &self.settings.password)
        {
            request = request.basic_auth(username, Some(password));
        }
        if let Some(body) = json_body {
            request = request.json(body);
        }
        if let Some(body) = ndjson_body {
            request = request
                .header("Content-Type", "application/x-ndjson")
                .body(body);
        }
        if !params.is_empty() {
            request = request.query(params);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));
        Ok(EsResponse { status, body })
    }

    pub async fn create_index(&self, index_name: &str, body: &Value) -> Result<EsResponse> {
        self.request(reqwest::Method::PUT, index_name, Some(body), None, &[])
            .await
    }

    /// Atomic alias transaction: removes (when an old index is given) come
    /// before adds.
    pub async fn alias_switch(
        &self,
        read_alias: &str,
        write_alias: &str,
        new_index: &str,
        old_index: Option<&str>,
    ) -> Result<EsResponse> {
        let actions = alias_actions(read_alias, write_alias, new_index, old_index);
        self.request(
            reqwest::Method::POST,
            "_aliases",
            Some(&json!({ "actions": actions })),
            None,
            &[],
        )
        .await
    }

    pub async fn bulk(
        &self,
        index_name: &str,
        docs: &[Value],
        refresh: Option<&str>,
    ) -> Result<EsResponse> {
        let payload = build_bulk_ndjson(index_name, docs);
        let params: Vec<(&str, String)> = refresh
            .map(|r| vec![("refresh", r.to_string())])
            .unwrap_or_default();
        self.request(reqwest::Method::POST, "_bulk", None, Some(payload), &params)
            .await
    }

    pub async fn delete_by_query(&self, index_name: &str, query: &Value) -> Result<EsResponse> {
        self.request(
            reqwest::Method::POST,
            &format!("{index_name}/_delete_by_query"),
            Some(query),
            None,
            &[],
        )
        .await
    }

    pub async fn search(&self, index_name: &str, body: &Value) -> Result<EsResponse> {
        self.request(
            reqwest::Method::POST,
            &format!("{index_name}/_search"),
            Some(body),
            None,
            &[],
        )
        .await
    }

    pub async fn cluster_health(&self) -> Result<EsResponse> {
        self.request(reqwest::Method::GET, "_cluster/health", None, None, &[])
            .await
    }
}

/// Alias transaction actions, removes before adds.
pub fn alias_actions(
    read_alias: &str,
    write_alias: &str,
    new_index: &str,
    old_index: Option<&str>,
) -> Vec<Value> {
    let mut actions = Vec::new();
    if let Some(old_index) = old_index {
        actions.push(json!({ "remove": { "index": old_index, "alias": read_alias } }));
        actions.push(json!({ "remove": { "index": old_index, "alias": write_alias } }));
    }
    actions.push(json!({ "add": { "index": new_index, "alias": read_alias } }));
    actions.push(json!({ "add": { "index": new_index, "alias": write_alias } }));
    actions
}

/// NDJSON for `_bulk`: a doc with a `chunk_id` indexes under that id, any
/// other doc gets an auto id.
pub fn build_bulk_ndjson(index_name: &str, docs: &[Value]) -> String {
    let mut lines = Vec::with_capacity(docs.len() * 2);
    for doc in docs {
        let mut action = json!({ "index": { "_index": index_name } });
        if let Some(chunk_id) = doc["chunk_id"].as_str().filter(|id| !id.is_empty()) {
            action["index"]["_id"] = json!(chunk_id);
        }
        lines.push(action.to_string());
        lines.push(doc.to_string());
    }
    let mut payload = lines.join("\n");
    payload.push('\n');
    payload
}
