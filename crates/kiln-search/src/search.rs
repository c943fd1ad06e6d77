//! Search dispatcher: text, vector, and hybrid query composition.
//!
//! Permission filters are prepended to caller filters so access control
//! clauses run before anything else in the filter context.

use serde_json::{json, Value};

use kiln_core::Result;

use crate::client::EsClient;
use crate::config::SearchServiceSettings;

/// Permission filters first, then caller filters, nulls dropped.
fn combine_filters(filters: Option<&Vec<Value>>, permission_filters: Option<&Vec<Value>>) -> Vec<Value> {
    let mut combined = Vec::new();
    if let Some(permission_filters) = permission_filters {
        combined.extend(permission_filters.iter().filter(|f| !f.is_null()).cloned());
    }
    if let Some(filters) = filters {
        combined.extend(filters.iter().filter(|f| !f.is_null()).cloned());
    }
    combined
}

/// Normalize a UI vector-weight ratio `r ∈ [0, 1]` to
/// `(text_weight, vector_weight) = (1 - r, r)`.
pub fn weights_from_ratio(ratio: f64) -> (f64, f64) {
    let ratio = ratio.clamp(0.0, 1.0);
    (1.0 - ratio, ratio)
}

#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub fields: Option<Vec<String>>,
    pub vector_field: Option<String>,
    pub filters: Option<Vec<Value>>,
    pub permission_filters: Option<Vec<Value>>,
    pub size: usize,
    pub from: usize,
    pub num_candidates: Option<usize>,
    pub highlight_fields: Option<Vec<String>>,
    pub source: Option<Vec<String>>,
}

/// Full-text query body: `multi_match best_fields` in `bool.must`.
pub fn build_text_query(
    query_text: &str,
    default_fields: &[String],
    options: &QueryOptions,
) -> Value {
    let fields = options.fields.as_deref().unwrap_or(default_fields);
    let mut bool_query = json!({
        "must": [{
            "multi_match": {
                "query": query_text,
                "fields": fields,
                "type": "best_fields",
            }
        }],
    });
    let filter_clauses = combine_filters(
        options.filters.as_ref(),
        options.permission_filters.as_ref(),
    );
    if !filter_clauses.is_empty() {
        bool_query["filter"] = json!(filter_clauses);
    }

    let mut body = json!({
        "from": options.from,
        "size": options.size.max(1),
        "query": { "bool": bool_query },
    });
    if let Some(highlight_fields) = &options.highlight_fields {
        let fields: serde_json::Map<String, Value> = highlight_fields
            .iter()
            .map(|name| (name.clone(), json!({})))
            .collect();
        body["highlight"] = json!({ "fields": fields });
    }
    if let Some(source) = &options.source {
        body["_source"] = json!(source);
    }
    body
}

/// k-NN query body with the same filter composition wrapped in
/// `bool.filter`.
pub fn build_vector_query(
    query_vector: &[f64],
    default_field: &str,
    default_num_candidates: usize,
    options: &QueryOptions,
) -> Value {
    let field = options.vector_field.as_deref().unwrap_or(default_field);
    let size = options.size.max(1);
    let mut knn = json!({
        "field": field,
        "query_vector": query_vector,
        "k": size,
        "num_candidates": options.num_candidates.unwrap_or(default_num_candidates),
    });
    let filter_clauses = combine_filters(
        options.filters.as_ref(),
        options.permission_filters.as_ref(),
    );
    if !filter_clauses.is_empty() {
        knn["filter"] = json!({ "bool": { "filter": filter_clauses } });
    }

    let mut body = json!({ "size": size, "knn": knn });
    if let Some(source) = &options.source {
        body["_source"] = json!(source);
    }
    body
}

/// Hybrid query body: `script_score` over the text `bool` with cosine
/// similarity blended against the BM25 `_score`.
pub fn build_hybrid_query(
    query_text: &str,
    query_vector: &[f64],
    default_fields: &[String],
    default_field: &str,
    text_weight: f64,
    vector_weight: f64,
    options: &QueryOptions,
) -> Value {
    let fields = options.fields.as_deref().unwrap_or(default_fields);
    let field = options.vector_field.as_deref().unwrap_or(default_field);
    let mut bool_query = json!({
        "must": [{
            "multi_match": {
                "query": query_text,
                "fields": fields,
                "type": "best_fields",
            }
        }],
    });
    let filter_clauses = combine_filters(
        options.filters.as_ref(),
        options.permission_filters.as_ref(),
    );
    if !filter_clauses.is_empty() {
        bool_query["filter"] = json!(filter_clauses);
    }

    let mut body = json!({
        "from": options.from,
        "size": options.size.max(1),
        "query": {
            "script_score": {
                "query": { "bool": bool_query },
                "script": {
                    "source": "cosineSimilarity(params.vector, params.field) * params.vector_weight + _score * params.text_weight",
                    "params": {
                        "vector": query_vector,
                        "field": field,
                        "vector_weight": vector_weight,
                        "text_weight": text_weight,
                    },
                },
            },
        },
    });
    if let Some(source) = &options.source {
        body["_source"] = json!(source);
    }
    body
}

pub struct SearchDispatcher {
    settings: SearchServiceSettings,
    client: EsClient,
}

impl SearchDispatcher {
    pub fn new(settings: SearchServiceSettings) -> Self {
        let client = EsClient::new(settings.es.clone());
        Self { settings, client }
    }

    pub fn settings(&self) -> &SearchServiceSettings {
        &self.settings
    }

    fn read_target(&self, index_name: Option<&str>) -> String {
        index_name
            .map(str::to_string)
            .unwrap_or_else(|| self.settings.es.read_alias.clone())
    }

    pub async fn text_search(
        &self,
        index_name: Option<&str>,
        query_text: &str,
        options: &QueryOptions,
    ) -> Result<Value> {
        let body = build_text_query(query_text, &self.settings.es.text_fields, options);
        let response = self.client.search(&self.read_target(index_name), &body).await?;
        if !response.ok() {
            return Err(response.into_error("text search"));
        }
        Ok(json!({ "status": response.status, "body": response.body }))
    }

    pub async fn vector_search(
        &self,
        index_name: Option<&str>,
        query_vector: &[f64],
        options: &QueryOptions,
    ) -> Result<Value> {
        let body = build_vector_query(
            query_vector,
            &self.settings.es.vector_field,
            self.settings.es.default_num_candidates,
            options,
        );
        let response = self.client.search(&self.read_target(index_name), &body).await?;
        if !response.ok() {
            return Err(response.into_error("vector search"));
        }
        Ok(json!({ "status": response.status, "body": response.body }))
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn hybrid_search(
        &self,
        index_name: Option<&str>,
        query_text: &str,
        query_vector: &[f64],
        text_weight: f64,
        vector_weight: f64,
        options: &QueryOptions,
    ) -> Result<Value> {
        let body = build_hybrid_query(
            query_text,
            query_vector,
            &self.settings.es.text_fields,
            &self.settings.es.vector_field,
            text_weight,
            vector_weight,
            options,
        );
        let response = self.client.search(&self.read_target(index_name), &body).await?;
        if !response.ok() {
            return Err(response.into_error("hybrid search"));
        }
        Ok(json!({ "status": response.status, "body": response.body }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_fields() -> Vec<String> {
        vec!["title".into(), "content".into()]
    }

    #[test]
    fn test_permission_filters_run_first() {
        let options = QueryOptions {
            filters: Some(vec![json!({ "term": { "kb_id": "kb1" } })]),
            permission_filters: Some(vec![json!({ "terms": { "permitted_user_ids": ["u1"] } })]),
            size: 10,
            ..Default::default()
        };
        let body = build_text_query("hello", &default_fields(), &options);
        let filters = body["query"]["bool"]["filter"].as_array().unwrap();
        assert_eq!(filters.len(), 2);
        assert!(filters[0].get("terms").is_some(), "permission clause first");
        assert!(filters[1].get("term").is_some());
    }

    #[test]
    fn test_text_query_shape() {
        let options = QueryOptions {
            size: 5,
            from: 10,
            highlight_fields: Some(vec!["content".into()]),
            source: Some(vec!["title".into()]),
            ..Default::default()
        };
        let body = build_text_query("q", &default_fields(), &options);
        assert_eq!(body["from"], 10);
        assert_eq!(body["size"], 5);
        let mm = &body["query"]["bool"]["must"][0]["multi_match"];
        assert_eq!(mm["type"], "best_fields");
        assert_eq!(mm["fields"][0], "title");
        assert!(body["highlight"]["fields"].get("content").is_some());
        assert_eq!(body["_source"][0], "title");
        assert!(body["query"]["bool"].get("filter").is_none());
    }

    #[test]
    fn test_vector_query_shape() {
        let options = QueryOptions {
            size: 7,
            permission_filters: Some(vec![json!({ "term": { "tenant_id": "t1" } })]),
            ..Default::default()
        };
        let body = build_vector_query(&[0.1, 0.2], "embedding", 100, &options);
        assert_eq!(body["knn"]["k"], 7);
        assert_eq!(body["knn"]["num_candidates"], 100);
        assert_eq!(body["knn"]["field"], "embedding");
        assert!(body["knn"]["filter"]["bool"]["filter"].is_array());
    }

    #[test]
    fn test_hybrid_query_script() {
        let body = build_hybrid_query(
            "q",
            &[0.5],
            &default_fields(),
            "embedding",
            0.3,
            0.7,
            &QueryOptions {
                size: 10,
                ..Default::default()
            },
        );
        let script = &body["query"]["script_score"]["script"];
        assert!(script["source"]
            .as_str()
            .unwrap()
            .contains("cosineSimilarity(params.vector, params.field)"));
        assert_eq!(script["params"]["text_weight"], 0.3);
        assert_eq!(script["params"]["vector_weight"], 0.7);
        assert_eq!(script["params"]["field"], "embedding");
    }

    #[test]
    fn test_weights_from_ratio() {
        let (text, vector) = weights_from_ratio(0.7);
        assert!((text - 0.3).abs() < 1e-9);
        assert!((vector - 0.7).abs() < 1e-9);
        assert_eq!(weights_from_ratio(0.0), (1.0, 0.0));
        assert_eq!(weights_from_ratio(2.0), (0.0, 1.0));
    }
}
