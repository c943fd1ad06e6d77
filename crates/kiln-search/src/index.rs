//! Index control plane: mapping render, versioned index creation, alias
//! switching, bulk ingest with optional legacy-schema translation, and
//! full/partial rebuilds.

use std::path::Path;

use serde_json::{json, Value};
use tracing::info;

use kiln_core::{KilnError, Result};

use crate::client::EsClient;
use crate::config::IndexServiceSettings;

/// Field translation from the legacy docIndex schema to the canonical
/// `kb_chunks` schema.
const DOCINDEX_TRANSLATION: [(&str, &str); 40] = [
    ("zj_id", "primary_id"),
    ("docid", "knowledge_id"),
    ("attachId", "file_id"),
    ("doctitle", "title"),
    ("klg_type", "knowledge_type"),
    ("item_value", "content"),
    ("item_value_vector", "embedding"),
    ("item_value_img", "content_image"),
    ("item_values", "content_values"),
    ("itemvaluess", "content_values_s"),
    ("klg_user_ids", "knowledge_user_ids"),
    ("klg_role_ids", "knowledge_role_ids"),
    ("group_id", "chunk_id"),
    ("depar_id", "department_id"),
    ("org_id", "enterprise_id"),
    ("ep_id", "tenant_id"),
    ("ct_id", "knowledge_base_id"),
    ("ct_id0", "kb_tree_id_0"),
    ("ct_id1", "kb_tree_id_1"),
    ("ct_id2", "kb_tree_id_2"),
    ("ct_id3", "kb_tree_id_3"),
    ("parent_path_id", "parent_path_id"),
    ("city_id", "city_id"),
    ("up_city_id", "parent_city_id"),
    ("doc_status", "document_status"),
    ("life_status", "lifecycle_status"),
    ("crt_userid", "created_user_id"),
    ("tags", "tags"),
    ("keywords", "keywords"),
    ("summary", "summary"),
    ("faq", "faq"),
    ("rel_classify_id", "external_classify_id"),
    ("rel_klg_id", "external_knowledge_id"),
    ("rel_attach_id", "external_attach_id"),
    ("attributes", "attributes"),
    ("metaData", "metadata"),
    ("role", "visibility_scope"),
    ("deptPermission", "permitted_department_ids"),
    ("userPermission", "permitted_user_ids"),
    ("item_type", "item_type"),
];

/// Load the mapping template. A missing template is a deployment fault, not
/// a per-request error.
pub fn load_mapping(template_path: &Path) -> Result<Value> {
    if !template_path.exists() {
        return Err(KilnError::Config {
            message: format!("Mapping template not found: {}", template_path.display()),
        });
    }
    let content = std::fs::read_to_string(template_path)
        .map_err(|e| KilnError::io_with_path(e, template_path))?;
    Ok(serde_json::from_str(&content)?)
}

/// Apply the whitelisted settings overrides. Applying the same override
/// twice yields an identical mapping.
pub fn apply_overrides(body: &Value, overrides: Option<&Value>) -> Value {
    let mut result = body.clone();
    let Some(overrides) = overrides else {
        return result;
    };
    if result.get("settings").is_none() {
        result["settings"] = json!({});
    }
    for field in ["number_of_shards", "number_of_replicas", "refresh_interval"] {
        if let Some(value) = overrides.get(field) {
            if !value.is_null() {
                result["settings"][field] = value.clone();
            }
        }
    }
    result
}

/// Coerce a vector payload to a homogeneous float array. Accepts a list, a
/// JSON-encoded list string, or a comma/semicolon-delimited string.
pub fn coerce_vector(value: &Value) -> Option<Vec<f64>> {
    match value {
        Value::Null => None,
        Value::Array(items) => {
            let mut floats = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::Number(n) => floats.push(n.as_f64()?),
                    Value::String(s) => floats.push(s.trim().parse().ok()?),
                    _ => return None,
                }
            }
            Some(floats)
        }
        Value::String(raw) => {
            if let Ok(parsed) = serde_json::from_str::<Value>(raw) {
                if parsed.is_array() {
                    return coerce_vector(&parsed);
                }
            }
            let normalized = raw.replace(';', ",");
            let mut floats = Vec::new();
            for part in normalized.split(',') {
                let part = part.trim();
                if part.is_empty() {
                    continue;
                }
                floats.push(part.parse().ok()?);
            }
            if floats.is_empty() {
                None
            } else {
                Some(floats)
            }
        }
        _ => None,
    }
}

/// Map one legacy docIndex record onto the canonical schema; null and
/// unmapped fields are dropped; the embedding goes through the tolerant
/// vector parser.
pub fn transform_doc_index(raw: &Value) -> Value {
    let mut transformed = json!({});
    for (src, dest) in DOCINDEX_TRANSLATION {
        let Some(value) = raw.get(src) else {
            continue;
        };
        if value.is_null() {
            continue;
        }
        if dest == "embedding" {
            if let Some(vector) = coerce_vector(value) {
                transformed[dest] = json!(vector);
            }
            continue;
        }
        transformed[dest] = value.clone();
    }
    transformed
}

pub struct IndexControl {
    settings: IndexServiceSettings,
    client: EsClient,
}

impl IndexControl {
    pub fn new(settings: IndexServiceSettings) -> Self {
        let client = EsClient::new(settings.es.clone());
        Self { settings, client }
    }

    pub fn settings(&self) -> &IndexServiceSettings {
        &self.settings
    }

    fn write_target(&self, index_name: Option<&str>) -> String {
        index_name
            .map(str::to_string)
            .unwrap_or_else(|| self.settings.es.write_alias.clone())
    }

    /// Render the mapping with overrides and `PUT` the index.
    pub async fn create_index(
        &self,
        index_name: Option<&str>,
        overrides: Option<&Value>,
    ) -> Result<Value> {
        let target = index_name.unwrap_or(&self.settings.es.default_index);
        let body = load_mapping(Path::new(&self.settings.es.mapping_path))?;
        let body = apply_overrides(&body, overrides);
        info!(index = target, "Creating index");
        let response = self.client.create_index(target, &body).await?;
        if !response.ok() {
            return Err(response.into_error("create index"));
        }
        Ok(json!({ "status": response.status, "body": response.body }))
    }

    pub async fn alias_switch(
        &self,
        new_index: &str,
        read_alias: Option<&str>,
        write_alias: Option<&str>,
        old_index: Option<&str>,
    ) -> Result<Value> {
        let read_alias = read_alias.unwrap_or(&self.settings.es.read_alias);
        let write_alias = write_alias.unwrap_or(&self.settings.es.write_alias);
        let response = self
            .client
            .alias_switch(read_alias, write_alias, new_index, old_index)
            .await?;
        if !response.ok() {
            return Err(response.into_error("alias switch"));
        }
        Ok(json!({ "status": response.status, "body": response.body }))
    }

    /// Bulk-ingest documents. Empty input returns a zero-count success
    /// without touching the endpoint.
    pub async fn bulk_ingest(
        &self,
        index_name: Option<&str>,
        docs: &[Value],
        refresh: Option<&str>,
    ) -> Result<Value> {
        if docs.is_empty() {
            return Ok(json!({ "status": 200, "body": { "took": 0, "ingested": 0 } }));
        }
        let target = self.write_target(index_name);
        let response = self.client.bulk(&target, docs, refresh).await?;
        if !response.ok() {
            return Err(response.into_error("bulk ingest"));
        }
        Ok(json!({ "status": response.status, "body": response.body }))
    }

    /// Translate legacy docIndex payloads and ingest the non-empty results.
    pub async fn ingest_docindex(
        &self,
        doc_index_list: &[Value],
        index_name: Option<&str>,
        refresh: Option<&str>,
    ) -> Result<Value> {
        let transformed: Vec<Value> = doc_index_list
            .iter()
            .map(transform_doc_index)
            .filter(|doc| doc.as_object().map(|m| !m.is_empty()).unwrap_or(false))
            .collect();
        if transformed.is_empty() {
            return Ok(json!({
                "status": 200,
                "body": { "took": 0, "ingested": 0 },
                "ingested": 0,
            }));
        }
        let target = self.write_target(index_name);
        let response = self.client.bulk(&target, &transformed, refresh).await?;
        if !response.ok() {
            return Err(response.into_error("docindex ingest"));
        }
        Ok(json!({
            "status": response.status,
            "body": response.body,
            "ingested": transformed.len(),
        }))
    }

    /// Create `<base>_<version>` and switch the aliases to it. Streaming the
    /// documents across is the caller's (out-of-scope) concern.
    pub async fn rebuild_full(
        &self,
        source_alias: Option<&str>,
        target_version: Option<&str>,
        overrides: Option<&Value>,
    ) -> Result<Value> {
        let base = &self.settings.es.base_index;
        let version = target_version.unwrap_or("v2");
        let new_index = if base.ends_with(version) {
            base.clone()
        } else {
            format!("{base}_{version}")
        };
        self.create_index(Some(&new_index), overrides).await?;
        self.alias_switch(&new_index, None, None, source_alias).await?;
        Ok(json!({ "status": "scheduled", "index": new_index }))
    }

    /// Delete the query's matches, then ingest the replacement documents.
    pub async fn rebuild_partial(
        &self,
        index_name: Option<&str>,
        query: &Value,
        docs: &[Value],
        refresh: Option<&str>,
    ) -> Result<Value> {
        let target = self.write_target(index_name);
        let delete_response = self.client.delete_by_query(&target, query).await?;
        if !delete_response.ok() {
            return Err(delete_response.into_error("delete by query"));
        }
        let delete_status = delete_response.status;
        let ingest = self.bulk_ingest(Some(&target), docs, refresh).await?;
        Ok(json!({
            "status": "completed",
            "delete_status": delete_status,
            "ingest": ingest,
        }))
    }

    pub async fn cluster_health(&self) -> Result<Value> {
        let response = self.client.cluster_health().await?;
        Ok(json!({ "status": response.status, "body": response.body }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_mapping_missing_is_config_error() {
        let err = load_mapping(Path::new("/definitely/missing/mapping.json"));
        assert!(matches!(err, Err(KilnError::Config { .. })));
    }

    #[test]
    fn test_load_mapping_reads_template() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("mapping.json");
        std::fs::write(&path, r#"{"settings": {}, "mappings": {"properties": {}}}"#).unwrap();
        let mapping = load_mapping(&path).unwrap();
        assert!(mapping.get("mappings").is_some());
    }

    #[test]
    fn test_apply_overrides_whitelist() {
        let body = json!({ "settings": { "number_of_shards": 3 }, "mappings": {} });
        let overrides = json!({
            "number_of_shards": 5,
            "refresh_interval": "30s",
            "number_of_replicas": null,
            "analysis": { "bad": true },
        });
        let result = apply_overrides(&body, Some(&overrides));
        assert_eq!(result["settings"]["number_of_shards"], 5);
        assert_eq!(result["settings"]["refresh_interval"], "30s");
        assert!(result["settings"].get("number_of_replicas").is_none());
        assert!(result["settings"].get("analysis").is_none());
    }

    #[test]
    fn test_apply_overrides_is_idempotent() {
        let body = json!({ "settings": {}, "mappings": {} });
        let overrides = json!({ "number_of_shards": 5 });
        let once = apply_overrides(&body, Some(&overrides));
        let twice = apply_overrides(&once, Some(&overrides));
        assert_eq!(once, twice);
    }

    #[test]
    fn test_coerce_vector_list() {
        assert_eq!(
            coerce_vector(&json!([1, 2.5, "3"])),
            Some(vec![1.0, 2.5, 3.0])
        );
    }

    #[test]
    fn test_coerce_vector_json_string() {
        assert_eq!(
            coerce_vector(&json!("[0.1, 0.2]")),
            Some(vec![0.1, 0.2])
        );
    }

    #[test]
    fn test_coerce_vector_delimited_strings() {
        assert_eq!(
            coerce_vector(&json!("0.1, 0.2;0.3")),
            Some(vec![0.1, 0.2, 0.3])
        );
    }

    #[test]
    fn test_coerce_vector_garbage() {
        assert_eq!(coerce_vector(&json!("not a vector")), None);
        assert_eq!(coerce_vector(&json!({"x": 1})), None);
        assert_eq!(coerce_vector(&Value::Null), None);
    }

    #[test]
    fn test_transform_doc_index_fields() {
        let raw = json!({
            "zj_id": "z1",
            "doctitle": "Title",
            "group_id": "chunk-9",
            "item_value_vector": "[0.5, 0.25]",
            "life_status": null,
            "unknown_field": "dropped",
        });
        let doc = transform_doc_index(&raw);
        assert_eq!(doc["primary_id"], "z1");
        assert_eq!(doc["title"], "Title");
        assert_eq!(doc["chunk_id"], "chunk-9");
        assert_eq!(doc["embedding"], json!([0.5, 0.25]));
        assert!(doc.get("lifecycle_status").is_none());
        assert!(doc.get("unknown_field").is_none());
    }

    #[test]
    fn test_transform_embedding_length_preserved() {
        let raw = json!({ "item_value_vector": [0.0, 1.0, 2.0, 3.0] });
        let doc = transform_doc_index(&raw);
        assert_eq!(doc["embedding"].as_array().unwrap().len(), 4);
    }

    #[test]
    fn test_transform_empty_doc_is_empty() {
        let doc = transform_doc_index(&json!({ "unrelated": 1 }));
        assert!(doc.as_object().unwrap().is_empty());
    }
}
