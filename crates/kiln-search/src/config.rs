//! Settings for the index control plane (`ES_INDEX_SERVICE_`, with legacy
//! `ES_SERVICE_` aliased in) and the search dispatcher
//! (`ES_SEARCH_SERVICE_`).

use serde::{Deserialize, Serialize};

use kiln_core::config::{alias_env_prefix, load_settings};
use kiln_core::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EsSettings {
    pub endpoint: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub verify_ssl: bool,
    pub request_timeout_sec: u64,
    pub base_index: String,
    pub default_index: String,
    pub read_alias: String,
    pub write_alias: String,
    pub mapping_path: String,
    pub text_fields: Vec<String>,
    pub vector_field: String,
    pub default_num_candidates: usize,
}

impl Default for EsSettings {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9200".into(),
            username: None,
            password: None,
            verify_ssl: false,
            request_timeout_sec: 30,
            base_index: "kb_chunks".into(),
            default_index: "kb_chunks_v1".into(),
            read_alias: "kb_chunks".into(),
            write_alias: "kb_chunks_write".into(),
            mapping_path: "config/kb_chunks_v1_mapping.json".into(),
            text_fields: vec![
                "title".into(),
                "content".into(),
                "summary".into(),
                "keywords".into(),
            ],
            vector_field: "embedding".into(),
            default_num_candidates: 100,
        }
    }
}

/// Index control-plane settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexServiceSettings {
    pub es: EsSettings,
    pub queue: IndexQueueSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexQueueSettings {
    pub index_queue: String,
}

impl Default for IndexQueueSettings {
    fn default() -> Self {
        Self {
            index_queue: "es_index".into(),
        }
    }
}

impl IndexServiceSettings {
    /// Load with the legacy `ES_SERVICE_*` prefix mapped into the new one.
    pub fn from_env() -> Result<Self> {
        alias_env_prefix("ES_SERVICE_", "ES_INDEX_SERVICE_");
        load_settings("ES_INDEX_SERVICE", None)
    }
}

/// Search dispatcher settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchServiceSettings {
    pub es: EsSettings,
    pub queue: SearchQueueSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchQueueSettings {
    pub search_queue: String,
}

impl Default for SearchQueueSettings {
    fn default() -> Self {
        Self {
            search_queue: "es_search".into(),
        }
    }
}

impl SearchServiceSettings {
    pub fn from_env() -> Result<Self> {
        load_settings("ES_SEARCH_SERVICE", None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = IndexServiceSettings::default();
        assert_eq!(settings.es.read_alias, "kb_chunks");
        assert_eq!(settings.es.write_alias, "kb_chunks_write");
        assert_eq!(settings.queue.index_queue, "es_index");

        let search = SearchServiceSettings::default();
        assert_eq!(search.es.vector_field, "embedding");
        assert_eq!(search.queue.search_queue, "es_search");
    }

    #[test]
    fn test_legacy_prefix_alias() {
        std::env::set_var("ES_SERVICE_ES__ENDPOINT", "http://legacy:9200");
        let settings = IndexServiceSettings::from_env().unwrap();
        assert_eq!(settings.es.endpoint, "http://legacy:9200");
        std::env::remove_var("ES_SERVICE_ES__ENDPOINT");
        std::env::remove_var("ES_INDEX_SERVICE_ES__ENDPOINT");
    }
}
