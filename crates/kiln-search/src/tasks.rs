//! Queue task handlers wrapping the index control plane and the search
//! dispatcher.

use std::sync::Arc;

use serde_json::Value;

use kiln_core::queue::{handler, TaskBroker};
use kiln_core::Result;

use crate::index::IndexControl;
use crate::search::{QueryOptions, SearchDispatcher};

fn opt_str(payload: &Value, key: &str) -> Option<String> {
    payload[key].as_str().map(str::to_string)
}

fn docs(payload: &Value, key: &str) -> Vec<Value> {
    payload[key].as_array().cloned().unwrap_or_default()
}

fn query_options(payload: &Value) -> QueryOptions {
    let string_list = |key: &str| -> Option<Vec<String>> {
        payload[key].as_array().map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
    };
    let value_list =
        |key: &str| -> Option<Vec<Value>> { payload[key].as_array().cloned() };

    QueryOptions {
        fields: string_list("fields"),
        vector_field: opt_str(payload, "vector_field"),
        filters: value_list("filters"),
        permission_filters: value_list("permission_filters"),
        size: payload["size"].as_u64().unwrap_or(10) as usize,
        from: payload["from"].as_u64().unwrap_or(0) as usize,
        num_candidates: payload["num_candidates"].as_u64().map(|n| n as usize),
        highlight_fields: string_list("highlight_fields"),
        source: string_list("source"),
    }
}

fn vector(payload: &Value, key: &str) -> Vec<f64> {
    payload[key]
        .as_array()
        .map(|items| items.iter().filter_map(Value::as_f64).collect())
        .unwrap_or_default()
}

/// Register index control-plane tasks on the index queue.
pub fn register_index_tasks(control: &Arc<IndexControl>, broker: &TaskBroker) -> Result<()> {
    let queue = control.settings().queue.index_queue.clone();

    let ctl = Arc::clone(control);
    broker.register(
        &queue,
        "es_schema.create_index",
        handler(move |_b, payload| {
            let ctl = Arc::clone(&ctl);
            async move {
                ctl.create_index(
                    opt_str(&payload, "index_name").as_deref(),
                    payload.get("overrides").filter(|v| !v.is_null()),
                )
                .await
            }
        }),
    )?;

    let ctl = Arc::clone(control);
    broker.register(
        &queue,
        "es_schema.alias_switch",
        handler(move |_b, payload| {
            let ctl = Arc::clone(&ctl);
            async move {
                let new_index = payload["new_index"].as_str().unwrap_or_default().to_string();
                ctl.alias_switch(
                    &new_index,
                    opt_str(&payload, "read_alias").as_deref(),
                    opt_str(&payload, "write_alias").as_deref(),
                    opt_str(&payload, "old_index").as_deref(),
                )
                .await
            }
        }),
    )?;

    let ctl = Arc::clone(control);
    broker.register(
        &queue,
        "es_schema.bulk_ingest",
        handler(move |_b, payload| {
            let ctl = Arc::clone(&ctl);
            async move {
                ctl.bulk_ingest(
                    opt_str(&payload, "index_name").as_deref(),
                    &docs(&payload, "docs"),
                    opt_str(&payload, "refresh").as_deref(),
                )
                .await
            }
        }),
    )?;

    let ctl = Arc::clone(control);
    broker.register(
        &queue,
        "es_schema.ingest_docindex",
        handler(move |_b, payload| {
            let ctl = Arc::clone(&ctl);
            async move {
                ctl.ingest_docindex(
                    &docs(&payload, "doc_index_list"),
                    opt_str(&payload, "index_name").as_deref(),
                    opt_str(&payload, "refresh").as_deref(),
                )
                .await
            }
        }),
    )?;

    let ctl = Arc::clone(control);
    broker.register(
        &queue,
        "es_schema.rebuild_full",
        handler(move |_b, payload| {
            let ctl = Arc::clone(&ctl);
            async move {
                ctl.rebuild_full(
                    opt_str(&payload, "source_alias").as_deref(),
                    opt_str(&payload, "target_version").as_deref(),
                    payload.get("overrides").filter(|v| !v.is_null()),
                )
                .await
            }
        }),
    )?;

    let ctl = Arc::clone(control);
    broker.register(
        &queue,
        "es_schema.rebuild_partial",
        handler(move |_b, payload| {
            let ctl = Arc::clone(&ctl);
            async move {
                ctl.rebuild_partial(
                    opt_str(&payload, "index_name").as_deref(),
                    &payload["query"].clone(),
                    &docs(&payload, "docs"),
                    opt_str(&payload, "refresh").as_deref(),
                )
                .await
            }
        }),
    )?;

    Ok(())
}

/// Register search tasks on the search queue.
pub fn register_search_tasks(dispatcher: &Arc<SearchDispatcher>, broker: &TaskBroker) -> Result<()> {
    let queue = dispatcher.settings().queue.search_queue.clone();

    let disp = Arc::clone(dispatcher);
    broker.register(
        &queue,
        "es_search.text_search",
        handler(move |_b, payload| {
            let disp = Arc::clone(&disp);
            async move {
                let query = payload["query"].as_str().unwrap_or_default().to_string();
                disp.text_search(
                    opt_str(&payload, "index_name").as_deref(),
                    &query,
                    &query_options(&payload),
                )
                .await
            }
        }),
    )?;

    let disp = Arc::clone(dispatcher);
    broker.register(
        &queue,
        "es_search.vector_search",
        handler(move |_b, payload| {
            let disp = Arc::clone(&disp);
            async move {
                disp.vector_search(
                    opt_str(&payload, "index_name").as_deref(),
                    &vector(&payload, "query_vector"),
                    &query_options(&payload),
                )
                .await
            }
        }),
    )?;

    let disp = Arc::clone(dispatcher);
    broker.register(
        &queue,
        "es_search.hybrid_search",
        handler(move |_b, payload| {
            let disp = Arc::clone(&disp);
            async move {
                let query = payload["query"].as_str().unwrap_or_default().to_string();
                let text_weight = payload["text_weight"].as_f64().unwrap_or(1.0);
                let vector_weight = payload["vector_weight"].as_f64().unwrap_or(1.0);
                disp.hybrid_search(
                    opt_str(&payload, "index_name").as_deref(),
                    &query,
                    &vector(&payload, "query_vector"),
                    text_weight,
                    vector_weight,
                    &query_options(&payload),
                )
                .await
            }
        }),
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IndexServiceSettings, SearchServiceSettings};
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_handlers_register_without_collisions() {
        let broker = TaskBroker::new(1, 1, Duration::from_secs(5));
        let control = Arc::new(IndexControl::new(IndexServiceSettings::default()));
        let dispatcher = Arc::new(SearchDispatcher::new(SearchServiceSettings::default()));
        register_index_tasks(&control, &broker).unwrap();
        register_search_tasks(&dispatcher, &broker).unwrap();
        broker.start();
        let queues = broker.active_queues();
        assert!(queues.contains(&"es_index".to_string()));
        assert!(queues.contains(&"es_search".to_string()));
    }

    #[test]
    fn test_query_options_parsing() {
        let payload = json!({
            "fields": ["title"],
            "filters": [{ "term": { "kb_id": "k" } }],
            "size": 25,
            "from": 5,
            "num_candidates": 300,
        });
        let options = query_options(&payload);
        assert_eq!(options.fields.unwrap(), vec!["title"]);
        assert_eq!(options.size, 25);
        assert_eq!(options.from, 5);
        assert_eq!(options.num_candidates, Some(300));
        assert!(options.permission_filters.is_none());
    }
}
