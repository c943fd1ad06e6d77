//! Process wiring: settings, gateway, workers, queue runtime, router.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use kiln_core::config::{load_settings, ChatSettings, ConverterSettings};
use kiln_core::llm::{ChatClient, ChatOptions};
use kiln_core::plugins::registry_from_settings;
use kiln_core::queue::{handler, TaskBroker};
use kiln_core::storage::StoreGateway;
use kiln_core::worker::ConversionWorker;
use kiln_core::{metrics, KilnError};
use kiln_pipeline::config::{PipelineSettings, ProbeSettings};
use kiln_pipeline::Orchestrator;
use kiln_search::config::{IndexServiceSettings, SearchServiceSettings};
use kiln_search::tasks::{register_index_tasks, register_search_tasks};
use kiln_search::vector::{VectorSettings, VectorWorker};
use kiln_search::{IndexControl, SearchDispatcher};
use kiln_video::asr::AsrWorker;
use kiln_video::config::{AsrSettings, MetaSettings, VideoSettings, VisionSettings};
use kiln_video::vision::VisionWorker;
use kiln_video::{MetaEnricher, VideoPipeline};

use crate::auth::AppKeyValidator;
use crate::routes;
use crate::state::AppState;

/// Generic chat worker on the `llm` queue.
fn register_chat_task(broker: &TaskBroker, chat: Arc<ChatClient>) -> kiln_core::Result<()> {
    broker.register(
        "llm",
        "llm.chat",
        handler(move |_b, payload| {
            let chat = Arc::clone(&chat);
            async move {
                let messages: Vec<Value> = payload["messages"].as_array().cloned().unwrap_or_default();
                if messages.is_empty() {
                    return Err(KilnError::Validation {
                        field: "messages".into(),
                        message: "messages is required".into(),
                    });
                }
                let options = ChatOptions {
                    model: payload["model"].as_str().map(str::to_string),
                    temperature: payload["temperature"].as_f64(),
                    top_p: payload["top_p"].as_f64(),
                    max_tokens: payload["max_tokens"].as_u64().map(|v| v as u32),
                    response_format: payload
                        .get("response_format")
                        .filter(|v| !v.is_null())
                        .cloned(),
                };
                let result = chat.chat(&messages, &options).await?;
                Ok(json!({
                    "model": options.model.as_deref().unwrap_or(chat.model()),
                    "choices": result["choices"],
                    "usage": result["usage"],
                    "raw": result,
                }))
            }
        }),
    )
}

/// Load every subsystem, register all queue workers, and start the runtime.
pub async fn build_state() -> anyhow::Result<Arc<AppState>> {
    let settings = ConverterSettings::from_env()?;
    let pipeline_settings = PipelineSettings::from_env()?;
    let probe_settings = ProbeSettings::from_env()?;
    let video_settings = VideoSettings::from_env()?;
    let asr_settings = AsrSettings::from_env()?;
    let vision_settings = VisionSettings::from_env()?;
    let meta_settings = MetaSettings::from_env()?;
    let llm_settings: ChatSettings = load_settings("LLM", None)?;
    let vector_settings = VectorSettings::from_env()?;
    let index_settings = IndexServiceSettings::from_env()?;
    let search_settings = SearchServiceSettings::from_env()?;

    metrics::ensure_metrics_server(settings.monitoring.prometheus_port).await?;

    let gateway = Arc::new(StoreGateway::new(
        settings.storage.clone(),
        settings.attach_store.clone(),
        &settings.work_dir,
    ));
    let registry = Arc::new(registry_from_settings(&settings)?);
    let worker = Arc::new(ConversionWorker::new(
        settings.clone(),
        Arc::clone(&gateway),
        registry,
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        pipeline_settings.clone(),
        probe_settings,
        Arc::clone(&gateway),
    ));
    let video = Arc::new(VideoPipeline::new(video_settings.clone(), Arc::clone(&gateway)));
    let asr = Arc::new(AsrWorker::new(asr_settings));
    let vision = Arc::new(VisionWorker::new(vision_settings));
    let enricher = Arc::new(MetaEnricher::new(meta_settings.clone(), Arc::clone(&gateway)));
    let index_control = Arc::new(IndexControl::new(index_settings));
    let search = Arc::new(SearchDispatcher::new(search_settings));
    let vector = Arc::new(VectorWorker::new(vector_settings));
    let chat = Arc::new(ChatClient::new(llm_settings));

    let broker = TaskBroker::new(
        settings.queues.workers_per_queue,
        settings.queues.prefetch_multiplier,
        Duration::from_secs(settings.queues.task_time_limit_sec),
    );
    worker.register_tasks(&broker, &settings.queues.default_queue)?;
    orchestrator.register_tasks(&broker)?;
    video.register_tasks(&broker)?;
    asr.register_tasks(&broker, &video_settings.queues.asr_queue)?;
    vision.register_tasks(&broker, &video_settings.queues.vision_queue)?;
    enricher.register_tasks(&broker)?;
    register_index_tasks(&index_control, &broker)?;
    register_search_tasks(&search, &broker)?;
    vector.register_tasks(&broker)?;
    register_chat_task(&broker, chat)?;
    broker.start();
    info!("Queue runtime started: {:?}", broker.active_queues());

    let validator = AppKeyValidator::new(settings.api_auth.clone());
    Ok(Arc::new(AppState {
        settings,
        video_settings,
        broker,
        gateway,
        worker,
        orchestrator,
        video,
        index_control,
        search,
        validator,
        meta_queue: meta_settings.queue.meta_queue,
    }))
}

/// The full `/api/v1` router.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .route("/convert", post(routes::convert::submit_conversion))
        .route("/formats", get(routes::convert::list_formats))
        .route("/monitor/health", get(routes::convert::health))
        .route("/pipeline/upload", post(routes::pipeline::upload))
        .route("/pipeline/recommend", post(routes::pipeline::recommend))
        .route("/video/slice", post(routes::video::slice))
        .route("/meta/enrich", post(routes::video::enrich))
        .route("/index/create", post(routes::search::create_index))
        .route("/index/alias-switch", post(routes::search::alias_switch))
        .route("/index/bulk", post(routes::search::bulk_ingest))
        .route("/index/docindex", post(routes::search::ingest_docindex))
        .route("/index/rebuild-full", post(routes::search::rebuild_full))
        .route("/index/rebuild-partial", post(routes::search::rebuild_partial))
        .route("/search/text", post(routes::search::text_search))
        .route("/search/vector", post(routes::search::vector_search))
        .route("/search/hybrid", post(routes::search::hybrid_search))
        .route("/tasks/:task_id", get(routes::video::task_status));

    Router::new()
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Bind and serve in the background; returns the bound address (useful when
/// port = 0).
pub async fn serve(state: Arc<AppState>) -> anyhow::Result<std::net::SocketAddr> {
    let addr = format!("{}:{}", state.settings.host, state.settings.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let actual = listener.local_addr()?;
    info!("API listening on {actual}");
    let app = router(state);
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            tracing::error!("Server error: {err}");
        }
    });
    Ok(actual)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::config::{AttachStoreSettings, StorageSettings};
    use kiln_core::plugins::build_registry;
    use kiln_pipeline::config::{PipelineSettings, ProbeSettings};
    use kiln_search::config::{IndexServiceSettings, SearchServiceSettings};
    use tempfile::TempDir;

    /// Offline state: unroutable backends, port 0.
    fn offline_state(tmp: &TempDir) -> Arc<AppState> {
        let mut settings = ConverterSettings::default();
        settings.host = "127.0.0.1".into();
        settings.port = 0;
        settings.work_dir = tmp.path().join("work").to_string_lossy().into_owned();
        settings.api_auth.required = false;
        settings.api_auth.app_secrets_path = tmp
            .path()
            .join("appkeys.json")
            .to_string_lossy()
            .into_owned();
        let mut storage = StorageSettings::default();
        storage.endpoint = "http://127.0.0.1:1".into();
        storage.timeout_sec = 1;
        let mut attach = AttachStoreSettings::default();
        attach.base_url = "http://127.0.0.1:1".into();
        attach.timeout_sec = 1;
        settings.storage = storage.clone();
        settings.attach_store = attach.clone();

        let gateway = Arc::new(StoreGateway::new(storage, attach, tmp.path().join("work")));
        let modules: Vec<String> = kiln_core::plugins::DEFAULT_PLUGIN_MODULES
            .iter()
            .map(|m| m.to_string())
            .collect();
        let registry = Arc::new(build_registry(&modules).unwrap());
        let worker = Arc::new(ConversionWorker::new(
            settings.clone(),
            Arc::clone(&gateway),
            registry,
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            PipelineSettings::default(),
            ProbeSettings::default(),
            Arc::clone(&gateway),
        ));
        let video_settings = VideoSettings::default();
        let video = Arc::new(VideoPipeline::new(video_settings.clone(), Arc::clone(&gateway)));
        let index_control = Arc::new(IndexControl::new(IndexServiceSettings::default()));
        let search = Arc::new(SearchDispatcher::new(SearchServiceSettings::default()));

        let broker = TaskBroker::new(1, 1, Duration::from_secs(5));
        worker.register_tasks(&broker, "conversion").unwrap();
        orchestrator.register_tasks(&broker).unwrap();
        broker.start();

        let validator = AppKeyValidator::new(settings.api_auth.clone());
        Arc::new(AppState {
            settings,
            video_settings,
            broker,
            gateway,
            worker,
            orchestrator,
            video,
            index_control,
            search,
            validator,
            meta_queue: "meta".into(),
        })
    }

    #[tokio::test]
    async fn test_server_binds_ephemeral_port() {
        let tmp = TempDir::new().unwrap();
        let addr = serve(offline_state(&tmp)).await.unwrap();
        assert!(addr.port() > 0);
    }

    #[tokio::test]
    async fn test_router_builds() {
        let tmp = TempDir::new().unwrap();
        let _router = router(offline_state(&tmp));
    }
}
