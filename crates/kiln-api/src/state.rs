//! Shared application state handed to every route handler.

use std::sync::Arc;

use kiln_core::config::ConverterSettings;
use kiln_core::queue::TaskBroker;
use kiln_core::storage::StoreGateway;
use kiln_core::worker::ConversionWorker;
use kiln_pipeline::Orchestrator;
use kiln_search::{IndexControl, SearchDispatcher};
use kiln_video::config::VideoSettings;
use kiln_video::VideoPipeline;

use crate::auth::AppKeyValidator;

pub struct AppState {
    pub settings: ConverterSettings,
    pub video_settings: VideoSettings,
    pub broker: TaskBroker,
    pub gateway: Arc<StoreGateway>,
    pub worker: Arc<ConversionWorker>,
    pub orchestrator: Arc<Orchestrator>,
    pub video: Arc<VideoPipeline>,
    pub index_control: Arc<IndexControl>,
    pub search: Arc<SearchDispatcher>,
    pub validator: AppKeyValidator,
    pub meta_queue: String,
}
