use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use aegis_core::AegisConfig;
use aegis_llm::{LlmClient, OllamaClient};
use aegis_store::Store;
use aegis_vm::VmRegistry;

/// Central shared state — passed as Arc<AppState> to all handlers.
pub struct AppState {
    pub config: Arc<AegisConfig>,
    pub store: Arc<Store>,
    pub llm: Arc<dyn LlmClient>,
    pub registry: Arc<VmRegistry>,
}

impl AppState {
    pub fn new(config: AegisConfig) -> aegis_store::Result<Self> {
        let store = Arc::new(Store::open(&config.storage.db_path)?);
        let llm: Arc<dyn LlmClient> = Arc::new(OllamaClient::new(config.llm.host.clone()));
        let registry = Arc::new(VmRegistry::new(
            config.vm.clone(),
            config.storage.upload_dir.clone(),
        ));
        Ok(Self {
            config: Arc::new(config),
            store,
            llm,
            registry,
        })
    }
}

/// Assemble the full router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route("/chat", post(crate::http::chat::chat_handler))
        .route("/ws", get(crate::ws::connection::ws_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
