use crate::adapter::{ClaudeAdapter, SessionOpener};
use crate::config::{GatewayConfig, ModelAliases};
use crate::error::{AppError, AppResult};
use crate::vertex::VertexOpener;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use std::sync::Arc;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub aliases: Arc<ModelAliases>,
    pub adapter: Arc<ClaudeAdapter>,
}

impl AppState {
    pub fn new(config: GatewayConfig, adapter: ClaudeAdapter) -> Self {
        let aliases = config.model_aliases();
        Self {
            config: Arc::new(config),
            aliases: Arc::new(aliases),
            adapter: Arc::new(adapter),
        }
    }
}

pub async fn load_state() -> AppResult<AppState> {
    let config = GatewayConfig::from_env()
        .map_err(|err| AppError::internal("config_invalid", err))?;
    load_state_with_config(config).await
}

pub async fn load_state_with_config(config: GatewayConfig) -> AppResult<AppState> {
    let http = reqwest::Client::builder()
        .user_agent("vertex-gateway/0.1")
        .build()
        .map_err(|err| AppError::internal("http_client_init_failed", err.to_string()))?;
    let opener = VertexOpener::new(http, config.adapter_settings())
        .with_base_url(config.vertex_base_url.clone());
    load_state_with_opener(config, Arc::new(opener)).await
}

pub async fn load_state_with_opener(
    config: GatewayConfig,
    opener: Arc<dyn SessionOpener>,
) -> AppResult<AppState> {
    let adapter = ClaudeAdapter::connect(config.adapter_settings(), opener).await?;
    Ok(AppState::new(config, adapter))
}

pub fn build_app(state: AppState) -> Router {
    Router::<AppState>::new()
        .route("/v1/messages", post(crate::handlers::create_message))
        .route("/health", get(crate::handlers::health))
        .with_state(state)
        .layer(DefaultBodyLimit::disable())
        .layer(axum::middleware::from_fn(crate::context::log_request))
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static(crate::context::REQUEST_ID_HEADER),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static(crate::context::REQUEST_ID_HEADER),
        ))
        .layer(TraceLayer::new_for_http())
}
