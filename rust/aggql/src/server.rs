use crate::{
    config::AppConfig,
    error::{Result, ServiceError},
    query::{RenderRequest, TranslateRequest, TranslateResponse},
    schema::{FieldRegistry, StaticFieldRegistry},
    state::AppState,
};
use anyhow::Context;
use axum::{
    extract::State,
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub struct Server {
    config: Arc<AppConfig>,
    state: AppState,
}

impl Server {
    pub async fn new(config: AppConfig) -> anyhow::Result<Self> {
        let registry = match &config.schema_path {
            Some(path) => {
                let registry = StaticFieldRegistry::load(path)
                    .with_context(|| format!("failed to load field registry {}", path.display()))?;
                info!(path = %path.display(), "loaded field registry");
                registry
            }
            None => {
                warn!("AGGQL_SCHEMA_PATH is not set; field names are used as column names");
                StaticFieldRegistry::new()
            }
        };
        Ok(Self::with_registry(config, Arc::new(registry)))
    }

    pub fn with_registry(config: AppConfig, registry: Arc<dyn FieldRegistry>) -> Self {
        let config = Arc::new(config);
        let state = AppState::new(Arc::clone(&config), registry);
        Self { config, state }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/healthz", get(Self::health))
            .route("/translate", post(Self::translate))
            .route("/render", post(Self::render))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.config.listen_addr;
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "aggql listening");
        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    async fn health() -> Json<Value> {
        Json(json!({ "status": "ok" }))
    }

    async fn translate(
        State(state): State<AppState>,
        headers: HeaderMap,
        Json(request): Json<TranslateRequest>,
    ) -> Result<Json<TranslateResponse>> {
        state.authorize(&headers)?;
        let translation = state
            .query
            .translate(request.index.as_deref(), &request.body)?;
        Ok(Json(translation.response()))
    }

    async fn render(
        State(state): State<AppState>,
        headers: HeaderMap,
        Json(request): Json<RenderRequest>,
    ) -> Result<Json<Value>> {
        state.authorize(&headers)?;

        let cancel = Arc::new(AtomicBool::new(false));
        let engine = state.query.clone();
        let flag = Arc::clone(&cancel);
        let task = tokio::task::spawn_blocking(move || engine.render_request(&request, &flag));

        match tokio::time::timeout(state.config.request_timeout, task).await {
            Ok(joined) => {
                let response = joined
                    .map_err(|err| ServiceError::Internal(anyhow::anyhow!("render task failed: {err}")))??;
                Ok(Json(response))
            }
            Err(_) => {
                cancel.store(true, Ordering::Relaxed);
                warn!(
                    timeout_secs = state.config.request_timeout.as_secs(),
                    "rendering timed out"
                );
                Err(ServiceError::Cancelled)
            }
        }
    }
}
