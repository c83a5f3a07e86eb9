use crate::{
    config::AppConfig,
    error::{Result, ServiceError},
    query::QueryEngine,
    schema::FieldRegistry,
};
use axum::http::HeaderMap;
use std::sync::Arc;

const API_KEY_HEADER: &str = "x-api-key";

/// Shared by every handler: the loaded configuration and the engine built
/// over the field registry.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub query: QueryEngine,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, registry: Arc<dyn FieldRegistry>) -> Self {
        let query = QueryEngine::new(registry, Arc::clone(&config));
        Self { config, query }
    }

    /// No-op unless an API key is configured.
    pub fn authorize(&self, headers: &HeaderMap) -> Result<()> {
        let Some(expected) = &self.config.api_key else {
            return Ok(());
        };
        let provided = headers
            .get(API_KEY_HEADER)
            .and_then(|value| value.to_str().ok());
        if provided == Some(expected.as_str()) {
            Ok(())
        } else {
            Err(ServiceError::Auth)
        }
    }
}
