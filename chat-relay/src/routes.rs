//! Route definitions for Chat Relay.
//!
//! Provides the chat relay endpoint, the model listing and health checks.

use crate::provider::{ModelInfo, Provider};
use crate::relay::{chat_relay, error_response, RelayState};
use axum::{
    extract::{DefaultBodyLimit, State},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chat_common::config::Config;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub service: String,
}

/// Model listing response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ModelsResponse {
    pub models: Vec<ModelInfo>,
}

/// Build the complete router with all routes.
pub fn build_all_routes(config: &Config) -> Router {
    build_all_routes_with_state(config, RelayState::from_config(config))
}

/// Build the complete router against a specific provider.
/// This is useful for testing without an inference server.
pub fn build_all_routes_with_provider(config: &Config, provider: Arc<dyn Provider>) -> Router {
    let state = RelayState::from_config(config);
    build_all_routes_with_state(config, RelayState::new(provider, state.images))
}

fn build_all_routes_with_state(config: &Config, state: RelayState) -> Router {
    Router::new()
        .merge(relay_routes(state, config.relay.max_body_bytes))
        .merge(health_routes())
}

/// Relay routes.
pub fn relay_routes(state: RelayState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/api/chat", post(chat_relay))
        .route("/api/models", get(list_models_handler))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(state)
}

/// Health check routes.
pub fn health_routes() -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/health", get(health_handler))
}

async fn list_models_handler(State(state): State<RelayState>) -> Response {
    match state.provider.list_models().await {
        Ok(models) => Json(ModelsResponse { models }).into_response(),
        Err(e) => {
            tracing::error!(upstream_status = ?e.status_code, error = %e, "Failed to list models");
            error_response(e)
        }
    }
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        service: "chat-relay".into(),
    })
}
