//! Chat Relay - forwards a conversation to a local inference server and streams the reply.
//!
//! ## Architecture
//!
//! ```text
//! Client ──POST /api/chat──▶ Relay (parse → package images) ──▶ Ollama /api/chat
//!        ◀──data stream────        (NDJSON → stream parts)   ◀──NDJSON────
//! ```
//!
//! The relay keeps no state between requests. Every failure that happens before
//! the first byte of the reply is sent comes back as a plain-text `Error: ...`
//! body with status 500.

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod images;
pub mod provider;
pub mod relay;
pub mod routes;

pub use images::ImageResolver;
pub use provider::{
    ChatChunk, ChatRequest, ChunkStream, ContentPart, Message, ModelInfo, OllamaProvider,
    Provider, ProviderError, TokenUsage,
};
pub use relay::RelayState;

use axum::Router;
use std::net::SocketAddr;
use tower_http::cors::{Any, CorsLayer};
use chat_common::config::Config;

/// Build the relay router with all routes and middleware.
pub fn build_router(config: &Config) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    routes::build_all_routes(config).layer(cors)
}

/// Start the relay server.
pub async fn start_server(config: &Config) -> anyhow::Result<()> {
    let addr = SocketAddr::from((
        config.network.bind.parse::<std::net::IpAddr>()?,
        config.relay.port,
    ));

    let router = build_router(config);

    tracing::info!(
        ollama = %config.ollama_base_url(),
        "Starting Chat Relay on {}",
        addr
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Chat Relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
