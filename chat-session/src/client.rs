//! HTTP client for the chat relay.

use anyhow::{Context, Result};
use chat_common::config::Config;
use chat_common::wire::{DataStreamDecoder, RelayRequest, StreamPart};
use futures_util::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use crate::stream::{ReplyHandle, ReplySender, StreamStatus};

/// Something that can start a streamed reply for a relay request.
pub trait ReplySource: Send + Sync {
    /// Start the request. Must be called from within a tokio runtime.
    fn start(&self, request: RelayRequest) -> ReplyHandle;
}

/// Client for the relay's HTTP interface.
#[derive(Clone)]
pub struct RelayClient {
    base_url: String,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    #[serde(default)]
    models: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    name: String,
}

impl RelayClient {
    /// Create a client for the relay at `base_url` (e.g. `http://127.0.0.1:4480`).
    pub fn new(base_url: &str) -> Self {
        Self::with_connect_timeout(base_url, Duration::from_secs(10))
    }

    /// Only connecting is bounded; a reply streams for as long as it takes.
    pub fn with_connect_timeout(base_url: &str, connect_timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::builder()
                .connect_timeout(connect_timeout)
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::with_connect_timeout(
            &config.relay_endpoint(),
            Duration::from_secs(config.ollama.connect_timeout_secs),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Names of the models installed on the inference server.
    pub async fn list_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/api/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to reach relay at {}", self.base_url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("{}", failure_reason(status.as_u16(), &body));
        }

        let models: ModelsResponse = response
            .json()
            .await
            .context("Failed to parse model list")?;
        Ok(models.models.into_iter().map(|m| m.name).collect())
    }

    /// Send the request and stream the reply until a terminal part arrives.
    async fn relay(&self, request: &RelayRequest, sender: &ReplySender) -> StreamStatus {
        let url = format!("{}/api/chat", self.base_url);
        tracing::debug!(
            url = %url,
            model = %request.selected_model,
            turns = request.messages.len(),
            "Starting reply stream"
        );

        let response = match self.client.post(&url).json(request).send().await {
            Ok(response) => response,
            Err(e) => return StreamStatus::Failed(format!("Failed to reach relay: {}", e)),
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return StreamStatus::Failed(failure_reason(status.as_u16(), &body));
        }

        let mut decoder = DataStreamDecoder::new();
        let mut bytes = response.bytes_stream();

        while let Some(chunk) = bytes.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => return StreamStatus::Failed(format!("Reply stream interrupted: {}", e)),
            };
            let parts = match decoder.push(&chunk) {
                Ok(parts) => parts,
                Err(e) => return StreamStatus::Failed(e.to_string()),
            };
            for part in parts {
                if let Some(status) = apply_part(part, sender) {
                    return status;
                }
            }
        }

        match decoder.finish() {
            Ok(Some(part)) => {
                if let Some(status) = apply_part(part, sender) {
                    return status;
                }
            }
            Ok(None) => {}
            Err(e) => return StreamStatus::Failed(e.to_string()),
        }

        StreamStatus::Failed("reply stream ended before completion".into())
    }
}

/// Forward a decoded part; returns the terminal status if it ends the reply.
fn apply_part(part: StreamPart, sender: &ReplySender) -> Option<StreamStatus> {
    match part {
        StreamPart::Text(text) => {
            if !text.is_empty() && !sender.fragment(text) {
                return Some(StreamStatus::Cancelled);
            }
            None
        }
        StreamPart::Error(message) => Some(StreamStatus::Failed(message)),
        StreamPart::FinishMessage(_) => Some(StreamStatus::Completed),
        StreamPart::Start { .. } | StreamPart::FinishStep(_) => None,
    }
}

fn failure_reason(status: u16, body: &str) -> String {
    let body = body.trim();
    if body.is_empty() {
        format!("relay returned HTTP {}", status)
    } else {
        body.to_string()
    }
}

impl ReplySource for RelayClient {
    fn start(&self, request: RelayRequest) -> ReplyHandle {
        let (sender, handle) = ReplyHandle::channel();
        let client = self.clone();

        tokio::spawn(async move {
            let token = sender.cancellation_token();
            let status = tokio::select! {
                _ = token.cancelled() => StreamStatus::Cancelled,
                status = client.relay(&request, &sender) => status,
            };

            match &status {
                StreamStatus::Failed(reason) => {
                    tracing::warn!(model = %request.selected_model, reason = %reason, "Reply stream failed");
                }
                other => {
                    tracing::debug!(model = %request.selected_model, status = %other, "Reply stream ended");
                }
            }
            sender.finish(status);
        });

        handle
    }
}
