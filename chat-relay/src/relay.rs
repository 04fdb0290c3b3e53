//! Chat relay handler.
//!
//! Forwards a conversation to the inference provider and streams the reply
//! back as soon as the provider starts answering.

use async_stream::stream;
use axum::{
    body::{Body, Bytes},
    extract::{rejection::BytesRejection, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use chat_common::wire::{
    FinishInfo, RelayRequest, StreamPart, Usage, DATA_STREAM_HEADER, DATA_STREAM_VERSION,
};
use chat_common::{Config, Error};
use futures_util::{Stream, StreamExt};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use crate::images::ImageResolver;
use crate::provider::{
    ChatChunk, ChatRequest, ChunkStream, ContentPart, Message, OllamaProvider, Provider,
};

/// Relay state shared by all requests.
#[derive(Clone)]
pub struct RelayState {
    pub provider: Arc<dyn Provider>,
    pub images: ImageResolver,
}

impl RelayState {
    /// Create relay state for an arbitrary provider.
    pub fn new(provider: Arc<dyn Provider>, images: ImageResolver) -> Self {
        Self { provider, images }
    }

    /// Create relay state talking to the configured Ollama server.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Arc::new(OllamaProvider::from_config(config)),
            ImageResolver::new(
                Duration::from_secs(config.ollama.image_fetch_timeout_secs),
                config.ollama.max_image_bytes,
            ),
        )
    }
}

/// Build the provider request from the relay body.
///
/// Prior turns are passed through as text; the newest turn becomes a `user`
/// message carrying a text item followed by one image item per attachment.
pub async fn build_chat_request(
    images: &ImageResolver,
    request: &RelayRequest,
) -> Result<ChatRequest, Error> {
    if request.selected_model.trim().is_empty() {
        return Err(Error::InvalidInput("no model selected".into()));
    }

    let (newest, prior) = request
        .split_newest()
        .ok_or_else(|| Error::InvalidInput("request contains no messages".into()))?;

    let mut messages: Vec<Message> = prior
        .iter()
        .map(|m| Message::text(m.role.clone(), m.content.clone()))
        .collect();

    let mut content = vec![ContentPart::Text {
        text: newest.content.clone(),
    }];
    content.extend(images.resolve_all(request.images()).await?);

    messages.push(Message {
        role: "user".into(),
        content,
    });

    Ok(ChatRequest {
        model: request.selected_model.clone(),
        messages,
    })
}

/// Plain-text failure response.
pub fn error_response(err: impl std::fmt::Display) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        format!("Error: {}", err),
    )
        .into_response()
}

/// Relay a chat request to the provider.
pub async fn chat_relay(
    State(state): State<RelayState>,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let request_id = chat_common::logging::generate_request_id();

    match start_relay(&state, body).await {
        Ok((model, chunks)) => {
            tracing::info!(request_id = %request_id, model = %model, "Streaming reply");
            stream_response(&request_id, chunks)
        }
        Err(e) => {
            tracing::error!(request_id = %request_id, error = %e, "Chat relay failed");
            error_response(e)
        }
    }
}

async fn start_relay(
    state: &RelayState,
    body: Result<Bytes, BytesRejection>,
) -> Result<(String, ChunkStream), Error> {
    let body = body.map_err(|e| Error::InvalidInput(e.body_text()))?;
    let request: RelayRequest = serde_json::from_slice(&body)
        .map_err(|e| Error::InvalidInput(format!("malformed request body: {}", e)))?;

    let chat_request = build_chat_request(&state.images, &request).await?;
    let model = chat_request.model.clone();

    tracing::debug!(
        model = %model,
        turns = chat_request.messages.len(),
        images = request.images().len(),
        "Relaying chat request"
    );

    let chunks = state
        .provider
        .chat_stream(chat_request)
        .await
        .inspect_err(|e| {
            tracing::warn!(
                provider = %e.provider,
                model = %model,
                upstream_status = ?e.status_code,
                "Provider rejected chat request"
            );
        })?;
    Ok((model, chunks))
}

fn stream_response(request_id: &str, chunks: ChunkStream) -> Response {
    let message_id = format!("msg-{}", uuid::Uuid::new_v4().simple());
    let body = Body::from_stream(data_stream(request_id.to_string(), message_id, chunks));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(DATA_STREAM_HEADER, DATA_STREAM_VERSION)
        .body(body)
        .unwrap_or_else(|e| error_response(e))
}

/// Encode provider chunks as data stream lines.
fn data_stream(
    request_id: String,
    message_id: String,
    mut chunks: ChunkStream,
) -> impl Stream<Item = Result<String, Infallible>> + Send {
    stream! {
        yield Ok(StreamPart::Start { message_id }.encode());

        let mut finished = false;
        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(ChatChunk::Delta(text)) => {
                    if !text.is_empty() {
                        yield Ok(StreamPart::Text(text).encode());
                    }
                }
                Ok(ChatChunk::Done { finish_reason, usage }) => {
                    let info = FinishInfo::new(
                        finish_reason.unwrap_or_else(|| "stop".into()),
                        Usage {
                            prompt_tokens: usage.input_tokens,
                            completion_tokens: usage.output_tokens,
                        },
                    );
                    yield Ok(StreamPart::FinishStep(info.clone()).encode());
                    yield Ok(StreamPart::FinishMessage(info).encode());
                    finished = true;
                    break;
                }
                Err(e) => {
                    tracing::warn!(request_id = %request_id, error = %e, "Reply stream failed");
                    yield Ok(StreamPart::Error(e.to_string()).encode());
                    finished = true;
                    break;
                }
            }
        }

        if !finished {
            tracing::warn!(request_id = %request_id, "Inference stream ended before completion");
            yield Ok(StreamPart::Error("inference stream ended before completion".into()).encode());
        } else {
            tracing::debug!(request_id = %request_id, "Reply stream finished");
        }
    }
}
