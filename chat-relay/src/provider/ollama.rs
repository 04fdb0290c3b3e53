//! Ollama provider for chat-relay.
//!
//! Connects to a local Ollama instance and streams `/api/chat` replies.

use super::{ChatChunk, ChatRequest, ChunkStream, ModelInfo, Provider, ProviderError, TokenUsage};
use async_stream::try_stream;
use async_trait::async_trait;
use chat_common::config::{Config, DEFAULT_OLLAMA_URL};
use chat_common::wire::LineBuffer;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const PROVIDER: &str = "ollama";

/// Ollama provider for local models.
pub struct OllamaProvider {
    base_url: String,
    client: Client,
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct OllamaMessage {
    role: String,
    content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
}

/// One NDJSON line of a streamed `/api/chat` reply.
#[derive(Debug, Deserialize)]
struct OllamaStreamChunk {
    #[serde(default)]
    message: Option<OllamaResponseMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OllamaResponseMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct OllamaTagsResponse {
    #[serde(default)]
    models: Vec<OllamaModel>,
}

#[derive(Debug, Deserialize)]
struct OllamaModel {
    name: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    modified_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OllamaErrorBody {
    error: String,
}

impl OllamaProvider {
    /// Create a new Ollama provider.
    ///
    /// # Arguments
    /// * `base_url` - Base URL for Ollama API (defaults to http://localhost:11434)
    pub fn new(base_url: Option<&str>) -> Self {
        Self::with_connect_timeout(base_url, Duration::from_secs(10))
    }

    /// Create a provider with a specific connect timeout.
    ///
    /// No overall request timeout is set: a reply streams for as long as the
    /// model keeps generating.
    pub fn with_connect_timeout(base_url: Option<&str>, connect_timeout: Duration) -> Self {
        Self {
            base_url: base_url
                .unwrap_or(DEFAULT_OLLAMA_URL)
                .trim_end_matches('/')
                .to_string(),
            client: Client::builder()
                .connect_timeout(connect_timeout)
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    /// Create from the service configuration.
    pub fn from_config(config: &Config) -> Self {
        Self::with_connect_timeout(
            Some(config.ollama_base_url()),
            Duration::from_secs(config.ollama.connect_timeout_secs),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build_request(request: ChatRequest) -> OllamaChatRequest {
        let messages = request
            .messages
            .iter()
            .map(|msg| OllamaMessage {
                role: msg.role.clone(),
                content: msg.text_content(),
                images: msg.image_data(),
            })
            .collect();

        OllamaChatRequest {
            model: request.model,
            messages,
            stream: true,
        }
    }
}

/// Turn an error response body into a readable message.
fn error_message(status: u16, body: &str) -> String {
    let detail = serde_json::from_str::<OllamaErrorBody>(body)
        .map(|b| b.error)
        .unwrap_or_else(|_| body.trim().to_string());
    format!("API error ({}): {}", status, detail)
}

/// Decode one NDJSON line into zero or more chunks.
fn parse_stream_line(model: &str, line: &str) -> Result<Vec<ChatChunk>, ProviderError> {
    if line.trim().is_empty() {
        return Ok(Vec::new());
    }

    let chunk: OllamaStreamChunk = serde_json::from_str(line).map_err(|e| {
        ProviderError::new(PROVIDER, model, format!("Failed to parse stream chunk: {}", e))
    })?;

    if let Some(error) = chunk.error {
        return Err(ProviderError::new(PROVIDER, model, error));
    }

    let mut chunks = Vec::new();
    if let Some(message) = chunk.message {
        if !message.content.is_empty() {
            chunks.push(ChatChunk::Delta(message.content));
        }
    }

    if chunk.done {
        chunks.push(ChatChunk::Done {
            finish_reason: chunk.done_reason,
            usage: TokenUsage {
                input_tokens: chunk.prompt_eval_count.unwrap_or(0),
                output_tokens: chunk.eval_count.unwrap_or(0),
            },
        });
    }

    Ok(chunks)
}

#[async_trait]
impl Provider for OllamaProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderError> {
        let url = format!("{}/api/tags", self.base_url);

        let response = self.client.get(&url).send().await.map_err(|e| {
            ProviderError::new(
                PROVIDER,
                "",
                format!("Request failed: {}. Is Ollama running? (ollama serve)", e),
            )
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(
                ProviderError::new(PROVIDER, "", error_message(status.as_u16(), &body))
                    .with_status(status.as_u16()),
            );
        }

        let tags: OllamaTagsResponse = response.json().await.map_err(|e| {
            ProviderError::new(PROVIDER, "", format!("Failed to parse model list: {}", e))
        })?;

        Ok(tags
            .models
            .into_iter()
            .map(|m| ModelInfo {
                name: m.name,
                size: m.size,
                modified_at: m.modified_at,
            })
            .collect())
    }

    async fn chat_stream(&self, request: ChatRequest) -> Result<ChunkStream, ProviderError> {
        let model = request.model.clone();
        let body = Self::build_request(request);
        let url = format!("{}/api/chat", self.base_url);

        tracing::debug!(
            model = %model,
            messages = body.messages.len(),
            url = %url,
            "Sending chat request to Ollama"
        );

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                ProviderError::new(
                    PROVIDER,
                    &model,
                    format!("Request failed: {}. Is Ollama running? (ollama serve)", e),
                )
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(ProviderError::new(
                PROVIDER,
                &model,
                error_message(status.as_u16(), &error_text),
            )
            .with_status(status.as_u16()));
        }

        let stream = try_stream! {
            let mut lines = LineBuffer::new();
            let mut bytes = response.bytes_stream();
            let mut finished = false;

            'read: while let Some(chunk) = bytes.next().await {
                let chunk = chunk.map_err(|e| {
                    ProviderError::new(PROVIDER, &model, format!("Stream interrupted: {}", e))
                })?;
                let complete = lines
                    .push(&chunk)
                    .map_err(|e| ProviderError::new(PROVIDER, &model, e.to_string()))?;

                for line in complete {
                    for out in parse_stream_line(&model, &line)? {
                        finished = matches!(out, ChatChunk::Done { .. });
                        yield out;
                        if finished {
                            break 'read;
                        }
                    }
                }
            }

            if !finished {
                let rest = lines
                    .finish()
                    .map_err(|e| ProviderError::new(PROVIDER, &model, e.to_string()))?;
                if let Some(line) = rest {
                    for out in parse_stream_line(&model, &line)? {
                        yield out;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ContentPart, Message};

    #[test]
    fn default_url() {
        let p = OllamaProvider::new(None);
        assert_eq!(p.base_url(), "http://localhost:11434");
    }

    #[test]
    fn custom_url_trailing_slash() {
        let p = OllamaProvider::new(Some("http://192.168.1.100:11434/"));
        assert_eq!(p.base_url(), "http://192.168.1.100:11434");
    }

    #[test]
    fn from_config_uses_configured_url() {
        let mut config = Config::default();
        config.ollama.base_url = "http://gpu-box:11434/".into();
        let p = OllamaProvider::from_config(&config);
        assert_eq!(p.base_url(), "http://gpu-box:11434");
    }

    #[test]
    fn provider_name_is_ollama() {
        let p = OllamaProvider::new(None);
        assert_eq!(p.name(), "ollama");
    }

    #[test]
    fn request_serializes_images_only_when_present() {
        let request = ChatRequest {
            model: "llava".into(),
            messages: vec![
                Message::text("user", "hello"),
                Message::text("assistant", "hi"),
                Message {
                    role: "user".into(),
                    content: vec![
                        ContentPart::Text {
                            text: "describe".into(),
                        },
                        ContentPart::Image {
                            url: "data:image/png;base64,aGVsbG8=".into(),
                            data: "aGVsbG8=".into(),
                            media_type: Some("image/png".into()),
                        },
                    ],
                },
            ],
        };

        let json = serde_json::to_value(OllamaProvider::build_request(request)).unwrap();
        assert_eq!(json["stream"], true);
        assert_eq!(json["model"], "llava");
        assert!(json["messages"][0].get("images").is_none());
        assert_eq!(json["messages"][2]["content"], "describe");
        assert_eq!(json["messages"][2]["images"][0], "aGVsbG8=");
    }

    #[test]
    fn parses_delta_line() {
        let line = r#"{"model":"llama3","message":{"role":"assistant","content":"Hi"},"done":false}"#;
        let chunks = parse_stream_line("llama3", line).unwrap();
        assert_eq!(chunks, vec![ChatChunk::Delta("Hi".into())]);
    }

    #[test]
    fn parses_final_line() {
        let line = r#"{"model":"llama3","message":{"role":"assistant","content":""},"done":true,"done_reason":"stop","prompt_eval_count":10,"eval_count":5}"#;
        let chunks = parse_stream_line("llama3", line).unwrap();
        assert_eq!(
            chunks,
            vec![ChatChunk::Done {
                finish_reason: Some("stop".into()),
                usage: TokenUsage {
                    input_tokens: 10,
                    output_tokens: 5,
                },
            }]
        );
    }

    #[test]
    fn error_line_becomes_error() {
        let err = parse_stream_line("llama3", r#"{"error":"model 'llama3' not found"}"#).unwrap_err();
        assert!(err.message.contains("not found"));
    }

    #[test]
    fn blank_and_garbage_lines() {
        assert!(parse_stream_line("llama3", "   ").unwrap().is_empty());
        assert!(parse_stream_line("llama3", "not json").is_err());
    }

    #[test]
    fn error_message_prefers_json_error_field() {
        assert_eq!(
            error_message(404, r#"{"error":"model not found"}"#),
            "API error (404): model not found"
        );
        assert_eq!(error_message(502, "bad gateway\n"), "API error (502): bad gateway");
    }

    #[tokio::test]
    async fn upstream_status_is_kept_on_errors() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(
                ResponseTemplate::new(404).set_body_string(r#"{"error":"model 'nope' not found"}"#),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let p = OllamaProvider::new(Some(&server.uri()));
        let err = p
            .chat_stream(ChatRequest {
                model: "nope".into(),
                messages: vec![Message::text("user", "hi")],
            })
            .await
            .err()
            .unwrap();
        assert_eq!(err.status_code, Some(404));
        assert!(err.message.contains("not found"));

        let err = p.list_models().await.unwrap_err();
        assert_eq!(err.status_code, Some(503));
    }
}
