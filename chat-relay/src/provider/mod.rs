//! Inference provider abstraction.
//!
//! The relay talks to the inference server through the [`Provider`] trait so
//! routes can be exercised against a scripted provider in tests.

mod ollama;

pub use ollama::OllamaProvider;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

// ============================================================================
// Provider Trait
// ============================================================================

/// Stream of reply chunks produced by a provider.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ChatChunk, ProviderError>> + Send>>;

/// Interface to an inference server.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Get the provider name.
    fn name(&self) -> &str;

    /// List the models installed on the server.
    async fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderError>;

    /// Start a streamed chat completion.
    ///
    /// Resolves once the server has accepted the request; any failure up to
    /// that point is returned here rather than inside the stream.
    async fn chat_stream(&self, request: ChatRequest) -> Result<ChunkStream, ProviderError>;
}

/// Error from a provider.
#[derive(Debug, Clone)]
pub struct ProviderError {
    pub provider: String,
    pub model: String,
    pub message: String,
    pub status_code: Option<u16>,
}

impl ProviderError {
    pub fn new(
        provider: impl Into<String>,
        model: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            message: message.into(),
            status_code: None,
        }
    }

    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.model.is_empty() {
            write!(f, "[{}] {}", self.provider, self.message)
        } else {
            write!(f, "[{}:{}] {}", self.provider, self.model, self.message)
        }
    }
}

impl std::error::Error for ProviderError {}

impl From<ProviderError> for chat_common::Error {
    fn from(err: ProviderError) -> Self {
        chat_common::Error::External(err.to_string())
    }
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// A streamed chat request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRequest {
    /// Model to use
    pub model: String,
    /// Prior turns followed by the newest turn
    pub messages: Vec<Message>,
}

/// One typed content item of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    Image {
        /// The reference the client sent (http(s) or data URL)
        url: String,
        /// Base64 image bytes
        data: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        media_type: Option<String>,
    },
}

/// A message in the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: Vec<ContentPart>,
}

impl Message {
    /// A message holding a single text item.
    pub fn text(role: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: vec![ContentPart::Text { text: text.into() }],
        }
    }

    /// Concatenated text items.
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(text.as_str()),
                ContentPart::Image { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Base64 payloads of the image items.
    pub fn image_data(&self) -> Vec<String> {
        self.content
            .iter()
            .filter_map(|part| match part {
                ContentPart::Image { data, .. } => Some(data.clone()),
                ContentPart::Text { .. } => None,
            })
            .collect()
    }
}

/// One piece of a streamed reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatChunk {
    /// Incremental assistant text
    Delta(String),
    /// The reply is complete
    Done {
        finish_reason: Option<String>,
        usage: TokenUsage,
    },
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// A model installed on the inference server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_display() {
        let err = ProviderError::new("ollama", "llama3", "model not found").with_status(404);
        assert_eq!(err.to_string(), "[ollama:llama3] model not found");
        assert_eq!(err.status_code, Some(404));

        let err = ProviderError::new("ollama", "", "connection refused");
        assert_eq!(err.to_string(), "[ollama] connection refused");
    }

    #[test]
    fn test_provider_error_into_common_error() {
        let err: chat_common::Error = ProviderError::new("ollama", "llama3", "boom").into();
        assert!(matches!(err, chat_common::Error::External(ref m) if m == "[ollama:llama3] boom"));
    }

    #[test]
    fn test_message_content_helpers() {
        let message = Message {
            role: "user".into(),
            content: vec![
                ContentPart::Text {
                    text: "What is this?".into(),
                },
                ContentPart::Image {
                    url: "https://example.com/a.png".into(),
                    data: "aGVsbG8=".into(),
                    media_type: Some("image/png".into()),
                },
            ],
        };

        assert_eq!(message.text_content(), "What is this?");
        assert_eq!(message.image_data(), vec!["aGVsbG8=".to_string()]);
    }

    #[test]
    fn test_content_part_serialization() {
        let json = serde_json::to_value(ContentPart::Text { text: "hi".into() }).unwrap();
        assert_eq!(json["type"], "text");
        assert_eq!(json["text"], "hi");
    }
}
