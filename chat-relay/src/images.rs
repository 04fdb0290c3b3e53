//! Packaging of image attachments.
//!
//! Ollama only accepts inline base64 images, so every reference the client
//! sends is turned into base64 bytes here: `data:` URLs are validated and
//! passed through, `http(s)` URLs are downloaded.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chat_common::Error;
use futures_util::StreamExt;
use reqwest::Client;
use std::time::Duration;
use url::Url;

use crate::provider::ContentPart;

/// Resolves image references into typed content items.
#[derive(Clone)]
pub struct ImageResolver {
    client: Client,
    max_bytes: usize,
}

impl ImageResolver {
    /// Create a resolver whose downloads give up after `fetch_timeout` or
    /// once they exceed `max_bytes`.
    pub fn new(fetch_timeout: Duration, max_bytes: usize) -> Self {
        Self {
            client: Client::builder()
                .timeout(fetch_timeout)
                .build()
                .unwrap_or_else(|_| Client::new()),
            max_bytes,
        }
    }

    /// Resolve one image reference.
    pub async fn resolve(&self, reference: &str) -> Result<ContentPart, Error> {
        let url = Url::parse(reference).map_err(|e| {
            Error::InvalidInput(format!("malformed image URL '{}': {}", reference, e))
        })?;

        match url.scheme() {
            "data" => decode_data_url(reference),
            "http" | "https" => self.download(reference, url).await,
            other => Err(Error::InvalidInput(format!(
                "unsupported image URL scheme '{}'",
                other
            ))),
        }
    }

    /// Resolve every reference in order, failing on the first bad one.
    pub async fn resolve_all(&self, references: &[String]) -> Result<Vec<ContentPart>, Error> {
        let mut parts = Vec::with_capacity(references.len());
        for reference in references {
            parts.push(self.resolve(reference).await?);
        }
        Ok(parts)
    }

    async fn download(&self, reference: &str, url: Url) -> Result<ContentPart, Error> {
        tracing::debug!(url = %url, "Downloading image attachment");

        let response = self.client.get(url).send().await.map_err(|e| {
            Error::External(format!("failed to fetch image '{}': {}", reference, e))
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::External(format!(
                "failed to fetch image '{}': HTTP {}",
                reference,
                status.as_u16()
            )));
        }

        let media_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());

        if response
            .content_length()
            .is_some_and(|len| len > self.max_bytes as u64)
        {
            return Err(self.too_large(reference));
        }

        let mut bytes = Vec::new();
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| {
                Error::External(format!("failed to read image '{}': {}", reference, e))
            })?;
            if bytes.len() + chunk.len() > self.max_bytes {
                return Err(self.too_large(reference));
            }
            bytes.extend_from_slice(&chunk);
        }

        Ok(ContentPart::Image {
            url: reference.to_string(),
            data: STANDARD.encode(&bytes),
            media_type,
        })
    }

    fn too_large(&self, reference: &str) -> Error {
        Error::InvalidInput(format!(
            "image '{}' is larger than {} bytes",
            reference, self.max_bytes
        ))
    }
}

/// Split a `data:<media type>;base64,<payload>` URL and validate the payload.
fn decode_data_url(reference: &str) -> Result<ContentPart, Error> {
    let rest = reference
        .get(..5)
        .filter(|scheme| scheme.eq_ignore_ascii_case("data:"))
        .map(|_| &reference[5..])
        .ok_or_else(|| Error::InvalidInput(format!("malformed data URL '{}'", reference)))?;

    let (meta, payload) = rest
        .split_once(',')
        .ok_or_else(|| Error::InvalidInput("data URL has no payload".into()))?;

    let media_type = match meta.strip_suffix(";base64") {
        Some(media_type) => media_type,
        None => {
            return Err(Error::InvalidInput(
                "only base64-encoded data URLs are supported".into(),
            ))
        }
    };

    let payload = payload.trim();
    STANDARD
        .decode(payload)
        .map_err(|e| Error::InvalidInput(format!("data URL payload is not base64: {}", e)))?;

    Ok(ContentPart::Image {
        url: reference.to_string(),
        data: payload.to_string(),
        media_type: (!media_type.is_empty()).then(|| media_type.to_string()),
    })
}
