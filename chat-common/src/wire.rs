//! Wire types shared by the relay and its clients.
//!
//! The relay accepts a [`RelayRequest`] as JSON and answers with a line-oriented
//! data stream. Each line is `<code>:<json>\n`:
//!
//! | code | part            | payload                                   |
//! |------|-----------------|-------------------------------------------|
//! | `f`  | message start   | `{"messageId": "..."}`                    |
//! | `0`  | text fragment   | JSON string                               |
//! | `3`  | error           | JSON string                               |
//! | `e`  | step finish     | `{"finishReason", "usage", "isContinued"}`|
//! | `d`  | message finish  | `{"finishReason", "usage"}`               |
//!
//! Unknown codes are skipped so newer producers stay readable.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Error, Result};

/// Header announcing the data stream format on relay responses.
pub const DATA_STREAM_HEADER: &str = "x-vercel-ai-data-stream";

/// Version advertised in [`DATA_STREAM_HEADER`].
pub const DATA_STREAM_VERSION: &str = "v1";

// ============================================================================
// Request
// ============================================================================

/// One turn as sent to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMessage {
    pub role: String,
    pub content: String,
}

impl RelayMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Extra request data attached to the newest turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayData {
    #[serde(default)]
    pub images: Vec<String>,
}

/// Body of `POST /api/chat`.
///
/// The last entry of `messages` is the turn just submitted; everything before
/// it is prior conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayRequest {
    pub messages: Vec<RelayMessage>,
    pub selected_model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<RelayData>,
}

impl RelayRequest {
    /// Image references attached to the newest turn.
    pub fn images(&self) -> &[String] {
        self.data.as_ref().map_or(&[], |d| d.images.as_slice())
    }

    /// Split into `(newest turn, prior turns)`.
    pub fn split_newest(&self) -> Option<(&RelayMessage, &[RelayMessage])> {
        self.messages.split_last()
    }
}

// ============================================================================
// Stream parts
// ============================================================================

/// Token accounting reported when a reply finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

/// Payload of the finish parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishInfo {
    pub finish_reason: String,
    #[serde(default)]
    pub usage: Usage,
}

impl FinishInfo {
    pub fn new(finish_reason: impl Into<String>, usage: Usage) -> Self {
        Self {
            finish_reason: finish_reason.into(),
            usage,
        }
    }
}

/// One line of the relay response stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamPart {
    Start { message_id: String },
    Text(String),
    Error(String),
    FinishStep(FinishInfo),
    FinishMessage(FinishInfo),
}

impl StreamPart {
    /// Encode as one `<code>:<json>\n` line.
    pub fn encode(&self) -> String {
        let (code, payload) = match self {
            Self::Start { message_id } => ('f', json!({ "messageId": message_id })),
            Self::Text(text) => ('0', Value::String(text.clone())),
            Self::Error(message) => ('3', Value::String(message.clone())),
            Self::FinishStep(info) => ('e', finish_json(info, Some(false))),
            Self::FinishMessage(info) => ('d', finish_json(info, None)),
        };
        format!("{}:{}\n", code, payload)
    }

    /// Decode a single line (without its trailing newline).
    ///
    /// Returns `Ok(None)` for blank lines and unknown part codes.
    pub fn decode_line(line: &str) -> Result<Option<Self>> {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            return Ok(None);
        }

        let (code, payload) = line
            .split_once(':')
            .ok_or_else(|| Error::InvalidInput(format!("stream line without code: {line}")))?;

        let part = match code {
            "f" => {
                let value: Value = serde_json::from_str(payload)?;
                let message_id = value
                    .get("messageId")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Self::Start { message_id }
            }
            "0" => Self::Text(serde_json::from_str(payload)?),
            "3" => Self::Error(serde_json::from_str(payload)?),
            "e" => Self::FinishStep(serde_json::from_str(payload)?),
            "d" => Self::FinishMessage(serde_json::from_str(payload)?),
            _ => return Ok(None),
        };

        Ok(Some(part))
    }
}

fn finish_json(info: &FinishInfo, is_continued: Option<bool>) -> Value {
    let mut value = json!({
        "finishReason": info.finish_reason,
        "usage": {
            "promptTokens": info.usage.prompt_tokens,
            "completionTokens": info.usage.completion_tokens,
        },
    });
    if let (Some(flag), Some(obj)) = (is_continued, value.as_object_mut()) {
        obj.insert("isContinued".into(), Value::Bool(flag));
    }
    value
}

// ============================================================================
// Line framing
// ============================================================================

/// Splits a byte stream into newline-terminated lines.
///
/// Chunks may end anywhere, including inside a multi-byte character; bytes are
/// held until their line is complete.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let rest = self.pending.split_off(pos + 1);
            let mut line = std::mem::replace(&mut self.pending, rest);
            line.pop();
            lines.push(into_utf8(line)?);
        }
        Ok(lines)
    }

    /// Return the trailing unterminated line, if any.
    pub fn finish(&mut self) -> Result<Option<String>> {
        if self.pending.is_empty() {
            return Ok(None);
        }
        into_utf8(std::mem::take(&mut self.pending)).map(Some)
    }
}

fn into_utf8(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes).map_err(|e| Error::InvalidInput(format!("stream is not UTF-8: {e}")))
}

/// Incremental decoder for the relay data stream.
#[derive(Debug, Default)]
pub struct DataStreamDecoder {
    lines: LineBuffer,
}

impl DataStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return the parts it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<StreamPart>> {
        let mut parts = Vec::new();
        for line in self.lines.push(chunk)? {
            if let Some(part) = StreamPart::decode_line(&line)? {
                parts.push(part);
            }
        }
        Ok(parts)
    }

    /// Decode whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Result<Option<StreamPart>> {
        match self.lines.finish()? {
            Some(line) => StreamPart::decode_line(&line),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_names() {
        let request = RelayRequest {
            messages: vec![RelayMessage::new("user", "Hello")],
            selected_model: "llama3".into(),
            data: Some(RelayData {
                images: vec!["https://example.com/a.png".into()],
            }),
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["selectedModel"], "llama3");
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["data"]["images"][0], "https://example.com/a.png");
    }

    #[test]
    fn test_request_without_data() {
        let request: RelayRequest = serde_json::from_str(
            r#"{"messages":[{"role":"user","content":"Hi"}],"selectedModel":"mistral"}"#,
        )
        .unwrap();
        assert!(request.images().is_empty());

        let (newest, prior) = request.split_newest().unwrap();
        assert_eq!(newest.content, "Hi");
        assert!(prior.is_empty());

        let json = serde_json::to_string(&request).unwrap();
        assert!(!json.contains("data"));
    }

    #[test]
    fn test_text_part_escapes_content() {
        let line = StreamPart::Text("line \"one\"\nline two".into()).encode();
        assert_eq!(line, "0:\"line \\\"one\\\"\\nline two\"\n");
        assert_eq!(line.matches('\n').count(), 1);
    }

    #[test]
    fn test_finish_parts_encoding() {
        let info = FinishInfo::new(
            "stop",
            Usage {
                prompt_tokens: 3,
                completion_tokens: 5,
            },
        );

        let step = StreamPart::FinishStep(info.clone()).encode();
        assert!(step.starts_with("e:{"));
        assert!(step.contains("\"isContinued\":false"));

        let done = StreamPart::FinishMessage(info).encode();
        assert!(done.starts_with("d:{"));
        assert!(done.contains("\"completionTokens\":5"));
        assert!(!done.contains("isContinued"));
    }

    #[test]
    fn test_decode_known_and_unknown_lines() {
        assert_eq!(
            StreamPart::decode_line("0:\"Hi\"").unwrap(),
            Some(StreamPart::Text("Hi".into()))
        );
        assert_eq!(
            StreamPart::decode_line("f:{\"messageId\":\"msg-1\"}").unwrap(),
            Some(StreamPart::Start {
                message_id: "msg-1".into()
            })
        );
        assert_eq!(StreamPart::decode_line("8:[{\"x\":1}]").unwrap(), None);
        assert_eq!(StreamPart::decode_line("").unwrap(), None);
        assert!(StreamPart::decode_line("no code here").is_err());
        assert!(StreamPart::decode_line("0:not-json").is_err());
    }

    #[test]
    fn test_decoder_handles_split_chunks() {
        let stream = [
            StreamPart::Start {
                message_id: "msg-9".into(),
            }
            .encode(),
            StreamPart::Text("Hi th".into()).encode(),
            StreamPart::Text("ere! ✓".into()).encode(),
            StreamPart::FinishMessage(FinishInfo::new("stop", Usage::default())).encode(),
        ]
        .concat();
        let bytes = stream.as_bytes();

        let mut decoder = DataStreamDecoder::new();
        let mut parts = Vec::new();
        // Feed three bytes at a time so lines and the multi-byte tick are split
        for chunk in bytes.chunks(3) {
            parts.extend(decoder.push(chunk).unwrap());
        }
        assert_eq!(decoder.finish().unwrap(), None);

        let text: String = parts
            .iter()
            .filter_map(|p| match p {
                StreamPart::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "Hi there! ✓");
        assert!(matches!(parts.last(), Some(StreamPart::FinishMessage(_))));
    }

    #[test]
    fn test_decoder_flushes_unterminated_line() {
        let mut decoder = DataStreamDecoder::new();
        assert!(decoder.push(b"3:\"boom\"").unwrap().is_empty());
        assert_eq!(
            decoder.finish().unwrap(),
            Some(StreamPart::Error("boom".into()))
        );
    }

    #[test]
    fn test_line_buffer_crlf_and_multiple_lines() {
        let mut lines = LineBuffer::new();
        let out = lines.push(b"{\"a\":1}\r\n{\"b\":2}\n{\"c\"").unwrap();
        assert_eq!(out, vec!["{\"a\":1}\r".to_string(), "{\"b\":2}".to_string()]);
        assert_eq!(lines.finish().unwrap(), Some("{\"c\"".to_string()));
        assert_eq!(lines.finish().unwrap(), None);
    }
}
