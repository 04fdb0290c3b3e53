//! Conversation types and the persisted record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Version written into [`PersistedState::version`].
pub const STATE_VERSION: u32 = 1;

/// Author of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// User message
    User,
    /// Model reply
    Assistant,
}

impl Role {
    /// Wire and storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    /// Parse from string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// A single turn of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    /// Unique within its conversation
    pub id: String,
    pub role: Role,
    pub content: String,
    /// Image references (URL strings) attached to the turn
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    /// Set on replies persisted from a cancelled or failed stream
    #[serde(default, skip_serializing_if = "is_false")]
    pub interrupted: bool,
}

impl Turn {
    /// Create a turn with a fresh identifier.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            images: Vec::new(),
            interrupted: false,
        }
    }

    /// A user turn with optional image attachments.
    pub fn user(content: impl Into<String>, images: Vec<String>) -> Self {
        Self {
            images,
            ..Self::new(Role::User, content)
        }
    }

    /// A complete assistant reply.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// An assistant reply cut short by cancellation or a stream failure.
    pub fn interrupted(content: impl Into<String>) -> Self {
        Self {
            interrupted: true,
            ..Self::assistant(content)
        }
    }

    /// Replace the generated identifier.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// A conversation and its metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    #[serde(default)]
    pub turns: Vec<Turn>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl Conversation {
    /// Create an empty conversation stamped with the current time.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            turns: Vec::new(),
            created_at: Utc::now(),
            category: None,
        }
    }

    /// Display title: the content of the first (user) turn.
    pub fn title(&self) -> Option<&str> {
        self.turns.first().map(|t| t.content.as_str())
    }

    pub fn last_turn(&self) -> Option<&Turn> {
        self.turns.last()
    }
}

/// The record written under one namespace key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub chats: HashMap<String, Conversation>,
    #[serde(default)]
    pub selected_model: Option<String>,
}

fn default_version() -> u32 {
    STATE_VERSION
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            chats: HashMap::new(),
            selected_model: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_roundtrip() {
        assert_eq!(Role::parse("user"), Some(Role::User));
        assert_eq!(Role::parse(Role::Assistant.as_str()), Some(Role::Assistant));
        assert_eq!(Role::parse("system"), None);
    }

    #[test]
    fn test_turn_constructors() {
        let user = Turn::user("Hello", vec!["https://example.com/a.png".into()]);
        assert_eq!(user.role, Role::User);
        assert_eq!(user.images.len(), 1);
        assert!(!user.interrupted);

        let partial = Turn::interrupted("Hi th");
        assert_eq!(partial.role, Role::Assistant);
        assert!(partial.interrupted);

        assert_ne!(Turn::assistant("a").id, Turn::assistant("a").id);
    }

    #[test]
    fn test_turn_omits_empty_fields() {
        let json = serde_json::to_value(Turn::assistant("Hi").with_id("t1")).unwrap();
        assert_eq!(json["id"], "t1");
        assert_eq!(json["role"], "assistant");
        assert!(json.get("images").is_none());
        assert!(json.get("interrupted").is_none());
    }

    #[test]
    fn test_empty_record_shape() {
        let json = serde_json::to_string(&PersistedState::default()).unwrap();
        assert_eq!(json, r#"{"version":1,"chats":{},"selectedModel":null}"#);
    }

    #[test]
    fn test_conversation_title() {
        let mut conversation = Conversation::new("c1");
        assert_eq!(conversation.title(), None);
        conversation.turns.push(Turn::user("Hello", vec![]));
        conversation.turns.push(Turn::assistant("Hi there!"));
        assert_eq!(conversation.title(), Some("Hello"));
        assert_eq!(conversation.last_turn().map(|t| t.role), Some(Role::Assistant));
    }
}
