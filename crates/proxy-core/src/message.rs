use std::collections::HashMap;
use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role of a chat participant (spec.md §3 `ChatMessage`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single part of a (possibly multimodal) message. Non-text parts are
/// preserved verbatim by the command parser and redaction middleware.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    #[serde(other)]
    Opaque,
}

/// Message content is either plain text or an ordered sequence of parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Content {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Content::Text(t) => Some(t),
            Content::Parts(_) => None,
        }
    }

    /// True if there is no user-visible text left in this content.
    pub fn is_empty(&self) -> bool {
        match self {
            Content::Text(t) => t.trim().is_empty(),
            Content::Parts(parts) => parts.iter().all(|p| match p {
                ContentPart::Text { text } => text.trim().is_empty(),
                ContentPart::Opaque => false,
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Content,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Content::Text(text.into()),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: Content::Text(text.into()),
            tool_call_id: None,
            name: None,
        }
    }
}

/// The canonical request shape the whole pipeline operates on (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub tools: Option<Value>,
    #[serde(default)]
    pub tool_choice: Option<Value>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl ChatRequest {
    /// Splits `model` into `(backend, model)` if it is qualified with
    /// `backend:model` or `backend/model` (spec.md §3).
    pub fn qualified_backend(&self) -> Option<(&str, &str)> {
        if let Some((b, m)) = self.model.split_once(':') {
            return Some((b, m));
        }
        if let Some((b, m)) = self.model.split_once('/') {
            return Some((b, m));
        }
        None
    }
}

pub type ByteStream = Pin<Box<dyn Stream<Item = std::result::Result<bytes::Bytes, crate::error::ProxyError>> + Send>>;

/// Transport-neutral representation of a response (spec.md §3 `ResponseEnvelope`).
pub enum ResponseEnvelope {
    NonStreaming {
        status: u16,
        headers: HashMap<String, String>,
        body: Value,
    },
    Streaming {
        media_type: &'static str,
        chunks: ByteStream,
    },
}

impl ResponseEnvelope {
    pub fn json(status: u16, body: Value) -> Self {
        ResponseEnvelope::NonStreaming {
            status,
            headers: HashMap::new(),
            body,
        }
    }

    pub fn error(status: u16, error_type: &str, message: &str) -> Self {
        Self::json(
            status,
            serde_json::json!({"error": {"message": message, "type": error_type}}),
        )
    }
}
