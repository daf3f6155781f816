use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{
    domain::{Message, SessionId, SessionStatus, SessionSummary},
    error::ApiError,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jurisdiction: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub query: String,
    #[serde(flatten)]
    pub params: SessionParams,
}

/// Partial metadata update; absent fields are left untouched by the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
}

impl SessionUpdate {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.tags.is_none() && self.status.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageQuery {
    pub page: u32,
    pub limit: u32,
}

impl Default for PageQuery {
    fn default() -> Self {
        Self { page: 1, limit: 50 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionListPage {
    #[serde(default)]
    pub sessions: Vec<SessionSummary>,
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePage {
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionEstablished {
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageBatch {
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextChunk {
    pub text: String,
}

/// Named event on the session stream, decoded from its event name and JSON data.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    ConnectionEstablished(ConnectionEstablished),
    Messages(Vec<Message>),
    TextChunk(String),
    Heartbeat,
    Error(ApiError),
    Unknown { event: String },
}

pub const EVENT_CONNECTION_ESTABLISHED: &str = "connection_established";
pub const EVENT_MESSAGES: &str = "messages";
pub const EVENT_TEXT_CHUNK: &str = "text_chunk";
pub const EVENT_HEARTBEAT: &str = "heartbeat";
pub const EVENT_ERROR: &str = "error";

impl StreamEvent {
    pub fn decode(event: &str, data: &str) -> Result<Self, serde_json::Error> {
        match event {
            EVENT_CONNECTION_ESTABLISHED => Ok(Self::ConnectionEstablished(
                serde_json::from_str(data)?,
            )),
            EVENT_MESSAGES => {
                // Servers send either `{"messages": [...]}` or a bare array.
                let value: serde_json::Value = serde_json::from_str(data)?;
                let messages = if value.is_array() {
                    serde_json::from_value(value)?
                } else {
                    serde_json::from_value::<MessageBatch>(value)?.messages
                };
                Ok(Self::Messages(messages))
            }
            EVENT_TEXT_CHUNK | "chunk" => {
                // Chunks may arrive as `{"text": ..}`, a JSON string, or raw text.
                let text = serde_json::from_str::<TextChunk>(data)
                    .map(|chunk| chunk.text)
                    .or_else(|_| serde_json::from_str::<String>(data))
                    .unwrap_or_else(|_| data.to_string());
                Ok(Self::TextChunk(text))
            }
            EVENT_HEARTBEAT | "ping" => Ok(Self::Heartbeat),
            EVENT_ERROR => Ok(Self::Error(serde_json::from_str(data)?)),
            other => Ok(Self::Unknown {
                event: other.to_string(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::ConnectionEstablished(_) => EVENT_CONNECTION_ESTABLISHED,
            Self::Messages(_) => EVENT_MESSAGES,
            Self::TextChunk(_) => EVENT_TEXT_CHUNK,
            Self::Heartbeat => EVENT_HEARTBEAT,
            Self::Error(_) => EVENT_ERROR,
            Self::Unknown { event } => event,
        }
    }
}

/// JSON envelope used when the stream is carried over a websocket instead of SSE.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketEnvelope {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl SocketEnvelope {
    /// Flattens the envelope into the `(event, data)` pair an SSE frame carries.
    pub fn into_frame(self) -> (String, String) {
        let data = match self.data {
            serde_json::Value::String(raw) => raw,
            other => other.to_string(),
        };
        (self.event, data)
    }
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
