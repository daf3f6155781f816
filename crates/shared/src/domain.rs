use std::{collections::BTreeSet, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

id_newtype!(SessionId);
id_newtype!(MessageId);
id_newtype!(UserId);
id_newtype!(OrganizationId);

const TEMPORARY_MESSAGE_PREFIX: &str = "temp-";

impl MessageId {
    /// Client-side id for a message the server has not confirmed yet.
    pub fn temporary() -> Self {
        Self(format!("{TEMPORARY_MESSAGE_PREFIX}{}", Uuid::new_v4()))
    }

    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMPORARY_MESSAGE_PREFIX)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Pending,
    Completed,
    Failed,
    NeedsClarification,
    Irrelevant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub text: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MessageContent {
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub citations: Vec<Citation>,
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            citations: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: MessageRole,
    #[serde(default)]
    pub content: MessageContent,
    pub sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Set while an assistant turn is still receiving text chunks.
    #[serde(default)]
    pub streaming: bool,
}

impl Message {
    pub fn new(
        id: MessageId,
        role: MessageRole,
        text: impl Into<String>,
        sequence: u64,
    ) -> Self {
        Self {
            id,
            role,
            content: MessageContent::text(text),
            sequence,
            status: None,
            created_at: None,
            streaming: false,
        }
    }

    pub fn text(&self) -> &str {
        &self.content.text
    }

    pub fn is_open_assistant(&self) -> bool {
        self.role == MessageRole::Assistant && self.streaming
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    #[serde(default)]
    pub title: String,
    pub query: String,
    #[serde(default)]
    pub status: SessionStatus,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<OrganizationId>,
}

impl Session {
    pub fn next_sequence(&self) -> u64 {
        next_sequence(&self.messages)
    }

    /// True when messages are strictly ordered by `(sequence, id)`, which also
    /// rules out duplicate ids at equal sequence.
    pub fn is_well_ordered(&self) -> bool {
        let ordered = self
            .messages
            .windows(2)
            .all(|pair| (pair[0].sequence, &pair[0].id) < (pair[1].sequence, &pair[1].id));
        let mut seen = std::collections::HashSet::new();
        ordered && self.messages.iter().all(|message| seen.insert(&message.id))
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            query: self.query.clone(),
            status: self.status,
            updated_at: self.updated_at,
            message_count: self.messages.len() as u64,
        }
    }
}

pub fn next_sequence(messages: &[Message]) -> u64 {
    messages
        .iter()
        .map(|message| message.sequence)
        .max()
        .map_or(1, |max| max + 1)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    #[serde(default)]
    pub title: String,
    pub query: String,
    #[serde(default)]
    pub status: SessionStatus,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub message_count: u64,
}
