//! Snapshot / apply / reconcile-or-rollback for locally issued mutations.

use chrono::Utc;
use shared::{
    domain::{Message, MessageId, MessageRole, Session, SessionStatus},
    protocol::SessionUpdate,
};

use crate::{
    error::{SyncError, SyncResult},
    merge,
};

/// Shortest accepted message or query after trimming.
pub const MIN_CONTENT_CHARS: usize = 3;

/// Trims `content` and rejects it when shorter than [`MIN_CONTENT_CHARS`].
pub fn validate_message_content(content: &str) -> SyncResult<String> {
    validate_text("message", content)
}

pub fn validate_query(query: &str) -> SyncResult<String> {
    validate_text("query", query)
}

fn validate_text(label: &str, raw: &str) -> SyncResult<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(SyncError::validation(format!("{label} must not be empty")));
    }
    if trimmed.chars().count() < MIN_CONTENT_CHARS {
        return Err(SyncError::validation(format!(
            "{label} must be at least {MIN_CONTENT_CHARS} characters"
        )));
    }
    Ok(trimmed.to_string())
}

#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    SendMessage { content: String },
    UpdateSession(SessionUpdate),
    DeleteSession,
}

impl Mutation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SendMessage { .. } => "send_message",
            Self::UpdateSession(_) => "update_session",
            Self::DeleteSession => "delete_session",
        }
    }
}

/// One in-flight mutation: the state it started from and the state published
/// while the server has not answered yet.
#[derive(Debug, Clone)]
pub struct OptimisticUpdate {
    mutation: Mutation,
    snapshot: Session,
    optimistic: Option<Session>,
    temporary_id: Option<MessageId>,
}

impl OptimisticUpdate {
    pub fn begin(current: &Session, mutation: Mutation) -> Self {
        let snapshot = current.clone();
        let mut temporary_id = None;

        let optimistic = match &mutation {
            Mutation::SendMessage { content } => {
                let id = MessageId::temporary();
                let mut next = current.clone();
                let mut pending =
                    Message::new(id.clone(), MessageRole::User, content.as_str(), next.next_sequence());
                pending.status = Some(SessionStatus::Pending);
                pending.created_at = Some(Utc::now());
                next.messages.push(pending);
                temporary_id = Some(id);
                Some(next)
            }
            Mutation::UpdateSession(update) => {
                let mut next = current.clone();
                if let Some(title) = &update.title {
                    next.title = title.clone();
                }
                if let Some(tags) = &update.tags {
                    next.tags = tags.clone();
                }
                if let Some(status) = update.status {
                    next.status = status;
                }
                next.updated_at = Utc::now();
                Some(next)
            }
            Mutation::DeleteSession => None,
        };

        Self {
            mutation,
            snapshot,
            optimistic,
            temporary_id,
        }
    }

    pub fn mutation(&self) -> &Mutation {
        &self.mutation
    }

    pub fn snapshot(&self) -> &Session {
        &self.snapshot
    }

    /// State to publish until the server answers. `None` for a delete.
    pub fn optimistic(&self) -> Option<&Session> {
        self.optimistic.as_ref()
    }

    pub fn temporary_id(&self) -> Option<&MessageId> {
        self.temporary_id.as_ref()
    }

    /// Adopts the server's session. Messages that arrived on the stream in the
    /// meantime are kept; this update's placeholder is dropped.
    pub fn reconcile(&self, current: Option<&Session>, authoritative: Session) -> Session {
        let local: Vec<Message> = current
            .map(|session| {
                session
                    .messages
                    .iter()
                    .filter(|message| Some(&message.id) != self.temporary_id.as_ref())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        let messages = merge::merge_batch(&local, &authoritative.messages);
        Session {
            messages,
            ..authoritative
        }
    }

    /// The state this update started from, unchanged.
    pub fn rollback(self) -> Session {
        self.snapshot
    }

    /// Restores the snapshot on top of `current`. Permanent messages confirmed
    /// since this update began survive, and the temporaries they replace are
    /// dropped; with nothing new confirmed the snapshot comes back verbatim.
    pub fn rollback_onto(self, current: Option<&Session>) -> Session {
        let Some(current) = current else {
            return self.snapshot;
        };
        let confirmed: Vec<Message> = current
            .messages
            .iter()
            .filter(|message| {
                !message.id.is_temporary()
                    && !self
                        .snapshot
                        .messages
                        .iter()
                        .any(|known| known.id == message.id)
            })
            .cloned()
            .collect();
        if confirmed.is_empty() {
            return self.snapshot;
        }
        let messages = merge::merge_batch(&self.snapshot.messages, &confirmed);
        Session {
            messages,
            ..self.snapshot
        }
    }
}

#[cfg(test)]
#[path = "tests/optimistic_tests.rs"]
mod tests;
