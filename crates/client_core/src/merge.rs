//! Pure folding of stream and REST payloads into an ordered message list.
//!
//! Both entry points return a fresh list sorted by `(sequence, id)` and leave
//! their input untouched, so the caller can publish the result as a new value.

use std::cmp::Ordering;

use shared::domain::{next_sequence, Message, MessageContent, MessageId, MessageRole};

/// Folds `incoming` into `existing`.
///
/// Same id: incoming wins field by field unless its field is empty. Unknown
/// permanent id: replaces a temporary entry of the same role at the same
/// sequence, or for user messages one with approximately the same text. The
/// temporary entry's provisional fields are discarded.
/// Applying the same batch twice yields the same list.
pub fn merge_batch(existing: &[Message], incoming: &[Message]) -> Vec<Message> {
    let mut merged = existing.to_vec();

    for message in incoming {
        if let Some(slot) = merged.iter_mut().find(|current| current.id == message.id) {
            *slot = merge_fields(slot, message);
            continue;
        }
        if !message.id.is_temporary() {
            if let Some(index) = find_temporary_counterpart(&merged, message) {
                merged[index] = message.clone();
                continue;
            }
        }
        merged.push(message.clone());
    }

    drop_shadowed_temporaries(&mut merged);
    sort_messages(&mut merged);
    merged
}

/// Appends a streamed text fragment to the open assistant message, or starts a
/// new one at the next sequence.
pub fn apply_text_chunk(existing: &[Message], chunk: &str) -> Vec<Message> {
    let mut messages = existing.to_vec();
    if chunk.is_empty() {
        return messages;
    }
    sort_messages(&mut messages);

    match messages.last_mut() {
        Some(last) if last.is_open_assistant() => last.content.text.push_str(chunk),
        _ => {
            let mut assistant = Message::new(
                MessageId::temporary(),
                MessageRole::Assistant,
                chunk,
                next_sequence(&messages),
            );
            assistant.streaming = true;
            messages.push(assistant);
        }
    }
    messages
}

pub fn sort_messages(messages: &mut [Message]) {
    messages.sort_by(compare_messages);
}

/// Ascending sequence; equal sequences fall back to the smaller id.
pub fn compare_messages(left: &Message, right: &Message) -> Ordering {
    left.sequence
        .cmp(&right.sequence)
        .then_with(|| left.id.cmp(&right.id))
}

fn merge_fields(current: &Message, incoming: &Message) -> Message {
    let text = if incoming.content.text.is_empty() {
        current.content.text.clone()
    } else {
        incoming.content.text.clone()
    };
    let citations = if incoming.content.citations.is_empty() {
        current.content.citations.clone()
    } else {
        incoming.content.citations.clone()
    };
    Message {
        id: incoming.id.clone(),
        role: incoming.role,
        content: MessageContent { text, citations },
        sequence: incoming.sequence,
        status: incoming.status.or(current.status),
        created_at: incoming.created_at.or(current.created_at),
        streaming: incoming.streaming,
    }
}

fn find_temporary_counterpart(messages: &[Message], incoming: &Message) -> Option<usize> {
    let temporaries = || {
        messages
            .iter()
            .enumerate()
            .filter(|(_, message)| message.id.is_temporary() && message.role == incoming.role)
    };
    if let Some((index, _)) = temporaries().find(|(_, message)| message.sequence == incoming.sequence)
    {
        return Some(index);
    }
    if incoming.role != MessageRole::User {
        return None;
    }
    let wanted = normalize_text(incoming.text());
    temporaries()
        .find(|(_, message)| !wanted.is_empty() && normalize_text(message.text()) == wanted)
        .map(|(index, _)| index)
}

fn drop_shadowed_temporaries(messages: &mut Vec<Message>) {
    let permanent: Vec<(MessageRole, u64)> = messages
        .iter()
        .filter(|message| !message.id.is_temporary())
        .map(|message| (message.role, message.sequence))
        .collect();
    messages.retain(|message| {
        !message.id.is_temporary() || !permanent.contains(&(message.role, message.sequence))
    });
}

/// Trimmed, whitespace-collapsed, lowercased.
fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
#[path = "tests/merge_tests.rs"]
mod tests;
