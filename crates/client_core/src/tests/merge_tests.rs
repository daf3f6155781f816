use super::*;
use crate::test_support::message;

use shared::domain::{Citation, SessionStatus};

fn ids(messages: &[Message]) -> Vec<&str> {
    messages.iter().map(|message| message.id.as_str()).collect()
}

fn temporary_user(text: &str, sequence: u64) -> Message {
    let mut pending = Message::new(MessageId::temporary(), MessageRole::User, text, sequence);
    pending.status = Some(SessionStatus::Pending);
    pending
}

#[test]
fn merging_the_same_batch_twice_is_idempotent() {
    let existing = vec![
        message("m1", MessageRole::User, "What is adverse possession?", 1),
        temporary_user("And in Texas?", 3),
    ];
    let batch = vec![
        message("m2", MessageRole::Assistant, "A doctrine of property law.", 2),
        message("m3", MessageRole::User, "And in Texas?", 3),
    ];

    let once = merge_batch(&existing, &batch);
    let twice = merge_batch(&once, &batch);

    assert_eq!(once, twice);
    assert_eq!(ids(&once), ["m1", "m2", "m3"]);
}

#[test]
fn result_is_sorted_with_id_tie_break() {
    let existing = vec![message("m9", MessageRole::Assistant, "late", 9)];
    let batch = vec![
        message("b", MessageRole::Assistant, "second", 4),
        message("a", MessageRole::System, "first", 4),
        message("m1", MessageRole::User, "opening", 1),
    ];

    let merged = merge_batch(&existing, &batch);

    assert_eq!(ids(&merged), ["m1", "a", "b", "m9"]);
    let session = crate::test_support::session_with("S1", merged);
    assert!(session.is_well_ordered());
}

#[test]
fn incoming_fields_win_unless_empty() {
    let mut cited = message("m2", MessageRole::Assistant, "Full answer.", 2);
    cited.content.citations = vec![Citation {
        text: "Smith v. Jones".into(),
        url: "https://example.com/smith".into(),
        metadata: None,
    }];
    cited.status = Some(SessionStatus::Completed);

    let mut sparse = message("m2", MessageRole::Assistant, "", 2);
    sparse.status = None;

    let merged = merge_batch(&[cited.clone()], &[sparse]);
    assert_eq!(merged, vec![cited.clone()]);

    let revised = message("m2", MessageRole::Assistant, "Revised answer.", 2);
    let merged = merge_batch(&[cited.clone()], &[revised]);
    assert_eq!(merged[0].text(), "Revised answer.");
    assert_eq!(merged[0].content.citations, cited.content.citations);
    assert_eq!(merged[0].status, Some(SessionStatus::Completed));
}

#[test]
fn permanent_message_replaces_temporary_at_same_sequence() {
    let existing = vec![
        message("m1", MessageRole::User, "Question", 1),
        temporary_user("Follow up please", 2),
    ];
    let confirmed = message("m2", MessageRole::User, "Follow up please", 2);

    let merged = merge_batch(&existing, &[confirmed]);

    assert_eq!(ids(&merged), ["m1", "m2"]);
    assert_eq!(merged[1].status, None);
}

#[test]
fn user_temporary_reconciles_by_approximate_text() {
    let existing = vec![temporary_user("  What about   EASEMENTS? ", 5)];
    let confirmed = message("m7", MessageRole::User, "what about easements?", 7);

    let merged = merge_batch(&existing, &[confirmed]);

    assert_eq!(ids(&merged), ["m7"]);
    assert_eq!(merged[0].sequence, 7);
}

#[test]
fn assistant_temporaries_do_not_match_by_text() {
    let mut streaming = Message::new(MessageId::temporary(), MessageRole::Assistant, "Yes.", 3);
    streaming.streaming = true;
    let unrelated = message("m8", MessageRole::Assistant, "Yes.", 8);

    let merged = merge_batch(&[streaming], &[unrelated]);

    assert_eq!(merged.len(), 2);
    assert!(merged[0].id.is_temporary());
}

#[test]
fn shadowed_temporaries_are_dropped() {
    let existing = vec![
        message("m3", MessageRole::User, "already confirmed", 3),
        temporary_user("stale copy", 3),
    ];

    let merged = merge_batch(&existing, &[]);

    assert_eq!(ids(&merged), ["m3"]);
}

#[test]
fn chunk_appends_to_open_assistant_message() {
    let mut open = message("m2", MessageRole::Assistant, "Adverse ", 2);
    open.streaming = true;
    let existing = vec![message("m1", MessageRole::User, "Question", 1), open];

    let merged = apply_text_chunk(&existing, "possession");

    assert_eq!(merged.len(), 2);
    assert_eq!(merged[1].text(), "Adverse possession");
    assert!(merged[1].streaming);
}

#[test]
fn chunk_starts_new_assistant_message_after_closed_one() {
    let existing = vec![
        message("m1", MessageRole::User, "Question", 1),
        message("m2", MessageRole::Assistant, "Done.", 2),
    ];

    let merged = apply_text_chunk(&existing, "Next");

    assert_eq!(merged.len(), 3);
    let started = &merged[2];
    assert!(started.id.is_temporary());
    assert!(started.is_open_assistant());
    assert_eq!(started.sequence, 3);
    assert_eq!(started.text(), "Next");
}

#[test]
fn chunk_into_empty_list_starts_at_sequence_one() {
    let merged = apply_text_chunk(&[], "Hello");
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].sequence, 1);
}

#[test]
fn empty_chunk_is_a_no_op() {
    let existing = vec![message("m1", MessageRole::User, "Question", 1)];
    assert_eq!(apply_text_chunk(&existing, ""), existing);
}

#[test]
fn streamed_answer_is_replaced_by_confirmed_batch() {
    let existing = vec![message("m1", MessageRole::User, "Question", 1)];
    let streamed = apply_text_chunk(&apply_text_chunk(&existing, "Part one, "), "part two.");
    assert_eq!(streamed.len(), 2);

    let final_answer = message("m2", MessageRole::Assistant, "Part one, part two.", 2);
    let merged = merge_batch(&streamed, &[final_answer.clone()]);

    assert_eq!(merged, vec![existing[0].clone(), final_answer]);
}
