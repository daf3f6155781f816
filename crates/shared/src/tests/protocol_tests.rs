use super::*;
use crate::domain::MessageRole;

#[test]
fn messages_accept_bare_array_and_wrapped_batch() {
    let bare = r#"[{"id":"m1","role":"user","content":{"text":"Q"},"sequence":1}]"#;
    let wrapped = r#"{"messages":[{"id":"m1","role":"user","content":{"text":"Q"},"sequence":1}]}"#;

    let StreamEvent::Messages(from_bare) = StreamEvent::decode("messages", bare).expect("bare")
    else {
        panic!("expected messages");
    };
    let from_wrapped = StreamEvent::decode("messages", wrapped).expect("wrapped");

    assert_eq!(from_bare[0].role, MessageRole::User);
    assert_eq!(from_wrapped, StreamEvent::Messages(from_bare));
}

#[test]
fn text_chunks_accept_object_string_and_raw_forms() {
    for data in [r#"{"text":"Hel"}"#, r#""Hel""#, "Hel"] {
        assert_eq!(
            StreamEvent::decode("text_chunk", data).expect("chunk"),
            StreamEvent::TextChunk("Hel".into())
        );
    }
    assert_eq!(
        StreamEvent::decode("chunk", "lo").expect("alias"),
        StreamEvent::TextChunk("lo".into())
    );
}

#[test]
fn unknown_events_are_kept_by_name() {
    let event = StreamEvent::decode("progress", "{}").expect("unknown");
    assert_eq!(event.name(), "progress");
    assert_eq!(StreamEvent::decode("ping", "").expect("ping"), StreamEvent::Heartbeat);
}

#[test]
fn malformed_payloads_are_errors() {
    assert!(StreamEvent::decode("messages", "{not json").is_err());
    assert!(StreamEvent::decode("connection_established", "[]").is_err());
}

#[test]
fn socket_envelope_flattens_to_frame() {
    let envelope: SocketEnvelope =
        serde_json::from_str(r#"{"event":"text_chunk","data":"raw words"}"#).expect("envelope");
    assert_eq!(
        envelope.into_frame(),
        ("text_chunk".to_string(), "raw words".to_string())
    );

    let envelope: SocketEnvelope =
        serde_json::from_str(r#"{"event":"heartbeat"}"#).expect("envelope");
    assert_eq!(envelope.into_frame(), ("heartbeat".to_string(), "null".to_string()));
}
