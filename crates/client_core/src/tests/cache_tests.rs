use super::*;
use crate::{
    error::SyncError,
    test_support::{message, two_message_session},
};

use std::sync::atomic::AtomicU32;

use serde_json::json;
use shared::domain::MessageRole;
use storage::Storage;

fn session_cache(ttl: Duration) -> ResourceCache<Session> {
    ResourceCache::in_memory(CacheNamespace::Session, CachePolicy::with_ttl(ttl))
}

#[tokio::test(start_paused = true)]
async fn entries_expire_after_ttl() {
    let cache = session_cache(Duration::from_secs(300));
    let key = CacheKey::session(&SessionId::from("S1"));
    cache.set(key.clone(), two_message_session("S1")).await;

    tokio::time::advance(Duration::from_secs(299)).await;
    assert!(cache.get(&key).is_some());

    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(cache.get(&key).is_none());
    assert!(cache.is_empty());
}

#[tokio::test(start_paused = true)]
async fn concurrent_misses_share_one_fetch() {
    let cache = session_cache(DEFAULT_TTL);
    let calls = Arc::new(AtomicU32::new(0));
    let key = CacheKey::session(&SessionId::from("S1"));

    let callers = (0..5).map(|_| {
        let cache = cache.clone();
        let calls = Arc::clone(&calls);
        let key = key.clone();
        async move {
            cache
                .get_or_fetch(key, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(two_message_session("S1"))
                })
                .await
        }
    });
    let results = futures::future::join_all(callers).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(results.iter().all(|result| result
        .as_ref()
        .is_ok_and(|session| session.id == SessionId::from("S1"))));
    assert!(cache.get(&key).is_some());
}

#[tokio::test]
async fn fresh_entry_skips_fetch() {
    let cache = session_cache(DEFAULT_TTL);
    let key = CacheKey::session(&SessionId::from("S1"));
    cache.set(key.clone(), two_message_session("S1")).await;

    let session = cache
        .get_or_fetch(key, || async {
            Err(SyncError::connection("fetch should not run"))
        })
        .await
        .expect("cached");
    assert_eq!(session.messages.len(), 2);
}

#[tokio::test]
async fn failed_fetch_is_shared_and_not_cached() {
    let cache = session_cache(DEFAULT_TTL);
    let key = CacheKey::session(&SessionId::from("S1"));

    let err = cache
        .get_or_fetch(key.clone(), || async {
            Err(SyncError::connection("offline"))
        })
        .await
        .expect_err("fetch failure");
    assert_eq!(err, SyncError::Connection("offline".into()));
    assert!(cache.get(&key).is_none());

    // The failed flight is gone, so the next caller fetches again.
    let session = cache
        .get_or_fetch(key, || async { Ok(two_message_session("S1")) })
        .await
        .expect("second fetch");
    assert_eq!(session.id, SessionId::from("S1"));
}

#[tokio::test(start_paused = true)]
async fn invalidation_during_fetch_discards_result() {
    let cache = session_cache(DEFAULT_TTL);
    let key = CacheKey::session(&SessionId::from("S1"));

    let pending = {
        let cache = cache.clone();
        let key = key.clone();
        tokio::spawn(async move {
            cache
                .get_or_fetch(key, || async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(two_message_session("S1"))
                })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    cache.invalidate(&key).await;

    let fetched = pending.await.expect("join").expect("fetch result");
    assert_eq!(fetched.id, SessionId::from("S1"));
    assert!(cache.get(&key).is_none());
}

#[tokio::test]
async fn namespaces_are_invalidated_independently() {
    let cache = SyncCache::in_memory(&SyncSettings::default());
    let session_id = SessionId::from("S1");
    let message_id = MessageId::from("m1");
    let page = PageQuery::default();

    cache
        .sessions
        .set(CacheKey::session(&session_id), two_message_session("S1"))
        .await;
    cache
        .messages
        .set(
            CacheKey::message(&session_id, &message_id),
            message("m1", MessageRole::User, "hello there", 1),
        )
        .await;
    cache
        .session_lists
        .set(
            CacheKey::session_list(page),
            SessionListPage {
                sessions: vec![two_message_session("S1").summary()],
                page: 1,
                total: 1,
                has_more: false,
            },
        )
        .await;

    cache.sessions.clear().await;

    assert!(cache.sessions.get(&CacheKey::session(&session_id)).is_none());
    assert!(cache
        .messages
        .get(&CacheKey::message(&session_id, &message_id))
        .is_some());
    assert!(cache
        .session_lists
        .get(&CacheKey::session_list(page))
        .is_some());
}

#[tokio::test]
async fn prefix_invalidation_stays_within_session() {
    let cache = ResourceCache::<Message>::in_memory(CacheNamespace::Message, CachePolicy::default());
    let s1 = SessionId::from("S1");
    let s10 = SessionId::from("S10");
    let m1 = MessageId::from("m1");
    cache
        .set(
            CacheKey::message(&s1, &m1),
            message("m1", MessageRole::User, "first", 1),
        )
        .await;
    cache
        .set(
            CacheKey::message(&s10, &m1),
            message("m1", MessageRole::User, "other", 1),
        )
        .await;

    cache.invalidate_prefix(&["S1"]).await;

    assert!(cache.get(&CacheKey::message(&s1, &m1)).is_none());
    assert!(cache.get(&CacheKey::message(&s10, &m1)).is_some());
}

#[test]
fn storage_keys_escape_separators() {
    let key = CacheKey::message(&SessionId::from("a:b"), &MessageId::from("50%"));
    assert_eq!(key.storage_key(), "message:a%3Ab:50%25");
    assert_eq!(
        CacheKey::from_storage_key(CacheNamespace::Message, &key.storage_key()),
        Some(key)
    );
}

#[test]
fn redaction_walks_nested_paths_and_wildcards() {
    let mut payload = json!({
        "query": "confidential matter",
        "messages": [
            {"content": {"text": "one"}},
            {"content": {"text": "two"}}
        ],
        "title": null
    });
    redact_path(&mut payload, &["query"]);
    redact_path(&mut payload, &["messages", "*", "content", "text"]);
    redact_path(&mut payload, &["title"]);
    redact_path(&mut payload, &["missing", "field"]);

    assert_eq!(payload["query"], REDACTED_PLACEHOLDER);
    assert_eq!(payload["messages"][0]["content"]["text"], REDACTED_PLACEHOLDER);
    assert_eq!(payload["messages"][1]["content"]["text"], REDACTED_PLACEHOLDER);
    assert!(payload["title"].is_null());
}

async fn memory_storage() -> Arc<Storage> {
    Arc::new(Storage::new("sqlite::memory:").await.expect("storage"))
}

#[tokio::test]
async fn sensitive_fields_are_redacted_in_durable_mirror_only() {
    let storage = memory_storage().await;
    let policy = CachePolicy {
        ttl: DEFAULT_TTL,
        sensitive_fields: vec!["query".into(), "messages.*.content.text".into()],
    };
    let cache = ResourceCache::new(CacheNamespace::Session, policy, storage.clone());
    let key = CacheKey::session(&SessionId::from("S1"));
    cache.set(key.clone(), two_message_session("S1")).await;

    let in_memory = cache.get(&key).expect("memory copy");
    assert_eq!(in_memory.query, "What is adverse possession?");

    let stored = storage
        .load_cache_entry("session:S1")
        .await
        .expect("load")
        .expect("mirrored");
    assert_eq!(stored.namespace, "session");
    assert_eq!(stored.payload["query"], REDACTED_PLACEHOLDER);
    assert_eq!(
        stored.payload["messages"][1]["content"]["text"],
        REDACTED_PLACEHOLDER
    );
    assert_eq!(stored.payload["title"], "Adverse possession");
}

#[tokio::test]
async fn warm_start_never_serves_redacted_payloads() {
    let storage = memory_storage().await;
    let settings = SyncSettings {
        sensitive_fields: vec!["messages.*.content.text".into()],
        ..SyncSettings::default()
    };

    let first = SyncCache::new(&settings, storage.clone());
    first
        .sessions
        .set(CacheKey::session(&SessionId::from("S1")), two_message_session("S1"))
        .await;
    storage
        .put_cache_entry(
            "session:S2",
            "session",
            &serde_json::to_value(two_message_session("S2")).expect("json"),
            Utc::now(),
        )
        .await
        .expect("clear row");

    let second = SyncCache::new(&settings, storage.clone());
    assert_eq!(second.warm_start().await, 1);
    assert!(second
        .sessions
        .get(&CacheKey::session(&SessionId::from("S1")))
        .is_none());
    let restored = second
        .sessions
        .get(&CacheKey::session(&SessionId::from("S2")))
        .expect("unredacted row");
    assert!(restored
        .messages
        .iter()
        .all(|message| message.text() != REDACTED_PLACEHOLDER));
}

#[tokio::test]
async fn warm_start_restores_unexpired_entries_and_purges_the_rest() {
    let storage = memory_storage().await;
    let settings = SyncSettings::default();

    let first = SyncCache::new(&settings, storage.clone());
    first
        .sessions
        .set(CacheKey::session(&SessionId::from("S1")), two_message_session("S1"))
        .await;
    first
        .sessions
        .set(CacheKey::session(&SessionId::from("S2")), two_message_session("S2"))
        .await;
    storage
        .put_cache_entry(
            "session:S3",
            "session",
            &serde_json::to_value(two_message_session("S3")).expect("json"),
            Utc::now() - chrono::Duration::hours(1),
        )
        .await
        .expect("stale row");

    let second = SyncCache::new(&settings, storage.clone());
    assert_eq!(second.warm_start().await, 2);
    assert!(storage
        .load_cache_entry("session:S3")
        .await
        .expect("load")
        .is_none());
    assert!(second
        .sessions
        .get(&CacheKey::session(&SessionId::from("S1")))
        .is_some());
    assert!(second
        .sessions
        .get(&CacheKey::session(&SessionId::from("S3")))
        .is_none());
}

#[tokio::test]
async fn invalidate_session_removes_durable_rows_beneath_it() {
    let storage = memory_storage().await;
    let cache = SyncCache::new(&SyncSettings::default(), storage.clone());
    let session_id = SessionId::from("S1");
    cache
        .sessions
        .set(CacheKey::session(&session_id), two_message_session("S1"))
        .await;
    cache
        .messages
        .set(
            CacheKey::message(&session_id, &MessageId::from("m1")),
            message("m1", MessageRole::User, "hello there", 1),
        )
        .await;

    cache.invalidate_session(&session_id).await;

    assert!(storage
        .load_cache_entry("session:S1")
        .await
        .expect("load")
        .is_none());
    assert!(storage
        .load_cache_entry("message:S1:m1")
        .await
        .expect("load")
        .is_none());
}
