//! Time-boxed resource cache with request coalescing and a durable mirror.
//!
//! Each resource class (sessions, session lists, single messages, message
//! pages) lives in its own [`ResourceCache`] so invalidating one namespace
//! never drops entries of another. The cache is advisory: every failure,
//! including a poisoned lock or a broken durable store, degrades to a miss.

use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use chrono::Utc;
use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    domain::{Message, MessageId, Session, SessionId},
    protocol::{MessagePage, PageQuery, SessionListPage},
};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{
    config::SyncSettings,
    durable_store::{DurableStore, MissingDurableStore},
    error::SyncResult,
};

pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);
pub const REDACTED_PLACEHOLDER: &str = "[redacted]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheNamespace {
    Session,
    SessionList,
    Message,
    MessagePage,
}

impl CacheNamespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::SessionList => "session-list",
            Self::Message => "message",
            Self::MessagePage => "message-page",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    namespace: CacheNamespace,
    parts: Vec<String>,
}

impl CacheKey {
    pub fn new<I, S>(namespace: CacheNamespace, parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            namespace,
            parts: parts.into_iter().map(Into::into).collect(),
        }
    }

    pub fn session(session_id: &SessionId) -> Self {
        Self::new(CacheNamespace::Session, [session_id.as_str()])
    }

    pub fn session_list(page: PageQuery) -> Self {
        Self::new(
            CacheNamespace::SessionList,
            [page.page.to_string(), page.limit.to_string()],
        )
    }

    pub fn message(session_id: &SessionId, message_id: &MessageId) -> Self {
        Self::new(
            CacheNamespace::Message,
            [session_id.as_str(), message_id.as_str()],
        )
    }

    pub fn message_page(session_id: &SessionId, page: PageQuery) -> Self {
        Self::new(
            CacheNamespace::MessagePage,
            [
                session_id.to_string(),
                page.page.to_string(),
                page.limit.to_string(),
            ],
        )
    }

    pub fn namespace(&self) -> CacheNamespace {
        self.namespace
    }

    pub fn parts(&self) -> &[String] {
        &self.parts
    }

    /// Flat key used by the durable mirror, e.g. `session:S1`.
    pub fn storage_key(&self) -> String {
        storage_key(self.namespace, &self.parts)
    }

    fn starts_with(&self, prefix: &[String]) -> bool {
        self.parts.len() >= prefix.len() && self.parts[..prefix.len()] == *prefix
    }

    fn from_storage_key(namespace: CacheNamespace, raw: &str) -> Option<Self> {
        let rest = raw.strip_prefix(namespace.as_str())?;
        if rest.is_empty() {
            return Some(Self::new(namespace, Vec::<String>::new()));
        }
        let rest = rest.strip_prefix(':')?;
        Some(Self::new(namespace, rest.split(':').map(unescape_part)))
    }
}

fn storage_key(namespace: CacheNamespace, parts: &[String]) -> String {
    let mut key = namespace.as_str().to_string();
    for part in parts {
        key.push(':');
        key.push_str(&escape_part(part));
    }
    key
}

fn escape_part(part: &str) -> String {
    part.replace('%', "%25").replace(':', "%3A")
}

fn unescape_part(part: &str) -> String {
    part.replace("%3A", ":").replace("%25", "%")
}

#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub key: CacheKey,
    pub payload: T,
    pub written_at: Instant,
}

impl<T> CacheEntry<T> {
    pub fn is_fresh(&self, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.written_at) < ttl
    }
}

#[derive(Debug, Clone)]
pub struct CachePolicy {
    pub ttl: Duration,
    /// Dotted field paths replaced by [`REDACTED_PLACEHOLDER`] before a payload
    /// reaches the durable mirror. `*` matches every array element or object key.
    pub sensitive_fields: Vec<String>,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            sensitive_fields: Vec::new(),
        }
    }
}

impl CachePolicy {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            ..Self::default()
        }
    }
}

type SharedFetch<T> = Shared<BoxFuture<'static, SyncResult<T>>>;

struct InFlight<T> {
    id: u64,
    future: SharedFetch<T>,
}

struct CacheState<T> {
    entries: HashMap<CacheKey, CacheEntry<T>>,
    in_flight: HashMap<CacheKey, InFlight<T>>,
    /// Bumped by every invalidation; a fetch that started under an older
    /// generation does not store its result.
    generation: u64,
}

struct CacheInner<T> {
    namespace: CacheNamespace,
    policy: CachePolicy,
    durable: Arc<dyn DurableStore>,
    next_fetch_id: AtomicU64,
    state: Mutex<CacheState<T>>,
}

impl<T> CacheInner<T> {
    fn lock(&self) -> MutexGuard<'_, CacheState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct ResourceCache<T> {
    inner: Arc<CacheInner<T>>,
}

impl<T> Clone for ResourceCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> ResourceCache<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(
        namespace: CacheNamespace,
        policy: CachePolicy,
        durable: Arc<dyn DurableStore>,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                namespace,
                policy,
                durable,
                next_fetch_id: AtomicU64::new(1),
                state: Mutex::new(CacheState {
                    entries: HashMap::new(),
                    in_flight: HashMap::new(),
                    generation: 0,
                }),
            }),
        }
    }

    pub fn in_memory(namespace: CacheNamespace, policy: CachePolicy) -> Self {
        Self::new(namespace, policy, Arc::new(MissingDurableStore))
    }

    pub fn namespace(&self) -> CacheNamespace {
        self.inner.namespace
    }

    pub fn ttl(&self) -> Duration {
        self.inner.policy.ttl
    }

    pub fn get(&self, key: &CacheKey) -> Option<T> {
        let mut state = self.inner.lock();
        lookup_fresh(&mut state, key, self.inner.policy.ttl)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the cached value, joins an in-flight fetch for the same key, or
    /// starts `fetch`. Concurrent callers for one key share a single fetch.
    pub async fn get_or_fetch<F, Fut>(&self, key: CacheKey, fetch: F) -> SyncResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SyncResult<T>> + Send + 'static,
    {
        let shared = {
            let mut state = self.inner.lock();
            if let Some(hit) = lookup_fresh(&mut state, &key, self.inner.policy.ttl) {
                return Ok(hit);
            }
            if let Some(flight) = state.in_flight.get(&key) {
                debug!(key = %key.storage_key(), "cache: joining in-flight fetch");
                flight.future.clone()
            } else {
                let id = self.inner.next_fetch_id.fetch_add(1, Ordering::Relaxed);
                let generation = state.generation;
                let inner = Arc::clone(&self.inner);
                let settle_key = key.clone();
                let pending = fetch();
                let future = async move {
                    let result = pending.await;
                    settle(&inner, settle_key, id, generation, &result).await;
                    result
                }
                .boxed()
                .shared();
                state.in_flight.insert(
                    key,
                    InFlight {
                        id,
                        future: future.clone(),
                    },
                );
                future
            }
        };
        shared.await
    }

    /// Stores `value` and mirrors it to the durable store.
    pub async fn set(&self, key: CacheKey, value: T) {
        let payload = serde_json::to_value(&value);
        store_in_memory(&self.inner, key.clone(), value);
        match payload {
            Ok(payload) => mirror(&self.inner, &key, payload).await,
            Err(err) => warn!(key = %key.storage_key(), error = %err, "cache: payload not serializable; kept in memory only"),
        }
    }

    /// Stores `value` in memory only.
    pub fn set_volatile(&self, key: CacheKey, value: T) {
        store_in_memory(&self.inner, key, value);
    }

    pub async fn invalidate(&self, key: &CacheKey) {
        {
            let mut state = self.inner.lock();
            state.entries.remove(key);
            state.generation += 1;
        }
        if let Err(err) = self.inner.durable.remove(&key.storage_key()).await {
            warn!(key = %key.storage_key(), error = %err, "cache: durable invalidate failed");
        }
    }

    /// Drops every entry whose key parts start with `prefix` (all entries of
    /// this namespace for an empty prefix).
    pub async fn invalidate_prefix(&self, prefix: &[&str]) {
        let prefix: Vec<String> = prefix.iter().map(|part| part.to_string()).collect();
        {
            let mut state = self.inner.lock();
            state.entries.retain(|key, _| !key.starts_with(&prefix));
            state.generation += 1;
        }

        let exact = storage_key(self.inner.namespace, &prefix);
        let durable = &self.inner.durable;
        let result = if prefix.is_empty() {
            durable.remove_prefix(&format!("{exact}:")).await
        } else {
            match durable.remove(&exact).await {
                Ok(()) => durable.remove_prefix(&format!("{exact}:")).await,
                Err(err) => Err(err),
            }
        };
        if let Err(err) = result {
            warn!(prefix = %exact, error = %err, "cache: durable prefix invalidate failed");
        }
    }

    pub async fn clear(&self) {
        {
            let mut state = self.inner.lock();
            state.entries.clear();
            state.in_flight.clear();
            state.generation += 1;
        }
        let prefix = format!("{}:", self.inner.namespace.as_str());
        if let Err(err) = self.inner.durable.remove_prefix(&prefix).await {
            warn!(namespace = self.inner.namespace.as_str(), error = %err, "cache: durable clear failed");
        }
    }

    /// Loads unexpired durable entries into memory. Returns how many were loaded.
    pub async fn warm_start(&self) -> usize {
        let namespace = self.inner.namespace;
        let records = match self.inner.durable.load_namespace(namespace.as_str()).await {
            Ok(records) => records,
            Err(err) => {
                warn!(namespace = namespace.as_str(), error = %err, "cache: warm start skipped");
                return 0;
            }
        };

        let ttl = self.inner.policy.ttl;
        let now_wall = Utc::now();
        let now = Instant::now();
        let mut loaded = 0;
        for record in records {
            let Ok(age) = (now_wall - record.written_at).to_std() else {
                continue;
            };
            if age >= ttl {
                continue;
            }
            let Some(key) = CacheKey::from_storage_key(namespace, &record.key) else {
                debug!(key = %record.key, "cache: unrecognised durable key skipped");
                continue;
            };
            if was_redacted(&self.inner.policy, &record.payload) {
                debug!(key = %record.key, "cache: redacted durable payload skipped");
                continue;
            }
            let payload = match serde_json::from_value::<T>(record.payload) {
                Ok(payload) => payload,
                Err(err) => {
                    debug!(key = %record.key, error = %err, "cache: durable payload skipped");
                    continue;
                }
            };
            let written_at = now.checked_sub(age).unwrap_or(now);
            self.inner.lock().entries.insert(
                key.clone(),
                CacheEntry {
                    key,
                    payload,
                    written_at,
                },
            );
            loaded += 1;
        }
        loaded
    }
}

fn lookup_fresh<T: Clone>(state: &mut CacheState<T>, key: &CacheKey, ttl: Duration) -> Option<T> {
    let entry = state.entries.get(key)?;
    if entry.is_fresh(ttl, Instant::now()) {
        return Some(entry.payload.clone());
    }
    state.entries.remove(key);
    None
}

fn store_in_memory<T>(inner: &CacheInner<T>, key: CacheKey, value: T) {
    inner.lock().entries.insert(
        key.clone(),
        CacheEntry {
            key,
            payload: value,
            written_at: Instant::now(),
        },
    );
}

async fn mirror<T>(inner: &CacheInner<T>, key: &CacheKey, mut payload: serde_json::Value) {
    for field in &inner.policy.sensitive_fields {
        let path: Vec<&str> = field.split('.').filter(|part| !part.is_empty()).collect();
        redact_path(&mut payload, &path);
    }
    if let Err(err) = inner
        .durable
        .write(inner.namespace.as_str(), &key.storage_key(), payload, Utc::now())
        .await
    {
        warn!(key = %key.storage_key(), error = %err, "cache: durable write failed; continuing in memory");
    }
}

async fn settle<T>(
    inner: &Arc<CacheInner<T>>,
    key: CacheKey,
    id: u64,
    generation: u64,
    result: &SyncResult<T>,
) where
    T: Clone + Serialize,
{
    let store = {
        let mut state = inner.lock();
        if state.in_flight.get(&key).is_some_and(|flight| flight.id == id) {
            state.in_flight.remove(&key);
        }
        result.is_ok() && state.generation == generation
    };
    if !store {
        return;
    }
    let Ok(value) = result else {
        return;
    };
    let payload = serde_json::to_value(value);
    store_in_memory(inner, key.clone(), value.clone());
    if let Ok(payload) = payload {
        mirror(inner, &key, payload).await;
    }
}

/// Replaces the value at `path` with [`REDACTED_PLACEHOLDER`]. Missing fields
/// and `null` values are left alone.
pub fn redact_path(value: &mut serde_json::Value, path: &[&str]) {
    use serde_json::Value;

    let Some((head, rest)) = path.split_first() else {
        if !value.is_null() {
            *value = Value::String(REDACTED_PLACEHOLDER.to_string());
        }
        return;
    };
    match value {
        Value::Object(map) if *head == "*" => {
            for child in map.values_mut() {
                redact_path(child, rest);
            }
        }
        Value::Object(map) => {
            if let Some(child) = map.get_mut(*head) {
                redact_path(child, rest);
            }
        }
        Value::Array(items) if *head == "*" => {
            for child in items {
                redact_path(child, rest);
            }
        }
        Value::Array(items) => {
            if let Some(child) = head.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                redact_path(child, rest);
            }
        }
        _ => {}
    }
}

/// True when any sensitive path of `payload` holds [`REDACTED_PLACEHOLDER`].
/// Such a mirror row cannot stand in for the real resource.
fn was_redacted(policy: &CachePolicy, payload: &serde_json::Value) -> bool {
    policy.sensitive_fields.iter().any(|field| {
        let path: Vec<&str> = field.split('.').filter(|part| !part.is_empty()).collect();
        holds_placeholder(payload, &path)
    })
}

fn holds_placeholder(value: &serde_json::Value, path: &[&str]) -> bool {
    use serde_json::Value;

    let Some((head, rest)) = path.split_first() else {
        return value.as_str() == Some(REDACTED_PLACEHOLDER);
    };
    match value {
        Value::Object(map) if *head == "*" => {
            map.values().any(|child| holds_placeholder(child, rest))
        }
        Value::Object(map) => map
            .get(*head)
            .is_some_and(|child| holds_placeholder(child, rest)),
        Value::Array(items) if *head == "*" => {
            items.iter().any(|child| holds_placeholder(child, rest))
        }
        Value::Array(items) => head
            .parse::<usize>()
            .ok()
            .and_then(|index| items.get(index))
            .is_some_and(|child| holds_placeholder(child, rest)),
        _ => false,
    }
}

/// The engine's cache set: one independent namespace per resource class.
///
/// Construct once at application start, hand it to the synchronizer by `Arc`,
/// and call [`SyncCache::clear`] at sign-out.
pub struct SyncCache {
    pub sessions: ResourceCache<Session>,
    pub session_lists: ResourceCache<SessionListPage>,
    pub messages: ResourceCache<Message>,
    pub message_pages: ResourceCache<MessagePage>,
    durable: Arc<dyn DurableStore>,
}

impl SyncCache {
    pub fn new(settings: &SyncSettings, durable: Arc<dyn DurableStore>) -> Self {
        let policy = |ttl_secs: u64| CachePolicy {
            ttl: Duration::from_secs(ttl_secs),
            sensitive_fields: settings.sensitive_fields.clone(),
        };
        Self {
            sessions: ResourceCache::new(
                CacheNamespace::Session,
                policy(settings.session_ttl_secs),
                Arc::clone(&durable),
            ),
            session_lists: ResourceCache::new(
                CacheNamespace::SessionList,
                policy(settings.session_list_ttl_secs),
                Arc::clone(&durable),
            ),
            messages: ResourceCache::new(
                CacheNamespace::Message,
                policy(settings.message_ttl_secs),
                Arc::clone(&durable),
            ),
            message_pages: ResourceCache::new(
                CacheNamespace::MessagePage,
                policy(settings.message_page_ttl_secs),
                Arc::clone(&durable),
            ),
            durable,
        }
    }

    pub fn in_memory(settings: &SyncSettings) -> Self {
        Self::new(settings, Arc::new(MissingDurableStore))
    }

    /// Purges durable rows older than the longest TTL, then loads the rest.
    pub async fn warm_start(&self) -> usize {
        let longest = [
            self.sessions.ttl(),
            self.session_lists.ttl(),
            self.messages.ttl(),
            self.message_pages.ttl(),
        ]
        .into_iter()
        .max()
        .unwrap_or(DEFAULT_TTL);
        let cutoff = chrono::Duration::from_std(longest)
            .ok()
            .and_then(|ttl| Utc::now().checked_sub_signed(ttl));
        if let Some(cutoff) = cutoff {
            match self.durable.purge_older_than(cutoff).await {
                Ok(0) => {}
                Ok(purged) => debug!(purged, "cache: expired durable rows purged"),
                Err(err) => warn!(error = %err, "cache: durable purge failed"),
            }
        }

        self.sessions.warm_start().await
            + self.session_lists.warm_start().await
            + self.messages.warm_start().await
            + self.message_pages.warm_start().await
    }

    /// Drops the session and everything cached beneath it.
    pub async fn invalidate_session(&self, session_id: &SessionId) {
        self.sessions.invalidate(&CacheKey::session(session_id)).await;
        self.messages.invalidate_prefix(&[session_id.as_str()]).await;
        self.message_pages
            .invalidate_prefix(&[session_id.as_str()])
            .await;
    }

    pub async fn clear(&self) {
        self.sessions.clear().await;
        self.session_lists.clear().await;
        self.messages.clear().await;
        self.message_pages.clear().await;
    }
}

#[cfg(test)]
#[path = "tests/cache_tests.rs"]
mod tests;
