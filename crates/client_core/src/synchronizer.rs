//! The engine's public face: one canonical session kept in step with REST
//! reads, the push stream and local mutations.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use async_trait::async_trait;
use shared::{
    domain::{Message, MessageId, Session, SessionId},
    protocol::{
        CreateSessionRequest, MessagePage, PageQuery, SendMessageRequest, SessionListPage,
        SessionParams, SessionUpdate,
    },
};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    api::{HttpSessionApi, SessionApi},
    auth::AuthProvider,
    cache::{CacheKey, SyncCache},
    config::{StreamTransportKind, SyncSettings},
    durable_store::open_durable_store,
    error::{SyncError, SyncResult},
    merge,
    optimistic::{validate_message_content, validate_query, Mutation, OptimisticUpdate},
    transport::{
        ConnectionState, SseConnector, StreamConnector, Transport, TransportHandler,
        WebSocketConnector,
    },
};

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    SessionUpdated(Option<Session>),
    ConnectionStateChanged(ConnectionState),
    Error(SyncError),
}

#[derive(Debug, Clone, Copy)]
struct PollSettings {
    interval: Duration,
    max_failures: u32,
    page_size: u32,
}

#[derive(Default)]
struct SyncState {
    session: Option<Session>,
    session_id: Option<SessionId>,
    connection: ConnectionState,
    error: Option<SyncError>,
    /// Bumped whenever `session_id` changes; work started under an older
    /// epoch must not touch state.
    epoch: u64,
    /// Bumped by every `load_session`; only the latest load may publish.
    load_seq: u64,
    polling_exhausted: bool,
}

pub struct SessionSynchronizer {
    api: Arc<dyn SessionApi>,
    cache: Arc<SyncCache>,
    transport: Transport,
    poll: PollSettings,
    state: Mutex<SyncState>,
    poller: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<SyncEvent>,
    weak_self: Weak<SessionSynchronizer>,
}

impl SessionSynchronizer {
    pub fn new(
        api: Arc<dyn SessionApi>,
        connector: Arc<dyn StreamConnector>,
        cache: Arc<SyncCache>,
        settings: &SyncSettings,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let poll = PollSettings {
            interval: settings.poll_interval(),
            max_failures: settings.max_poll_failures,
            page_size: settings.message_page_size,
        };
        let transport = Transport::new(connector, settings.reconnect_policy());
        Arc::new_cyclic(|weak_self| Self {
            api,
            cache,
            transport,
            poll,
            state: Mutex::new(SyncState::default()),
            poller: Mutex::new(None),
            events,
            weak_self: weak_self.clone(),
        })
    }

    /// Builds the HTTP client, stream connector and cache described by
    /// `settings`, then warms the cache from the durable mirror.
    pub async fn from_settings(
        settings: &SyncSettings,
        auth: Arc<dyn AuthProvider>,
    ) -> SyncResult<Arc<Self>> {
        settings.validate()?;
        let api = HttpSessionApi::new(
            &settings.api_base_url,
            Arc::clone(&auth),
            settings.request_timeout(),
            settings.retry_policy(),
        )?;
        let connector: Arc<dyn StreamConnector> = match settings.stream_transport {
            StreamTransportKind::Sse => Arc::new(SseConnector::new(
                settings.stream_base_url(),
                auth,
                settings.request_timeout(),
            )?),
            StreamTransportKind::Websocket => {
                Arc::new(WebSocketConnector::new(settings.stream_base_url(), auth)?)
            }
        };
        let durable = open_durable_store(settings.durable_cache_url.as_deref()).await;
        let cache = Arc::new(SyncCache::new(settings, durable));
        let warmed = cache.warm_start().await;
        if warmed > 0 {
            info!(entries = warmed, "sync: cache warmed from durable mirror");
        }
        Ok(Self::new(Arc::new(api), connector, cache, settings))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn session(&self) -> Option<Session> {
        self.lock_state().session.clone()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.lock_state().session_id.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.lock_state().connection
    }

    pub fn error(&self) -> Option<SyncError> {
        self.lock_state().error.clone()
    }

    pub fn cache(&self) -> &Arc<SyncCache> {
        &self.cache
    }

    /// Loads `session_id` cache-first and starts streaming it. Switching to a
    /// different session is committed only once the fetch succeeds; a failed
    /// load keeps the previous session, its epoch and its stream.
    pub async fn load_session(&self, session_id: SessionId) -> SyncResult<Session> {
        let (ticket, started_epoch) = {
            let mut state = self.lock_state();
            state.load_seq += 1;
            (state.load_seq, state.epoch)
        };
        let api = Arc::clone(&self.api);
        let fetch_id = session_id.clone();
        let result = self
            .cache
            .sessions
            .get_or_fetch(CacheKey::session(&session_id), move || async move {
                api.fetch_session(&fetch_id).await
            })
            .await;

        let superseded = {
            let state = self.lock_state();
            state.load_seq != ticket || state.epoch != started_epoch
        };
        if superseded {
            debug!(session_id = %session_id, "sync: superseded load ignored");
            return result;
        }
        match result {
            Ok(session) => {
                let epoch = self.switch_to(&session_id);
                let session = normalized(session);
                self.replace_session(epoch, Some(session.clone()));
                self.clear_error(epoch);
                self.ensure_stream(epoch);
                Ok(session)
            }
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "sync: session load failed");
                self.report_error(started_epoch, err.clone());
                Err(err)
            }
        }
    }

    pub async fn create_session(
        &self,
        query: &str,
        params: SessionParams,
    ) -> SyncResult<Session> {
        let query = validate_query(query)?;
        let created = match self
            .api
            .create_session(CreateSessionRequest { query, params })
            .await
        {
            Ok(session) => normalized(session),
            Err(err) => {
                let epoch = self.lock_state().epoch;
                self.report_error(epoch, err.clone());
                return Err(err);
            }
        };

        let epoch = self.switch_to(&created.id);
        info!(session_id = %created.id, "sync: session created");
        self.replace_session(epoch, Some(created.clone()));
        self.clear_error(epoch);
        self.cache
            .sessions
            .set(CacheKey::session(&created.id), created.clone())
            .await;
        self.cache.session_lists.invalidate_prefix(&[]).await;
        self.ensure_stream(epoch);
        Ok(created)
    }

    pub async fn send_message(&self, content: &str) -> SyncResult<Session> {
        let content = validate_message_content(content)?;
        let (epoch, current) = self.current_session()?;
        let session_id = current.id.clone();

        let update = OptimisticUpdate::begin(
            &current,
            Mutation::SendMessage {
                content: content.clone(),
            },
        );
        self.replace_session(epoch, update.optimistic().cloned());

        let outcome = self
            .api
            .send_message(&session_id, SendMessageRequest { content })
            .await;
        let reconciled = self.settle(epoch, update, outcome)?;

        self.cache
            .sessions
            .set(CacheKey::session(&session_id), reconciled.clone())
            .await;
        self.cache
            .message_pages
            .invalidate_prefix(&[session_id.as_str()])
            .await;
        self.cache.session_lists.invalidate_prefix(&[]).await;
        Ok(reconciled)
    }

    pub async fn update_session(&self, update: SessionUpdate) -> SyncResult<Session> {
        if update.is_empty() {
            return Err(SyncError::validation("session update changes nothing"));
        }
        if update
            .title
            .as_deref()
            .is_some_and(|title| title.trim().is_empty())
        {
            return Err(SyncError::validation("title must not be empty"));
        }
        let (epoch, current) = self.current_session()?;
        let session_id = current.id.clone();

        let pending = OptimisticUpdate::begin(&current, Mutation::UpdateSession(update.clone()));
        self.replace_session(epoch, pending.optimistic().cloned());

        let outcome = self.api.update_session(&session_id, update).await;
        let reconciled = self.settle(epoch, pending, outcome)?;

        self.cache
            .sessions
            .set(CacheKey::session(&session_id), reconciled.clone())
            .await;
        self.cache.session_lists.invalidate_prefix(&[]).await;
        Ok(reconciled)
    }

    pub async fn delete_session(&self) -> SyncResult<()> {
        let (epoch, current) = self.current_session()?;
        let session_id = current.id.clone();

        let pending = OptimisticUpdate::begin(&current, Mutation::DeleteSession);
        self.replace_session(epoch, None);

        if let Err(err) = self.api.delete_session(&session_id).await {
            warn!(session_id = %session_id, error = %err, "sync: delete failed; restoring session");
            self.replace_session(epoch, Some(pending.rollback()));
            self.report_error(epoch, err.clone());
            return Err(err);
        }

        info!(session_id = %session_id, "sync: session deleted");
        {
            let mut state = self.lock_state();
            if state.epoch == epoch {
                state.epoch += 1;
                state.session_id = None;
                state.session = None;
                state.error = None;
            }
        }
        self.stop_stream();
        self.cache.invalidate_session(&session_id).await;
        self.cache.session_lists.invalidate_prefix(&[]).await;
        Ok(())
    }

    /// (Re)opens the stream for the current session.
    pub fn connect_stream(&self) -> SyncResult<()> {
        let (epoch, session_id) = {
            let state = self.lock_state();
            let session_id = state.session_id.clone().ok_or(SyncError::NoActiveSession)?;
            (state.epoch, session_id)
        };
        self.open_stream(epoch, session_id);
        Ok(())
    }

    pub fn disconnect_stream(&self) {
        self.stop_stream();
    }

    /// Drops the current session, stream and poller. Cached entries survive.
    pub fn teardown(&self) {
        {
            let mut state = self.lock_state();
            state.epoch += 1;
            state.session_id = None;
            state.session = None;
            state.error = None;
            state.polling_exhausted = false;
        }
        self.stop_stream();
        let _ = self.events.send(SyncEvent::SessionUpdated(None));
    }

    /// Teardown plus clearing every cached entry, memory and durable.
    pub async fn sign_out(&self) {
        self.teardown();
        self.cache.clear().await;
        info!("sync: signed out; cache cleared");
    }

    pub async fn list_sessions(&self, page: PageQuery) -> SyncResult<SessionListPage> {
        let api = Arc::clone(&self.api);
        self.cache
            .session_lists
            .get_or_fetch(CacheKey::session_list(page), move || async move {
                api.list_sessions(page).await
            })
            .await
    }

    /// Fetches one page of history for the current session and folds it into
    /// the canonical message list.
    pub async fn load_message_page(&self, page: PageQuery) -> SyncResult<MessagePage> {
        let (epoch, session_id) = self.current_session_id()?;
        let api = Arc::clone(&self.api);
        let fetch_id = session_id.clone();
        let result = self
            .cache
            .message_pages
            .get_or_fetch(CacheKey::message_page(&session_id, page), move || async move {
                api.fetch_messages(&fetch_id, page).await
            })
            .await;

        match result {
            Ok(loaded) => {
                for message in &loaded.messages {
                    self.cache.messages.set_volatile(
                        CacheKey::message(&session_id, &message.id),
                        message.clone(),
                    );
                }
                self.apply_batch(epoch, &loaded.messages);
                Ok(loaded)
            }
            Err(err) => {
                self.report_error(epoch, err.clone());
                Err(err)
            }
        }
    }

    /// Single message lookup: cache, then the canonical session, then REST.
    pub async fn message(&self, message_id: &MessageId) -> SyncResult<Message> {
        let (_, session_id) = self.current_session_id()?;
        let key = CacheKey::message(&session_id, message_id);
        if let Some(hit) = self.cache.messages.get(&key) {
            return Ok(hit);
        }
        let local = self.session().and_then(|session| {
            session
                .messages
                .into_iter()
                .find(|message| &message.id == message_id)
        });
        if let Some(local) = local {
            return Ok(local);
        }
        if message_id.is_temporary() {
            return Err(SyncError::NotFound(format!(
                "message {message_id} is not confirmed yet"
            )));
        }

        let api = Arc::clone(&self.api);
        let fetch_session = session_id.clone();
        let fetch_message = message_id.clone();
        self.cache
            .messages
            .get_or_fetch(key, move || async move {
                api.fetch_message(&fetch_session, &fetch_message).await
            })
            .await
    }

    fn lock_state(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.lock_state().epoch == epoch
    }

    /// Makes `session_id` current. A different id bumps the epoch and tears
    /// down the previous stream; the same id keeps both.
    fn switch_to(&self, session_id: &SessionId) -> u64 {
        let switched = {
            let mut state = self.lock_state();
            if state.session_id.as_ref() == Some(session_id) {
                None
            } else {
                state.epoch += 1;
                state.session_id = Some(session_id.clone());
                state.polling_exhausted = false;
                Some(state.epoch)
            }
        };
        match switched {
            Some(epoch) => {
                debug!(session_id = %session_id, epoch, "sync: switched session");
                self.stop_stream();
                epoch
            }
            None => self.lock_state().epoch,
        }
    }

    fn current_session(&self) -> SyncResult<(u64, Session)> {
        let state = self.lock_state();
        let session = state.session.clone().ok_or(SyncError::NoActiveSession)?;
        Ok((state.epoch, session))
    }

    fn current_session_id(&self) -> SyncResult<(u64, SessionId)> {
        let state = self.lock_state();
        let session_id = state.session_id.clone().ok_or(SyncError::NoActiveSession)?;
        Ok((state.epoch, session_id))
    }

    /// Reconciles or rolls back `update` depending on the remote outcome.
    fn settle(
        &self,
        epoch: u64,
        update: OptimisticUpdate,
        outcome: SyncResult<Session>,
    ) -> SyncResult<Session> {
        match outcome {
            Ok(authoritative) => {
                let reconciled = {
                    let state = self.lock_state();
                    let current = (state.epoch == epoch)
                        .then_some(state.session.as_ref())
                        .flatten();
                    update.reconcile(current, authoritative)
                };
                self.replace_session(epoch, Some(reconciled.clone()));
                self.clear_error(epoch);
                Ok(reconciled)
            }
            Err(err) => {
                warn!(
                    mutation = update.mutation().name(),
                    error = %err,
                    "sync: mutation failed; rolling back"
                );
                let restored = {
                    let state = self.lock_state();
                    let current = (state.epoch == epoch)
                        .then_some(state.session.as_ref())
                        .flatten();
                    update.rollback_onto(current)
                };
                self.replace_session(epoch, Some(restored));
                self.report_error(epoch, err.clone());
                Err(err)
            }
        }
    }

    fn replace_session(&self, epoch: u64, session: Option<Session>) {
        {
            let mut state = self.lock_state();
            if state.epoch != epoch {
                return;
            }
            state.session = session.clone();
        }
        let _ = self.events.send(SyncEvent::SessionUpdated(session));
    }

    fn apply_batch(&self, epoch: u64, messages: &[Message]) {
        self.update_messages(epoch, |current| merge::merge_batch(current, messages));
    }

    fn apply_chunk(&self, epoch: u64, chunk: &str) {
        self.update_messages(epoch, |current| merge::apply_text_chunk(current, chunk));
    }

    fn update_messages(&self, epoch: u64, fold: impl FnOnce(&[Message]) -> Vec<Message>) {
        let updated = {
            let mut state = self.lock_state();
            if state.epoch != epoch {
                return;
            }
            let Some(session) = state.session.as_mut() else {
                return;
            };
            session.messages = fold(&session.messages);
            session.clone()
        };
        let _ = self.events.send(SyncEvent::SessionUpdated(Some(updated)));
    }

    fn report_error(&self, epoch: u64, error: SyncError) {
        {
            let mut state = self.lock_state();
            if state.epoch != epoch {
                return;
            }
            state.error = Some(error.clone());
        }
        let _ = self.events.send(SyncEvent::Error(error));
    }

    fn clear_error(&self, epoch: u64) {
        let mut state = self.lock_state();
        if state.epoch == epoch {
            state.error = None;
        }
    }

    fn set_connection(&self, epoch: u64, connection: ConnectionState) -> bool {
        {
            let mut state = self.lock_state();
            if state.epoch != epoch || state.connection == connection {
                return false;
            }
            state.connection = connection;
        }
        let _ = self.events.send(SyncEvent::ConnectionStateChanged(connection));
        true
    }

    fn ensure_stream(&self, epoch: u64) {
        let Some(session_id) = self.session_id() else {
            return;
        };
        let already_streaming = self.transport.session_id().as_ref() == Some(&session_id)
            && !matches!(
                self.transport.state(),
                ConnectionState::Disconnected | ConnectionState::Error
            );
        if !already_streaming {
            self.open_stream(epoch, session_id);
        }
    }

    fn open_stream(&self, epoch: u64, session_id: SessionId) {
        info!(session_id = %session_id, "sync: opening stream");
        let handler = Arc::new(EpochHandler {
            sync: self.weak_self.clone(),
            epoch,
        });
        self.transport.connect(session_id, handler);
    }

    fn stop_stream(&self) {
        self.transport.disconnect();
        self.stop_poller();
        let mut state = self.lock_state();
        let changed = state.connection != ConnectionState::Disconnected;
        state.connection = ConnectionState::Disconnected;
        drop(state);
        if changed {
            let _ = self
                .events
                .send(SyncEvent::ConnectionStateChanged(ConnectionState::Disconnected));
        }
    }

    fn on_connection_state(&self, epoch: u64, connection: ConnectionState) {
        if !self.set_connection(epoch, connection) {
            return;
        }
        if connection.needs_fallback() {
            self.start_poller(epoch);
        } else if connection == ConnectionState::Connected {
            self.stop_poller();
        }
    }

    fn start_poller(&self, epoch: u64) {
        let session_id = {
            let state = self.lock_state();
            if state.epoch != epoch || state.polling_exhausted {
                return;
            }
            match state.session_id.clone() {
                Some(session_id) => session_id,
                None => return,
            }
        };
        let mut poller = self.poller.lock().unwrap_or_else(PoisonError::into_inner);
        if poller.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        info!(session_id = %session_id, "sync: stream degraded; polling for messages");
        *poller = Some(tokio::spawn(poll_messages(
            self.weak_self.clone(),
            epoch,
            session_id,
            self.poll,
        )));
    }

    fn stop_poller(&self) {
        let task = self
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }

    fn exhaust_polling(&self, epoch: u64, error: SyncError) {
        {
            let mut state = self.lock_state();
            if state.epoch != epoch {
                return;
            }
            state.polling_exhausted = true;
        }
        self.report_error(epoch, error);
    }
}

impl Drop for SessionSynchronizer {
    fn drop(&mut self) {
        let task = self
            .poller
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

/// Sorts a server payload into canonical message order.
fn normalized(mut session: Session) -> Session {
    session.messages = merge::merge_batch(&[], &session.messages);
    session
}

async fn poll_messages(
    sync: Weak<SessionSynchronizer>,
    epoch: u64,
    session_id: SessionId,
    poll: PollSettings,
) {
    let mut failures = 0u32;
    loop {
        tokio::time::sleep(poll.interval).await;
        let Some(sync) = sync.upgrade() else {
            return;
        };
        if !sync.is_current(epoch) {
            return;
        }
        let page = PageQuery {
            page: 1,
            limit: poll.page_size,
        };
        match sync.api.fetch_messages(&session_id, page).await {
            Ok(loaded) => {
                failures = 0;
                debug!(session_id = %session_id, count = loaded.messages.len(), "sync: poll merged");
                sync.apply_batch(epoch, &loaded.messages);
            }
            Err(err) => {
                failures += 1;
                warn!(session_id = %session_id, failures, error = %err, "sync: poll failed");
                if failures >= poll.max_failures {
                    sync.exhaust_polling(
                        epoch,
                        SyncError::connection(format!(
                            "message polling stopped after {failures} consecutive failures: {err}"
                        )),
                    );
                    return;
                }
            }
        }
    }
}

/// Routes transport callbacks for one connection; a stale epoch turns every
/// call into a no-op.
struct EpochHandler {
    sync: Weak<SessionSynchronizer>,
    epoch: u64,
}

#[async_trait]
impl TransportHandler for EpochHandler {
    async fn on_message_batch(&self, messages: Vec<Message>) {
        if let Some(sync) = self.sync.upgrade() {
            sync.apply_batch(self.epoch, &messages);
        }
    }

    async fn on_text_chunk(&self, chunk: String) {
        if let Some(sync) = self.sync.upgrade() {
            sync.apply_chunk(self.epoch, &chunk);
        }
    }

    async fn on_connection_state_change(&self, state: ConnectionState) {
        if let Some(sync) = self.sync.upgrade() {
            sync.on_connection_state(self.epoch, state);
        }
    }

    async fn on_fatal_error(&self, error: SyncError) {
        if let Some(sync) = self.sync.upgrade() {
            sync.report_error(self.epoch, error);
        }
    }
}

#[cfg(test)]
#[path = "tests/synchronizer_tests.rs"]
mod tests;
