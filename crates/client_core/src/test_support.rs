use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::StreamExt;
use shared::{
    domain::{Message, MessageId, MessageRole, Session, SessionId, SessionStatus, UserId},
    protocol::{
        CreateSessionRequest, MessagePage, PageQuery, SendMessageRequest, SessionListPage,
        SessionUpdate,
    },
};
use tokio::{sync::mpsc, time::Instant};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{
    api::SessionApi,
    auth::AuthProvider,
    error::{SyncError, SyncResult},
    transport::{FrameStream, StreamConnector, StreamFrame},
};

pub fn message(id: &str, role: MessageRole, text: &str, sequence: u64) -> Message {
    Message::new(MessageId::from(id), role, text, sequence)
}

pub fn session_with(id: &str, messages: Vec<Message>) -> Session {
    let created_at = Utc
        .with_ymd_and_hms(2024, 5, 1, 12, 0, 0)
        .single()
        .expect("fixed timestamp");
    Session {
        id: SessionId::from(id),
        title: "Adverse possession".to_string(),
        query: "What is adverse possession?".to_string(),
        status: SessionStatus::Completed,
        messages,
        tags: BTreeSet::from(["property".to_string()]),
        created_at,
        updated_at: created_at,
        user_id: Some(UserId::from("user-1")),
        organization_id: None,
    }
}

pub fn two_message_session(id: &str) -> Session {
    session_with(
        id,
        vec![
            message("m1", MessageRole::User, "What is adverse possession?", 1),
            message("m2", MessageRole::Assistant, "A doctrine of property law.", 2),
        ],
    )
}

/// Auth double whose token changes on every refresh.
pub struct RotatingAuth {
    token: Mutex<String>,
    pub refreshes: AtomicU32,
}

impl RotatingAuth {
    pub fn new(token: &str) -> Self {
        Self {
            token: Mutex::new(token.to_string()),
            refreshes: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl AuthProvider for RotatingAuth {
    async fn bearer_token(&self) -> SyncResult<Option<String>> {
        Ok(Some(self.token.lock().expect("token lock").clone()))
    }

    async fn refresh(&self) -> SyncResult<()> {
        let count = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        *self.token.lock().expect("token lock") = format!("fresh-{count}");
        Ok(())
    }
}

pub type FrameSender = mpsc::UnboundedSender<SyncResult<StreamFrame>>;

enum ScriptedOpen {
    Refuse,
    Stream(mpsc::UnboundedReceiver<SyncResult<StreamFrame>>),
}

/// Connector that replays a fixed script of open outcomes and records when
/// each open happened. Opens beyond the script are refused.
#[derive(Default)]
pub struct ScriptedConnector {
    script: Mutex<VecDeque<ScriptedOpen>>,
    opened_at: Mutex<Vec<Instant>>,
}

impl ScriptedConnector {
    pub fn refusing() -> Self {
        Self::default()
    }

    /// Queues a connection that stays open until the returned sender drops.
    pub fn push_stream(&self) -> FrameSender {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.script
            .lock()
            .expect("script")
            .push_back(ScriptedOpen::Stream(receiver));
        sender
    }

    pub fn opens(&self) -> Vec<Instant> {
        self.opened_at.lock().expect("opens").clone()
    }
}

#[async_trait]
impl StreamConnector for ScriptedConnector {
    async fn open(&self, _session_id: &SessionId) -> SyncResult<FrameStream> {
        self.opened_at.lock().expect("opens").push(Instant::now());
        let next = self
            .script
            .lock()
            .expect("script")
            .pop_front()
            .unwrap_or(ScriptedOpen::Refuse);
        match next {
            ScriptedOpen::Refuse => Err(SyncError::connection("connection refused")),
            ScriptedOpen::Stream(receiver) => Ok(UnboundedReceiverStream::new(receiver).boxed()),
        }
    }
}

pub fn stream_frame(event: &str, data: &str) -> SyncResult<StreamFrame> {
    Ok(StreamFrame::new(event, data))
}

/// In-memory stand-in for the REST service.
#[derive(Default)]
pub struct FakeSessionApi {
    pub sessions: Mutex<HashMap<SessionId, Session>>,
    pub fetch_delays: Mutex<HashMap<SessionId, Duration>>,
    pub fail_sends: AtomicBool,
    pub fail_message_polls: AtomicBool,
    pub fetch_calls: AtomicU32,
    pub list_calls: AtomicU32,
    pub poll_calls: AtomicU32,
    pub message_calls: AtomicU32,
    next_id: AtomicU32,
}

impl FakeSessionApi {
    pub fn with_sessions(sessions: impl IntoIterator<Item = Session>) -> Self {
        let api = Self::default();
        api.sessions.lock().expect("sessions").extend(
            sessions
                .into_iter()
                .map(|session| (session.id.clone(), session)),
        );
        api
    }

    pub fn insert(&self, session: Session) {
        self.sessions
            .lock()
            .expect("sessions")
            .insert(session.id.clone(), session);
    }

    pub fn remove(&self, session_id: &SessionId) {
        self.sessions.lock().expect("sessions").remove(session_id);
    }

    pub fn delay_fetch(&self, session_id: &SessionId, delay: Duration) {
        self.fetch_delays
            .lock()
            .expect("delays")
            .insert(session_id.clone(), delay);
    }

    fn stored(&self, session_id: &SessionId) -> SyncResult<Session> {
        self.sessions
            .lock()
            .expect("sessions")
            .get(session_id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("session {session_id} not found")))
    }
}

#[async_trait]
impl SessionApi for FakeSessionApi {
    async fn fetch_session(&self, session_id: &SessionId) -> SyncResult<Session> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.fetch_delays.lock().expect("delays").get(session_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.stored(session_id)
    }

    async fn list_sessions(&self, page: PageQuery) -> SyncResult<SessionListPage> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let mut sessions: Vec<_> = self
            .sessions
            .lock()
            .expect("sessions")
            .values()
            .map(Session::summary)
            .collect();
        sessions.sort_by(|left, right| left.id.cmp(&right.id));
        let total = sessions.len() as u64;
        Ok(SessionListPage {
            sessions,
            page: page.page,
            total,
            has_more: false,
        })
    }

    async fn create_session(&self, request: CreateSessionRequest) -> SyncResult<Session> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut session = session_with(
            &format!("new-{n}"),
            vec![message(&format!("new-{n}-m1"), MessageRole::User, &request.query, 1)],
        );
        session.query = request.query;
        session.status = SessionStatus::Pending;
        if let Some(title) = request.params.title {
            session.title = title;
        }
        self.insert(session.clone());
        Ok(session)
    }

    async fn update_session(
        &self,
        session_id: &SessionId,
        update: SessionUpdate,
    ) -> SyncResult<Session> {
        let mut session = self.stored(session_id)?;
        if let Some(title) = update.title {
            session.title = title;
        }
        if let Some(tags) = update.tags {
            session.tags = tags;
        }
        if let Some(status) = update.status {
            session.status = status;
        }
        self.insert(session.clone());
        Ok(session)
    }

    async fn delete_session(&self, session_id: &SessionId) -> SyncResult<()> {
        self.stored(session_id)?;
        self.remove(session_id);
        Ok(())
    }

    async fn fetch_messages(
        &self,
        session_id: &SessionId,
        page: PageQuery,
    ) -> SyncResult<MessagePage> {
        self.poll_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_message_polls.load(Ordering::SeqCst) {
            return Err(SyncError::Server {
                status: 503,
                message: "unavailable".into(),
            });
        }
        let messages = self.stored(session_id)?.messages;
        let total = messages.len() as u64;
        let skip = (page.page.saturating_sub(1) * page.limit) as usize;
        let window: Vec<_> = messages
            .into_iter()
            .skip(skip)
            .take(page.limit as usize)
            .collect();
        Ok(MessagePage {
            has_more: (skip + window.len()) < total as usize,
            messages: window,
            page: page.page,
            total,
        })
    }

    async fn fetch_message(
        &self,
        session_id: &SessionId,
        message_id: &MessageId,
    ) -> SyncResult<Message> {
        self.message_calls.fetch_add(1, Ordering::SeqCst);
        self.stored(session_id)?
            .messages
            .into_iter()
            .find(|message| &message.id == message_id)
            .ok_or_else(|| SyncError::NotFound(format!("message {message_id} not found")))
    }

    async fn send_message(
        &self,
        session_id: &SessionId,
        request: SendMessageRequest,
    ) -> SyncResult<Session> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(SyncError::Server {
                status: 500,
                message: "send failed".into(),
            });
        }
        let mut session = self.stored(session_id)?;
        let sequence = session.next_sequence();
        session.messages.push(message(
            &format!("m{sequence}"),
            MessageRole::User,
            &request.content,
            sequence,
        ));
        session.status = SessionStatus::Pending;
        self.insert(session.clone());
        Ok(session)
    }
}
