//! Per-session push stream with reconnection and liveness tracking.
//!
//! [`Transport`] runs one connection task at a time. The task feeds socket
//! and timer signals into a [`TransportMachine`] and carries out the effects
//! it returns, so all lifecycle rules live in the pure machine.

mod connector;
mod machine;

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use futures::StreamExt;
use shared::{
    domain::{Message, SessionId},
    protocol::StreamEvent,
};
use tokio::{
    task::JoinHandle,
    time::{sleep_until, timeout, Instant},
};
use tracing::{debug, info, warn};

pub use connector::{
    stream_url, FrameStream, SseConnector, StreamConnector, StreamFrame, WebSocketConnector,
};
pub use machine::{ConnectionState, Effect, TransportEvent, TransportMachine};

use crate::{
    config::ReconnectPolicy,
    error::{SyncError, SyncResult},
};

/// Receives decoded stream activity. Calls for one connection are awaited in
/// delivery order.
#[async_trait]
pub trait TransportHandler: Send + Sync {
    async fn on_message_batch(&self, messages: Vec<Message>);
    async fn on_text_chunk(&self, chunk: String);
    async fn on_connection_state_change(&self, state: ConnectionState);
    async fn on_fatal_error(&self, error: SyncError);
}

struct ActiveConnection {
    session_id: SessionId,
    task: JoinHandle<()>,
}

pub struct Transport {
    connector: Arc<dyn StreamConnector>,
    policy: ReconnectPolicy,
    active: Mutex<Option<ActiveConnection>>,
    state: Arc<Mutex<ConnectionState>>,
}

impl Transport {
    pub fn new(connector: Arc<dyn StreamConnector>, policy: ReconnectPolicy) -> Self {
        Self {
            connector,
            policy,
            active: Mutex::new(None),
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|active| active.session_id.clone())
    }

    /// Starts streaming `session_id`, aborting any previous connection first.
    /// Must be called from within a tokio runtime.
    pub fn connect(&self, session_id: SessionId, handler: Arc<dyn TransportHandler>) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = active.take() {
            debug!(session_id = %previous.session_id, "transport: replacing connection");
            previous.task.abort();
        }

        let driver = Driver {
            machine: TransportMachine::new(self.policy),
            connector: Arc::clone(&self.connector),
            handler,
            session_id: session_id.clone(),
            state: Arc::clone(&self.state),
            stream: None,
            retry_at: None,
            heartbeat_at: None,
        };
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = ConnectionState::Connecting;
        let task = tokio::spawn(driver.run());
        *active = Some(ActiveConnection { session_id, task });
    }

    /// Aborts the connection task. Returns whether one was running.
    pub fn disconnect(&self) -> bool {
        let previous = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = ConnectionState::Disconnected;
        match previous {
            Some(previous) => {
                info!(session_id = %previous.session_id, "transport: disconnected");
                previous.task.abort();
                true
            }
            None => false,
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        let active = self
            .active
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(active) = active {
            active.task.abort();
        }
    }
}

struct Driver {
    machine: TransportMachine,
    connector: Arc<dyn StreamConnector>,
    handler: Arc<dyn TransportHandler>,
    session_id: SessionId,
    state: Arc<Mutex<ConnectionState>>,
    stream: Option<FrameStream>,
    retry_at: Option<Instant>,
    heartbeat_at: Option<Instant>,
}

impl Driver {
    async fn run(mut self) {
        let mut effects: VecDeque<Effect> = self.machine.handle(TransportEvent::Connect).into();

        loop {
            while let Some(effect) = effects.pop_front() {
                if let Some(event) = self.apply(effect).await {
                    effects.extend(self.machine.handle(event));
                }
            }
            if matches!(
                self.machine.state(),
                ConnectionState::Error | ConnectionState::Disconnected
            ) {
                return;
            }

            let event = tokio::select! {
                frame = next_frame(&mut self.stream) => match frame {
                    Some(Ok(frame)) => self.dispatch(frame).await,
                    Some(Err(err)) => Some(TransportEvent::Failed(err)),
                    None => Some(TransportEvent::Closed),
                },
                _ = sleep_until_some(self.retry_at) => {
                    self.retry_at = None;
                    Some(TransportEvent::RetryElapsed)
                }
                _ = sleep_until_some(self.heartbeat_at) => {
                    self.heartbeat_at = None;
                    warn!(session_id = %self.session_id, "transport: heartbeat overdue");
                    Some(TransportEvent::HeartbeatTimeout)
                }
            };
            if let Some(event) = event {
                effects.extend(self.machine.handle(event));
            }
        }
    }

    /// Carries out one effect; opening a connection reports back its outcome.
    async fn apply(&mut self, effect: Effect) -> Option<TransportEvent> {
        match effect {
            Effect::Open => {
                let connect_timeout = self.machine.policy().connect_timeout;
                let opened = timeout(connect_timeout, self.connector.open(&self.session_id))
                    .await
                    .map_err(SyncError::from)
                    .and_then(|result| result);
                match opened {
                    Ok(stream) => {
                        info!(session_id = %self.session_id, "transport: stream opened");
                        self.stream = Some(stream);
                        Some(TransportEvent::Opened)
                    }
                    Err(err) => {
                        warn!(
                            session_id = %self.session_id,
                            attempt = self.machine.attempt(),
                            error = %err,
                            "transport: open failed"
                        );
                        Some(TransportEvent::Failed(err))
                    }
                }
            }
            Effect::CloseConnection => {
                self.stream = None;
                self.heartbeat_at = None;
                None
            }
            Effect::ScheduleRetry(delay) => {
                info!(
                    session_id = %self.session_id,
                    attempt = self.machine.attempt(),
                    delay_ms = delay.as_millis() as u64,
                    "transport: reconnect scheduled"
                );
                self.retry_at = Some(Instant::now() + delay);
                None
            }
            Effect::ArmHeartbeat(window) => {
                self.heartbeat_at = Some(Instant::now() + window);
                None
            }
            Effect::CancelTimers => {
                self.retry_at = None;
                self.heartbeat_at = None;
                None
            }
            Effect::NotifyState(state) => {
                *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
                self.handler.on_connection_state_change(state).await;
                None
            }
            Effect::NotifyFatal(error) => {
                warn!(session_id = %self.session_id, error = %error, "transport: giving up");
                self.handler.on_fatal_error(error).await;
                None
            }
        }
    }

    /// Any decoded frame proves the connection alive.
    async fn dispatch(&mut self, frame: StreamFrame) -> Option<TransportEvent> {
        let event = match StreamEvent::decode(&frame.event, &frame.data) {
            Ok(event) => event,
            Err(err) => {
                warn!(
                    session_id = %self.session_id,
                    event = %frame.event,
                    error = %err,
                    "transport: unparsable payload skipped"
                );
                return None;
            }
        };

        match event {
            StreamEvent::ConnectionEstablished(established) => {
                debug!(
                    session_id = %self.session_id,
                    connection_id = ?established.connection_id,
                    "transport: server acknowledged stream"
                );
            }
            StreamEvent::Messages(messages) => self.handler.on_message_batch(messages).await,
            StreamEvent::TextChunk(chunk) => self.handler.on_text_chunk(chunk).await,
            StreamEvent::Heartbeat => {}
            StreamEvent::Error(error) => {
                warn!(session_id = %self.session_id, message = %error.message, "transport: server reported stream error");
                return Some(TransportEvent::Failed(SyncError::from(error)));
            }
            StreamEvent::Unknown { event } => {
                debug!(session_id = %self.session_id, event = %event, "transport: unknown event ignored");
            }
        }
        Some(TransportEvent::HeartbeatReceived)
    }
}

async fn next_frame(stream: &mut Option<FrameStream>) -> Option<SyncResult<StreamFrame>> {
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[path = "../tests/transport_tests.rs"]
mod tests;
