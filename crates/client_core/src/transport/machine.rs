//! Connection lifecycle as a pure state machine.
//!
//! The machine owns no timers and no sockets: every input is a
//! [`TransportEvent`] and every output is a list of [`Effect`]s for the driver
//! to carry out in order.

use std::time::Duration;

use serde::Serialize;

use crate::{config::ReconnectPolicy, error::SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl ConnectionState {
    /// States in which the REST poller stands in for the stream.
    pub fn needs_fallback(&self) -> bool {
        matches!(self, Self::Reconnecting | Self::Error)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connect,
    Opened,
    Failed(SyncError),
    Closed,
    HeartbeatReceived,
    HeartbeatTimeout,
    RetryElapsed,
    Disconnect,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Open,
    CloseConnection,
    ScheduleRetry(Duration),
    ArmHeartbeat(Duration),
    CancelTimers,
    NotifyState(ConnectionState),
    NotifyFatal(SyncError),
}

#[derive(Debug, Clone)]
pub struct TransportMachine {
    policy: ReconnectPolicy,
    state: ConnectionState,
    attempt: u32,
}

impl TransportMachine {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::Disconnected,
            attempt: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Retries scheduled since the last successful open.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn handle(&mut self, event: TransportEvent) -> Vec<Effect> {
        use ConnectionState as S;

        let mut effects = Vec::new();
        match (self.state, event) {
            (state, TransportEvent::Connect) => {
                if matches!(state, S::Connecting | S::Connected) {
                    effects.push(Effect::CloseConnection);
                }
                effects.push(Effect::CancelTimers);
                self.attempt = 0;
                self.transition(S::Connecting, &mut effects);
                effects.push(Effect::Open);
            }
            (S::Connecting, TransportEvent::Opened) => {
                self.attempt = 0;
                self.transition(S::Connected, &mut effects);
                effects.push(Effect::ArmHeartbeat(self.policy.heartbeat_timeout));
            }
            (S::Connecting | S::Connected, TransportEvent::Failed(error)) => {
                self.connection_lost(error, &mut effects);
            }
            (S::Connecting | S::Connected, TransportEvent::Closed) => {
                self.connection_lost(SyncError::connection("stream closed by server"), &mut effects);
            }
            (S::Connected, TransportEvent::HeartbeatTimeout) => {
                self.connection_lost(
                    SyncError::connection("no heartbeat within liveness window"),
                    &mut effects,
                );
            }
            (S::Connected, TransportEvent::HeartbeatReceived) => {
                effects.push(Effect::ArmHeartbeat(self.policy.heartbeat_timeout));
            }
            (S::Reconnecting, TransportEvent::RetryElapsed) => {
                self.transition(S::Connecting, &mut effects);
                effects.push(Effect::Open);
            }
            (S::Disconnected, TransportEvent::Disconnect) => {}
            (_, TransportEvent::Disconnect) => {
                effects.push(Effect::CancelTimers);
                effects.push(Effect::CloseConnection);
                self.attempt = 0;
                self.transition(S::Disconnected, &mut effects);
            }
            // Late timer or stream signals for a state that already moved on.
            _ => {}
        }
        effects
    }

    fn connection_lost(&mut self, error: SyncError, effects: &mut Vec<Effect>) {
        effects.push(Effect::CloseConnection);
        if self.attempt < self.policy.max_attempts {
            let delay = self.policy.delay_for(self.attempt);
            self.attempt += 1;
            self.transition(ConnectionState::Reconnecting, effects);
            effects.push(Effect::ScheduleRetry(delay));
        } else {
            self.transition(ConnectionState::Error, effects);
            effects.push(Effect::NotifyFatal(SyncError::connection(format!(
                "stream unavailable after {} reconnect attempts: {error}",
                self.policy.max_attempts
            ))));
        }
    }

    fn transition(&mut self, next: ConnectionState, effects: &mut Vec<Effect>) {
        if self.state != next {
            self.state = next;
            effects.push(Effect::NotifyState(next));
        }
    }
}

#[cfg(test)]
#[path = "../tests/transport_machine_tests.rs"]
mod tests;
