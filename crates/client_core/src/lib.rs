//! Client-side synchronization engine for research sessions.
//!
//! [`SessionSynchronizer`] is the entry point. It keeps one canonical copy of
//! the active session, fed by REST loads, optimistic mutations, and a push
//! stream that falls back to polling when the stream is unavailable.

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod durable_store;
pub mod error;
pub mod merge;
pub mod optimistic;
pub mod synchronizer;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use api::{HttpSessionApi, SessionApi};
pub use auth::{AnonymousAuth, AuthProvider, StaticTokenAuth};
pub use cache::{CacheKey, CacheNamespace, CachePolicy, ResourceCache, SyncCache};
pub use config::{load_settings, ReconnectPolicy, RetryPolicy, StreamTransportKind, SyncSettings};
pub use durable_store::{open_durable_store, DurableRecord, DurableStore, MissingDurableStore};
pub use error::{SyncError, SyncResult};
pub use optimistic::{Mutation, OptimisticUpdate};
pub use synchronizer::{SessionSynchronizer, SyncEvent};
pub use transport::{ConnectionState, Transport, TransportHandler};
