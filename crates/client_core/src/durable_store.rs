use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use storage::Storage;
use tracing::{info, warn};

use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone, PartialEq)]
pub struct DurableRecord {
    pub key: String,
    pub payload: serde_json::Value,
    pub written_at: DateTime<Utc>,
}

/// Warm-start side store for the cache. Implementations may fail freely; the
/// cache downgrades every failure to a logged miss.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn write(
        &self,
        namespace: &str,
        key: &str,
        payload: serde_json::Value,
        written_at: DateTime<Utc>,
    ) -> SyncResult<()>;
    async fn load_namespace(&self, namespace: &str) -> SyncResult<Vec<DurableRecord>>;
    async fn remove(&self, key: &str) -> SyncResult<()>;
    async fn remove_prefix(&self, prefix: &str) -> SyncResult<()>;
    /// Drops records written before `cutoff`; returns how many went.
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> SyncResult<u64>;
}

/// Used when no durable store is configured or it failed to open.
pub struct MissingDurableStore;

#[async_trait]
impl DurableStore for MissingDurableStore {
    async fn write(
        &self,
        _namespace: &str,
        _key: &str,
        _payload: serde_json::Value,
        _written_at: DateTime<Utc>,
    ) -> SyncResult<()> {
        Ok(())
    }

    async fn load_namespace(&self, _namespace: &str) -> SyncResult<Vec<DurableRecord>> {
        Ok(Vec::new())
    }

    async fn remove(&self, _key: &str) -> SyncResult<()> {
        Ok(())
    }

    async fn remove_prefix(&self, _prefix: &str) -> SyncResult<()> {
        Ok(())
    }

    async fn purge_older_than(&self, _cutoff: DateTime<Utc>) -> SyncResult<u64> {
        Ok(0)
    }
}

fn storage_error(err: anyhow::Error) -> SyncError {
    SyncError::Storage(format!("{err:#}"))
}

#[async_trait]
impl DurableStore for Storage {
    async fn write(
        &self,
        namespace: &str,
        key: &str,
        payload: serde_json::Value,
        written_at: DateTime<Utc>,
    ) -> SyncResult<()> {
        self.put_cache_entry(key, namespace, &payload, written_at)
            .await
            .map_err(storage_error)
    }

    async fn load_namespace(&self, namespace: &str) -> SyncResult<Vec<DurableRecord>> {
        let entries = self
            .list_cache_entries(namespace)
            .await
            .map_err(storage_error)?;
        Ok(entries
            .into_iter()
            .map(|entry| DurableRecord {
                key: entry.key,
                payload: entry.payload,
                written_at: entry.written_at,
            })
            .collect())
    }

    async fn remove(&self, key: &str) -> SyncResult<()> {
        self.delete_cache_entry(key)
            .await
            .map(|_| ())
            .map_err(storage_error)
    }

    async fn remove_prefix(&self, prefix: &str) -> SyncResult<()> {
        self.delete_cache_prefix(prefix)
            .await
            .map(|_| ())
            .map_err(storage_error)
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> SyncResult<u64> {
        Storage::purge_older_than(self, cutoff)
            .await
            .map_err(storage_error)
    }
}

/// Opens the sqlite mirror, falling back to [`MissingDurableStore`] when it
/// cannot be opened.
pub async fn open_durable_store(database_url: Option<&str>) -> Arc<dyn DurableStore> {
    let Some(database_url) = database_url else {
        return Arc::new(MissingDurableStore);
    };
    let opened = match Storage::new(database_url).await {
        Ok(storage) => storage.health_check().await.map(|()| storage),
        Err(err) => Err(err),
    };
    match opened {
        Ok(storage) => {
            info!(database_url, "cache: durable mirror opened");
            Arc::new(storage)
        }
        Err(err) => {
            warn!(
                database_url,
                error = %format!("{err:#}"),
                "cache: durable mirror unavailable; using memory only"
            );
            Arc::new(MissingDurableStore)
        }
    }
}
