use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{SyncError, SyncResult};

/// Supplies bearer credentials. The engine never inspects tokens; on a 401 it
/// asks for one refresh and retries once.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn bearer_token(&self) -> SyncResult<Option<String>>;
    async fn refresh(&self) -> SyncResult<()>;
}

pub struct AnonymousAuth;

#[async_trait]
impl AuthProvider for AnonymousAuth {
    async fn bearer_token(&self) -> SyncResult<Option<String>> {
        Ok(None)
    }

    async fn refresh(&self) -> SyncResult<()> {
        Err(SyncError::Auth("no credential provider configured".into()))
    }
}

/// Fixed token, replaceable at runtime by the embedding application.
pub struct StaticTokenAuth {
    token: RwLock<String>,
}

impl StaticTokenAuth {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(token.into()),
        }
    }

    pub async fn replace(&self, token: impl Into<String>) {
        *self.token.write().await = token.into();
    }
}

#[async_trait]
impl AuthProvider for StaticTokenAuth {
    async fn bearer_token(&self) -> SyncResult<Option<String>> {
        Ok(Some(self.token.read().await.clone()))
    }

    async fn refresh(&self) -> SyncResult<()> {
        Err(SyncError::Auth("static token cannot be refreshed".into()))
    }
}
