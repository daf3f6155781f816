use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::{header::RETRY_AFTER, redirect, Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::{Message, MessageId, Session, SessionId},
    error::ApiError,
    protocol::{
        CreateSessionRequest, MessagePage, PageQuery, SendMessageRequest, SessionListPage,
        SessionUpdate,
    },
};
use tracing::{debug, warn};
use url::Url;

use crate::{
    auth::AuthProvider,
    config::RetryPolicy,
    error::{SyncError, SyncResult},
};

/// REST collaborator for session and message resources.
#[async_trait]
pub trait SessionApi: Send + Sync {
    async fn fetch_session(&self, session_id: &SessionId) -> SyncResult<Session>;
    async fn list_sessions(&self, page: PageQuery) -> SyncResult<SessionListPage>;
    async fn create_session(&self, request: CreateSessionRequest) -> SyncResult<Session>;
    async fn update_session(
        &self,
        session_id: &SessionId,
        update: SessionUpdate,
    ) -> SyncResult<Session>;
    async fn delete_session(&self, session_id: &SessionId) -> SyncResult<()>;
    async fn fetch_messages(&self, session_id: &SessionId, page: PageQuery)
        -> SyncResult<MessagePage>;
    async fn fetch_message(
        &self,
        session_id: &SessionId,
        message_id: &MessageId,
    ) -> SyncResult<Message>;
    async fn send_message(
        &self,
        session_id: &SessionId,
        request: SendMessageRequest,
    ) -> SyncResult<Session>;
}

pub struct HttpSessionApi {
    http: Client,
    base_url: Url,
    auth: Arc<dyn AuthProvider>,
    retry: RetryPolicy,
}

impl HttpSessionApi {
    pub fn new(
        base_url: &str,
        auth: Arc<dyn AuthProvider>,
        request_timeout: Duration,
        retry: RetryPolicy,
    ) -> SyncResult<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|err| SyncError::validation(format!("invalid api base url: {err}")))?;
        if base_url.cannot_be_a_base() {
            return Err(SyncError::validation("api base url cannot carry a path"));
        }
        // 307/308 are followed once; reqwest re-sends the body for both.
        let http = Client::builder()
            .timeout(request_timeout)
            .redirect(redirect::Policy::limited(1))
            .build()
            .map_err(|err| SyncError::connection(format!("failed to build http client: {err}")))?;
        Ok(Self {
            http,
            base_url,
            auth,
            retry,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn execute(&self, build: impl Fn(&Client) -> RequestBuilder) -> SyncResult<Response> {
        let mut refreshed = false;
        let mut transient_attempts = 0u32;
        let mut rate_limit_attempts = 0u32;

        loop {
            let mut request = build(&self.http);
            if let Some(token) = self.auth.bearer_token().await? {
                request = request.bearer_auth(token);
            }

            let error = match request.send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => error_from_response(response).await,
                Err(err) => SyncError::from(err),
            };

            match &error {
                SyncError::Auth(_) if !refreshed => {
                    refreshed = true;
                    debug!("api: 401 received; refreshing credential before one retry");
                    if let Err(refresh_err) = self.auth.refresh().await {
                        warn!(error = %refresh_err, "api: credential refresh failed");
                        return Err(error);
                    }
                }
                SyncError::RateLimited { retry_after, .. }
                    if rate_limit_attempts < self.retry.max_rate_limit_retries =>
                {
                    let delay = retry_after.unwrap_or_else(|| self.retry.backoff(rate_limit_attempts));
                    rate_limit_attempts += 1;
                    warn!(
                        attempt = rate_limit_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "api: rate limited; backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                _ if error.is_retryable()
                    && !error.is_service_busy()
                    && transient_attempts < self.retry.max_server_retries =>
                {
                    let delay = self.retry.backoff(transient_attempts);
                    transient_attempts += 1;
                    warn!(
                        attempt = transient_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "api: transient failure; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                _ => return Err(error),
            }
        }
    }

    async fn execute_json<T: DeserializeOwned>(
        &self,
        build: impl Fn(&Client) -> RequestBuilder,
    ) -> SyncResult<T> {
        let response = self.execute(build).await?;
        let body = response.bytes().await.map_err(SyncError::from)?;
        Ok(serde_json::from_slice(&body)?)
    }
}

pub(crate) async fn error_from_response(response: Response) -> SyncError {
    let status = response.status().as_u16();
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = match response.bytes().await {
        Ok(bytes) => serde_json::from_slice::<ApiError>(&bytes).ok(),
        Err(_) => None,
    };
    SyncError::from_status(status, body, retry_after)
}

#[async_trait]
impl SessionApi for HttpSessionApi {
    async fn fetch_session(&self, session_id: &SessionId) -> SyncResult<Session> {
        let url = self.endpoint(&["sessions", session_id.as_str()]);
        self.execute_json(|http| http.get(url.clone())).await
    }

    async fn list_sessions(&self, page: PageQuery) -> SyncResult<SessionListPage> {
        let url = self.endpoint(&["sessions"]);
        self.execute_json(|http| http.get(url.clone()).query(&page))
            .await
    }

    async fn create_session(&self, request: CreateSessionRequest) -> SyncResult<Session> {
        let url = self.endpoint(&["sessions"]);
        self.execute_json(|http| http.post(url.clone()).json(&request))
            .await
    }

    async fn update_session(
        &self,
        session_id: &SessionId,
        update: SessionUpdate,
    ) -> SyncResult<Session> {
        let url = self.endpoint(&["sessions", session_id.as_str()]);
        self.execute_json(|http| http.patch(url.clone()).json(&update))
            .await
    }

    async fn delete_session(&self, session_id: &SessionId) -> SyncResult<()> {
        let url = self.endpoint(&["sessions", session_id.as_str()]);
        self.execute(|http| http.delete(url.clone())).await?;
        Ok(())
    }

    async fn fetch_messages(
        &self,
        session_id: &SessionId,
        page: PageQuery,
    ) -> SyncResult<MessagePage> {
        let url = self.endpoint(&["sessions", session_id.as_str(), "messages"]);
        self.execute_json(|http| http.get(url.clone()).query(&page))
            .await
    }

    async fn fetch_message(
        &self,
        session_id: &SessionId,
        message_id: &MessageId,
    ) -> SyncResult<Message> {
        let url = self.endpoint(&[
            "sessions",
            session_id.as_str(),
            "messages",
            message_id.as_str(),
        ]);
        self.execute_json(|http| http.get(url.clone())).await
    }

    async fn send_message(
        &self,
        session_id: &SessionId,
        request: SendMessageRequest,
    ) -> SyncResult<Session> {
        let url = self.endpoint(&["sessions", session_id.as_str(), "messages"]);
        self.execute_json(|http| http.post(url.clone()).json(&request))
            .await
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
