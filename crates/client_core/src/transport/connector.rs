use std::{future::ready, sync::Arc, time::Duration};

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{stream::BoxStream, StreamExt};
use reqwest::{header::ACCEPT, Client, StatusCode};
use shared::{domain::SessionId, protocol::SocketEnvelope};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
        Error as WsError, Message as WsMessage,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, warn};
use url::Url;

use crate::{
    api::error_from_response,
    auth::AuthProvider,
    error::{SyncError, SyncResult},
};

/// One named event as it came off the wire, not yet decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    pub event: String,
    pub data: String,
}

impl StreamFrame {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
        }
    }

    fn from_envelope(envelope: SocketEnvelope) -> Self {
        let (event, data) = envelope.into_frame();
        Self { event, data }
    }
}

pub type FrameStream = BoxStream<'static, SyncResult<StreamFrame>>;

/// Opens the push stream for one session. The returned stream ends when the
/// server closes the connection.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn open(&self, session_id: &SessionId) -> SyncResult<FrameStream>;
}

/// `{base}/sessions/{id}/stream`
pub fn stream_url(base_url: &Url, session_id: &SessionId) -> Url {
    let mut url = base_url.clone();
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty()
            .extend(["sessions", session_id.as_str(), "stream"]);
    }
    url
}

fn parse_base_url(raw: &str) -> SyncResult<Url> {
    let url = Url::parse(raw)
        .map_err(|err| SyncError::validation(format!("invalid stream base url: {err}")))?;
    if url.cannot_be_a_base() {
        return Err(SyncError::validation("stream base url cannot carry a path"));
    }
    Ok(url)
}

/// Server-sent events over a long-lived reqwest response.
pub struct SseConnector {
    http: Client,
    base_url: Url,
    auth: Arc<dyn AuthProvider>,
}

impl SseConnector {
    pub fn new(
        base_url: &str,
        auth: Arc<dyn AuthProvider>,
        connect_timeout: Duration,
    ) -> SyncResult<Self> {
        let base_url = parse_base_url(base_url)?;
        // No overall timeout: the response body is the stream itself.
        let http = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|err| SyncError::connection(format!("failed to build http client: {err}")))?;
        Ok(Self {
            http,
            base_url,
            auth,
        })
    }
}

#[async_trait]
impl StreamConnector for SseConnector {
    async fn open(&self, session_id: &SessionId) -> SyncResult<FrameStream> {
        let url = stream_url(&self.base_url, session_id);
        let mut refreshed = false;

        loop {
            let mut request = self
                .http
                .get(url.clone())
                .header(ACCEPT, "text/event-stream");
            if let Some(token) = self.auth.bearer_token().await? {
                request = request.bearer_auth(token);
            }

            let response = request.send().await?;
            if response.status() == StatusCode::UNAUTHORIZED && !refreshed {
                refreshed = true;
                debug!(session_id = %session_id, "stream: 401 on open; refreshing credential");
                self.auth.refresh().await?;
                continue;
            }
            if !response.status().is_success() {
                return Err(error_from_response(response).await);
            }

            let frames = response
                .bytes_stream()
                .eventsource()
                .filter_map(|item| {
                    ready(match item {
                        Ok(event) => sse_frame(event.event, event.data),
                        Err(err) => Some(Err(SyncError::connection(format!(
                            "event stream failed: {err}"
                        )))),
                    })
                });
            return Ok(frames.boxed());
        }
    }
}

/// Unnamed SSE events arrive as `message`; those may wrap a socket envelope.
fn sse_frame(event: String, data: String) -> Option<SyncResult<StreamFrame>> {
    if event.is_empty() || event == "message" {
        return match serde_json::from_str::<SocketEnvelope>(&data) {
            Ok(envelope) => Some(Ok(StreamFrame::from_envelope(envelope))),
            Err(_) => {
                debug!("stream: unnamed event without envelope skipped");
                None
            }
        };
    }
    Some(Ok(StreamFrame { event, data }))
}

/// JSON text frames `{"event": .., "data": ..}` over a websocket.
pub struct WebSocketConnector {
    base_url: Url,
    auth: Arc<dyn AuthProvider>,
}

impl WebSocketConnector {
    /// Accepts an http(s) or ws(s) base; http maps to ws and https to wss.
    pub fn new(base_url: &str, auth: Arc<dyn AuthProvider>) -> SyncResult<Self> {
        let mut base_url = parse_base_url(base_url)?;
        let scheme = match base_url.scheme() {
            "https" | "wss" => "wss",
            "http" | "ws" => "ws",
            other => {
                return Err(SyncError::validation(format!(
                    "unsupported stream scheme: {other}"
                )))
            }
        };
        if base_url.set_scheme(scheme).is_err() {
            return Err(SyncError::validation("stream base url rejected websocket scheme"));
        }
        Ok(Self { base_url, auth })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }
}

#[async_trait]
impl StreamConnector for WebSocketConnector {
    async fn open(&self, session_id: &SessionId) -> SyncResult<FrameStream> {
        let url = stream_url(&self.base_url, session_id);
        let mut refreshed = false;

        loop {
            let mut request = url
                .as_str()
                .into_client_request()
                .map_err(|err| SyncError::validation(format!("invalid stream url: {err}")))?;
            if let Some(token) = self.auth.bearer_token().await? {
                let value = HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|_| SyncError::Auth("bearer token is not a valid header".into()))?;
                request.headers_mut().insert(AUTHORIZATION, value);
            }

            match connect_async(request).await {
                Ok((socket, _)) => return Ok(socket_frames(socket)),
                Err(WsError::Http(response))
                    if response.status().as_u16() == 401 && !refreshed =>
                {
                    refreshed = true;
                    debug!(session_id = %session_id, "stream: 401 on websocket open; refreshing credential");
                    self.auth.refresh().await?;
                }
                Err(WsError::Http(response)) => {
                    return Err(SyncError::from_status(
                        response.status().as_u16(),
                        None,
                        None,
                    ))
                }
                Err(err) => {
                    return Err(SyncError::connection(format!(
                        "websocket connect failed: {err}"
                    )))
                }
            }
        }
    }
}

fn socket_frames(socket: WebSocketStream<MaybeTlsStream<TcpStream>>) -> FrameStream {
    socket
        .take_while(|message| ready(!matches!(message, Ok(WsMessage::Close(_)))))
        .filter_map(|message| {
            ready(match message {
                Ok(WsMessage::Text(text)) => match serde_json::from_str::<SocketEnvelope>(&text) {
                    Ok(envelope) => Some(Ok(StreamFrame::from_envelope(envelope))),
                    Err(err) => {
                        warn!(error = %err, "stream: unparsable socket frame skipped");
                        None
                    }
                },
                Ok(_) => None,
                Err(err) => Some(Err(SyncError::connection(format!(
                    "websocket receive failed: {err}"
                )))),
            })
        })
        .boxed()
}

#[cfg(test)]
#[path = "../tests/transport_connector_tests.rs"]
mod tests;
