use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use tracing::warn;

use crate::error::{SyncError, SyncResult};

const ENV_PREFIX: &str = "RESEARCH_SYNC__";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StreamTransportKind {
    #[default]
    Sse,
    Websocket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub heartbeat_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
            heartbeat_timeout: Duration::from_secs(35),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// `min(base * 2^attempt, max)`, with `attempt` counted from zero.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_server_retries: u32,
    pub max_rate_limit_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_server_retries: 3,
            max_rate_limit_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// Engine settings. Every field has a default so a TOML file may set any subset.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub api_base_url: String,
    pub stream_base_url: Option<String>,
    pub stream_transport: StreamTransportKind,
    pub durable_cache_url: Option<String>,
    pub session_ttl_secs: u64,
    pub session_list_ttl_secs: u64,
    pub message_ttl_secs: u64,
    pub message_page_ttl_secs: u64,
    pub sensitive_fields: Vec<String>,
    pub request_timeout_secs: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub reconnect_max_attempts: u32,
    pub heartbeat_timeout_secs: u64,
    pub max_server_retries: u32,
    pub max_rate_limit_retries: u32,
    pub poll_interval_secs: u64,
    pub max_poll_failures: u32,
    pub message_page_size: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:8000/api".into(),
            stream_base_url: None,
            stream_transport: StreamTransportKind::Sse,
            durable_cache_url: None,
            session_ttl_secs: 300,
            session_list_ttl_secs: 300,
            message_ttl_secs: 300,
            message_page_ttl_secs: 300,
            sensitive_fields: Vec::new(),
            request_timeout_secs: 30,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            reconnect_max_attempts: 5,
            heartbeat_timeout_secs: 35,
            max_server_retries: 3,
            max_rate_limit_retries: 3,
            poll_interval_secs: 5,
            max_poll_failures: 3,
            message_page_size: 50,
        }
    }
}

impl SyncSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn stream_base_url(&self) -> &str {
        self.stream_base_url.as_deref().unwrap_or(&self.api_base_url)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            max_attempts: self.reconnect_max_attempts,
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout_secs),
            connect_timeout: self.request_timeout(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_server_retries: self.max_server_retries,
            max_rate_limit_retries: self.max_rate_limit_retries,
            ..RetryPolicy::default()
        }
    }

    pub fn validate(&self) -> SyncResult<()> {
        if !self.api_base_url.starts_with("http://") && !self.api_base_url.starts_with("https://")
        {
            return Err(SyncError::validation(
                "api_base_url must start with http:// or https://",
            ));
        }
        if self.reconnect_base_delay_ms == 0 || self.reconnect_max_delay_ms == 0 {
            return Err(SyncError::validation("reconnect delays must be positive"));
        }
        if self.poll_interval_secs == 0 {
            return Err(SyncError::validation("poll_interval_secs must be positive"));
        }
        Ok(())
    }
}

/// Defaults, then the optional TOML file, then `RESEARCH_SYNC__*` env overrides.
pub fn load_settings(path: Option<&Path>) -> SyncSettings {
    let mut settings = path
        .and_then(|path| match fs::read_to_string(path) {
            Ok(raw) => Some((path, raw)),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "settings file unreadable; using defaults");
                None
            }
        })
        .and_then(|(path, raw)| match toml::from_str::<SyncSettings>(&raw) {
            Ok(parsed) => Some(parsed),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "settings file invalid; using defaults");
                None
            }
        })
        .unwrap_or_default();

    apply_env_overrides(&mut settings, |name| std::env::var(name).ok());
    settings
}

fn apply_env_overrides(settings: &mut SyncSettings, lookup: impl Fn(&str) -> Option<String>) {
    let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

    if let Some(v) = var("API_BASE_URL") {
        settings.api_base_url = v;
    }
    if let Some(v) = var("STREAM_BASE_URL") {
        settings.stream_base_url = Some(v);
    }
    if let Some(v) = var("STREAM_TRANSPORT") {
        match v.to_ascii_lowercase().as_str() {
            "sse" => settings.stream_transport = StreamTransportKind::Sse,
            "websocket" | "ws" => settings.stream_transport = StreamTransportKind::Websocket,
            other => warn!(value = other, "unknown stream transport override ignored"),
        }
    }
    if let Some(v) = var("DURABLE_CACHE_URL") {
        settings.durable_cache_url = Some(v);
    }
    if let Some(v) = var("SENSITIVE_FIELDS") {
        settings.sensitive_fields = v
            .split(',')
            .map(str::trim)
            .filter(|field| !field.is_empty())
            .map(str::to_string)
            .collect();
    }

    macro_rules! parsed_override {
        ($name:literal, $field:ident) => {
            if let Some(v) = var($name) {
                match v.parse() {
                    Ok(parsed) => settings.$field = parsed,
                    Err(_) => warn!(variable = $name, value = %v, "non-numeric override ignored"),
                }
            }
        };
    }

    parsed_override!("SESSION_TTL_SECS", session_ttl_secs);
    parsed_override!("SESSION_LIST_TTL_SECS", session_list_ttl_secs);
    parsed_override!("MESSAGE_TTL_SECS", message_ttl_secs);
    parsed_override!("MESSAGE_PAGE_TTL_SECS", message_page_ttl_secs);
    parsed_override!("REQUEST_TIMEOUT_SECS", request_timeout_secs);
    parsed_override!("RECONNECT_BASE_DELAY_MS", reconnect_base_delay_ms);
    parsed_override!("RECONNECT_MAX_DELAY_MS", reconnect_max_delay_ms);
    parsed_override!("RECONNECT_MAX_ATTEMPTS", reconnect_max_attempts);
    parsed_override!("HEARTBEAT_TIMEOUT_SECS", heartbeat_timeout_secs);
    parsed_override!("POLL_INTERVAL_SECS", poll_interval_secs);
    parsed_override!("MAX_POLL_FAILURES", max_poll_failures);
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
