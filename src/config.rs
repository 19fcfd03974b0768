use reqwest::Url;
use std::time::Duration;
use thiserror::Error;

use crate::models::DEFAULT_PAGE_SIZE;

/// Path of the STOMP-over-WebSocket endpoint on the backend origin.
pub const WS_PATH: &str = "/ws-chat";

const DEFAULT_HEARTBEAT_MS: u64 = 4000;
const DEFAULT_RECONNECT_DELAY_MS: u64 = 5000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("invalid URL in {var}: {reason}")]
    InvalidUrl { var: &'static str, reason: String },
    #[error("cannot derive a WebSocket URL from origin {0}")]
    UnsupportedScheme(String),
}

/// Settings for the chat connection and its REST collaborators.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Backend origin, e.g. `https://fans.example.com`.
    pub origin: Url,
    /// Explicit WebSocket endpoint; derived from `origin` when `None`.
    pub ws_url: Option<Url>,
    /// Base for REST calls; defaults to `origin`.
    pub api_base_url: Url,
    pub heartbeat_outgoing: Duration,
    pub heartbeat_incoming: Duration,
    pub reconnect_delay: Duration,
    pub connect_timeout: Duration,
    pub history_page_size: u32,
    /// Bearer credential sent in the STOMP CONNECT frame and on REST calls.
    pub access_token: Option<String>,
}

impl ChatConfig {
    pub fn new(origin: Url) -> Self {
        Self {
            api_base_url: origin.clone(),
            origin,
            ws_url: None,
            heartbeat_outgoing: Duration::from_millis(DEFAULT_HEARTBEAT_MS),
            heartbeat_incoming: Duration::from_millis(DEFAULT_HEARTBEAT_MS),
            reconnect_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            history_page_size: DEFAULT_PAGE_SIZE,
            access_token: None,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the environment, a map in tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let origin = lookup("CHAT_ORIGIN").ok_or(ConfigError::Missing("CHAT_ORIGIN"))?;
        let mut config = Self::new(parse_url("CHAT_ORIGIN", &origin)?);

        if let Some(ws) = lookup("CHAT_WS_URL") {
            config.ws_url = Some(parse_url("CHAT_WS_URL", &ws)?);
        }
        if let Some(api) = lookup("CHAT_API_URL") {
            config.api_base_url = parse_url("CHAT_API_URL", &api)?;
        }

        let heartbeat = parse_duration_ms(&lookup, "CHAT_HEARTBEAT_MS", DEFAULT_HEARTBEAT_MS);
        config.heartbeat_outgoing = heartbeat;
        config.heartbeat_incoming = heartbeat;
        config.reconnect_delay = parse_duration_ms(
            &lookup,
            "CHAT_RECONNECT_DELAY_MS",
            DEFAULT_RECONNECT_DELAY_MS,
        );
        config.connect_timeout = parse_duration_ms(
            &lookup,
            "CHAT_CONNECT_TIMEOUT_MS",
            DEFAULT_CONNECT_TIMEOUT_MS,
        );
        config.history_page_size = lookup("CHAT_PAGE_SIZE")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_PAGE_SIZE);
        config.access_token = lookup("CHAT_ACCESS_TOKEN").filter(|t| !t.is_empty());

        Ok(config)
    }

    /// The WebSocket endpoint: the explicit one, or the origin with its
    /// scheme switched to `ws`/`wss` and the path set to [`WS_PATH`].
    pub fn ws_endpoint(&self) -> Result<Url, ConfigError> {
        if let Some(url) = &self.ws_url {
            return Ok(url.clone());
        }

        let scheme = match self.origin.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
        };

        let mut url = self.origin.clone();
        url.set_scheme(scheme)
            .map_err(|_| ConfigError::UnsupportedScheme(self.origin.to_string()))?;
        url.set_path(WS_PATH);
        url.set_query(None);
        url.set_fragment(None);
        Ok(url)
    }
}

fn parse_url(var: &'static str, raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw).map_err(|e| ConfigError::InvalidUrl {
        var,
        reason: e.to_string(),
    })
}

fn parse_duration_ms<F>(lookup: &F, var: &str, default: u64) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    lookup(var)
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or_else(|| Duration::from_millis(default))
}
