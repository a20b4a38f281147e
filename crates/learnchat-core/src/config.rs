//! Client configuration
//!
//! A single base API URL drives both endpoints: the REST origin is the URL
//! itself and the socket origin is the URL with a trailing `/api` removed.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Environment variable holding the backend API URL
pub const API_URL_ENV: &str = "LEARNCHAT_API_URL";

/// API URL used when nothing is configured
pub const DEFAULT_API_URL: &str = "http://localhost:3001/api";

/// Reconnection policy for the persistent connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectPolicy {
    /// Reconnection attempts allowed before giving up
    pub max_attempts: u32,
    /// Attempt `n` waits `n * base_delay_ms` before connecting
    pub base_delay_ms: u64,
    /// How long a reconnection attempt may take to complete its handshake
    pub settle_window_ms: u64,
    /// Reconnect in the background after a failed connect or a dropped link
    pub auto_reconnect: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
            settle_window_ms: 2000,
            auto_reconnect: true,
        }
    }
}

impl ReconnectPolicy {
    /// Backoff before the given (1-based) attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms.saturating_mul(u64::from(attempt)))
    }

    pub fn settle_window(&self) -> Duration {
        Duration::from_millis(self.settle_window_ms)
    }
}

/// Configuration for a chat client session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    pub api_url: String,
    pub reconnect: ReconnectPolicy,
    pub handshake_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            reconnect: ReconnectPolicy::default(),
            handshake_timeout_ms: 20_000,
            request_timeout_ms: 60_000,
        }
    }
}

impl ClientConfig {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            ..Default::default()
        }
    }

    /// Build a config from `LEARNCHAT_API_URL`, keeping defaults otherwise
    pub fn from_env() -> Self {
        match std::env::var(API_URL_ENV) {
            Ok(url) if !url.trim().is_empty() => Self::new(url.trim()),
            _ => Self::default(),
        }
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Check that the API URL is usable
    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.api_url)?;
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(Error::Config(format!(
                    "unsupported API URL scheme: {}",
                    other
                )))
            }
        }
        if url.host_str().is_none() {
            return Err(Error::Config("API URL has no host".to_string()));
        }
        if self.reconnect.max_attempts == 0 {
            return Err(Error::Config(
                "reconnect.maxAttempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// REST base URL without a trailing slash
    pub fn api_base(&self) -> String {
        self.api_url.trim_end_matches('/').to_string()
    }

    /// Origin of the socket server (`/api` suffix removed)
    pub fn socket_origin(&self) -> String {
        let base = self.api_base();
        match base.strip_suffix("/api") {
            Some(origin) => origin.to_string(),
            None => base,
        }
    }

    /// Engine.IO WebSocket endpoint for the socket server
    pub fn socket_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.socket_origin())?;
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme)
            .map_err(|_| Error::Config(format!("cannot use {} for a socket URL", scheme)))?;
        url.set_path("/socket.io/");
        url.set_query(Some("EIO=4&transport=websocket"));
        Ok(url)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
