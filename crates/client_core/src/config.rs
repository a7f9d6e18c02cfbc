use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff: Backoff,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff: Backoff::Fixed,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the zero-based `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.base_delay.min(self.max_delay),
            Backoff::Exponential => {
                let factor = 2u32.saturating_pow(attempt);
                self.base_delay.saturating_mul(factor).min(self.max_delay)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub server_url: String,
    /// Duplex endpoint. Derived from `server_url` when unset.
    pub channel_url: Option<String>,
    pub staleness_window: Duration,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub dedup_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8000".into(),
            channel_url: None,
            staleness_window: Duration::from_secs(10),
            poll_interval: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
            dedup_capacity: 4096,
        }
    }
}

impl EngineConfig {
    pub fn with_server_url(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }

    pub fn rest_base_url(&self) -> Result<Url, SyncError> {
        Url::parse(self.server_url.trim_end_matches('/')).map_err(|err| {
            SyncError::Connection(format!("invalid server url {}: {err}", self.server_url))
        })
    }

    pub fn resolved_channel_url(&self) -> Result<Url, SyncError> {
        if let Some(raw) = &self.channel_url {
            return Url::parse(raw)
                .map_err(|err| SyncError::Connection(format!("invalid channel url {raw}: {err}")));
        }

        let mut url = self.rest_base_url()?;
        let scheme = match url.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => {
                return Err(SyncError::Connection(format!(
                    "server_url must start with http:// or https://, got {other}://"
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| SyncError::Connection("failed to derive websocket scheme".into()))?;
        url.path_segments_mut()
            .map_err(|_| SyncError::Connection("server url cannot be a base".into()))?
            .pop_if_empty()
            .push("ws");
        Ok(url)
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
