use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use client_core::{Backoff, EngineConfig, ReconnectPolicy};
use serde::Deserialize;

pub const DEFAULT_CONFIG_FILE: &str = "presence.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub server_url: String,
    pub channel_url: Option<String>,
    pub poll_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub staleness_window_ms: u64,
    pub max_reconnect_attempts: u32,
    pub reconnect_backoff: Backoff,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8000".into(),
            channel_url: None,
            poll_interval_ms: 10_000,
            heartbeat_interval_ms: 30_000,
            staleness_window_ms: 10_000,
            max_reconnect_attempts: 10,
            reconnect_backoff: Backoff::Fixed,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    server_url: Option<String>,
    channel_url: Option<String>,
    poll_interval_ms: Option<u64>,
    heartbeat_interval_ms: Option<u64>,
    staleness_window_ms: Option<u64>,
    max_reconnect_attempts: Option<u32>,
    reconnect_backoff: Option<Backoff>,
}

impl Settings {
    fn apply_file(&mut self, file: FileSettings) {
        if let Some(v) = file.server_url {
            self.server_url = v;
        }
        if let Some(v) = file.channel_url {
            self.channel_url = Some(v);
        }
        if let Some(v) = file.poll_interval_ms {
            self.poll_interval_ms = v;
        }
        if let Some(v) = file.heartbeat_interval_ms {
            self.heartbeat_interval_ms = v;
        }
        if let Some(v) = file.staleness_window_ms {
            self.staleness_window_ms = v;
        }
        if let Some(v) = file.max_reconnect_attempts {
            self.max_reconnect_attempts = v;
        }
        if let Some(v) = file.reconnect_backoff {
            self.reconnect_backoff = v;
        }
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("PRESENCE_SERVER_URL") {
            self.server_url = v;
        }
        if let Some(v) = var("APP__SERVER_URL") {
            self.server_url = v;
        }
        if let Some(v) = var("APP__CHANNEL_URL") {
            self.channel_url = Some(v);
        }
        if let Some(v) = var("APP__POLL_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            self.poll_interval_ms = v;
        }
        if let Some(v) = var("APP__HEARTBEAT_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            self.heartbeat_interval_ms = v;
        }
        if let Some(v) = var("APP__STALENESS_WINDOW_MS").and_then(|v| v.parse().ok()) {
            self.staleness_window_ms = v;
        }
        if let Some(v) = var("APP__MAX_RECONNECT_ATTEMPTS").and_then(|v| v.parse().ok()) {
            self.max_reconnect_attempts = v;
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            server_url: self.server_url.clone(),
            channel_url: self.channel_url.clone(),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            staleness_window: Duration::from_millis(self.staleness_window_ms),
            reconnect: ReconnectPolicy {
                max_attempts: self.max_reconnect_attempts,
                backoff: self.reconnect_backoff,
                ..ReconnectPolicy::default()
            },
            ..EngineConfig::default()
        }
    }
}

/// Defaults, then the TOML file, then environment overrides. An explicit
/// `path` must exist; the default file is optional.
pub fn load_settings(path: Option<&Path>) -> anyhow::Result<Settings> {
    let mut settings = Settings::default();

    let raw = match path {
        Some(path) => Some(
            fs::read_to_string(path)
                .with_context(|| format!("failed to read config file '{}'", path.display()))?,
        ),
        None => fs::read_to_string(DEFAULT_CONFIG_FILE).ok(),
    };
    if let Some(raw) = raw {
        let file: FileSettings = toml::from_str(&raw).context("invalid presence config")?;
        settings.apply_file(file);
    }

    settings.apply_env(|key| std::env::var(key).ok());
    Ok(settings)
}
