use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;
use url::Url;

use crate::{
    backoff::BackoffPolicy,
    error::{ClientError, ClientResult},
};

pub const DEFAULT_CONFIG_FILE: &str = "chat_client.toml";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub base_url: String,
    pub ws_url: Option<String>,
    pub api_key: String,
    pub user_id: Option<String>,
    pub token: Option<String>,
    pub health_check_interval_secs: u64,
    pub monitor_interval_ms: u64,
    /// Silence tolerated before the monitor declares the socket dead.
    /// Defaults to twice the health-check interval.
    pub silence_threshold_secs: Option<u64>,
    pub connect_timeout_secs: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub typing_timeout_secs: u64,
    pub typing_sweep_interval_ms: u64,
    pub max_sync_gap_days: i64,
    pub latest_reactions_limit: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:3030".into(),
            ws_url: None,
            api_key: "dev-key".into(),
            user_id: None,
            token: None,
            health_check_interval_secs: 30,
            monitor_interval_ms: 1000,
            silence_threshold_secs: None,
            connect_timeout_secs: 10,
            backoff_base_ms: 250,
            backoff_max_ms: 25_000,
            typing_timeout_secs: 7,
            typing_sweep_interval_ms: 500,
            max_sync_gap_days: 30,
            latest_reactions_limit: 10,
        }
    }
}

impl ClientSettings {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs.max(1))
    }

    pub fn silence_threshold(&self) -> Duration {
        match self.silence_threshold_secs {
            Some(secs) => Duration::from_secs(secs.max(1)),
            None => self.health_check_interval() * 2,
        }
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms.max(10))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
    }

    pub fn typing_timeout(&self) -> Duration {
        Duration::from_secs(self.typing_timeout_secs)
    }

    pub fn typing_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.typing_sweep_interval_ms.max(10))
    }

    pub fn max_sync_gap(&self) -> chrono::Duration {
        chrono::Duration::days(self.max_sync_gap_days)
    }

    /// Websocket endpoint, derived from `base_url` unless set explicitly.
    pub fn websocket_url(&self) -> ClientResult<Url> {
        let raw = match &self.ws_url {
            Some(ws_url) => ws_url.clone(),
            None => {
                let base = self.base_url.trim_end_matches('/');
                let ws_base = if let Some(rest) = base.strip_prefix("https://") {
                    format!("wss://{rest}")
                } else if let Some(rest) = base.strip_prefix("http://") {
                    format!("ws://{rest}")
                } else {
                    return Err(ClientError::Config(
                        "base_url must start with http:// or https://".to_string(),
                    ));
                };
                format!("{ws_base}/connect")
            }
        };
        let url = Url::parse(&raw)
            .map_err(|err| ClientError::Config(format!("invalid websocket url '{raw}': {err}")))?;
        match url.scheme() {
            "ws" | "wss" => Ok(url),
            other => Err(ClientError::Config(format!(
                "websocket url must use ws:// or wss://, got {other}://"
            ))),
        }
    }

    pub fn rest_url(&self) -> ClientResult<Url> {
        Url::parse(self.base_url.trim_end_matches('/'))
            .map_err(|err| ClientError::Config(format!("invalid base_url: {err}")))
    }
}

pub fn load_settings() -> anyhow::Result<ClientSettings> {
    let path =
        std::env::var("CHAT_CLIENT_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
    let mut settings = load_settings_file(Path::new(&path))?;
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

/// A missing file yields the defaults; a malformed one is an error.
pub fn load_settings_file(path: &Path) -> anyhow::Result<ClientSettings> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(ClientSettings::default())
        }
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read '{}'", path.display()))
        }
    };
    toml::from_str(&raw).with_context(|| format!("failed to parse '{}'", path.display()))
}

pub fn apply_env_overrides(settings: &mut ClientSettings, lookup: impl Fn(&str) -> Option<String>) {
    let var = |plain: &str, namespaced: &str| lookup(namespaced).or_else(|| lookup(plain));

    if let Some(v) = var("CHAT_BASE_URL", "APP__BASE_URL") {
        settings.base_url = v;
    }
    if let Some(v) = var("CHAT_WS_URL", "APP__WS_URL") {
        settings.ws_url = Some(v);
    }
    if let Some(v) = var("CHAT_API_KEY", "APP__API_KEY") {
        settings.api_key = v;
    }
    if let Some(v) = var("CHAT_USER_ID", "APP__USER_ID") {
        settings.user_id = Some(v);
    }
    if let Some(v) = var("CHAT_TOKEN", "APP__TOKEN") {
        settings.token = Some(v);
    }
    if let Some(v) = var("CHAT_HEALTH_CHECK_INTERVAL_SECS", "APP__HEALTH_CHECK_INTERVAL_SECS") {
        if let Ok(parsed) = v.parse() {
            settings.health_check_interval_secs = parsed;
        }
    }
    if let Some(v) = var("CHAT_SILENCE_THRESHOLD_SECS", "APP__SILENCE_THRESHOLD_SECS") {
        if let Ok(parsed) = v.parse() {
            settings.silence_threshold_secs = Some(parsed);
        }
    }
    if let Some(v) = var("CHAT_BACKOFF_MAX_MS", "APP__BACKOFF_MAX_MS") {
        if let Ok(parsed) = v.parse() {
            settings.backoff_max_ms = parsed;
        }
    }
    if let Some(v) = var("CHAT_CONNECT_TIMEOUT_SECS", "APP__CONNECT_TIMEOUT_SECS") {
        if let Ok(parsed) = v.parse() {
            settings.connect_timeout_secs = parsed;
        }
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
