use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use tracing::warn;
use url::Url;

use crate::error::{ChatError, Result};

pub const DEFAULT_SETTINGS_FILE: &str = "client.toml";
const STORAGE_DIR_NAME: &str = "livestock-chat";
const STORAGE_FILE_NAME: &str = "session.json";

#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    pub api_base_url: String,
    pub realtime_url: String,
    pub request_timeout: Duration,
    pub storage_path: PathBuf,
    pub outbound_queue_capacity: usize,
    pub reconnect: ReconnectPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Delay before the given zero-based attempt: doubles each time, capped.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 8,
        }
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:3000".into(),
            realtime_url: "ws://127.0.0.1:3000/realtime".into(),
            request_timeout: Duration::from_secs(15),
            storage_path: default_storage_path(),
            outbound_queue_capacity: 64,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    api_base_url: Option<String>,
    realtime_url: Option<String>,
    request_timeout_secs: Option<u64>,
    storage_path: Option<PathBuf>,
    outbound_queue_capacity: Option<usize>,
    #[serde(default)]
    reconnect: FileReconnect,
}

#[derive(Debug, Default, Deserialize)]
struct FileReconnect {
    enabled: Option<bool>,
    initial_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    max_attempts: Option<u32>,
}

fn default_storage_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(STORAGE_DIR_NAME)
        .join(STORAGE_FILE_NAME)
}

/// Defaults, then `client.toml` (when present), then `APP__*` variables.
pub fn load_settings(path: Option<&Path>) -> ClientSettings {
    let mut settings = ClientSettings::default();
    let path = path.unwrap_or_else(|| Path::new(DEFAULT_SETTINGS_FILE));

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<FileSettings>(&raw) {
            Ok(file_cfg) => apply_file_settings(&mut settings, file_cfg),
            Err(err) => warn!(path = %path.display(), "config: ignoring unparsable settings file: {err}"),
        }
    }

    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    settings
}

fn apply_file_settings(settings: &mut ClientSettings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.api_base_url {
        settings.api_base_url = v;
    }
    if let Some(v) = file_cfg.realtime_url {
        settings.realtime_url = v;
    }
    if let Some(v) = file_cfg.request_timeout_secs {
        settings.request_timeout = Duration::from_secs(v);
    }
    if let Some(v) = file_cfg.storage_path {
        settings.storage_path = v;
    }
    if let Some(v) = file_cfg.outbound_queue_capacity {
        settings.outbound_queue_capacity = v;
    }
    if let Some(v) = file_cfg.reconnect.enabled {
        settings.reconnect.enabled = v;
    }
    if let Some(v) = file_cfg.reconnect.initial_delay_ms {
        settings.reconnect.initial_delay = Duration::from_millis(v);
    }
    if let Some(v) = file_cfg.reconnect.max_delay_ms {
        settings.reconnect.max_delay = Duration::from_millis(v);
    }
    if let Some(v) = file_cfg.reconnect.max_attempts {
        settings.reconnect.max_attempts = v;
    }
}

fn apply_env_overrides(settings: &mut ClientSettings, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("APP__API_BASE_URL") {
        settings.api_base_url = v;
    }
    if let Some(v) = var("APP__REALTIME_URL") {
        settings.realtime_url = v;
    }
    if let Some(v) = var("APP__REQUEST_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
        settings.request_timeout = Duration::from_secs(v);
    }
    if let Some(v) = var("APP__STORAGE_PATH") {
        settings.storage_path = PathBuf::from(v);
    }
    if let Some(v) = var("APP__OUTBOUND_QUEUE_CAPACITY").and_then(|v| v.parse().ok()) {
        settings.outbound_queue_capacity = v;
    }
    if let Some(v) = var("APP__RECONNECT_ENABLED").and_then(|v| v.parse().ok()) {
        settings.reconnect.enabled = v;
    }
    if let Some(v) = var("APP__RECONNECT_MAX_ATTEMPTS").and_then(|v| v.parse().ok()) {
        settings.reconnect.max_attempts = v;
    }
}

impl ClientSettings {
    /// Rejects URLs the HTTP and WebSocket clients could not use.
    pub fn validate(&self) -> Result<()> {
        let api = Url::parse(&self.api_base_url)
            .map_err(|e| ChatError::Validation(format!("api_base_url: {e}")))?;
        if !matches!(api.scheme(), "http" | "https") {
            return Err(ChatError::Validation(
                "api_base_url must start with http:// or https://".into(),
            ));
        }
        let realtime = Url::parse(&self.realtime_url)
            .map_err(|e| ChatError::Validation(format!("realtime_url: {e}")))?;
        if !matches!(realtime.scheme(), "ws" | "wss") {
            return Err(ChatError::Validation(
                "realtime_url must start with ws:// or wss://".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
