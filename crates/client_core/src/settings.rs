use std::{
    fs,
    io::ErrorKind,
    path::Path,
    time::Duration,
};

use serde::Deserialize;

use crate::error::SettingsError;

pub const SETTINGS_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub server_url: String,
    pub auto_reconnect: bool,
    pub reconnect_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_max_missed: u32,
    /// Force a reconnect when the liveness monitor times out.
    pub reconnect_on_heartbeat_timeout: bool,
    pub pending_queue_limit: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:6666".into(),
            auto_reconnect: true,
            reconnect_interval_ms: 5000,
            heartbeat_interval_ms: 30_000,
            heartbeat_max_missed: 3,
            reconnect_on_heartbeat_timeout: true,
            pending_queue_limit: 100,
        }
    }
}

impl ClientSettings {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Applies `APP__*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("APP__SERVER_URL") {
            self.server_url = v;
        }
        if let Some(v) = lookup("APP__AUTO_RECONNECT") {
            self.auto_reconnect = parse_value("auto_reconnect", v)?;
        }
        if let Some(v) = lookup("APP__RECONNECT_INTERVAL_MS") {
            self.reconnect_interval_ms = parse_value("reconnect_interval_ms", v)?;
        }
        if let Some(v) = lookup("APP__HEARTBEAT_INTERVAL_MS") {
            self.heartbeat_interval_ms = parse_value("heartbeat_interval_ms", v)?;
        }
        if let Some(v) = lookup("APP__HEARTBEAT_MAX_MISSED") {
            self.heartbeat_max_missed = parse_value("heartbeat_max_missed", v)?;
        }
        if let Some(v) = lookup("APP__RECONNECT_ON_HEARTBEAT_TIMEOUT") {
            self.reconnect_on_heartbeat_timeout =
                parse_value("reconnect_on_heartbeat_timeout", v)?;
        }
        if let Some(v) = lookup("APP__PENDING_QUEUE_LIMIT") {
            self.pending_queue_limit = parse_value("pending_queue_limit", v)?;
        }
        self.validate()
    }

    /// Rejects values the connection layer cannot run with.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.heartbeat_interval_ms == 0 {
            return Err(zero_value("heartbeat_interval_ms"));
        }
        if self.heartbeat_max_missed == 0 {
            return Err(zero_value("heartbeat_max_missed"));
        }
        if self.reconnect_interval_ms == 0 {
            return Err(zero_value("reconnect_interval_ms"));
        }
        Ok(())
    }
}

/// Defaults, then `client.toml` in the working directory, then the environment.
pub fn load_settings() -> Result<ClientSettings, SettingsError> {
    let mut settings = load_settings_from(SETTINGS_FILE)?;
    settings.apply_overrides(|key| std::env::var(key).ok())?;
    Ok(settings)
}

/// Reads one settings file. A missing file yields the defaults.
pub fn load_settings_from(path: impl AsRef<Path>) -> Result<ClientSettings, SettingsError> {
    let path = path.as_ref();
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(ClientSettings::default()),
        Err(source) => {
            return Err(SettingsError::Read {
                path: path.display().to_string(),
                source,
            })
        }
    };
    let settings: ClientSettings = toml::from_str(&raw).map_err(|source| SettingsError::Parse {
        path: path.display().to_string(),
        source,
    })?;
    settings.validate()?;
    Ok(settings)
}

fn zero_value(key: &'static str) -> SettingsError {
    SettingsError::InvalidValue {
        key,
        value: "0".to_string(),
    }
}

fn parse_value<T: std::str::FromStr>(key: &'static str, value: String) -> Result<T, SettingsError> {
    value
        .trim()
        .parse()
        .map_err(|_| SettingsError::InvalidValue { key, value })
}
