//! Client settings and TOML configuration loading.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::proto::Credentials;

/// Operation retry policy applied to `NotHandled` responses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Retry {
    /// Abort an exchange once `retry_count + 1` reaches the bound.
    AtMost(u32),
    KeepRetrying,
}

impl Retry {
    pub fn max_reached(self, retry_count: u32) -> bool {
        match self {
            Retry::AtMost(bound) => retry_count.saturating_add(1) >= bound,
            Retry::KeepRetrying => false,
        }
    }
}

impl Default for Retry {
    fn default() -> Self {
        Retry::AtMost(5)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Reported to the server during identification; `ES-<uuid>` when absent.
    pub default_connection_name: Option<String>,
    /// When present, the authentication handshake stage runs first.
    pub default_user_credentials: Option<CredentialsConfig>,
}

/// Credentials as they appear in configuration. Converted to
/// [`Credentials`] before use so the redacting `Debug` applies everywhere
/// outside the config file itself.
#[derive(Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    pub login: String,
    pub password: String,
}

impl CredentialsConfig {
    pub fn to_credentials(&self) -> Credentials {
        Credentials::new(self.login.clone(), self.password.clone())
    }
}

impl std::fmt::Debug for CredentialsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialsConfig")
            .field("login", &self.login)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationSettings {
    pub retry: Retry,
}

impl Default for OperationSettings {
    fn default() -> Self {
        Self {
            retry: Retry::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    pub max_frame_bytes: usize,
    pub heartbeat_interval_ms: u64,
    /// Receive-silence bound before the connection is declared dead.
    /// Zero disables keep-alive monitoring.
    pub heartbeat_timeout_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub msg_queue_capacity: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            max_frame_bytes: 8 * 1024 * 1024,
            heartbeat_interval_ms: 750,
            heartbeat_timeout_ms: 1_500,
            backoff_base_ms: 500,
            backoff_max_ms: 10_000,
            msg_queue_capacity: 1_024,
        }
    }
}

impl TransportSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub connection: ConnectionSettings,
    pub operation: OperationSettings,
    pub transport: TransportSettings,
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

impl Settings {
    /// Loads settings from a TOML file. An absent file yields defaults.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| SettingsError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}
