//! Tunnel configuration.
//!
//! Three layers feed a tunnel:
//!
//! 1. [`TunnelConfig`]: the `(host, username)` pair a single tunnel instance
//!    is built from. Immutable once handed to the controller.
//! 2. [`TunnelSettings`]: transport tunables (SSH port, timeouts, keepalive,
//!    identity agent socket). Compiled defaults, agent socket from the
//!    environment.
//! 3. [`AppSettings`]: the persisted `settings.json` the host and user are
//!    read from between runs.
//!
//! Host and user are resolved in order of precedence (highest wins): command
//! line flag, saved setting, then the `SSH_HOST` / `SSH_USER` environment
//! variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Standard secure-shell port.
pub const DEFAULT_SSH_PORT: u16 = 22;

const SETTINGS_DIR: &str = "geo-tunnel";
const SETTINGS_FILE: &str = "settings.json";

/// Remote endpoint and identity used to authenticate the secure connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    pub host: String,
    pub username: String,
}

/// Host or username was empty; nothing was attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("SSH host and user are not configured")]
pub struct MissingConfiguration;

impl TunnelConfig {
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
        }
    }

    /// Host and username are opaque; the only check is non-emptiness.
    pub fn validate(&self) -> Result<(), MissingConfiguration> {
        if self.host.is_empty() || self.username.is_empty() {
            return Err(MissingConfiguration);
        }
        Ok(())
    }
}

/// Transport tunables shared by the tunnel and the diagnostic probe.
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    pub ssh_port: u16,
    /// Bound on TCP connect + SSH handshake + authentication.
    pub connect_timeout: Duration,
    /// Interval between SSH keepalive messages on an established session.
    pub keepalive_interval: Duration,
    /// How long a relay waits for the remote side to accept a channel.
    pub channel_open_timeout: Duration,
    /// Identity agent socket. Key material never passes through this process.
    pub agent_socket: Option<PathBuf>,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            ssh_port: DEFAULT_SSH_PORT,
            connect_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(15),
            channel_open_timeout: Duration::from_secs(30),
            agent_socket: None,
        }
    }
}

impl TunnelSettings {
    /// Defaults plus the agent socket advertised by `SSH_AUTH_SOCK`.
    pub fn from_env() -> Self {
        Self {
            agent_socket: std::env::var_os("SSH_AUTH_SOCK")
                .filter(|value| !value.is_empty())
                .map(PathBuf::from),
            ..Self::default()
        }
    }
}

/// Errors reading or writing the persisted settings file.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("no configuration directory available on this platform")]
    NoConfigDir,

    #[error("settings I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("settings JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Persisted user settings. Field names match the on-disk JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSettings {
    #[serde(default)]
    pub ssh_host: String,
    #[serde(default)]
    pub ssh_user: String,
}

impl AppSettings {
    /// `<config dir>/geo-tunnel/settings.json`.
    pub fn default_path() -> Result<PathBuf, SettingsError> {
        dirs::config_dir()
            .map(|dir| dir.join(SETTINGS_DIR).join(SETTINGS_FILE))
            .ok_or(SettingsError::NoConfigDir)
    }

    /// Missing or unreadable settings fall back to defaults.
    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "ignoring malformed settings file");
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw)?;
        Ok(())
    }

    /// Apply only the fields that were supplied.
    pub fn merge(&mut self, host: Option<String>, user: Option<String>) {
        if let Some(host) = host {
            self.ssh_host = host;
        }
        if let Some(user) = user {
            self.ssh_user = user;
        }
    }

    /// Flag, then saved value, then environment.
    pub fn resolve(&self, host: Option<String>, user: Option<String>) -> TunnelConfig {
        self.resolve_with(host, user, |key| std::env::var(key).ok())
    }

    fn resolve_with(
        &self,
        host: Option<String>,
        user: Option<String>,
        env: impl Fn(&str) -> Option<String>,
    ) -> TunnelConfig {
        let pick = |flag: Option<String>, saved: &str, key: &str| {
            flag.filter(|v| !v.is_empty())
                .or_else(|| Some(saved.to_string()).filter(|v| !v.is_empty()))
                .or_else(|| env(key))
                .unwrap_or_default()
        };
        TunnelConfig {
            host: pick(host, &self.ssh_host, "SSH_HOST"),
            username: pick(user, &self.ssh_user, "SSH_USER"),
        }
    }
}
