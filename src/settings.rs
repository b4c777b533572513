// src/settings.rs
//
// Application settings: TOML file with per-field defaults, then environment
// overrides.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::io::serial::{LineSettings, MAX_BUFFER_LEN};

const APP_DIR_NAME: &str = "sensorlink";
const SETTINGS_FILE_NAME: &str = "settings.toml";

// ============================================================================
// Link
// ============================================================================

/// Serial link and supervision timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkSettings {
    #[serde(default = "default_port")]
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default)]
    pub line: LineSettings,
    /// Bounded wait for the port to become ready
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// How often liveness is checked
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Silence longer than this while connected counts as link loss
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    /// Fixed delay before each reconnect attempt
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_buffer_cap")]
    pub buffer_cap: usize,
    /// Length of the read session started by `run` (0 = until interrupted)
    #[serde(default = "default_read_duration_ms")]
    pub read_duration_ms: u64,
}

fn default_port() -> String {
    "/dev/ttyUSB0".to_string()
}
fn default_baud_rate() -> u32 {
    115200
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_heartbeat_interval_ms() -> u64 {
    1000
}
fn default_connection_timeout_ms() -> u64 {
    10_000
}
fn default_reconnect_delay_ms() -> u64 {
    3000
}
fn default_max_reconnect_attempts() -> u32 {
    5
}
fn default_buffer_cap() -> usize {
    MAX_BUFFER_LEN
}
fn default_read_duration_ms() -> u64 {
    60_000
}

impl Default for LinkSettings {
    fn default() -> Self {
        LinkSettings {
            port: default_port(),
            baud_rate: default_baud_rate(),
            line: LineSettings::default(),
            connect_timeout_ms: default_connect_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            connection_timeout_ms: default_connection_timeout_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            buffer_cap: default_buffer_cap(),
            read_duration_ms: default_read_duration_ms(),
        }
    }
}

impl LinkSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
    pub fn heartbeat_interval(&self) -> Duration {
        // A zero period would make tokio's interval panic
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
    pub fn read_duration(&self) -> Option<Duration> {
        (self.read_duration_ms > 0).then(|| Duration::from_millis(self.read_duration_ms))
    }
}

// ============================================================================
// Backend + status server
// ============================================================================

/// HTTP backend that stores readings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default = "default_password")]
    pub password: String,
    #[serde(default = "default_login_attempts")]
    pub login_attempts: u32,
    #[serde(default = "default_login_retry_delay_ms")]
    pub login_retry_delay_ms: u64,
}

fn default_base_url() -> String {
    "http://localhost:3000".to_string()
}
fn default_username() -> String {
    "user".to_string()
}
fn default_password() -> String {
    "password".to_string()
}
fn default_login_attempts() -> u32 {
    5
}
fn default_login_retry_delay_ms() -> u64 {
    3000
}

impl Default for BackendSettings {
    fn default() -> Self {
        BackendSettings {
            enabled: false,
            base_url: default_base_url(),
            username: default_username(),
            password: default_password(),
            login_attempts: default_login_attempts(),
            login_retry_delay_ms: default_login_retry_delay_ms(),
        }
    }
}

/// WebSocket endpoint for dashboard clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusServerSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:4000".to_string()
}

impl Default for StatusServerSettings {
    fn default() -> Self {
        StatusServerSettings {
            enabled: false,
            bind: default_bind(),
        }
    }
}

// ============================================================================
// App
// ============================================================================

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default)]
    pub link: LinkSettings,
    #[serde(default)]
    pub backend: BackendSettings,
    #[serde(default)]
    pub status_server: StatusServerSettings,
    /// Directory for session log files (None = stderr only)
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

impl AppSettings {
    pub fn from_toml_str(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| format!("Failed to parse settings: {}", e))
    }

    /// Apply environment overrides through `lookup` (normally `std::env::var`).
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), String>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("SERIAL_PORT") {
            self.link.port = port;
        }
        if let Some(baud) = lookup("BAUD_RATE") {
            self.link.baud_rate = baud
                .parse()
                .map_err(|e| format!("Invalid BAUD_RATE '{}': {}", baud, e))?;
        }
        if let Some(user) = lookup("USER_NAME") {
            self.backend.username = user;
        }
        if let Some(password) = lookup("PASSWORD") {
            self.backend.password = password;
        }
        if let Some(url) = lookup("API_URL") {
            self.backend.base_url = url;
        }
        if let Some(socket_port) = lookup("SOCKET_PORT") {
            let port: u16 = socket_port
                .parse()
                .map_err(|e| format!("Invalid SOCKET_PORT '{}': {}", socket_port, e))?;
            let host = self
                .status_server
                .bind
                .rsplit_once(':')
                .map(|(host, _)| host.to_string())
                .unwrap_or_else(|| "127.0.0.1".to_string());
            self.status_server.bind = format!("{}:{}", host, port);
        }
        Ok(())
    }
}

/// Default settings file location
pub fn default_settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(APP_DIR_NAME).join(SETTINGS_FILE_NAME))
}

/// Load settings.
/// An explicit path must exist; the default path falls back to defaults when missing.
pub fn load_settings(path: Option<&Path>) -> Result<AppSettings, String> {
    let mut settings = match path {
        Some(p) => {
            let content = std::fs::read_to_string(p)
                .map_err(|e| format!("Failed to read settings {}: {}", p.display(), e))?;
            AppSettings::from_toml_str(&content)?
        }
        None => match default_settings_path() {
            Some(p) if p.exists() => {
                let content = std::fs::read_to_string(&p)
                    .map_err(|e| format!("Failed to read settings {}: {}", p.display(), e))?;
                AppSettings::from_toml_str(&content)?
            }
            _ => AppSettings::default(),
        },
    };

    settings.apply_env_overrides(|key| std::env::var(key).ok())?;
    Ok(settings)
}
