//! Construction-time configuration for the MQTT client.
//!
//! Everything here is immutable once a client has been built from it.
//! Configs can be assembled in code or loaded from a TOML file; every field
//! except `host` and `module_name` has a default, so partial files load.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Default broker port.
fn default_port() -> u16 {
    1883
}

/// Keep-alive interval sent to the broker.
fn default_keep_alive_secs() -> u64 {
    5
}

/// Upper bound for the TCP connect attempt.
fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_presence_enabled() -> bool {
    true
}

fn default_presence_period_secs() -> u64 {
    10
}

fn default_presence_topic() -> String {
    "mqtt_client".to_string()
}

/// Errors raised while loading a [`ClientConfig`] from disk.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Username/password pair applied to the broker session before connecting.
///
/// The pair is a single value on purpose: a username without a password (or
/// the reverse) is not a state the broker handshake can express.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Settings for the recurring presence announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Whether the recurring presence task runs at all.
    #[serde(default = "default_presence_enabled")]
    pub enabled: bool,

    /// Seconds between presence publishes. Also bounds how long cancellation
    /// of the presence task may lag behind `stop()`.
    #[serde(default = "default_presence_period_secs")]
    pub period_secs: u64,

    /// Topic the presence message is published to.
    #[serde(default = "default_presence_topic")]
    pub topic: String,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            enabled: default_presence_enabled(),
            period_secs: default_presence_period_secs(),
            topic: default_presence_topic(),
        }
    }
}

impl PresenceConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }
}

/// Immutable configuration for one [`MqttClient`](crate::MqttClient).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Broker host name or address.
    pub host: String,

    /// Broker port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Module identity. Used as the MQTT client id and as the `type` field
    /// of the presence payload.
    pub module_name: String,

    /// Credentials applied before the connection attempt, if any.
    #[serde(default)]
    pub credentials: Option<Credentials>,

    /// Network device to bind the local endpoint to (e.g. `eth0`).
    /// `None` leaves the OS default (wildcard) in place.
    #[serde(default)]
    pub bind_device: Option<String>,

    /// Keep-alive interval for the broker session, in seconds.
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    /// Bound on the TCP connect attempt, in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Presence announcement settings.
    #[serde(default)]
    pub presence: PresenceConfig,
}

impl ClientConfig {
    /// Config for `module_name` against the broker at `host`, everything
    /// else defaulted.
    pub fn new(host: impl Into<String>, module_name: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            module_name: module_name.into(),
            credentials: None,
            bind_device: None,
            keep_alive_secs: default_keep_alive_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            presence: PresenceConfig::default(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_presence(mut self, presence: PresenceConfig) -> Self {
        self.presence = presence;
        self
    }

    /// Parses a config from TOML text.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Loads a config from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        debug!("Loading client config from {}", path.display());
        let raw = fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let config = ClientConfig::new("broker.local", "test-module");
        assert_eq!(config.port, 1883);
        assert_eq!(config.keep_alive_secs, 5);
        assert_eq!(config.connect_timeout_secs, 10);
        assert!(config.credentials.is_none());
        assert!(config.bind_device.is_none());
        assert!(config.presence.enabled);
        assert_eq!(config.presence.period_secs, 10);
        assert_eq!(config.presence.topic, "mqtt_client");
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config = ClientConfig::from_toml_str(
            r#"
            host = "broker.local"
            module_name = "camera"
            "#,
        )
        .unwrap();
        assert_eq!(config, ClientConfig::new("broker.local", "camera"));
    }

    #[test]
    fn full_toml_parses() {
        let config = ClientConfig::from_toml_str(
            r#"
            host = "10.0.0.2"
            port = 8883
            module_name = "camera"
            bind_device = "eth0"
            keep_alive_secs = 30
            connect_timeout_secs = 3

            [credentials]
            username = "cam"
            password = "secret"

            [presence]
            enabled = false
            period_secs = 2
            topic = "mod/presence"
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 8883);
        assert_eq!(config.bind_device.as_deref(), Some("eth0"));
        assert_eq!(config.credentials, Some(Credentials::new("cam", "secret")));
        assert!(!config.presence.enabled);
        assert_eq!(config.presence.topic, "mod/presence");
        assert_eq!(config.presence.period(), Duration::from_secs(2));
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "host = \"broker.local\"\nmodule_name = \"camera\"").unwrap();
        let config = ClientConfig::load(file.path()).unwrap();
        assert_eq!(config.host, "broker.local");
        assert_eq!(config.module_name, "camera");
    }

    #[test]
    fn load_reports_missing_file() {
        let err = ClientConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn parse_error_is_reported() {
        let err = ClientConfig::from_toml_str("port = \"not a number\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
