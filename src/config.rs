//! Configuration for the parcela messaging core
//!
//! Loaded from a TOML file with these sections:
//!
//! - `[service]` topic namespace and health endpoint port
//! - `[mqtt]` broker address, credential variable names and session options
//! - `[dispatch]` command retry, reconnect wait, online policy and fail-safe timing
//! - `[store]` seed devices and records for the in-memory store
//!
//! Credentials never live in the file. `[mqtt]` names the environment variables
//! that hold them and they are resolved when the session options are built.

use crate::protocol::{validate_device_id, TopicScheme};
use crate::transport::mqtt::SessionOptions;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Environment variable that overrides `[mqtt].broker_url`
pub const BROKER_ENV_OVERRIDE: &str = "PARCELA_MQTT_BROKER";

/// Complete service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ParcelaConfig {
    #[serde(default)]
    pub service: ServiceSection,
    #[serde(default)]
    pub mqtt: MqttSection,
    #[serde(default)]
    pub dispatch: DispatchSection,
    #[serde(default)]
    pub store: StoreSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceSection {
    /// First topic level shared by every device topic
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Port for the health/metrics endpoint; omitted disables it
    #[serde(default)]
    pub health_port: Option<u16>,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            health_port: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Broker URL, e.g. `mqtt://localhost:1883` or `mqtts://broker:8883`
    #[serde(default)]
    pub broker_url: Option<String>,
    /// Environment variable containing the username
    #[serde(default = "default_username_env")]
    pub username_env: String,
    /// Environment variable containing the password
    #[serde(default = "default_password_env")]
    pub password_env: String,
    /// Connect without credentials when the variables are unset
    #[serde(default)]
    pub allow_anonymous: bool,
    #[serde(default = "default_reconnect_period_ms")]
    pub reconnect_period_ms: u64,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// A random suffix is appended per process
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,
    #[serde(default = "default_clean_session")]
    pub clean_session: bool,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            broker_url: None,
            username_env: default_username_env(),
            password_env: default_password_env(),
            allow_anonymous: false,
            reconnect_period_ms: default_reconnect_period_ms(),
            keep_alive_secs: default_keep_alive_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            client_id_prefix: default_client_id_prefix(),
            clean_session: default_clean_session(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchSection {
    /// Publish attempts per command, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Fixed delay between attempts
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// Bound on waiting for a reconnect before an attempt
    #[serde(default = "default_reconnect_wait_ms")]
    pub reconnect_wait_ms: u64,
    /// Bound on the first connect performed at startup
    #[serde(default = "default_initial_connect_timeout_secs")]
    pub initial_connect_timeout_secs: u64,
    /// Refuse alarm commands for devices not reported online
    #[serde(default = "default_require_online")]
    pub require_online: bool,
    /// Window in which an identical fail-safe publish is suppressed
    #[serde(default = "default_dedup_window_ms")]
    pub dedup_window_ms: u64,
    /// Offsets after an offline event at which `ALARM_OFF` is sent
    #[serde(default = "default_failsafe_offsets_ms")]
    pub failsafe_offsets_ms: Vec<u64>,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            reconnect_wait_ms: default_reconnect_wait_ms(),
            initial_connect_timeout_secs: default_initial_connect_timeout_secs(),
            require_online: default_require_online(),
            dedup_window_ms: default_dedup_window_ms(),
            failsafe_offsets_ms: default_failsafe_offsets_ms(),
        }
    }
}

impl DispatchSection {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn reconnect_wait(&self) -> Duration {
        Duration::from_millis(self.reconnect_wait_ms)
    }

    pub fn initial_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.initial_connect_timeout_secs)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }

    pub fn failsafe_offsets(&self) -> Vec<Duration> {
        self.failsafe_offsets_ms
            .iter()
            .copied()
            .map(Duration::from_millis)
            .collect()
    }
}

/// Seed data for the in-memory store
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StoreSection {
    #[serde(default)]
    pub devices: Vec<DeviceSeed>,
    #[serde(default)]
    pub records: Vec<RecordSeed>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSeed {
    pub device_id: String,
    #[serde(default = "default_seed_status")]
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordSeed {
    pub record_id: String,
    #[serde(default)]
    pub customer_name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub order: String,
    #[serde(default)]
    pub device_id: Option<String>,
}

fn default_namespace() -> String {
    crate::protocol::DEFAULT_NAMESPACE.to_string()
}

fn default_username_env() -> String {
    "PARCELA_MQTT_USERNAME".to_string()
}

fn default_password_env() -> String {
    "PARCELA_MQTT_PASSWORD".to_string()
}

fn default_reconnect_period_ms() -> u64 {
    1000
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_client_id_prefix() -> String {
    "parcela-core".to_string()
}

fn default_clean_session() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    1000
}

fn default_reconnect_wait_ms() -> u64 {
    5000
}

fn default_initial_connect_timeout_secs() -> u64 {
    10
}

fn default_require_online() -> bool {
    true
}

fn default_dedup_window_ms() -> u64 {
    1500
}

fn default_failsafe_offsets_ms() -> Vec<u64> {
    vec![0, 2000, 5000]
}

fn default_seed_status() -> String {
    "offline".to_string()
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("MQTT broker URL is not configured (set [mqtt].broker_url or {BROKER_ENV_OVERRIDE})")]
    MissingBroker,
    #[error("Invalid broker URL '{url}': {reason}")]
    InvalidBrokerUrl { url: String, reason: String },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ConfigError {
    /// Whether this error means required settings are absent
    pub fn is_missing(&self) -> bool {
        matches!(
            self,
            ConfigError::EnvVarNotFound(_) | ConfigError::MissingBroker
        )
    }
}

impl ParcelaConfig {
    /// Load configuration from a TOML file and apply environment overrides
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content, |name| std::env::var(name).ok())
    }

    /// Parse configuration text, resolving overrides through `env`
    pub fn from_toml_str(
        content: &str,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config: ParcelaConfig = toml::from_str(content)?;
        config.apply_env_overrides(env);
        config.validate()?;
        Ok(config)
    }

    /// Configuration built purely from the environment, used when no file exists
    pub fn from_env(env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = ParcelaConfig::default();
        config.apply_env_overrides(env);
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(broker) = env(BROKER_ENV_OVERRIDE).filter(|v| !v.trim().is_empty()) {
            self.mqtt.broker_url = Some(broker);
        }
    }

    /// Check values that serde cannot express
    ///
    /// A missing broker URL is not rejected here so `config --show` works on a
    /// partial file; it fails when session options are built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        TopicScheme::new(&self.service.namespace).map_err(|e| {
            ConfigError::InvalidConfig(format!("[service].namespace: {e}"))
        })?;

        if let Some(url) = &self.mqtt.broker_url {
            parse_broker_url(url)?;
        }

        if self.dispatch.max_attempts == 0 {
            return Err(ConfigError::InvalidConfig(
                "[dispatch].max_attempts must be at least 1".to_string(),
            ));
        }

        if self.mqtt.reconnect_period_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "[mqtt].reconnect_period_ms must be greater than 0".to_string(),
            ));
        }

        for seed in &self.store.devices {
            validate_device_id(&seed.device_id).map_err(|e| {
                ConfigError::InvalidConfig(format!("[[store.devices]] '{}': {e}", seed.device_id))
            })?;
        }

        for record in &self.store.records {
            if record.record_id.trim().is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "[[store.records]] record_id cannot be empty".to_string(),
                ));
            }
        }

        Ok(())
    }

    pub fn topics(&self) -> Result<TopicScheme, ConfigError> {
        TopicScheme::new(&self.service.namespace)
            .map_err(|e| ConfigError::InvalidConfig(format!("[service].namespace: {e}")))
    }

    /// Resolve credentials from the process environment and build session options
    pub fn session_options(&self) -> Result<SessionOptions, ConfigError> {
        self.session_options_with(|name| std::env::var(name).ok())
    }

    /// Build session options, resolving credential variables through `env`
    pub fn session_options_with(
        &self,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<SessionOptions, ConfigError> {
        let broker_url = self
            .mqtt
            .broker_url
            .clone()
            .filter(|u| !u.trim().is_empty())
            .ok_or(ConfigError::MissingBroker)?;
        parse_broker_url(&broker_url)?;

        let credentials = match (env(&self.mqtt.username_env), env(&self.mqtt.password_env)) {
            (Some(username), Some(password)) => Some((username, password)),
            _ if self.mqtt.allow_anonymous => None,
            (None, _) => return Err(ConfigError::EnvVarNotFound(self.mqtt.username_env.clone())),
            (_, None) => return Err(ConfigError::EnvVarNotFound(self.mqtt.password_env.clone())),
        };

        Ok(SessionOptions {
            broker_url,
            credentials,
            client_id: format!(
                "{}-{}",
                self.mqtt.client_id_prefix,
                &uuid::Uuid::new_v4().simple().to_string()[..8]
            ),
            keep_alive: Duration::from_secs(self.mqtt.keep_alive_secs),
            reconnect_period: Duration::from_millis(self.mqtt.reconnect_period_ms),
            connect_timeout: Duration::from_secs(self.mqtt.connect_timeout_secs),
            clean_session: self.mqtt.clean_session,
            last_will: None,
        })
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[service]
namespace = "parcela"

[mqtt]
broker_url = "mqtt://localhost:1883"
allow_anonymous = true

[dispatch]
backoff_ms = 10
reconnect_wait_ms = 100
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

/// Parse and check a broker URL
pub fn parse_broker_url(url: &str) -> Result<url::Url, ConfigError> {
    let parsed = url::Url::parse(url).map_err(|e| ConfigError::InvalidBrokerUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    match parsed.scheme() {
        "mqtt" | "mqtts" | "tcp" | "ssl" => {}
        other => {
            return Err(ConfigError::InvalidBrokerUrl {
                url: url.to_string(),
                reason: format!("unsupported scheme '{other}'"),
            })
        }
    }

    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(ConfigError::InvalidBrokerUrl {
            url: url.to_string(),
            reason: "missing host".to_string(),
        });
    }

    Ok(parsed)
}
