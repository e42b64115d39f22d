//! Device configuration
//!
//! Settings come from an optional TOML file, are overridden by command-line
//! flags and finally fall back to the usual Google Cloud project environment
//! variables. Required options may be supplied by any of the three sources,
//! so they are optional while loading and enforced by [`DeviceConfig::validate`].

use crate::auth::{CredentialIssuer, KeySource, SigningAlgorithm};
use crate::protocol::{DeviceIdentity, MessageType, ValidationError};
use crate::session::{ReconnectPolicy, SessionSettings, MIN_RECONNECT_DELAY_MS};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variables consulted, in order, when no project id is configured
pub const PROJECT_ENV_VARS: [&str; 2] = ["GCLOUD_PROJECT", "GOOGLE_CLOUD_PROJECT"];

/// Smallest keep-alive the broker accepts
const MIN_KEEP_ALIVE_SECS: u64 = 5;

/// Complete device configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    #[serde(default)]
    pub device: DeviceSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub mqtt: MqttSection,
    #[serde(default)]
    pub telemetry: TelemetrySection,
}

/// Which device this client runs as
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            project_id: None,
            region: default_region(),
            registry_id: None,
            device_id: None,
        }
    }
}

fn default_region() -> String {
    "us-central1".to_string()
}

/// Credential settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthSection {
    /// Path to the PEM private key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_file: Option<PathBuf>,
    /// `RS256` or `ES256`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<String>,
    #[serde(default = "default_token_expiration_minutes")]
    pub token_expiration_minutes: u64,
    /// Reissue credentials this close to expiry (default: the publish interval)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_margin_secs: Option<u64>,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            private_key_file: None,
            algorithm: None,
            token_expiration_minutes: default_token_expiration_minutes(),
            refresh_margin_secs: None,
        }
    }
}

fn default_token_expiration_minutes() -> u64 {
    20
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    #[serde(default = "default_broker_hostname")]
    pub broker_hostname: String,
    #[serde(default = "default_broker_port")]
    pub broker_port: u16,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_reconnect_backoff")]
    pub reconnect_backoff_ms: Vec<u64>,
    #[serde(default = "default_reconnect_sustained")]
    pub reconnect_sustained_ms: u64,
    /// 0 = unlimited
    #[serde(default)]
    pub max_reconnect_attempts: u32,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            broker_hostname: default_broker_hostname(),
            broker_port: default_broker_port(),
            keep_alive_secs: default_keep_alive(),
            connect_timeout_secs: default_connect_timeout(),
            reconnect_backoff_ms: default_reconnect_backoff(),
            reconnect_sustained_ms: default_reconnect_sustained(),
            max_reconnect_attempts: 0,
        }
    }
}

fn default_broker_hostname() -> String {
    "mqtt.googleapis.com".to_string()
}

fn default_broker_port() -> u16 {
    8883
}

fn default_keep_alive() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_reconnect_backoff() -> Vec<u64> {
    vec![1000, 2000, 5000, 10000]
}

fn default_reconnect_sustained() -> u64 {
    30000
}

/// Telemetry publication settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetrySection {
    #[serde(default = "default_publish_interval")]
    pub publish_interval_secs: u64,
    #[serde(default)]
    pub message_type: MessageType,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            publish_interval_secs: default_publish_interval(),
            message_type: MessageType::default(),
        }
    }
}

fn default_publish_interval() -> u64 {
    30
}

/// Values supplied on the command line; `None` keeps the configured value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigOverrides {
    pub project_id: Option<String>,
    pub region: Option<String>,
    pub registry_id: Option<String>,
    pub device_id: Option<String>,
    pub private_key_file: Option<PathBuf>,
    pub algorithm: Option<String>,
    pub token_expiration_minutes: Option<u64>,
    pub broker_hostname: Option<String>,
    pub broker_port: Option<u16>,
    pub publish_interval_secs: Option<u64>,
    pub message_type: Option<MessageType>,
}

/// Configuration errors; all are fatal before the session starts
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to render TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("Missing required option: {0}")]
    MissingField(&'static str),
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(#[from] ValidationError),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl DeviceConfig {
    /// Load configuration from a TOML file
    ///
    /// Only parses; call [`DeviceConfig::validate`] once overrides are applied.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        fn set<T: Clone>(target: &mut T, value: &Option<T>) {
            if let Some(value) = value {
                *target = value.clone();
            }
        }
        fn set_some<T: Clone>(target: &mut Option<T>, value: &Option<T>) {
            if value.is_some() {
                *target = value.clone();
            }
        }

        set_some(&mut self.device.project_id, &overrides.project_id);
        set(&mut self.device.region, &overrides.region);
        set_some(&mut self.device.registry_id, &overrides.registry_id);
        set_some(&mut self.device.device_id, &overrides.device_id);
        set_some(&mut self.auth.private_key_file, &overrides.private_key_file);
        set_some(&mut self.auth.algorithm, &overrides.algorithm);
        set(
            &mut self.auth.token_expiration_minutes,
            &overrides.token_expiration_minutes,
        );
        set(&mut self.mqtt.broker_hostname, &overrides.broker_hostname);
        set(&mut self.mqtt.broker_port, &overrides.broker_port);
        set(
            &mut self.telemetry.publish_interval_secs,
            &overrides.publish_interval_secs,
        );
        set(&mut self.telemetry.message_type, &overrides.message_type);
    }

    /// Fill a missing project id from the process environment
    pub fn apply_env_fallbacks(&mut self) {
        self.apply_env_fallbacks_with(|name| std::env::var(name).ok());
    }

    pub fn apply_env_fallbacks_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if self.device.project_id.is_some() {
            return;
        }
        self.device.project_id = PROJECT_ENV_VARS
            .iter()
            .filter_map(|name| lookup(name))
            .find(|value| !value.is_empty());
    }

    /// Check required options and value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.identity()?;
        self.algorithm()?;
        required(&self.auth.private_key_file, "private_key_file")?;

        if self.auth.token_expiration_minutes == 0 {
            return Err(ConfigError::InvalidConfig(
                "token_expiration_minutes must be greater than 0".to_string(),
            ));
        }
        if self.telemetry.publish_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "publish_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.mqtt.broker_hostname.trim().is_empty() {
            return Err(ConfigError::MissingField("broker_hostname"));
        }
        if self.mqtt.broker_port == 0 {
            return Err(ConfigError::InvalidConfig(
                "broker_port must be greater than 0".to_string(),
            ));
        }
        if self.mqtt.keep_alive_secs < MIN_KEEP_ALIVE_SECS {
            return Err(ConfigError::InvalidConfig(format!(
                "keep_alive_secs must be at least {MIN_KEEP_ALIVE_SECS}"
            )));
        }
        if self.mqtt.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "connect_timeout_secs must be greater than 0".to_string(),
            ));
        }

        let lifetime = self.token_validity();
        if self.refresh_margin() >= lifetime {
            return Err(ConfigError::InvalidConfig(format!(
                "refresh margin ({}s) must be shorter than the token lifetime ({}s)",
                self.refresh_margin().as_secs(),
                lifetime.as_secs()
            )));
        }

        if let Some(delay) = self
            .mqtt
            .reconnect_backoff_ms
            .iter()
            .chain(std::iter::once(&self.mqtt.reconnect_sustained_ms))
            .find(|delay| **delay < MIN_RECONNECT_DELAY_MS)
        {
            return Err(ConfigError::InvalidConfig(format!(
                "reconnect delay {delay}ms is below the minimum of {MIN_RECONNECT_DELAY_MS}ms"
            )));
        }

        self.reconnect_policy()
            .validate()
            .map_err(ConfigError::InvalidConfig)
    }

    pub fn identity(&self) -> Result<DeviceIdentity, ConfigError> {
        let project_id = required(&self.device.project_id, "project_id")?;
        let registry_id = required(&self.device.registry_id, "registry_id")?;
        let device_id = required(&self.device.device_id, "device_id")?;

        Ok(DeviceIdentity::new(
            project_id,
            &self.device.region,
            registry_id,
            device_id,
        )?)
    }

    pub fn algorithm(&self) -> Result<SigningAlgorithm, ConfigError> {
        required(&self.auth.algorithm, "algorithm")?
            .parse()
            .map_err(|e: crate::auth::CredentialError| ConfigError::InvalidConfig(e.to_string()))
    }

    pub fn token_validity(&self) -> Duration {
        Duration::from_secs(self.auth.token_expiration_minutes.saturating_mul(60))
    }

    pub fn refresh_margin(&self) -> Duration {
        Duration::from_secs(
            self.auth
                .refresh_margin_secs
                .unwrap_or(self.telemetry.publish_interval_secs),
        )
    }

    /// Credential issuer reading the configured key file
    pub fn issuer(&self) -> Result<CredentialIssuer, ConfigError> {
        let key_file = required(&self.auth.private_key_file, "private_key_file")?;
        Ok(CredentialIssuer::new(
            KeySource::File(key_file.clone()),
            self.algorithm()?,
            self.token_validity(),
        ))
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: match self.mqtt.max_reconnect_attempts {
                0 => None,
                attempts => Some(attempts),
            },
            backoff_pattern: self.mqtt.reconnect_backoff_ms.clone(),
            sustained_delay: self.mqtt.reconnect_sustained_ms,
            min_delay: MIN_RECONNECT_DELAY_MS,
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            host: self.mqtt.broker_hostname.clone(),
            port: self.mqtt.broker_port,
            keep_alive: Duration::from_secs(self.mqtt.keep_alive_secs),
            connect_timeout: Duration::from_secs(self.mqtt.connect_timeout_secs),
            refresh_margin: self.refresh_margin(),
            publish_interval: Duration::from_secs(self.telemetry.publish_interval_secs),
            message_type: self.telemetry.message_type,
            reconnect: self.reconnect_policy(),
        }
    }
}

fn required<'a, T>(value: &'a Option<T>, field: &'static str) -> Result<&'a T, ConfigError> {
    value.as_ref().ok_or(ConfigError::MissingField(field))
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_CONFIG: &str = r#"
[device]
project_id = "demo-123"
region = "europe-west1"
registry_id = "my-registry"
device_id = "my-node-device"

[auth]
private_key_file = "./rsa_private.pem"
algorithm = "RS256"
token_expiration_minutes = 60
refresh_margin_secs = 120

[mqtt]
broker_hostname = "localhost"
broker_port = 8884
keep_alive_secs = 30
connect_timeout_secs = 10
reconnect_backoff_ms = [1000, 4000]
reconnect_sustained_ms = 15000
max_reconnect_attempts = 5

[telemetry]
publish_interval_secs = 10
message_type = "events"
"#;

    fn minimal() -> DeviceConfig {
        DeviceConfig::from_toml_str(
            r#"
[device]
project_id = "demo-123"
registry_id = "my-registry"
device_id = "my-node-device"

[auth]
private_key_file = "./rsa_private.pem"
algorithm = "ES256"
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_full_config() {
        let config = DeviceConfig::from_toml_str(FULL_CONFIG).unwrap();
        config.validate().unwrap();

        let identity = config.identity().unwrap();
        assert_eq!(
            identity.client_id(),
            "projects/demo-123/locations/europe-west1/registries/my-registry/devices/my-node-device"
        );
        assert_eq!(config.algorithm().unwrap(), SigningAlgorithm::Rs256);
        assert_eq!(config.token_validity(), Duration::from_secs(3600));

        let settings = config.session_settings();
        assert_eq!(settings.host, "localhost");
        assert_eq!(settings.port, 8884);
        assert_eq!(settings.keep_alive, Duration::from_secs(30));
        assert_eq!(settings.connect_timeout, Duration::from_secs(10));
        assert_eq!(settings.refresh_margin, Duration::from_secs(120));
        assert_eq!(settings.publish_interval, Duration::from_secs(10));
        assert_eq!(settings.message_type, MessageType::Events);
        assert_eq!(settings.reconnect.max_attempts, Some(5));
        assert_eq!(settings.reconnect.backoff_pattern, vec![1000, 4000]);
    }

    #[test]
    fn test_defaults() {
        let config = minimal();
        config.validate().unwrap();

        assert_eq!(config.device.region, "us-central1");
        assert_eq!(config.auth.token_expiration_minutes, 20);
        assert_eq!(config.mqtt.broker_hostname, "mqtt.googleapis.com");
        assert_eq!(config.mqtt.broker_port, 8883);
        assert_eq!(config.telemetry.publish_interval_secs, 30);
        assert_eq!(config.telemetry.message_type, MessageType::State);

        // Margin defaults to one publish interval
        assert_eq!(config.refresh_margin(), Duration::from_secs(30));
        assert_eq!(config.reconnect_policy().max_attempts, None);
    }

    #[test]
    fn test_missing_required_fields() {
        let cases: [(&str, fn(&mut DeviceConfig)); 5] = [
            ("project_id", |c| c.device.project_id = None),
            ("registry_id", |c| c.device.registry_id = None),
            ("device_id", |c| c.device.device_id = None),
            ("private_key_file", |c| c.auth.private_key_file = None),
            ("algorithm", |c| c.auth.algorithm = None),
        ];

        for (field, clear) in cases {
            let mut config = minimal();
            clear(&mut config);
            match config.validate() {
                Err(ConfigError::MissingField(name)) => assert_eq!(name, field),
                other => panic!("expected missing {field}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_invalid_values() {
        let cases: [fn(&mut DeviceConfig); 7] = [
            |c| c.auth.token_expiration_minutes = 0,
            |c| c.telemetry.publish_interval_secs = 0,
            |c| c.mqtt.broker_port = 0,
            |c| c.mqtt.keep_alive_secs = 2,
            |c| c.auth.refresh_margin_secs = Some(20 * 60),
            |c| c.mqtt.reconnect_backoff_ms = vec![1000, 10],
            |c| c.auth.algorithm = Some("HS256".to_string()),
        ];

        for (index, mutate) in cases.into_iter().enumerate() {
            let mut config = minimal();
            mutate(&mut config);
            assert!(
                matches!(config.validate(), Err(ConfigError::InvalidConfig(_))),
                "case {index} should be rejected"
            );
        }
    }

    #[test]
    fn test_invalid_identifier() {
        let mut config = minimal();
        config.device.device_id = Some("dev/1".to_string());

        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidIdentifier(ValidationError::InvalidChar {
                field: "device_id",
                ch: '/'
            }))
        ));
    }

    #[test]
    fn test_overrides_win() {
        let mut config = minimal();
        config.apply_overrides(&ConfigOverrides {
            device_id: Some("other-device".to_string()),
            region: Some("asia-east1".to_string()),
            broker_port: Some(443),
            publish_interval_secs: Some(5),
            message_type: Some(MessageType::Events),
            ..Default::default()
        });

        assert_eq!(config.device.device_id.as_deref(), Some("other-device"));
        assert_eq!(config.device.region, "asia-east1");
        assert_eq!(config.device.registry_id.as_deref(), Some("my-registry"));
        assert_eq!(config.mqtt.broker_port, 443);
        assert_eq!(config.telemetry.publish_interval_secs, 5);
        assert_eq!(config.telemetry.message_type, MessageType::Events);
    }

    #[test]
    fn test_env_fallback_only_when_missing() {
        let mut config = minimal();
        config.apply_env_fallbacks_with(|_| Some("from-env".to_string()));
        assert_eq!(config.device.project_id.as_deref(), Some("demo-123"));

        config.device.project_id = None;
        config.apply_env_fallbacks_with(|name| match name {
            "GCLOUD_PROJECT" => Some(String::new()),
            "GOOGLE_CLOUD_PROJECT" => Some("google-project".to_string()),
            _ => None,
        });
        assert_eq!(config.device.project_id.as_deref(), Some("google-project"));
    }

    #[test]
    fn test_round_trips_through_toml() {
        let config = DeviceConfig::from_toml_str(FULL_CONFIG).unwrap();
        let rendered = config.to_toml_string().unwrap();
        assert_eq!(DeviceConfig::from_toml_str(&rendered).unwrap(), config);
    }
}
