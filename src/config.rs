//! Node configuration, loaded from a JSON file. Every field has a default so
//! an empty object is a valid configuration.

use crate::agent::{AgentSettings, DEFAULT_LINK_RETRY_INTERVAL_MS, DEFAULT_TELEMETRY_INTERVAL_MS};
use crate::identity::{parse_hardware_id, DeviceIdentity, HardwareIdSource};
use crate::link::{LinkCredentials, DEFAULT_ATTEMPT_INTERVAL_MS, DEFAULT_MAX_ATTEMPTS};
use crate::mqtt::DEFAULT_KEEP_ALIVE_SECS;
use crate::publisher::{
    Calibration, DeviceProfile, DEFAULT_BATTERY_LEVEL, DEFAULT_DEVICE_NAME,
    DEFAULT_FIRMWARE_VERSION, DIST_EMPTY, DIST_FULL,
};
use crate::session::{
    SessionSettings, DEFAULT_HANDSHAKE_TIMEOUT_MS, DEFAULT_HEARTBEAT_INTERVAL_MS,
    DEFAULT_RECONNECT_INTERVAL_MS,
};
use crate::transport::BrokerCredentials;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_BROKER_PORT: u16 = 1883;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispenserConfig {
    pub device: DeviceConfig,
    pub link: LinkConfig,
    pub broker: BrokerConfig,
    pub session: SessionConfig,
    pub calibration: Calibration,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub name: String,
    pub version: String,
    pub battery_level: u8,
    /// Hex override for the hardware id, e.g. `"01:23:45:67:89:AB"`.
    pub hardware_id: Option<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_DEVICE_NAME.to_string(),
            version: DEFAULT_FIRMWARE_VERSION.to_string(),
            battery_level: DEFAULT_BATTERY_LEVEL,
            hardware_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub ssid: String,
    pub password: String,
    pub attempt_interval_ms: u64,
    pub max_attempts: u8,
    pub retry_interval_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            ssid: String::new(),
            password: String::new(),
            attempt_interval_ms: DEFAULT_ATTEMPT_INTERVAL_MS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_interval_ms: DEFAULT_LINK_RETRY_INTERVAL_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub keep_alive_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_BROKER_PORT,
            username: String::new(),
            password: String::new(),
            keep_alive_secs: DEFAULT_KEEP_ALIVE_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub heartbeat_interval_ms: u64,
    pub reconnect_interval_ms: u64,
    pub handshake_timeout_ms: u64,
    /// Acknowledge commands that carry no name.
    pub ack_empty_commands: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            reconnect_interval_ms: DEFAULT_RECONNECT_INTERVAL_MS,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            ack_empty_commands: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub interval_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_TELEMETRY_INTERVAL_MS,
        }
    }
}

impl DispenserConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: DispenserConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("link.attempt_interval_ms", self.link.attempt_interval_ms),
            ("link.retry_interval_ms", self.link.retry_interval_ms),
            ("session.heartbeat_interval_ms", self.session.heartbeat_interval_ms),
            ("session.reconnect_interval_ms", self.session.reconnect_interval_ms),
            ("session.handshake_timeout_ms", self.session.handshake_timeout_ms),
            ("telemetry.interval_ms", self.telemetry.interval_ms),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Validation(format!("{} must be > 0", name)));
        }

        if self.link.max_attempts == 0 {
            return Err(invalid("link.max_attempts must be > 0"));
        }
        if self.broker.host.trim().is_empty() {
            return Err(invalid("broker.host must not be empty"));
        }
        if self.broker.port == 0 {
            return Err(invalid("broker.port must be > 0"));
        }
        if self.device.battery_level > 100 {
            return Err(invalid("device.battery_level must be at most 100"));
        }
        let Calibration {
            dist_full,
            dist_empty,
        } = self.calibration;
        if dist_full.is_nan() || dist_empty.is_nan() || dist_full >= dist_empty {
            return Err(invalid(
                "calibration.dist_full must be smaller than calibration.dist_empty",
            ));
        }
        if let Some(text) = &self.device.hardware_id {
            if parse_hardware_id(text).is_none() {
                return Err(ConfigError::Validation(format!(
                    "device.hardware_id {:?} is not a 48-bit hex value",
                    text
                )));
            }
        }

        Ok(())
    }

    /// Identity from the configured override, falling back to `source`.
    pub fn identity<H: HardwareIdSource + ?Sized>(&self, source: &H) -> DeviceIdentity {
        match self.device.hardware_id.as_deref().and_then(parse_hardware_id) {
            Some(raw) => DeviceIdentity::from_hardware_id(raw),
            None => DeviceIdentity::generate(source),
        }
    }

    pub fn profile(&self) -> DeviceProfile {
        DeviceProfile {
            name: self.device.name.clone(),
            version: self.device.version.clone(),
            battery_level: self.device.battery_level,
        }
    }

    pub fn link_credentials(&self) -> LinkCredentials {
        LinkCredentials {
            ssid: self.link.ssid.clone(),
            password: self.link.password.clone(),
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            heartbeat_interval_ms: self.session.heartbeat_interval_ms,
            reconnect_interval_ms: self.session.reconnect_interval_ms,
            handshake_timeout_ms: self.session.handshake_timeout_ms,
            credentials: BrokerCredentials {
                username: self.broker.username.clone(),
                password: self.broker.password.clone(),
            },
            ack_empty_commands: self.session.ack_empty_commands,
        }
    }

    pub fn agent_settings(&self) -> AgentSettings {
        AgentSettings {
            telemetry_interval_ms: self.telemetry.interval_ms,
            link_retry_interval_ms: self.link.retry_interval_ms,
        }
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Validation(message.to_string())
}
