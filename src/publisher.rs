use crate::identity::DeviceIdentity;
use crate::protocol::{
    DiscoveryMessage, MessageCodec, ProtocolError, ResponseMessage, SensorDataMessage,
    StatusMessage, DEVICE_TYPE,
};
use crate::transport::{BrokerTransport, TransportError};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use thiserror::Error;
use tracing::{debug, warn};

pub const DIST_FULL: f32 = 8.0;
pub const DIST_EMPTY: f32 = 12.5;
pub const DEFAULT_DEVICE_NAME: &str = "FIDO_Dispenser";
pub const DEFAULT_FIRMWARE_VERSION: &str = "1.0.0";
pub const DEFAULT_BATTERY_LEVEL: u8 = 100;
const UNKNOWN_IP: &str = "0.0.0.0";

/// Distance calibration for the reservoir level sensor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Calibration {
    /// Reading at or below which the reservoir is full.
    pub dist_full: f32,
    /// Reading at or above which the reservoir is empty.
    pub dist_empty: f32,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            dist_full: DIST_FULL,
            dist_empty: DIST_EMPTY,
        }
    }
}

impl Calibration {
    /// Percent full in [0, 100], linear between the two calibration points.
    /// A NaN reading counts as empty.
    pub fn level_percent(&self, distance: f32) -> f32 {
        if distance.is_nan() {
            return 0.0;
        }

        let level = if distance <= self.dist_full {
            100.0
        } else if distance >= self.dist_empty {
            0.0
        } else {
            100.0 * (self.dist_empty - distance) / (self.dist_empty - self.dist_full)
        };

        level.clamp(0.0, 100.0)
    }

    pub fn container_level(&self, distance: f32) -> u8 {
        self.level_percent(distance).round() as u8
    }
}

pub fn round_tenths(value: f32) -> f32 {
    (value * 10.0).round() / 10.0
}

fn round_percent(level: f32) -> u8 {
    if level.is_nan() {
        0
    } else {
        level.clamp(0.0, 100.0).round() as u8
    }
}

/// Static facts advertised in discovery and telemetry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub name: String,
    pub version: String,
    pub battery_level: u8,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            name: DEFAULT_DEVICE_NAME.to_string(),
            version: DEFAULT_FIRMWARE_VERSION.to_string(),
            battery_level: DEFAULT_BATTERY_LEVEL,
        }
    }
}

/// One telemetry reading handed over by the sensor collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSnapshot {
    pub weight: f32,
    pub distance: f32,
    pub dispenser_state: String,
    pub dispensed_amount: f32,
    /// Overrides the level derived from `distance` when set.
    pub container_level: Option<f32>,
    /// Optional discriminator for downstream consumers; empty means absent.
    pub kind: Option<String>,
}

impl SensorSnapshot {
    pub fn new(weight: f32, distance: f32, dispenser_state: impl Into<String>) -> Self {
        Self {
            weight,
            distance,
            dispenser_state: dispenser_state.into(),
            dispensed_amount: 0.0,
            container_level: None,
            kind: None,
        }
    }

    pub fn with_dispensed_amount(mut self, amount: f32) -> Self {
        self.dispensed_amount = amount;
        self
    }

    pub fn with_container_level(mut self, level: f32) -> Self {
        self.container_level = Some(level);
        self
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error("session is not connected")]
    NotConnected,
    #[error("encode failed: {0}")]
    Encode(#[from] ProtocolError),
    #[error("send failed: {0}")]
    Transport(#[from] TransportError),
}

fn non_empty(text: Option<&str>) -> Option<&str> {
    text.filter(|t| !t.is_empty())
}

/// Formats the four outbound message kinds and hands them to a transport.
///
/// Connection gating is the session's job; the publisher only encodes and
/// sends.
#[derive(Debug)]
pub struct Publisher {
    identity: DeviceIdentity,
    profile: DeviceProfile,
    calibration: Calibration,
    codec: MessageCodec,
    local_ip: Option<IpAddr>,
}

impl Publisher {
    pub fn new(identity: DeviceIdentity, profile: DeviceProfile, calibration: Calibration) -> Self {
        Self {
            identity,
            profile,
            calibration,
            codec: MessageCodec::new(),
            local_ip: None,
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    pub fn set_local_ip(&mut self, ip: Option<IpAddr>) {
        self.local_ip = ip;
    }

    pub fn local_ip(&self) -> Option<IpAddr> {
        self.local_ip
    }

    /// Presence advertisement on the shared discovery topic, always retained.
    pub fn publish_discovery<T: BrokerTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        now_ms: u64,
    ) -> Result<(), PublishError> {
        let ip = self
            .local_ip
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| UNKNOWN_IP.to_string());
        let message = DiscoveryMessage {
            device_id: self.identity.id(),
            name: &self.profile.name,
            device_type: DEVICE_TYPE,
            version: &self.profile.version,
            ip: &ip,
            timestamp: now_ms,
            is_available: true,
            battery_level: self.profile.battery_level,
        };

        let frame = self.codec.encode(&message)?;
        transport.publish(self.identity.topics().discovery(), frame, true)?;
        debug!("Discovery message published");
        Ok(())
    }

    pub fn publish_status<T: BrokerTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        now_ms: u64,
        status: &str,
        description: &str,
    ) -> Result<(), PublishError> {
        let message = StatusMessage {
            device_id: self.identity.id(),
            status,
            description,
            timestamp: now_ms,
            is_online: true,
        };

        let frame = self.codec.encode(&message)?;
        transport.publish(self.identity.topics().status(), frame, false)?;
        debug!(status, description, "Status published");
        Ok(())
    }

    pub fn publish_sensor_data<T: BrokerTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        now_ms: u64,
        snapshot: &SensorSnapshot,
    ) -> Result<(), PublishError> {
        let container_level = match snapshot.container_level {
            Some(level) => round_percent(level),
            None => self.calibration.container_level(snapshot.distance),
        };
        let message = SensorDataMessage {
            device_id: self.identity.id(),
            timestamp: now_ms,
            weight: round_tenths(snapshot.weight),
            distance: round_tenths(snapshot.distance),
            dispenser_state: &snapshot.dispenser_state,
            dispensed_amount: round_tenths(snapshot.dispensed_amount),
            container_level,
            battery_level: self.profile.battery_level,
            is_online: true,
            kind: non_empty(snapshot.kind.as_deref()),
        };

        let frame = self.codec.encode(&message)?;
        if let Err(e) = transport.publish(self.identity.topics().data(), frame, false) {
            warn!(error = %e, "Telemetry send failed");
            return Err(e.into());
        }
        debug!(
            container_level,
            state = %snapshot.dispenser_state,
            "Telemetry published"
        );
        Ok(())
    }

    pub fn publish_response<T: BrokerTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        now_ms: u64,
        command: &str,
        result: &str,
        message: &str,
        kind: Option<&str>,
    ) -> Result<(), PublishError> {
        let response = ResponseMessage {
            device_id: self.identity.id(),
            command,
            result,
            message,
            timestamp: now_ms,
            kind: non_empty(kind),
        };

        let frame = self.codec.encode(&response)?;
        transport.publish(self.identity.topics().response(), frame, false)?;
        debug!(command, result, "Response published");
        Ok(())
    }
}
