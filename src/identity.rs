//! Device identity and the per-device topic set.
//!
//! The identity is derived once from a 48-bit hardware value (the network
//! interface MAC on the reference board) and never changes afterwards. All
//! topic names are pure functions of the resulting id.

use serde::{Deserialize, Serialize};

pub const DEVICE_ID_PREFIX: &str = "FIDO_";
pub const TOPIC_ROOT: &str = "fido/dispensers";
pub const DISCOVERY_TOPIC: &str = "fido/dispensers/discovery";

const HARDWARE_ID_MASK: u64 = 0xFFFF_FFFF_FFFF;
const HARDWARE_ID_HEX_DIGITS: usize = 12;

/// Source of the hardware-unique 48-bit value. Reads are assumed infallible.
pub trait HardwareIdSource {
    fn read_hardware_id(&self) -> u64;
}

/// Hardware id known up front (configuration override, tests).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHardwareId(pub u64);

impl HardwareIdSource for FixedHardwareId {
    fn read_hardware_id(&self) -> u64 {
        self.0
    }
}

/// Which inbound channel a topic belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundTopic {
    Discovery,
    Commands,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicSet {
    status: String,
    data: String,
    commands: String,
    response: String,
}

impl TopicSet {
    pub fn for_device(device_id: &str) -> Self {
        Self {
            status: format!("{}/{}/status", TOPIC_ROOT, device_id),
            data: format!("{}/{}/data", TOPIC_ROOT, device_id),
            commands: format!("{}/{}/commands", TOPIC_ROOT, device_id),
            response: format!("{}/{}/response", TOPIC_ROOT, device_id),
        }
    }

    pub fn discovery(&self) -> &'static str {
        DISCOVERY_TOPIC
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn data(&self) -> &str {
        &self.data
    }

    pub fn commands(&self) -> &str {
        &self.commands
    }

    pub fn response(&self) -> &str {
        &self.response
    }

    pub fn classify(&self, topic: &str) -> Option<InboundTopic> {
        if topic == DISCOVERY_TOPIC {
            Some(InboundTopic::Discovery)
        } else if topic == self.commands {
            Some(InboundTopic::Commands)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    id: String,
    hardware_id: u64,
    topics: TopicSet,
}

impl DeviceIdentity {
    /// Reads the hardware value once and derives the id and topics from it.
    pub fn generate<H: HardwareIdSource + ?Sized>(source: &H) -> Self {
        Self::from_hardware_id(source.read_hardware_id())
    }

    pub fn from_hardware_id(raw: u64) -> Self {
        let hardware_id = raw & HARDWARE_ID_MASK;
        let id = format!(
            "{}{:0width$X}",
            DEVICE_ID_PREFIX,
            hardware_id,
            width = HARDWARE_ID_HEX_DIGITS
        );
        let topics = TopicSet::for_device(&id);

        Self {
            id,
            hardware_id,
            topics,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn hardware_id(&self) -> u64 {
        self.hardware_id
    }

    pub fn topics(&self) -> &TopicSet {
        &self.topics
    }
}

/// Parses a hardware id written as `01:23:45:67:89:AB`, `01-23-...`,
/// `0x0123456789AB` or bare hex. Values wider than 48 bits are rejected.
pub fn parse_hardware_id(text: &str) -> Option<u64> {
    let trimmed = text.trim();
    let without_prefix = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    let digits: String = without_prefix
        .chars()
        .filter(|c| *c != ':' && *c != '-')
        .collect();

    if digits.is_empty() || digits.len() > HARDWARE_ID_HEX_DIGITS {
        return None;
    }

    u64::from_str_radix(&digits, 16).ok()
}
