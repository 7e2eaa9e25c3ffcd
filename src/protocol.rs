use arrayvec::ArrayVec;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use static_assertions::const_assert;
use thiserror::Error;

pub const MAX_INBOUND_SIZE: usize = 512;
pub const MAX_DISCOVERY_SIZE: usize = 384;
pub const MAX_STATUS_SIZE: usize = 256;
pub const MAX_DATA_SIZE: usize = 384;
pub const MAX_RESPONSE_SIZE: usize = 320;
pub const MAX_FRAME_SIZE: usize = 512;

const_assert!(MAX_DISCOVERY_SIZE <= MAX_FRAME_SIZE);
const_assert!(MAX_STATUS_SIZE <= MAX_FRAME_SIZE);
const_assert!(MAX_DATA_SIZE <= MAX_FRAME_SIZE);
const_assert!(MAX_RESPONSE_SIZE <= MAX_FRAME_SIZE);

pub type FrameBuffer = ArrayVec<u8, MAX_FRAME_SIZE>;

pub const DEVICE_TYPE: &str = "smart_dispenser";
pub const DISCOVER_ACTION: &str = "discover";
pub const CONNECT_COMMAND: &str = "connect";
pub const RESULT_RECEIVED: &str = "received";
pub const STATUS_ONLINE: &str = "online";
pub const STATUS_OFFLINE: &str = "offline";
pub const STARTUP_DESCRIPTION: &str = "System started";
pub const HEARTBEAT_DESCRIPTION: &str = "Heartbeat";
pub const SHUTDOWN_DESCRIPTION: &str = "System stopping";

const COMMAND_FIELD: &str = "command";
const ACTION_FIELD: &str = "action";
const DATA_FIELD: &str = "data";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Discovery,
    Status,
    Data,
    Response,
}

impl MessageKind {
    pub const fn max_size(self) -> usize {
        match self {
            MessageKind::Discovery => MAX_DISCOVERY_SIZE,
            MessageKind::Status => MAX_STATUS_SIZE,
            MessageKind::Data => MAX_DATA_SIZE,
            MessageKind::Response => MAX_RESPONSE_SIZE,
        }
    }
}

/// An outbound record with a fixed schema and serialized-size budget.
pub trait OutboundMessage: Serialize {
    const KIND: MessageKind;
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryMessage<'a> {
    pub device_id: &'a str,
    pub name: &'a str,
    #[serde(rename = "type")]
    pub device_type: &'a str,
    pub version: &'a str,
    pub ip: &'a str,
    pub timestamp: u64,
    pub is_available: bool,
    pub battery_level: u8,
}

impl OutboundMessage for DiscoveryMessage<'_> {
    const KIND: MessageKind = MessageKind::Discovery;
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusMessage<'a> {
    pub device_id: &'a str,
    pub status: &'a str,
    pub description: &'a str,
    pub timestamp: u64,
    pub is_online: bool,
}

impl OutboundMessage for StatusMessage<'_> {
    const KIND: MessageKind = MessageKind::Status;
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorDataMessage<'a> {
    pub device_id: &'a str,
    pub timestamp: u64,
    pub weight: f32,
    pub distance: f32,
    pub dispenser_state: &'a str,
    pub dispensed_amount: f32,
    pub container_level: u8,
    pub battery_level: u8,
    pub is_online: bool,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<&'a str>,
}

impl OutboundMessage for SensorDataMessage<'_> {
    const KIND: MessageKind = MessageKind::Data;
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMessage<'a> {
    pub device_id: &'a str,
    pub command: &'a str,
    pub result: &'a str,
    pub message: &'a str,
    pub timestamp: u64,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<&'a str>,
}

impl OutboundMessage for ResponseMessage<'_> {
    const KIND: MessageKind = MessageKind::Response;
}

/// Inbound message on the shared discovery topic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DiscoveryRequest {
    #[serde(default)]
    pub action: Option<String>,
}

impl DiscoveryRequest {
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        check_inbound_size(payload)?;
        serde_json::from_slice(payload).map_err(|e| ProtocolError::InvalidJson(e.to_string()))
    }

    pub fn is_discover(&self) -> bool {
        self.action.as_deref() == Some(DISCOVER_ACTION)
    }
}

/// Command name resolved from an inbound envelope. `command` wins over
/// `action`; an envelope with neither carries no name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandName {
    Command(String),
    Action(String),
    Missing,
}

impl CommandName {
    pub fn extract(envelope: &Map<String, Value>) -> Self {
        if let Some(value) = envelope.get(COMMAND_FIELD) {
            CommandName::Command(field_text(value))
        } else if let Some(value) = envelope.get(ACTION_FIELD) {
            CommandName::Action(field_text(value))
        } else {
            CommandName::Missing
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            CommandName::Command(name) | CommandName::Action(name) => name,
            CommandName::Missing => "",
        }
    }

    pub fn is_empty(&self) -> bool {
        self.as_str().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadSource {
    /// The envelope's nested `data` field.
    Nested,
    /// The whole envelope, name field included.
    Envelope,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandEnvelope {
    name: CommandName,
    payload: Value,
    payload_source: PayloadSource,
}

impl CommandEnvelope {
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        decode_object(payload).map(Self::from_object)
    }

    pub fn from_object(mut envelope: Map<String, Value>) -> Self {
        let name = CommandName::extract(&envelope);
        let (payload, payload_source) = match envelope.remove(DATA_FIELD) {
            Some(data) => (data, PayloadSource::Nested),
            None => (Value::Object(envelope), PayloadSource::Envelope),
        };

        Self {
            name,
            payload,
            payload_source,
        }
    }

    pub fn name(&self) -> &CommandName {
        &self.name
    }

    pub fn command(&self) -> &str {
        self.name.as_str()
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn payload_source(&self) -> PayloadSource {
        self.payload_source
    }
}

// Non-string names are rendered as their JSON text; null counts as absent text.
fn field_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn check_inbound_size(payload: &[u8]) -> Result<(), ProtocolError> {
    if payload.len() > MAX_INBOUND_SIZE {
        return Err(ProtocolError::InboundTooLarge {
            len: payload.len(),
            limit: MAX_INBOUND_SIZE,
        });
    }
    Ok(())
}

/// Decodes an inbound frame into a JSON object, rejecting oversized frames
/// before any parsing happens.
pub fn decode_object(payload: &[u8]) -> Result<Map<String, Value>, ProtocolError> {
    check_inbound_size(payload)?;

    match serde_json::from_slice::<Value>(payload) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ProtocolError::NotAnObject),
        Err(e) => Err(ProtocolError::InvalidJson(e.to_string())),
    }
}

/// Serializes outbound records into one preallocated frame buffer.
#[derive(Debug, Default)]
pub struct MessageCodec {
    frame: FrameBuffer,
}

impl MessageCodec {
    pub fn new() -> Self {
        Self {
            frame: ArrayVec::new(),
        }
    }

    pub fn encode<M: OutboundMessage>(&mut self, message: &M) -> Result<&[u8], ProtocolError> {
        let limit = M::KIND.max_size();
        self.frame.clear();

        if let Err(e) = serde_json::to_writer(&mut self.frame, message) {
            self.frame.clear();
            return Err(if e.is_io() {
                ProtocolError::MessageTooLarge {
                    kind: M::KIND,
                    limit,
                }
            } else {
                ProtocolError::Serialization(e.to_string())
            });
        }

        if self.frame.len() > limit {
            self.frame.clear();
            return Err(ProtocolError::MessageTooLarge {
                kind: M::KIND,
                limit,
            });
        }

        Ok(&self.frame)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("inbound frame of {len} bytes exceeds the {limit} byte limit")]
    InboundTooLarge { len: usize, limit: usize },
    #[error("inbound frame is not a JSON object")]
    NotAnObject,
    #[error("{kind:?} message exceeds its {limit} byte budget")]
    MessageTooLarge { kind: MessageKind, limit: usize },
    #[error("serialization failed: {0}")]
    Serialization(String),
}
