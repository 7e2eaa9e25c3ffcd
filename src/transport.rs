use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broker status codes, following the conventional MQTT client state
/// numbering: negative values are client-side failures, positive values are
/// CONNACK refusal codes.
pub mod codes {
    pub const CONNECTION_TIMEOUT: i8 = -4;
    pub const CONNECTION_LOST: i8 = -3;
    pub const CONNECT_FAILED: i8 = -2;
    pub const DISCONNECTED: i8 = -1;
    pub const CONNECTED: i8 = 0;
    pub const BAD_PROTOCOL: i8 = 1;
    pub const BAD_CLIENT_ID: i8 = 2;
    pub const UNAVAILABLE: i8 = 3;
    pub const BAD_CREDENTIALS: i8 = 4;
    pub const UNAUTHORIZED: i8 = 5;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerCredentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Broker accepted the handshake.
    ConnAck,
    /// Handshake failed with a broker or client status code.
    Refused { code: i8 },
    Message { topic: String, payload: Vec<u8> },
    /// An established session ended.
    Disconnected { code: i8 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("not connected to broker")]
    NotConnected,
    #[error("transport request queue is full")]
    QueueFull,
    #[error("transport failure: {0}")]
    Io(String),
}

/// Publish/subscribe transport driven from the maintenance tick.
///
/// Implementations must never block: handshakes, deliveries and disconnects
/// are reported through [`poll_event`](BrokerTransport::poll_event).
pub trait BrokerTransport {
    fn start_connect(
        &mut self,
        client_id: &str,
        credentials: &BrokerCredentials,
    ) -> Result<(), TransportError>;

    fn poll_event(&mut self) -> Option<TransportEvent>;

    fn is_connected(&self) -> bool;

    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError>;

    fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        retained: bool,
    ) -> Result<(), TransportError>;

    fn disconnect(&mut self);
}
