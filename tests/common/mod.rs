#![allow(dead_code)]

use dispenser_link::identity::{DeviceIdentity, FixedHardwareId};
use dispenser_link::link::{LinkCredentials, LinkDriver, LinkError, LinkStatus};
use dispenser_link::publisher::{Calibration, DeviceProfile, Publisher};
use dispenser_link::router::{CommandHandler, CommandReply};
use dispenser_link::session::{BrokerSession, SessionSettings};
use dispenser_link::transport::{BrokerCredentials, BrokerTransport, TransportError, TransportEvent};
use serde_json::Value;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr};
use std::rc::Rc;

pub const HARDWARE_ID: u64 = 0x0123_4567_89ab;
pub const DEVICE_ID: &str = "FIDO_0123456789AB";

#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retained: bool,
}

impl Published {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.payload).expect("published payload is JSON")
    }
}

/// In-memory broker transport that records every interaction.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    pub events: VecDeque<TransportEvent>,
    pub connected: bool,
    pub auto_ack: bool,
    pub fail_connect: bool,
    pub fail_publish: bool,
    pub connect_calls: Vec<(String, BrokerCredentials)>,
    pub subscriptions: Vec<String>,
    pub published: Vec<Published>,
    pub disconnects: u32,
}

impl RecordingTransport {
    pub fn auto_ack() -> Self {
        Self {
            auto_ack: true,
            ..Self::default()
        }
    }

    pub fn deliver(&mut self, topic: &str, payload: &[u8]) {
        self.events.push_back(TransportEvent::Message {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        });
    }

    pub fn published_on(&self, topic: &str) -> Vec<&Published> {
        self.published.iter().filter(|p| p.topic == topic).collect()
    }

    /// Simulates the broker dropping the session without a notification.
    pub fn drop_silently(&mut self) {
        self.connected = false;
    }
}

impl BrokerTransport for RecordingTransport {
    fn start_connect(
        &mut self,
        client_id: &str,
        credentials: &BrokerCredentials,
    ) -> Result<(), TransportError> {
        self.connect_calls
            .push((client_id.to_string(), credentials.clone()));
        if self.fail_connect {
            return Err(TransportError::Io("connection refused".to_string()));
        }
        if self.auto_ack {
            self.events.push_back(TransportEvent::ConnAck);
        }
        Ok(())
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        let event = self.events.pop_front()?;
        match &event {
            TransportEvent::ConnAck => self.connected = true,
            TransportEvent::Refused { .. } | TransportEvent::Disconnected { .. } => {
                self.connected = false
            }
            TransportEvent::Message { .. } => {}
        }
        Some(event)
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        self.subscriptions.push(topic.to_string());
        Ok(())
    }

    fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        retained: bool,
    ) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        if self.fail_publish {
            return Err(TransportError::QueueFull);
        }
        self.published.push(Published {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            retained,
        });
        Ok(())
    }

    fn disconnect(&mut self) {
        self.connected = false;
        self.disconnects += 1;
    }
}

pub type CallLog = Rc<RefCell<Vec<(String, Value)>>>;

/// Handler that records every dispatch and optionally replies.
pub struct RecordingHandler {
    pub calls: CallLog,
    pub replies: Vec<(String, CommandReply)>,
}

impl RecordingHandler {
    pub fn new() -> (Self, CallLog) {
        let calls = CallLog::default();
        (
            Self {
                calls: Rc::clone(&calls),
                replies: Vec::new(),
            },
            calls,
        )
    }

    pub fn replying(mut self, command: &str, reply: CommandReply) -> Self {
        self.replies.push((command.to_string(), reply));
        self
    }
}

impl CommandHandler for RecordingHandler {
    fn handle(&mut self, command: &str, payload: &Value) {
        self.calls
            .borrow_mut()
            .push((command.to_string(), payload.clone()));
    }

    fn reply(&mut self, command: &str) -> Option<CommandReply> {
        self.replies
            .iter()
            .find(|(name, _)| name == command)
            .map(|(_, reply)| reply.clone())
    }
}

/// Link driver whose status is set by the test.
#[derive(Debug)]
pub struct ManualLinkDriver {
    pub status: Rc<RefCell<LinkStatus>>,
    pub begins: u32,
}

impl ManualLinkDriver {
    pub fn new(status: LinkStatus) -> (Self, Rc<RefCell<LinkStatus>>) {
        let status = Rc::new(RefCell::new(status));
        (
            Self {
                status: Rc::clone(&status),
                begins: 0,
            },
            status,
        )
    }
}

impl LinkDriver for ManualLinkDriver {
    fn begin(&mut self, _credentials: &LinkCredentials) -> Result<(), LinkError> {
        self.begins += 1;
        Ok(())
    }

    fn status(&mut self) -> LinkStatus {
        *self.status.borrow()
    }

    fn local_ip(&self) -> Option<IpAddr> {
        Some(IpAddr::V4(Ipv4Addr::new(192, 168, 4, 20)))
    }
}

pub fn identity() -> DeviceIdentity {
    DeviceIdentity::generate(&FixedHardwareId(HARDWARE_ID))
}

pub fn publisher() -> Publisher {
    Publisher::new(identity(), DeviceProfile::default(), Calibration::default())
}

pub fn session(transport: RecordingTransport) -> BrokerSession<RecordingTransport> {
    BrokerSession::new(transport, publisher(), SessionSettings::default())
}

pub fn session_with(
    transport: RecordingTransport,
    settings: SessionSettings,
) -> BrokerSession<RecordingTransport> {
    BrokerSession::new(transport, publisher(), settings)
}

/// Session connected at t=0 with the startup publishes cleared.
pub fn connected_session(handler: Box<dyn CommandHandler>) -> BrokerSession<RecordingTransport> {
    let mut session = session(RecordingTransport::auto_ack()).with_command_handler(handler);
    session.tick(0, true);
    assert!(session.is_connected(), "session should connect on first tick");
    session.transport_mut().published.clear();
    session
}

pub fn topic(kind: &str) -> String {
    format!("fido/dispensers/{}/{}", DEVICE_ID, kind)
}
