//! MQTT broker transport built on `rumqttc`.
//!
//! Every connection attempt gets a fresh client and event loop. The event
//! loop runs as a task on the surrounding tokio runtime and forwards what the
//! session cares about over a bounded channel; the session drains it from its
//! maintenance tick. The task never reconnects on its own, so reconnect
//! pacing stays with the session.

use crate::protocol::{MAX_FRAME_SIZE, MAX_INBOUND_SIZE};
use crate::session::MAX_REQUESTS_PER_TICK;
use crate::transport::{codes, BrokerCredentials, BrokerTransport, TransportError, TransportEvent};
use rumqttc::{
    AsyncClient, ClientError, ConnAck, ConnectReturnCode, ConnectionError, Event, EventLoop,
    MqttOptions, Outgoing, Packet, QoS,
};
use static_assertions::const_assert;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 32;
const REQUEST_CHANNEL_CAPACITY: usize = 48;
// A packet above this limit ends the connection inside rumqttc. Frames
// between the codec limit and this one reach the codec and are dropped there.
const MAX_INCOMING_PACKET_SIZE: usize = 256 * 1024;
const MAX_OUTGOING_PACKET_SIZE: usize = 1024;

// The session queues requests synchronously within a tick, so the client
// queue must hold a full tick's worth without draining.
const_assert!(REQUEST_CHANNEL_CAPACITY >= MAX_REQUESTS_PER_TICK);
const_assert!(MAX_INCOMING_PACKET_SIZE >= 64 * MAX_INBOUND_SIZE);
const_assert!(MAX_OUTGOING_PACKET_SIZE >= MAX_FRAME_SIZE + 128);
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 15;

pub struct MqttTransport {
    host: String,
    port: u16,
    keep_alive: Duration,
    client: Option<AsyncClient>,
    events: Option<mpsc::Receiver<TransportEvent>>,
    task: Option<JoinHandle<()>>,
    connected: bool,
}

impl MqttTransport {
    pub fn new(host: impl Into<String>, port: u16, keep_alive_secs: u64) -> Self {
        Self {
            host: host.into(),
            port,
            keep_alive: Duration::from_secs(keep_alive_secs.max(5)),
            client: None,
            events: None,
            task: None,
            connected: false,
        }
    }

    fn teardown(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.client = None;
        self.events = None;
        self.connected = false;
    }

    fn client(&self) -> Result<&AsyncClient, TransportError> {
        self.client.as_ref().ok_or(TransportError::NotConnected)
    }
}

impl BrokerTransport for MqttTransport {
    fn start_connect(
        &mut self,
        client_id: &str,
        credentials: &BrokerCredentials,
    ) -> Result<(), TransportError> {
        self.teardown();

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TransportError::Io(e.to_string()))?;

        let mut options = MqttOptions::new(client_id, self.host.clone(), self.port);
        options
            .set_keep_alive(self.keep_alive)
            .set_clean_session(true)
            .set_max_packet_size(MAX_INCOMING_PACKET_SIZE, MAX_OUTGOING_PACKET_SIZE);
        if !credentials.username.is_empty() {
            options.set_credentials(credentials.username.clone(), credentials.password.clone());
        }

        let (client, event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        debug!(host = %self.host, port = self.port, client_id, "Starting MQTT event loop");
        self.task = Some(runtime.spawn(run_event_loop(event_loop, events_tx)));
        self.client = Some(client);
        self.events = Some(events_rx);
        Ok(())
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        let received = self.events.as_mut()?.try_recv();

        match received {
            Ok(event) => {
                match event {
                    TransportEvent::ConnAck => self.connected = true,
                    TransportEvent::Refused { .. } | TransportEvent::Disconnected { .. } => {
                        self.connected = false
                    }
                    TransportEvent::Message { .. } => {}
                }
                Some(event)
            }
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.events = None;
                if self.connected {
                    self.connected = false;
                    Some(TransportEvent::Disconnected {
                        code: codes::CONNECTION_LOST,
                    })
                } else {
                    None
                }
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.client()?
            .try_subscribe(topic, QoS::AtMostOnce)
            .map_err(map_client_error)
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
        self.client()?
            .try_publish(topic, QoS::AtMostOnce, retained, payload.to_vec())
            .map_err(map_client_error)
    }

    fn disconnect(&mut self) {
        if let Some(client) = self.client.as_ref() {
            if let Err(e) = client.try_disconnect() {
                debug!(error = %e, "Disconnect request not queued");
            }
        }
        self.connected = false;
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn map_client_error(error: ClientError) -> TransportError {
    match error {
        ClientError::TryRequest(_) => TransportError::QueueFull,
        ClientError::Request(_) => TransportError::Io(error.to_string()),
    }
}

pub fn return_code(code: ConnectReturnCode) -> i8 {
    match code {
        ConnectReturnCode::Success => codes::CONNECTED,
        ConnectReturnCode::RefusedProtocolVersion => codes::BAD_PROTOCOL,
        ConnectReturnCode::BadClientId => codes::BAD_CLIENT_ID,
        ConnectReturnCode::ServiceUnavailable => codes::UNAVAILABLE,
        ConnectReturnCode::BadUserNamePassword => codes::BAD_CREDENTIALS,
        ConnectReturnCode::NotAuthorized => codes::UNAUTHORIZED,
    }
}

fn connection_error_event(error: &ConnectionError, acknowledged: bool) -> TransportEvent {
    match error {
        ConnectionError::ConnectionRefused(code) => TransportEvent::Refused {
            code: return_code(*code),
        },
        _ if acknowledged => TransportEvent::Disconnected {
            code: codes::CONNECTION_LOST,
        },
        ConnectionError::NetworkTimeout => TransportEvent::Refused {
            code: codes::CONNECTION_TIMEOUT,
        },
        _ => TransportEvent::Refused {
            code: codes::CONNECT_FAILED,
        },
    }
}

async fn run_event_loop(mut event_loop: EventLoop, events: mpsc::Sender<TransportEvent>) {
    let mut acknowledged = false;

    loop {
        let (event, last) = match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ConnAck { code, .. }))) => {
                if code == ConnectReturnCode::Success {
                    acknowledged = true;
                    (TransportEvent::ConnAck, false)
                } else {
                    (TransportEvent::Refused { code: return_code(code) }, true)
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => (
                TransportEvent::Message {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                },
                false,
            ),
            Ok(Event::Incoming(Packet::Disconnect)) => {
                info!("Broker closed the session");
                (
                    TransportEvent::Disconnected {
                        code: codes::DISCONNECTED,
                    },
                    true,
                )
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("Sent disconnect to broker");
                (
                    TransportEvent::Disconnected {
                        code: codes::DISCONNECTED,
                    },
                    true,
                )
            }
            Ok(other) => {
                debug!(event = ?other, "MQTT notification");
                continue;
            }
            Err(e) => {
                warn!(error = %e, "MQTT event loop stopped");
                (connection_error_event(&e, acknowledged), true)
            }
        };

        if events.send(event).await.is_err() || last {
            break;
        }
    }
}
