mod common;

use common::*;
use dispenser_link::agent::MonotonicClock;
use dispenser_link::mqtt::{MqttTransport, DEFAULT_KEEP_ALIVE_SECS};
use dispenser_link::protocol::MAX_INBOUND_SIZE;
use dispenser_link::router::CommandReply;
use dispenser_link::session::{BrokerSession, SessionSettings, SessionState};
use dispenser_link::transport::BrokerTransport;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;

const WAIT: Duration = Duration::from_secs(5);

const CONNECT: u8 = 1;
const PUBLISH: u8 = 3;
const SUBSCRIBE: u8 = 8;
const PINGREQ: u8 = 12;
const DISCONNECT: u8 = 14;

#[derive(Debug, Clone)]
struct BrokerPublish {
    topic: String,
    payload: Vec<u8>,
    retained: bool,
}

impl BrokerPublish {
    fn json(&self) -> Value {
        serde_json::from_slice(&self.payload).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Default)]
struct BrokerLog {
    connects: u32,
    subscriptions: Vec<String>,
    published: Vec<BrokerPublish>,
}

/// Single-client MQTT 3.1.1 broker speaking just enough of the protocol for
/// one device: CONNACK, SUBACK, PINGRESP, and QoS 0 publishes both ways.
struct LocalBroker {
    port: u16,
    log: Arc<Mutex<BrokerLog>>,
    writer: Arc<tokio::sync::Mutex<Option<OwnedWriteHalf>>>,
}

impl LocalBroker {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        let log = Arc::new(Mutex::new(BrokerLog::default()));
        let writer = Arc::new(tokio::sync::Mutex::new(None));

        let accept_log = Arc::clone(&log);
        let accept_writer = Arc::clone(&writer);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let (reader, write_half) = stream.into_split();
                *accept_writer.lock().await = Some(write_half);
                tokio::spawn(serve(
                    reader,
                    Arc::clone(&accept_log),
                    Arc::clone(&accept_writer),
                ));
            }
        });

        Self { port, log, writer }
    }

    async fn send(&self, bytes: &[u8]) {
        let mut writer = self.writer.lock().await;
        if let Some(stream) = writer.as_mut() {
            stream.write_all(bytes).await.expect("write to client");
        }
    }

    async fn deliver(&self, topic: &str, payload: &[u8]) {
        self.send(&publish_frame(topic, payload)).await;
    }

    /// Closes the client connection from the broker side.
    async fn hang_up(&self) {
        if let Some(mut stream) = self.writer.lock().await.take() {
            let _ = stream.shutdown().await;
        }
    }

    fn subscriptions(&self) -> Vec<String> {
        self.log.lock().expect("log").subscriptions.clone()
    }

    fn published_on(&self, topic: &str) -> Vec<BrokerPublish> {
        self.log
            .lock()
            .expect("log")
            .published
            .iter()
            .filter(|p| p.topic == topic)
            .cloned()
            .collect()
    }

    fn connects(&self) -> u32 {
        self.log.lock().expect("log").connects
    }
}

async fn serve(
    mut reader: OwnedReadHalf,
    log: Arc<Mutex<BrokerLog>>,
    writer: Arc<tokio::sync::Mutex<Option<OwnedWriteHalf>>>,
) {
    while let Some((header, body)) = read_packet(&mut reader).await {
        let reply: Option<Vec<u8>> = match header >> 4 {
            CONNECT => {
                log.lock().expect("log").connects += 1;
                Some(vec![0x20, 0x02, 0x00, 0x00])
            }
            SUBSCRIBE => {
                let mut at = 2;
                while at + 2 <= body.len() {
                    let (filter, next) = read_string(&body, at);
                    log.lock().expect("log").subscriptions.push(filter);
                    at = next + 1;
                }
                Some(vec![0x90, 0x03, body[0], body[1], 0x00])
            }
            PUBLISH => {
                let (topic, mut at) = read_string(&body, 0);
                if (header >> 1) & 0x03 > 0 {
                    at += 2;
                }
                log.lock().expect("log").published.push(BrokerPublish {
                    topic,
                    payload: body[at..].to_vec(),
                    retained: header & 0x01 == 1,
                });
                None
            }
            PINGREQ => Some(vec![0xD0, 0x00]),
            DISCONNECT => break,
            _ => None,
        };

        if let Some(bytes) = reply {
            if let Some(stream) = writer.lock().await.as_mut() {
                let _ = stream.write_all(&bytes).await;
            }
        }
    }
}

async fn read_packet(reader: &mut OwnedReadHalf) -> Option<(u8, Vec<u8>)> {
    let header = reader.read_u8().await.ok()?;
    let mut len = 0usize;
    let mut shift = 0;
    loop {
        let byte = reader.read_u8().await.ok()?;
        len |= usize::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    let mut body = vec![0; len];
    reader.read_exact(&mut body).await.ok()?;
    Some((header, body))
}

fn read_string(body: &[u8], at: usize) -> (String, usize) {
    let len = (usize::from(body[at]) << 8) | usize::from(body[at + 1]);
    let start = at + 2;
    let text = String::from_utf8_lossy(&body[start..start + len]).into_owned();
    (text, start + len)
}

fn publish_frame(topic: &str, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0x30];
    let mut remaining = 2 + topic.len() + payload.len();
    loop {
        let mut byte = (remaining % 128) as u8;
        remaining /= 128;
        if remaining > 0 {
            byte |= 0x80;
        }
        frame.push(byte);
        if remaining == 0 {
            break;
        }
    }
    frame.extend_from_slice(&(topic.len() as u16).to_be_bytes());
    frame.extend_from_slice(topic.as_bytes());
    frame.extend_from_slice(payload);
    frame
}

type MqttSession = BrokerSession<MqttTransport>;

fn mqtt_session(port: u16, reply_to_dispense: bool) -> MqttSession {
    let transport = MqttTransport::new("127.0.0.1", port, DEFAULT_KEEP_ALIVE_SECS);
    let (handler, _calls) = RecordingHandler::new();
    let handler = if reply_to_dispense {
        handler.replying("dispense", CommandReply::new("success", "Portion served"))
    } else {
        handler
    };
    BrokerSession::new(transport, publisher(), SessionSettings::default())
        .with_command_handler(Box::new(handler))
}

/// Ticks the session until `done` holds, yielding to the event loop between
/// ticks. Returns whether `done` held before the deadline.
async fn tick_until<F>(session: &mut MqttSession, clock: &MonotonicClock, mut done: F) -> bool
where
    F: FnMut(&MqttSession) -> bool,
{
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        session.tick(clock.now_ms(), true);
        if done(session) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Ticks for a fixed span so in-flight traffic settles.
async fn tick_for(session: &mut MqttSession, clock: &MonotonicClock, span: Duration) {
    let until = Instant::now() + span;
    while Instant::now() < until {
        session.tick(clock.now_ms(), true);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

async fn connected(broker: &LocalBroker, reply_to_dispense: bool) -> (MqttSession, MonotonicClock) {
    let clock = MonotonicClock::new();
    let mut session = mqtt_session(broker.port, reply_to_dispense);
    assert!(
        tick_until(&mut session, &clock, |s| s.is_connected()).await,
        "session should connect to the local broker"
    );
    assert!(wait_for(|| broker.subscriptions().len() == 2).await);
    (session, clock)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connect_subscribe_announce_and_acknowledge() {
    let broker = LocalBroker::start().await;
    let (mut session, clock) = connected(&broker, false).await;

    assert!(session.transport().is_connected());
    assert_eq!(broker.connects(), 1);
    assert_eq!(
        broker.subscriptions(),
        vec![topic("commands"), "fido/dispensers/discovery".to_string()]
    );

    assert!(wait_for(|| !broker.published_on(&topic("status")).is_empty()).await);
    let discovery = broker.published_on("fido/dispensers/discovery");
    assert_eq!(discovery.len(), 1);
    assert!(discovery[0].retained);
    assert_eq!(discovery[0].json()["deviceId"], DEVICE_ID);
    assert_eq!(discovery[0].json()["isAvailable"], true);
    let status = broker.published_on(&topic("status"));
    assert!(!status[0].retained);
    assert_eq!(status[0].json()["description"], "System started");

    let command = json!({"command": "dispense", "data": {"amount": 50}}).to_string();
    broker.deliver(&topic("commands"), command.as_bytes()).await;
    assert!(tick_until(&mut session, &clock, |s| s.stats().acks_sent == 1).await);

    assert!(wait_for(|| broker.published_on(&topic("response")).len() == 1).await);
    let ack = broker.published_on(&topic("response"))[0].json();
    assert_eq!(ack["command"], "dispense");
    assert_eq!(ack["result"], "received");
    assert_eq!(ack["message"], "");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_oversized_inbound_frame_keeps_session() {
    let broker = LocalBroker::start().await;
    let (mut session, clock) = connected(&broker, false).await;

    let padding = "x".repeat(10 * MAX_INBOUND_SIZE);
    let oversized = format!(r#"{{"command":"dispense","note":"{}"}}"#, padding);
    broker.deliver(&topic("commands"), oversized.as_bytes()).await;
    assert!(tick_until(&mut session, &clock, |s| s.stats().decode_errors == 1).await);

    tick_for(&mut session, &clock, Duration::from_millis(200)).await;
    assert_eq!(session.state(), SessionState::Connected);
    assert_eq!(broker.connects(), 1);
    assert!(broker.published_on(&topic("response")).is_empty());

    broker
        .deliver(&topic("commands"), br#"{"command":"dispense"}"#)
        .await;
    assert!(tick_until(&mut session, &clock, |s| s.stats().acks_sent == 1).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_command_burst_fully_acknowledged() {
    let broker = LocalBroker::start().await;
    let (mut session, clock) = connected(&broker, true).await;

    let mut burst = Vec::new();
    for amount in 0..12 {
        let frame = json!({"command": "dispense", "data": {"amount": amount}}).to_string();
        burst.extend(publish_frame(&topic("commands"), frame.as_bytes()));
    }
    broker.send(&burst).await;

    assert!(tick_until(&mut session, &clock, |s| s.stats().acks_sent == 12).await);
    assert_eq!(session.stats().commands_dispatched, 12);
    assert_eq!(session.stats().publish_failures, 0);

    assert!(wait_for(|| broker.published_on(&topic("response")).len() == 24).await);
    let responses = broker.published_on(&topic("response"));
    let acks = responses
        .iter()
        .filter(|p| p.json()["result"] == "received")
        .count();
    assert_eq!(acks, 12);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_broker_hang_up_ends_session() {
    let broker = LocalBroker::start().await;
    let (mut session, clock) = connected(&broker, false).await;

    broker.hang_up().await;
    assert!(tick_until(&mut session, &clock, |s| s.state() != SessionState::Connected).await);
    assert!(!session.transport().is_connected());
    assert_eq!(
        session.publish_status(clock.now_ms(), "online", "Heartbeat"),
        Err(dispenser_link::publisher::PublishError::NotConnected)
    );
}
