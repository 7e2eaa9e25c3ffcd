//! Broker session state machine.
//!
//! `BrokerSession::tick` is the only re-entry point. It reconnects (rate
//! limited), pumps queued transport events, routes inbound frames, checks
//! the handshake timeout and sends heartbeats. Inbound events are drained
//! into a bounded batch before any of them is processed, so publishes made
//! while handling a message never re-enter reception.

use crate::publisher::{PublishError, Publisher, SensorSnapshot};
use crate::protocol::{
    HEARTBEAT_DESCRIPTION, RESULT_RECEIVED, STARTUP_DESCRIPTION, STATUS_ONLINE,
};
use crate::router::{CommandHandler, CommandRouter, RouteOutcome};
use crate::transport::{codes, BrokerCredentials, BrokerTransport, TransportEvent};
use heapless::Vec as BoundedVec;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use tracing::{debug, error, info, warn};

pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;
pub const MAX_EVENTS_PER_TICK: usize = 16;
/// Upper bound on transport requests queued by one tick: a reply and an
/// acknowledgment per drained event, the two subscriptions and two
/// announcements of a handshake, a heartbeat, a telemetry sample, and the
/// offline status with its disconnect.
pub const MAX_REQUESTS_PER_TICK: usize = 2 * MAX_EVENTS_PER_TICK + 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Connectivity flags as seen by the control loop. `session_up` implies
/// `link_up`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub link_up: bool,
    pub session_up: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectFailure {
    pub code: i8,
    pub at_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub connect_attempts: u32,
    pub connect_failures: u32,
    pub last_failure: Option<ConnectFailure>,
    pub heartbeats_sent: u32,
    pub messages_received: u32,
    pub messages_published: u32,
    pub publish_failures: u32,
    pub decode_errors: u32,
    pub commands_dispatched: u32,
    pub acks_sent: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSettings {
    pub heartbeat_interval_ms: u64,
    pub reconnect_interval_ms: u64,
    pub handshake_timeout_ms: u64,
    pub credentials: BrokerCredentials,
    pub ack_empty_commands: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            reconnect_interval_ms: DEFAULT_RECONNECT_INTERVAL_MS,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            credentials: BrokerCredentials::default(),
            ack_empty_commands: true,
        }
    }
}

/// Elapsed-time gate. Never fired means due.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryClock {
    last_ms: Option<u64>,
}

impl RetryClock {
    pub fn is_due(&self, now_ms: u64, interval_ms: u64) -> bool {
        match self.last_ms {
            Some(last) => now_ms.saturating_sub(last) >= interval_ms,
            None => true,
        }
    }

    pub fn mark(&mut self, now_ms: u64) {
        self.last_ms = Some(now_ms);
    }

    pub fn last(&self) -> Option<u64> {
        self.last_ms
    }
}

pub struct BrokerSession<T: BrokerTransport> {
    transport: T,
    publisher: Publisher,
    router: CommandRouter,
    settings: SessionSettings,
    state: SessionState,
    link_up: bool,
    reconnect_clock: RetryClock,
    heartbeat_clock: RetryClock,
    handshake_started_ms: u64,
    stats: SessionStats,
}

impl<T: BrokerTransport> BrokerSession<T> {
    pub fn new(transport: T, publisher: Publisher, settings: SessionSettings) -> Self {
        let router = CommandRouter::new(settings.ack_empty_commands);
        Self {
            transport,
            publisher,
            router,
            settings,
            state: SessionState::Disconnected,
            link_up: false,
            reconnect_clock: RetryClock::default(),
            heartbeat_clock: RetryClock::default(),
            handshake_started_ms: 0,
            stats: SessionStats::default(),
        }
    }

    /// Injects the business-logic handler for inbound commands.
    pub fn set_command_handler(&mut self, handler: Box<dyn CommandHandler>) {
        self.router.set_handler(handler);
    }

    pub fn with_command_handler(mut self, handler: Box<dyn CommandHandler>) -> Self {
        self.router.set_handler(handler);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    pub fn connection_state(&self) -> ConnectionState {
        ConnectionState {
            link_up: self.link_up,
            session_up: self.link_up && self.is_connected(),
        }
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn device_id(&self) -> &str {
        self.publisher.identity().id()
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn set_local_ip(&mut self, ip: Option<IpAddr>) {
        self.publisher.set_local_ip(ip);
    }

    /// One maintenance step. `link_up` is the network link's current state.
    pub fn tick(&mut self, now_ms: u64, link_up: bool) {
        self.link_up = link_up;

        if !link_up {
            if self.state != SessionState::Disconnected {
                warn!("Network link down, dropping broker session");
                self.transport.disconnect();
                self.state = SessionState::Disconnected;
            }
            return;
        }

        if self.state == SessionState::Disconnected
            && self
                .reconnect_clock
                .is_due(now_ms, self.settings.reconnect_interval_ms)
        {
            self.begin_connect(now_ms);
        }

        self.pump_events(now_ms);

        match self.state {
            SessionState::Connecting => {
                if now_ms.saturating_sub(self.handshake_started_ms)
                    >= self.settings.handshake_timeout_ms
                {
                    self.transport.disconnect();
                    self.record_failure(codes::CONNECTION_TIMEOUT, now_ms);
                }
            }
            SessionState::Connected => {
                if !self.transport.is_connected() {
                    warn!("Broker session lost");
                    self.state = SessionState::Disconnected;
                } else if self
                    .heartbeat_clock
                    .is_due(now_ms, self.settings.heartbeat_interval_ms)
                {
                    if self
                        .publish_status(now_ms, STATUS_ONLINE, HEARTBEAT_DESCRIPTION)
                        .is_ok()
                    {
                        self.stats.heartbeats_sent += 1;
                    }
                    self.heartbeat_clock.mark(now_ms);
                }
            }
            SessionState::Disconnected => {}
        }
    }

    /// Ends the session on purpose. The reconnect gate still applies on the
    /// next tick.
    pub fn disconnect(&mut self) {
        if self.state != SessionState::Disconnected {
            info!("Disconnecting from broker");
        }
        self.transport.disconnect();
        self.state = SessionState::Disconnected;
    }

    pub fn publish_discovery(&mut self, now_ms: u64) -> Result<(), PublishError> {
        self.ensure_connected()?;
        let result = self.publisher.publish_discovery(&mut self.transport, now_ms);
        self.count_publish(result)
    }

    pub fn publish_status(
        &mut self,
        now_ms: u64,
        status: &str,
        description: &str,
    ) -> Result<(), PublishError> {
        self.ensure_connected()?;
        let result = self
            .publisher
            .publish_status(&mut self.transport, now_ms, status, description);
        self.count_publish(result)
    }

    pub fn publish_sensor_data(
        &mut self,
        now_ms: u64,
        snapshot: &SensorSnapshot,
    ) -> Result<(), PublishError> {
        self.ensure_connected()?;
        let result = self
            .publisher
            .publish_sensor_data(&mut self.transport, now_ms, snapshot);
        self.count_publish(result)
    }

    pub fn publish_response(
        &mut self,
        now_ms: u64,
        command: &str,
        result: &str,
        message: &str,
        kind: Option<&str>,
    ) -> Result<(), PublishError> {
        self.ensure_connected()?;
        let outcome = self.publisher.publish_response(
            &mut self.transport,
            now_ms,
            command,
            result,
            message,
            kind,
        );
        self.count_publish(outcome)
    }

    fn ensure_connected(&self) -> Result<(), PublishError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(PublishError::NotConnected)
        }
    }

    fn count_publish(&mut self, result: Result<(), PublishError>) -> Result<(), PublishError> {
        match &result {
            Ok(()) => self.stats.messages_published += 1,
            Err(e) => {
                self.stats.publish_failures += 1;
                warn!(error = %e, "Publish failed");
            }
        }
        result
    }

    fn begin_connect(&mut self, now_ms: u64) {
        self.reconnect_clock.mark(now_ms);
        self.stats.connect_attempts += 1;

        let client_id = self.publisher.identity().id().to_string();
        info!(client_id = %client_id, "Connecting to broker");

        match self
            .transport
            .start_connect(&client_id, &self.settings.credentials)
        {
            Ok(()) => {
                self.state = SessionState::Connecting;
                self.handshake_started_ms = now_ms;
            }
            Err(e) => {
                error!(error = %e, "Could not start broker connection");
                self.record_failure(codes::CONNECT_FAILED, now_ms);
            }
        }
    }

    fn record_failure(&mut self, code: i8, now_ms: u64) {
        error!(code, "Broker connection failed");
        self.stats.connect_failures += 1;
        self.stats.last_failure = Some(ConnectFailure { code, at_ms: now_ms });
        self.state = SessionState::Disconnected;
    }

    fn pump_events(&mut self, now_ms: u64) {
        let mut batch: BoundedVec<TransportEvent, MAX_EVENTS_PER_TICK> = BoundedVec::new();
        while !batch.is_full() {
            match self.transport.poll_event() {
                Some(event) => {
                    // Capacity was checked above.
                    let _ = batch.push(event);
                }
                None => break,
            }
        }

        for event in batch {
            self.handle_event(now_ms, event);
        }
    }

    fn handle_event(&mut self, now_ms: u64, event: TransportEvent) {
        match event {
            TransportEvent::ConnAck => {
                if self.state == SessionState::Connecting {
                    self.on_connected(now_ms);
                } else {
                    debug!(state = ?self.state, "Ignoring stale handshake acknowledgment");
                }
            }
            TransportEvent::Refused { code } => {
                if self.state == SessionState::Connecting {
                    self.record_failure(code, now_ms);
                }
            }
            TransportEvent::Disconnected { code } => {
                if self.state == SessionState::Connected {
                    warn!(code, "Broker session closed");
                    self.state = SessionState::Disconnected;
                }
            }
            TransportEvent::Message { topic, payload } => {
                self.stats.messages_received += 1;
                if self.state == SessionState::Connected {
                    self.handle_message(now_ms, &topic, &payload);
                } else {
                    debug!(topic = %topic, "Dropping message outside a session");
                }
            }
        }
    }

    fn on_connected(&mut self, now_ms: u64) {
        self.state = SessionState::Connected;
        info!(device_id = %self.publisher.identity().id(), "Broker session established");

        let topics = self.publisher.identity().topics().clone();
        for topic in [topics.commands(), topics.discovery()] {
            match self.transport.subscribe(topic) {
                Ok(()) => info!(topic, "Subscribed"),
                Err(e) => warn!(topic, error = %e, "Subscribe failed"),
            }
        }

        let _ = self.publish_discovery(now_ms);
        let _ = self.publish_status(now_ms, STATUS_ONLINE, STARTUP_DESCRIPTION);
        self.heartbeat_clock.mark(now_ms);
    }

    fn handle_message(&mut self, now_ms: u64, topic: &str, payload: &[u8]) {
        let outcome = self
            .router
            .route(self.publisher.identity().topics(), topic, payload);

        match outcome {
            RouteOutcome::Ignored => {}
            RouteOutcome::DiscoveryRequested => {
                info!("Answering discovery request");
                let _ = self.publish_discovery(now_ms);
            }
            RouteOutcome::Rejected(_) => self.stats.decode_errors += 1,
            RouteOutcome::Dispatched {
                command,
                handled,
                reply,
                acknowledge,
            } => {
                if handled {
                    self.stats.commands_dispatched += 1;
                }
                if let Some(reply) = reply {
                    let _ = self.publish_response(
                        now_ms,
                        &command,
                        &reply.result,
                        &reply.message,
                        reply.kind.as_deref(),
                    );
                }
                if acknowledge
                    && self
                        .publish_response(now_ms, &command, RESULT_RECEIVED, "", None)
                        .is_ok()
                {
                    self.stats.acks_sent += 1;
                }
            }
        }
    }
}
