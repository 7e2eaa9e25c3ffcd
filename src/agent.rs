use crate::link::{LinkDriver, LinkError, NetworkLink};
use crate::protocol::{SHUTDOWN_DESCRIPTION, STATUS_OFFLINE};
use crate::publisher::{PublishError, SensorSnapshot};
use crate::session::{BrokerSession, RetryClock, SessionState, SessionStats};
use crate::transport::BrokerTransport;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_TELEMETRY_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_LINK_RETRY_INTERVAL_MS: u64 = 30_000;

/// Supplies telemetry readings. Owned by the sensing side of the device.
pub trait SensorSource {
    fn snapshot(&mut self) -> SensorSnapshot;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSettings {
    pub telemetry_interval_ms: u64,
    pub link_retry_interval_ms: u64,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            telemetry_interval_ms: DEFAULT_TELEMETRY_INTERVAL_MS,
            link_retry_interval_ms: DEFAULT_LINK_RETRY_INTERVAL_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentError {
    #[error("agent is not running")]
    NotRunning,
    #[error("network link error: {0}")]
    Link(#[from] LinkError),
    #[error("publish error: {0}")]
    Publish(#[from] PublishError),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentState {
    pub running: bool,
    pub link_up: bool,
    pub session: Option<SessionState>,
    pub telemetry_count: u32,
    pub last_error: Option<String>,
}

/// Milliseconds since construction; the timestamp source for every tick.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    start: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Device node driver: network link, broker session and telemetry, all
/// advanced from [`update`](Self::update).
pub struct DispenserAgent<D: LinkDriver, T: BrokerTransport, S: SensorSource> {
    link: NetworkLink<D>,
    session: BrokerSession<T>,
    sensors: S,
    settings: AgentSettings,
    state: AgentState,
    link_retry_clock: RetryClock,
    telemetry_clock: RetryClock,
    reported_ip: Option<IpAddr>,
}

impl<D: LinkDriver, T: BrokerTransport, S: SensorSource> DispenserAgent<D, T, S> {
    pub fn new(
        link: NetworkLink<D>,
        session: BrokerSession<T>,
        sensors: S,
        settings: AgentSettings,
    ) -> Self {
        Self {
            link,
            session,
            sensors,
            settings,
            state: AgentState::default(),
            link_retry_clock: RetryClock::default(),
            telemetry_clock: RetryClock::default(),
            reported_ip: None,
        }
    }

    /// Starts the node and begins joining the network. A rejected join is
    /// returned but the agent keeps running and retries from `update`.
    pub fn start(&mut self, now_ms: u64) -> Result<(), AgentError> {
        self.state.running = true;
        info!(device_id = %self.session.device_id(), "Dispenser node starting");
        self.begin_link(now_ms)
    }

    /// Best-effort offline notice, then ends the broker session.
    pub fn stop(&mut self, now_ms: u64) {
        if !self.state.running {
            return;
        }

        if self.session.is_connected() {
            if let Err(e) =
                self.session
                    .publish_status(now_ms, STATUS_OFFLINE, SHUTDOWN_DESCRIPTION)
            {
                debug!(error = %e, "Offline status not sent");
            }
        }
        self.session.disconnect();
        self.state.running = false;
        self.state.session = Some(self.session.state());
        info!("Dispenser node stopped");
    }

    pub fn update(&mut self, now_ms: u64) -> Result<(), AgentError> {
        if !self.state.running {
            return Err(AgentError::NotRunning);
        }

        let link_up = self.poll_link(now_ms);
        self.state.link_up = link_up;

        let ip = self.link.local_ip();
        if ip != self.reported_ip {
            self.reported_ip = ip;
            self.session.set_local_ip(ip);
        }

        self.session.tick(now_ms, link_up);
        self.state.session = Some(self.session.state());

        if self.session.is_connected()
            && self
                .telemetry_clock
                .is_due(now_ms, self.settings.telemetry_interval_ms)
        {
            self.telemetry_clock.mark(now_ms);
            if let Err(e) = self.publish_telemetry(now_ms) {
                self.state.last_error = Some(e.to_string());
            }
        }

        Ok(())
    }

    pub fn publish_telemetry(&mut self, now_ms: u64) -> Result<(), AgentError> {
        let snapshot = self.sensors.snapshot();
        self.session.publish_sensor_data(now_ms, &snapshot)?;
        self.state.telemetry_count += 1;
        Ok(())
    }

    fn poll_link(&mut self, now_ms: u64) -> bool {
        match self.link.poll(now_ms) {
            Ok(()) => true,
            Err(nb::Error::WouldBlock) => false,
            Err(nb::Error::Other(e)) => {
                if self
                    .link_retry_clock
                    .is_due(now_ms, self.settings.link_retry_interval_ms)
                {
                    warn!(error = %e, "Network link unavailable, retrying");
                    if let Err(e) = self.begin_link(now_ms) {
                        self.state.last_error = Some(e.to_string());
                    }
                }
                false
            }
        }
    }

    fn begin_link(&mut self, now_ms: u64) -> Result<(), AgentError> {
        self.link_retry_clock.mark(now_ms);
        self.link.begin(now_ms).map_err(AgentError::from)
    }

    pub fn connection_info(&self) -> String {
        let link_up = self.link.is_up();
        let mut info = format!(
            "WiFi: {} | MQTT: {}",
            if link_up { "OK" } else { "FAIL" },
            if self.session.is_connected() { "OK" } else { "FAIL" }
        );
        if link_up {
            let ip = self
                .link
                .local_ip()
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| "0.0.0.0".to_string());
            info.push_str(" | IP: ");
            info.push_str(&ip);
        }
        info
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_up() && self.session.is_connected()
    }

    pub fn is_running(&self) -> bool {
        self.state.running
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    pub fn stats(&self) -> &SessionStats {
        self.session.stats()
    }

    pub fn link(&self) -> &NetworkLink<D> {
        &self.link
    }

    pub fn session(&self) -> &BrokerSession<T> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut BrokerSession<T> {
        &mut self.session
    }

    pub fn sensors_mut(&mut self) -> &mut S {
        &mut self.sensors
    }
}
