//! Network link bring-up and supervision.
//!
//! The link is a small non-blocking state machine: [`NetworkLink::begin`]
//! issues the join request and [`NetworkLink::poll`] samples the driver at
//! most once per attempt interval, giving up after a fixed number of
//! attempts. [`NetworkLink::connect`] layers the blocking bring-up on top for
//! hosts that can afford to stall.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs, UdpSocket};
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const DEFAULT_ATTEMPT_INTERVAL_MS: u64 = 500;
pub const DEFAULT_MAX_ATTEMPTS: u8 = 20;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkCredentials {
    pub ssid: String,
    pub password: String,
}

/// Status reported by the underlying radio or OS network stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkStatus {
    Idle,
    Connecting,
    Connected,
    Failed,
}

pub trait LinkDriver {
    /// Issues a join request. Must not block.
    fn begin(&mut self, credentials: &LinkCredentials) -> Result<(), LinkError>;
    fn status(&mut self) -> LinkStatus;
    fn local_ip(&self) -> Option<IpAddr>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("link not established after {attempts} attempts")]
    Timeout { attempts: u8 },
    #[error("link driver rejected join request: {0}")]
    Driver(String),
    #[error("link was lost")]
    Lost,
    #[error("link join has not been started")]
    NotStarted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkPhase {
    Down,
    Joining { attempts: u8 },
    Up,
    Failed(LinkError),
}

pub struct NetworkLink<D: LinkDriver> {
    driver: D,
    credentials: LinkCredentials,
    attempt_interval_ms: u64,
    max_attempts: u8,
    phase: LinkPhase,
    last_sample_ms: u64,
}

impl<D: LinkDriver> NetworkLink<D> {
    pub fn new(driver: D, credentials: LinkCredentials) -> Self {
        Self {
            driver,
            credentials,
            attempt_interval_ms: DEFAULT_ATTEMPT_INTERVAL_MS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            phase: LinkPhase::Down,
            last_sample_ms: 0,
        }
    }

    pub fn with_attempts(mut self, attempt_interval_ms: u64, max_attempts: u8) -> Self {
        self.attempt_interval_ms = attempt_interval_ms.max(1);
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn begin(&mut self, now_ms: u64) -> Result<(), LinkError> {
        info!(ssid = %self.credentials.ssid, "Joining network");

        if let Err(e) = self.driver.begin(&self.credentials) {
            error!(error = %e, "Link driver rejected join request");
            self.phase = LinkPhase::Failed(e.clone());
            return Err(e);
        }

        self.phase = LinkPhase::Joining { attempts: 0 };
        self.last_sample_ms = now_ms;
        Ok(())
    }

    /// Advances the link state machine.
    ///
    /// `WouldBlock` while joining, `Ok(())` while up. A timed out or failed
    /// join keeps returning its error until [`begin`](Self::begin) is called
    /// again; a lost link reports `Lost` once and then `NotStarted`.
    pub fn poll(&mut self, now_ms: u64) -> nb::Result<(), LinkError> {
        match self.phase.clone() {
            LinkPhase::Down => Err(nb::Error::Other(LinkError::NotStarted)),
            LinkPhase::Failed(e) => Err(nb::Error::Other(e)),
            LinkPhase::Up => {
                if !self.sample_due(now_ms) {
                    return Ok(());
                }
                self.last_sample_ms = now_ms;

                if self.driver.status() == LinkStatus::Connected {
                    Ok(())
                } else {
                    warn!("Network link lost");
                    self.phase = LinkPhase::Down;
                    Err(nb::Error::Other(LinkError::Lost))
                }
            }
            LinkPhase::Joining { attempts } => {
                if !self.sample_due(now_ms) {
                    return Err(nb::Error::WouldBlock);
                }
                self.last_sample_ms = now_ms;
                let attempts = attempts.saturating_add(1);

                if self.driver.status() == LinkStatus::Connected {
                    self.phase = LinkPhase::Up;
                    info!(
                        attempts,
                        ip = ?self.driver.local_ip(),
                        "Network link established"
                    );
                    Ok(())
                } else if attempts >= self.max_attempts {
                    let e = LinkError::Timeout { attempts };
                    error!(attempts, "Network link not established");
                    self.phase = LinkPhase::Failed(e.clone());
                    Err(nb::Error::Other(e))
                } else {
                    debug!(attempts, "Waiting for network link");
                    self.phase = LinkPhase::Joining { attempts };
                    Err(nb::Error::WouldBlock)
                }
            }
        }
    }

    /// Blocking bring-up: begins a join and polls until the link is up or the
    /// attempt cap is reached, suspending through `sleep` between samples.
    pub fn connect<C, S>(&mut self, mut now_ms: C, mut sleep: S) -> bool
    where
        C: FnMut() -> u64,
        S: FnMut(u64),
    {
        if self.begin(now_ms()).is_err() {
            return false;
        }

        loop {
            match self.poll(now_ms()) {
                Ok(()) => return true,
                Err(nb::Error::WouldBlock) => sleep(self.attempt_interval_ms),
                Err(nb::Error::Other(_)) => return false,
            }
        }
    }

    fn sample_due(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_sample_ms) >= self.attempt_interval_ms
    }

    pub fn is_up(&self) -> bool {
        self.phase == LinkPhase::Up
    }

    pub fn phase(&self) -> &LinkPhase {
        &self.phase
    }

    pub fn local_ip(&self) -> Option<IpAddr> {
        if self.is_up() {
            self.driver.local_ip()
        } else {
            None
        }
    }

    pub fn attempt_interval_ms(&self) -> u64 {
        self.attempt_interval_ms
    }

    pub fn max_attempts(&self) -> u8 {
        self.max_attempts
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }
}

/// Link driver for hosts whose network is managed by the operating system.
///
/// The link counts as up once a route to the broker exists; the outbound
/// interface address is reported as the local IP.
#[derive(Debug)]
pub struct HostLink {
    target: String,
    resolved: Option<SocketAddr>,
    local_ip: Option<IpAddr>,
    started: bool,
}

impl HostLink {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            target: format!("{}:{}", host, port),
            resolved: None,
            local_ip: None,
            started: false,
        }
    }

    fn resolve(&mut self) -> Option<SocketAddr> {
        if self.resolved.is_none() {
            self.resolved = self
                .target
                .to_socket_addrs()
                .ok()
                .and_then(|mut addrs| addrs.next());
        }
        self.resolved
    }
}

impl LinkDriver for HostLink {
    fn begin(&mut self, _credentials: &LinkCredentials) -> Result<(), LinkError> {
        self.started = true;
        self.resolved = None;
        self.local_ip = None;
        Ok(())
    }

    fn status(&mut self) -> LinkStatus {
        if !self.started {
            return LinkStatus::Idle;
        }

        self.local_ip = self.resolve().and_then(route_local_ip);
        if self.local_ip.is_some() {
            LinkStatus::Connected
        } else {
            self.resolved = None;
            LinkStatus::Connecting
        }
    }

    fn local_ip(&self) -> Option<IpAddr> {
        self.local_ip
    }
}

// Connecting a UDP socket sends nothing; it only asks the OS to pick a route.
fn route_local_ip(target: SocketAddr) -> Option<IpAddr> {
    let bind_addr = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind_addr).ok()?;
    socket.connect(target).ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}
