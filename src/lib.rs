//! # Dispenser Link
//!
//! Connectivity core for a networked smart food dispenser. The library keeps
//! a device node reachable over MQTT under intermittent connectivity: it
//! brings up the network link, runs the broker session lifecycle, advertises
//! the device for discovery, emits heartbeats and telemetry, and routes
//! inbound commands to the dispenser's business logic.
//!
//! ## Quick Start
//!
//! ```rust
//! use dispenser_link::{DeviceIdentity, FixedHardwareId};
//!
//! let identity = DeviceIdentity::generate(&FixedHardwareId(0x0123_4567_89AB));
//! assert_eq!(identity.id(), "FIDO_0123456789AB");
//! assert_eq!(
//!     identity.topics().commands(),
//!     "fido/dispensers/FIDO_0123456789AB/commands"
//! );
//! ```
//!
//! ## Architecture
//!
//! - [`identity`] - Device id and topic derivation
//! - [`protocol`] - Wire messages and the bounded message codec
//! - [`link`] - Network link bring-up and supervision
//! - [`transport`] / [`mqtt`] - Broker transport seam and its `rumqttc` implementation
//! - [`session`] - Broker session state machine driven by a maintenance tick
//! - [`router`] - Inbound command and discovery routing
//! - [`publisher`] - Discovery, status, telemetry and response publishing
//! - [`agent`] - Device node driver composing all of the above
//! - [`config`] - JSON configuration

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod agent;
pub mod config;
pub mod identity;
pub mod link;
pub mod mqtt;
pub mod protocol;
pub mod publisher;
pub mod router;
pub mod session;
pub mod transport;

// Re-export main public types for convenience
pub use agent::{AgentError, DispenserAgent, MonotonicClock, SensorSource};
pub use config::{ConfigError, DispenserConfig};
pub use identity::{DeviceIdentity, FixedHardwareId, HardwareIdSource, TopicSet};
pub use link::{HostLink, LinkDriver, LinkError, NetworkLink};
pub use mqtt::MqttTransport;
pub use protocol::{MessageCodec, ProtocolError};
pub use publisher::{Calibration, DeviceProfile, PublishError, Publisher, SensorSnapshot};
pub use router::{CommandHandler, CommandReply, CommandRouter, RouteOutcome};
pub use session::{BrokerSession, SessionSettings, SessionState, SessionStats};
pub use transport::{BrokerTransport, TransportError, TransportEvent};
