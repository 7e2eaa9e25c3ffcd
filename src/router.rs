//! Inbound message routing.
//!
//! The router only decides what should happen to a frame. Any publish that
//! follows (discovery re-announce, acknowledgment, handler reply) is carried
//! out by the session after routing returns, so a handler never runs while
//! the inbound frame is still being processed.

use crate::identity::{InboundTopic, TopicSet};
use crate::protocol::{CommandEnvelope, DiscoveryRequest, ProtocolError, CONNECT_COMMAND};
use serde_json::Value;
use tracing::{debug, warn};

/// Answer a handler wants sent to the response topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReply {
    pub result: String,
    pub message: String,
    pub kind: Option<String>,
}

impl CommandReply {
    pub fn new(result: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            result: result.into(),
            message: message.into(),
            kind: None,
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }
}

/// Business logic that receives commands addressed to this device.
pub trait CommandHandler {
    fn handle(&mut self, command: &str, payload: &Value);

    /// Called right after `handle`; a returned reply is published on the
    /// response topic.
    fn reply(&mut self, _command: &str) -> Option<CommandReply> {
        None
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    /// Topic not ours, or discovery traffic that is not a request.
    Ignored,
    DiscoveryRequested,
    /// Frame could not be decoded; nothing is dispatched or acknowledged.
    Rejected(ProtocolError),
    Dispatched {
        command: String,
        handled: bool,
        reply: Option<CommandReply>,
        acknowledge: bool,
    },
}

pub struct CommandRouter {
    handler: Option<Box<dyn CommandHandler>>,
    ack_empty_commands: bool,
}

impl CommandRouter {
    pub fn new(ack_empty_commands: bool) -> Self {
        Self {
            handler: None,
            ack_empty_commands,
        }
    }

    pub fn with_handler(handler: Box<dyn CommandHandler>, ack_empty_commands: bool) -> Self {
        Self {
            handler: Some(handler),
            ack_empty_commands,
        }
    }

    pub fn set_handler(&mut self, handler: Box<dyn CommandHandler>) {
        self.handler = Some(handler);
    }

    pub fn has_handler(&self) -> bool {
        self.handler.is_some()
    }

    pub fn ack_empty_commands(&self) -> bool {
        self.ack_empty_commands
    }

    pub fn route(&mut self, topics: &TopicSet, topic: &str, payload: &[u8]) -> RouteOutcome {
        match topics.classify(topic) {
            Some(InboundTopic::Discovery) => Self::route_discovery(payload),
            Some(InboundTopic::Commands) => self.route_command(payload),
            None => {
                debug!(topic, "Ignoring message on unexpected topic");
                RouteOutcome::Ignored
            }
        }
    }

    fn route_discovery(payload: &[u8]) -> RouteOutcome {
        match DiscoveryRequest::decode(payload) {
            Ok(request) if request.is_discover() => RouteOutcome::DiscoveryRequested,
            Ok(_) => RouteOutcome::Ignored,
            Err(e) => {
                // Retained announcements from other devices land here too.
                debug!(error = %e, "Ignoring undecodable discovery traffic");
                RouteOutcome::Ignored
            }
        }
    }

    fn route_command(&mut self, payload: &[u8]) -> RouteOutcome {
        let envelope = match CommandEnvelope::decode(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, len = payload.len(), "Discarding malformed command");
                return RouteOutcome::Rejected(e);
            }
        };

        let command = envelope.command().to_string();
        let mut handled = false;
        let mut reply = None;

        if command.is_empty() {
            warn!("Command without a name, dispatch skipped");
        } else if let Some(handler) = self.handler.as_mut() {
            debug!(command = %command, "Dispatching command");
            handler.handle(&command, envelope.payload());
            reply = handler.reply(&command);
            handled = true;
        } else {
            debug!(command = %command, "No handler registered");
        }

        let acknowledge = if command == CONNECT_COMMAND {
            false
        } else if command.is_empty() {
            self.ack_empty_commands
        } else {
            true
        };

        RouteOutcome::Dispatched {
            command,
            handled,
            reply,
            acknowledge,
        }
    }
}

impl std::fmt::Debug for CommandRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRouter")
            .field("has_handler", &self.handler.is_some())
            .field("ack_empty_commands", &self.ack_empty_commands)
            .finish()
    }
}
