//! Inbound message classification, decoding and dispatch
//!
//! Classification is a pure function of the topic and the device id. Payloads
//! arrive base64-encoded; a payload that fails to decode is logged and dropped
//! without affecting the session.

use crate::inbound_span;
use crate::observability::metrics::metrics;
use crate::protocol::{ChannelKind, InboundMessage, TopicBuilder};
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

const PAYLOAD_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Inbound payload could not be turned into text
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadDecodeError {
    #[error("Payload is not valid base64: {0}")]
    Base64(String),
    #[error("Decoded payload is not valid UTF-8 text")]
    NotText,
}

/// Classify a topic for the given device
///
/// `ConfigUpdate` for an exact match of the config topic, `Command` for the
/// commands root or anything below it, `Unrecognized` otherwise.
pub fn classify(topic: &str, device_id: &str) -> ChannelKind {
    if topic == TopicBuilder::build_config_topic(device_id) {
        return ChannelKind::ConfigUpdate;
    }
    if command_subfolder(topic, &TopicBuilder::build_commands_root(device_id)).is_some() {
        return ChannelKind::Command;
    }
    ChannelKind::Unrecognized
}

/// Decode a base64 payload to text
pub fn decode_payload(payload: &[u8]) -> Result<String, PayloadDecodeError> {
    let bytes = PAYLOAD_ENGINE
        .decode(trim_whitespace(payload))
        .map_err(|e| PayloadDecodeError::Base64(e.to_string()))?;
    String::from_utf8(bytes).map_err(|_| PayloadDecodeError::NotText)
}

fn trim_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

/// `Some("")` for the commands root itself, `Some(sub/path)` below it
fn command_subfolder<'a>(topic: &'a str, commands_root: &str) -> Option<&'a str> {
    let rest = topic.strip_prefix(commands_root)?;
    if rest.is_empty() {
        Some("")
    } else {
        rest.strip_prefix('/')
    }
}

/// A classified, decoded inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedMessage {
    pub kind: ChannelKind,
    pub topic: String,
    /// Sub-folder below `/commands/` for command messages, if any
    pub subfolder: Option<String>,
    pub text: String,
}

/// Receives routed messages
///
/// Called synchronously from the session event loop; implementations must not
/// block for long.
pub trait InboundHandler: Send + Sync {
    fn handle(&self, message: &RoutedMessage);
}

/// Handler that only logs what arrived
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

impl InboundHandler for LoggingHandler {
    fn handle(&self, message: &RoutedMessage) {
        info!(
            topic = %message.topic,
            kind = ?message.kind,
            subfolder = message.subfolder.as_deref().unwrap_or(""),
            "{}: {}",
            message.kind.label(),
            message.text
        );
    }
}

/// Routes inbound messages for one device to a handler
pub struct MessageRouter {
    device_id: String,
    config_topic: String,
    commands_root: String,
    handler: Arc<dyn InboundHandler>,
}

impl MessageRouter {
    pub fn new(device_id: &str, handler: Arc<dyn InboundHandler>) -> Self {
        Self {
            device_id: device_id.to_string(),
            config_topic: TopicBuilder::build_config_topic(device_id),
            commands_root: TopicBuilder::build_commands_root(device_id),
            handler,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn classify(&self, topic: &str) -> ChannelKind {
        if topic == self.config_topic {
            ChannelKind::ConfigUpdate
        } else if command_subfolder(topic, &self.commands_root).is_some() {
            ChannelKind::Command
        } else {
            ChannelKind::Unrecognized
        }
    }

    /// Classify and decode without dispatching (pure)
    pub fn route(&self, message: &InboundMessage) -> Result<RoutedMessage, PayloadDecodeError> {
        let kind = self.classify(&message.topic);
        let subfolder = match kind {
            ChannelKind::Command => command_subfolder(&message.topic, &self.commands_root)
                .filter(|sub| !sub.is_empty())
                .map(str::to_string),
            _ => None,
        };
        let text = decode_payload(&message.payload)?;

        Ok(RoutedMessage {
            kind,
            topic: message.topic.clone(),
            subfolder,
            text,
        })
    }

    /// Route and hand the message to the handler
    ///
    /// Returns the channel kind on success; decode failures are logged and the
    /// message is discarded.
    pub fn dispatch(&self, message: InboundMessage) -> Option<ChannelKind> {
        let span = inbound_span!(topic = %message.topic);
        let _enter = span.enter();

        metrics().record_message_received();
        debug!(bytes = message.payload.len(), "Inbound message");

        match self.route(&message) {
            Ok(routed) => {
                self.handler.handle(&routed);
                Some(routed.kind)
            }
            Err(e) => {
                metrics().record_decode_failure();
                warn!(topic = %message.topic, error = %e, "Discarding undecodable inbound message");
                None
            }
        }
    }
}
