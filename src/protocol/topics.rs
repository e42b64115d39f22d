//! Per-device topic construction
//!
//! All device topics live under `/devices/{device_id}/`:
//!
//! - `state` / `events`: telemetry published by the device
//! - `config`: configuration pushed by the broker (at-least-once)
//! - `commands/#`: commands pushed by the broker (at-most-once)

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which telemetry topic the device publishes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// `/devices/{id}/state`
    #[default]
    State,
    /// `/devices/{id}/events`
    Events,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::State => f.write_str("state"),
            MessageType::Events => f.write_str("events"),
        }
    }
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "state" => Ok(MessageType::State),
            "events" => Ok(MessageType::Events),
            other => Err(format!(
                "unknown message type '{other}' (expected 'state' or 'events')"
            )),
        }
    }
}

pub struct TopicBuilder;

impl TopicBuilder {
    /// `/devices/{device_id}/state`
    pub fn build_state_topic(device_id: &str) -> String {
        format!("/devices/{device_id}/state")
    }

    /// `/devices/{device_id}/events`
    pub fn build_events_topic(device_id: &str) -> String {
        format!("/devices/{device_id}/events")
    }

    /// Telemetry topic for the configured message type
    pub fn build_telemetry_topic(device_id: &str, message_type: MessageType) -> String {
        match message_type {
            MessageType::State => Self::build_state_topic(device_id),
            MessageType::Events => Self::build_events_topic(device_id),
        }
    }

    /// `/devices/{device_id}/config`
    pub fn build_config_topic(device_id: &str) -> String {
        format!("/devices/{device_id}/config")
    }

    /// `/devices/{device_id}/commands`, the root every command topic shares
    pub fn build_commands_root(device_id: &str) -> String {
        format!("/devices/{device_id}/commands")
    }

    /// `/devices/{device_id}/commands/#`
    pub fn build_commands_subscription(device_id: &str) -> String {
        format!("/devices/{device_id}/commands/#")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_construction() {
        assert_eq!(TopicBuilder::build_state_topic("dev1"), "/devices/dev1/state");
        assert_eq!(TopicBuilder::build_events_topic("dev1"), "/devices/dev1/events");
        assert_eq!(TopicBuilder::build_config_topic("dev1"), "/devices/dev1/config");
        assert_eq!(
            TopicBuilder::build_commands_root("dev1"),
            "/devices/dev1/commands"
        );
        assert_eq!(
            TopicBuilder::build_commands_subscription("dev1"),
            "/devices/dev1/commands/#"
        );
    }

    #[test]
    fn test_telemetry_topic_follows_message_type() {
        assert_eq!(
            TopicBuilder::build_telemetry_topic("dev1", MessageType::State),
            "/devices/dev1/state"
        );
        assert_eq!(
            TopicBuilder::build_telemetry_topic("dev1", MessageType::Events),
            "/devices/dev1/events"
        );
    }

    #[test]
    fn test_message_type_parsing() {
        assert_eq!("state".parse::<MessageType>().unwrap(), MessageType::State);
        assert_eq!("EVENTS".parse::<MessageType>().unwrap(), MessageType::Events);
        assert!("telemetry".parse::<MessageType>().is_err());
        assert_eq!(MessageType::default(), MessageType::State);
    }
}
