//! Message types exchanged with the broker

use bytes::Bytes;
use chrono::{NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

/// Format of [`TelemetrySample::timestamp`] on the wire
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Delivery guarantee requested for a publish or subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryTier {
    /// QoS 0
    AtMostOnce,
    /// QoS 1
    AtLeastOnce,
}

/// One telemetry reading, serialized as `{"temp":..,"humd":..,"time":"YYYY-MM-DD HH:MM:SS"}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    #[serde(rename = "temp")]
    pub temperature: f64,
    #[serde(rename = "humd")]
    pub humidity: f64,
    #[serde(rename = "time", with = "sample_time")]
    pub timestamp: NaiveDateTime,
}

impl TelemetrySample {
    /// Build a sample; the timestamp is truncated to second precision
    pub fn new(temperature: f64, humidity: f64, timestamp: NaiveDateTime) -> Self {
        Self {
            temperature,
            humidity,
            timestamp: timestamp.with_nanosecond(0).unwrap_or(timestamp),
        }
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

mod sample_time {
    use super::TIMESTAMP_FORMAT;
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(&value.format(TIMESTAMP_FORMAT))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveDateTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&raw, TIMESTAMP_FORMAT).map_err(serde::de::Error::custom)
    }
}

/// Message delivered by the broker on a subscribed topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    /// Raw body, base64-encoded by the broker
    pub payload: Bytes,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Inbound channel a topic belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    ConfigUpdate,
    Command,
    Unrecognized,
}

impl ChannelKind {
    /// Log label used when a message of this kind arrives
    pub fn label(&self) -> &'static str {
        match self {
            ChannelKind::ConfigUpdate => "Config message received",
            ChannelKind::Command => "Command message received",
            ChannelKind::Unrecognized => "Message received",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 17)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[test]
    fn test_sample_wire_format() {
        let sample = TelemetrySample::new(22.0, 50.0, at(9, 5, 3));
        let json: serde_json::Value =
            serde_json::from_slice(&sample.to_payload().unwrap()).unwrap();

        assert_eq!(json["temp"], 22.0);
        assert_eq!(json["humd"], 50.0);
        assert_eq!(json["time"], "2024-05-17 09:05:03");
    }

    #[test]
    fn test_sample_round_trip() {
        for (temperature, humidity) in [(22.0, 50.0), (-3.25, 99.5), (0.0, 0.0), (41.5, 12.75)] {
            let sample = TelemetrySample::new(temperature, humidity, at(23, 59, 59));
            let parsed = TelemetrySample::from_payload(&sample.to_payload().unwrap()).unwrap();

            assert_eq!(parsed.temperature, sample.temperature);
            assert_eq!(parsed.humidity, sample.humidity);
            assert_eq!(parsed.timestamp, sample.timestamp);
        }
    }

    #[test]
    fn test_timestamp_truncated_to_seconds() {
        let precise = at(12, 0, 1) + chrono::Duration::milliseconds(987);
        let sample = TelemetrySample::new(22.0, 50.0, precise);

        assert_eq!(sample.timestamp, at(12, 0, 1));
    }

    #[test]
    fn test_malformed_timestamp_rejected() {
        let payload = br#"{"temp":22,"humd":50,"time":"2024-05-17T09:05:03Z"}"#;
        assert!(TelemetrySample::from_payload(payload).is_err());
    }

    #[test]
    fn test_channel_labels() {
        assert_eq!(ChannelKind::ConfigUpdate.label(), "Config message received");
        assert_eq!(ChannelKind::Command.label(), "Command message received");
        assert_eq!(ChannelKind::Unrecognized.label(), "Message received");
    }
}
