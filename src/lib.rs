//! Device-side MQTT session client
//!
//! Keeps an authenticated TLS session with the Cloud IoT Core MQTT bridge,
//! publishes telemetry at a fixed interval and routes inbound configuration
//! and command messages.
//!
//! # Overview
//!
//! - [`auth`] issues short-lived JWT credentials (RS256 / ES256)
//! - [`session`] drives the connect / reconnect state machine
//! - [`telemetry`] publishes samples while the session is connected
//! - [`routing`] classifies and decodes inbound messages
//! - [`transport`] is the broker connection (rumqttc over TLS)
//!
//! # Quick Start
//!
//! ```rust
//! use iotcore_device::protocol::{DeviceIdentity, TopicBuilder, TelemetrySample, ChannelKind};
//! use iotcore_device::routing::{classify, decode_payload};
//! use chrono::NaiveDate;
//!
//! let identity = DeviceIdentity::new("demo-123", "us-central1", "my-registry", "dev1").unwrap();
//! assert_eq!(
//!     identity.client_id(),
//!     "projects/demo-123/locations/us-central1/registries/my-registry/devices/dev1"
//! );
//!
//! assert_eq!(TopicBuilder::build_state_topic("dev1"), "/devices/dev1/state");
//! assert_eq!(classify("/devices/dev1/config", "dev1"), ChannelKind::ConfigUpdate);
//! assert_eq!(decode_payload(b"aGVsbG8=").unwrap(), "hello");
//!
//! let at = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap().and_hms_opt(12, 0, 0).unwrap();
//! let payload = TelemetrySample::new(22.0, 50.0, at).to_payload().unwrap();
//! assert!(String::from_utf8(payload).unwrap().contains("2024-03-01 12:00:00"));
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod routing;
pub mod session;
pub mod telemetry;
pub mod testing;
pub mod transport;

pub use auth::{Credential, CredentialError, CredentialIssuer, KeySource, SigningAlgorithm};
pub use config::{ConfigError, ConfigOverrides, DeviceConfig};
pub use error::{DeviceError, DeviceResult};
pub use protocol::*;
pub use session::{PublishError, SessionHandle, SessionManager, SessionSettings, SessionState};
