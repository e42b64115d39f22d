//! MQTT transport for the device session (rumqttc, TLS)
//!
//! The module keeps pure functions apart from I/O:
//!
//! - [`connection`] - option construction and QoS mapping
//! - [`message_handler`] - routing of rumqttc events and errors
//! - [`client`] - connector, connection and event pump
//!
//! # Usage
//!
//! ```rust,no_run
//! use iotcore_device::transport::mqtt::MqttConnector;
//! use iotcore_device::transport::{ConnectionParams, Connector};
//! use iotcore_device::session::TransportEventSink;
//! use iotcore_device::protocol::DeviceIdentity;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let identity = DeviceIdentity::new("my-project", "us-central1", "my-registry", "my-device")?;
//! let params = ConnectionParams::new(&identity, "mqtt.googleapis.com", 8883, Duration::from_secs(60), "<jwt>");
//! let (tx, _rx) = tokio::sync::mpsc::channel(64);
//! let connection = MqttConnector::new().connect(params, TransportEventSink::new(1, tx))?;
//! connection.close();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::{MqttConnection, MqttConnector};
pub use connection::{configure_mqtt_options, REQUEST_QUEUE_CAPACITY};
pub use message_handler::{EventRoute, MessageHandler};
