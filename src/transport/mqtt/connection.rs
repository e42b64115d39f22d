//! Pure MQTT option construction
//!
//! Builds rumqttc options from [`ConnectionParams`]. TLS is always enabled;
//! the rustls backend only negotiates TLS 1.2 and newer.

use crate::protocol::DeliveryTier;
use crate::transport::ConnectionParams;
use rumqttc::{MqttOptions, QoS, Transport};

/// Capacity of the client request queue; bounds in-flight publishes
pub const REQUEST_QUEUE_CAPACITY: usize = 10;

/// Largest inbound packet accepted (config payloads are capped at 64 KiB by the broker)
pub const MAX_INCOMING_PACKET_SIZE: usize = 256 * 1024;

impl From<DeliveryTier> for QoS {
    fn from(tier: DeliveryTier) -> Self {
        match tier {
            DeliveryTier::AtMostOnce => QoS::AtMostOnce,
            DeliveryTier::AtLeastOnce => QoS::AtLeastOnce,
        }
    }
}

/// Configure MQTT options for one connection attempt
pub fn configure_mqtt_options(params: &ConnectionParams) -> MqttOptions {
    let mut mqtt_options = MqttOptions::new(params.client_id.clone(), params.host.clone(), params.port);

    mqtt_options.set_transport(Transport::tls_with_default_config());
    mqtt_options.set_credentials(params.username.clone(), params.password.clone());
    mqtt_options.set_keep_alive(params.keep_alive);
    mqtt_options.set_clean_session(true);
    mqtt_options.set_max_packet_size(MAX_INCOMING_PACKET_SIZE, MAX_INCOMING_PACKET_SIZE);

    mqtt_options
}
