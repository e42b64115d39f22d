//! Impure I/O for the MQTT transport
//!
//! [`MqttConnector`] opens one rumqttc client per connection attempt and
//! spawns an event pump that forwards acknowledgments, errors and inbound
//! publishes to the session. The pump stops after the first error; recovery is
//! the session's decision, not rumqttc's.

use super::connection::{configure_mqtt_options, REQUEST_QUEUE_CAPACITY};
use super::message_handler::{EventRoute, MessageHandler};
use crate::protocol::DeliveryTier;
use crate::session::TransportEventSink;
use crate::transport::{Connection, ConnectionParams, Connector, TransportError};
use rumqttc::{AsyncClient, EventLoop};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// How long a closing connection may take to flush its DISCONNECT
const CLOSE_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Opens TLS MQTT connections to the broker
#[derive(Debug, Default, Clone, Copy)]
pub struct MqttConnector;

impl MqttConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for MqttConnector {
    fn connect(
        &self,
        params: ConnectionParams,
        sink: TransportEventSink,
    ) -> Result<Box<dyn Connection>, TransportError> {
        let mqtt_options = configure_mqtt_options(&params);
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_QUEUE_CAPACITY);

        info!(
            host = %params.host,
            port = params.port,
            client_id = %params.client_id,
            generation = sink.generation(),
            "Opening MQTT connection"
        );

        let pump = tokio::spawn(run_event_pump(event_loop, sink));
        Ok(Box::new(MqttConnection {
            client,
            pump: Some(pump),
        }))
    }
}

/// A live rumqttc client plus its event pump
pub struct MqttConnection {
    client: AsyncClient,
    pump: Option<JoinHandle<()>>,
}

impl Connection for MqttConnection {
    fn subscribe(&self, topic: &str, tier: DeliveryTier) -> Result<(), TransportError> {
        self.client
            .try_subscribe(topic, tier.into())
            .map_err(|e| TransportError::SubscribeFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;
        info!(topic = %topic, qos = ?tier, "Subscription requested");
        Ok(())
    }

    fn publish(&self, topic: &str, payload: Vec<u8>, tier: DeliveryTier) -> Result<(), TransportError> {
        self.client
            .try_publish(topic, tier.into(), false, payload)
            .map_err(|e| TransportError::PublishFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    fn close(mut self: Box<Self>) {
        if let Err(e) = self.client.try_disconnect() {
            debug!(error = %e, "Could not queue DISCONNECT");
        }

        // Give the pump a moment to flush the DISCONNECT, then force it down
        if let Some(mut pump) = self.pump.take() {
            tokio::spawn(async move {
                if tokio::time::timeout(CLOSE_GRACE_PERIOD, &mut pump).await.is_err() {
                    debug!("MQTT event pump did not stop in time, aborting");
                    pump.abort();
                }
            });
        }
    }
}

impl Drop for MqttConnection {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

/// Poll the event loop and forward what the session needs to hear
async fn run_event_pump(mut event_loop: EventLoop, sink: TransportEventSink) {
    let generation = sink.generation();
    let mut acknowledged = false;

    loop {
        match event_loop.poll().await {
            Ok(event) => {
                let route = MessageHandler::route_mqtt_event(&event);
                match &route {
                    EventRoute::ConnectionAcknowledged => acknowledged = true,
                    EventRoute::SubscriptionConfirmed { packet_id, rejected } => {
                        if *rejected > 0 {
                            warn!(packet_id, rejected, "Broker rejected subscription");
                        } else {
                            debug!(packet_id, "Subscription confirmed");
                        }
                    }
                    EventRoute::InfrastructureEvent(detail) => trace!(%detail, "MQTT event"),
                    _ => {}
                }

                let closing = matches!(
                    route,
                    EventRoute::Disconnected | EventRoute::ConnectionRefused(_)
                );
                if let Some(transport_event) = MessageHandler::transport_event_for(route) {
                    if !sink.emit(transport_event).await {
                        break;
                    }
                }
                if closing {
                    break;
                }
            }
            Err(e) => {
                debug!(generation, error = %e, "MQTT event loop error");
                sink.emit(MessageHandler::connection_error_event(&e, acknowledged))
                    .await;
                break;
            }
        }
    }

    debug!(generation, "MQTT event pump stopped");
}
