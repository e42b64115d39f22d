//! Pure routing of rumqttc events and errors into transport events
//!
//! The event pump in [`super::client`] polls the rumqttc event loop and uses
//! these functions to decide what, if anything, the session should hear.

use crate::protocol::InboundMessage;
use crate::session::TransportEvent;
use bytes::Bytes;
use rumqttc::{ConnectReturnCode, ConnectionError, Event, Packet, SubscribeReasonCode};

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to appropriate handler (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(connack) => match connack.code {
                    ConnectReturnCode::Success => EventRoute::ConnectionAcknowledged,
                    code => EventRoute::ConnectionRefused(code),
                },
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                },
                Packet::Disconnect => EventRoute::Disconnected,
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    rejected: suback
                        .return_codes
                        .iter()
                        .filter(|code| matches!(code, SubscribeReasonCode::Failure))
                        .count(),
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Refusals that mean the credential itself was not accepted
    pub fn is_credential_refusal(code: ConnectReturnCode) -> bool {
        matches!(
            code,
            ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized
        )
    }

    /// Translate an event-loop error into the event the session should see
    ///
    /// Before the broker acknowledged the connection every error is a failed
    /// connect attempt; afterwards it is an error on an established connection.
    pub fn connection_error_event(error: &ConnectionError, acknowledged: bool) -> TransportEvent {
        let reason = error.to_string();
        if acknowledged {
            return TransportEvent::Error(reason);
        }

        let credential_rejected = match error {
            ConnectionError::ConnectionRefused(code) => Self::is_credential_refusal(*code),
            _ => false,
        };
        TransportEvent::ConnectFailed {
            reason,
            credential_rejected,
        }
    }

    /// Build the transport event for a routed packet, if the session needs one
    pub fn transport_event_for(route: EventRoute) -> Option<TransportEvent> {
        match route {
            EventRoute::ConnectionAcknowledged => Some(TransportEvent::Connected),
            EventRoute::ConnectionRefused(code) => Some(TransportEvent::ConnectFailed {
                reason: format!("Connection refused by broker: {code:?}"),
                credential_rejected: Self::is_credential_refusal(code),
            }),
            EventRoute::MessageReceived { topic, payload } => {
                Some(TransportEvent::Message(InboundMessage::new(topic, payload)))
            }
            EventRoute::Disconnected => Some(TransportEvent::Closed(
                "Broker closed the connection".to_string(),
            )),
            EventRoute::SubscriptionConfirmed { .. }
            | EventRoute::InfrastructureEvent(_)
            | EventRoute::OutgoingEvent => None,
        }
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Connection acknowledged - ready to publish/subscribe
    ConnectionAcknowledged,
    /// ConnAck carried a refusal code
    ConnectionRefused(ConnectReturnCode),
    /// Message received on subscribed topic
    MessageReceived { topic: String, payload: Bytes },
    /// MQTT broker disconnected
    Disconnected,
    /// SubAck with the number of rejected filters
    SubscriptionConfirmed { packet_id: u16, rejected: usize },
    /// Infrastructure event (PingResp, PubAck, etc.)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}
