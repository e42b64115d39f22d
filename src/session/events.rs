//! Typed events delivered to the session's single intake channel

use super::handle::PublishError;
use crate::protocol::{DeliveryTier, InboundMessage};
use tokio::sync::{mpsc, oneshot};

/// Capacity of the session intake channel
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Something that happened on a transport connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Broker acknowledged the connection
    Connected,
    /// Connection could not be established
    ConnectFailed {
        reason: String,
        /// Broker refused the credential (bad password / not authorized)
        credential_rejected: bool,
    },
    /// Broker closed an established connection
    Closed(String),
    /// Network or protocol error on an established connection
    Error(String),
    Message(InboundMessage),
}

/// Requests issued through a [`super::SessionHandle`]
#[derive(Debug)]
pub enum SessionCommand {
    Connect,
    Publish {
        topic: String,
        payload: Vec<u8>,
        tier: DeliveryTier,
        reply: oneshot::Sender<Result<(), PublishError>>,
    },
}

#[derive(Debug)]
pub enum SessionEvent {
    /// Event from the connection opened as `generation`
    Transport {
        generation: u64,
        event: TransportEvent,
    },
    Command(SessionCommand),
}

/// Sending side handed to a connection; tags every event with its generation
#[derive(Debug, Clone)]
pub struct TransportEventSink {
    generation: u64,
    tx: mpsc::Sender<SessionEvent>,
}

impl TransportEventSink {
    pub fn new(generation: u64, tx: mpsc::Sender<SessionEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Deliver an event; false once the session has stopped listening
    pub async fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(SessionEvent::Transport {
                generation: self.generation,
                event,
            })
            .await
            .is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
