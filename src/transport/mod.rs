//! Transport layer for the device session
//!
//! The session only sees the [`Connector`] and [`Connection`] capabilities.
//! Opening a connection returns immediately; its outcome (acknowledgment,
//! refusal, errors, inbound messages) is reported asynchronously through the
//! [`TransportEventSink`] handed to [`Connector::connect`].

use crate::protocol::{DeliveryTier, DeviceIdentity};
use crate::session::TransportEventSink;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub mod mqtt;

/// Username sent with every connection; required but ignored by the broker
pub const IGNORED_USERNAME: &str = "unused";

/// Transport-level failures
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectFailed(String),
    #[error("Broker rejected the credential: {0}")]
    CredentialRejected(String),
    #[error("Subscription to {topic} failed: {reason}")]
    SubscribeFailed { topic: String, reason: String },
    #[error("Publish to {topic} failed: {reason}")]
    PublishFailed { topic: String, reason: String },
}

impl TransportError {
    pub fn is_credential_rejection(&self) -> bool {
        matches!(self, TransportError::CredentialRejected(_))
    }
}

/// Everything needed to open one authenticated connection
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: String,
    /// Signed credential token
    pub password: String,
    pub keep_alive: Duration,
}

impl ConnectionParams {
    pub fn new(
        identity: &DeviceIdentity,
        host: &str,
        port: u16,
        keep_alive: Duration,
        token: &str,
    ) -> Self {
        Self {
            host: host.to_string(),
            port,
            client_id: identity.client_id(),
            username: IGNORED_USERNAME.to_string(),
            password: token.to_string(),
            keep_alive,
        }
    }
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("keep_alive", &self.keep_alive)
            .finish()
    }
}

/// Opens connections to the broker
///
/// Implementations must not block: the handshake proceeds in the background
/// and reports through `sink`.
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        params: ConnectionParams,
        sink: TransportEventSink,
    ) -> Result<Box<dyn Connection>, TransportError>;
}

/// One live connection, exclusively owned by the session
///
/// Requests are queued without waiting for the broker. A full request queue
/// fails the call instead of growing without bound.
pub trait Connection: Send {
    fn subscribe(&self, topic: &str, tier: DeliveryTier) -> Result<(), TransportError>;

    fn publish(&self, topic: &str, payload: Vec<u8>, tier: DeliveryTier) -> Result<(), TransportError>;

    /// Disconnect and release background resources
    fn close(self: Box<Self>);
}
