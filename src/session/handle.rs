//! Narrow capability for interacting with a running session
//!
//! The handle never exposes the transport connection or the credential. It
//! can request a publish, request a connect, query state and request
//! shutdown; everything else stays inside the session manager.

use super::events::{SessionCommand, SessionEvent};
use super::state::{SessionState, SessionStatus};
use crate::protocol::DeliveryTier;
use crate::telemetry::TelemetryPublisher;
use crate::transport::TransportError;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

/// Why a publish request did not reach the transport
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Not connected - current state: {state}")]
    NotConnected { state: SessionState },
    #[error("Transport rejected publish: {0}")]
    Transport(#[from] TransportError),
    #[error("Session is no longer running")]
    SessionClosed,
}

impl PublishError {
    pub fn is_not_connected(&self) -> bool {
        matches!(self, PublishError::NotConnected { .. })
    }
}

/// Cloneable handle to a session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionEvent>,
    status_rx: watch::Receiver<SessionStatus>,
    shutdown: CancellationToken,
}

impl SessionHandle {
    pub(crate) fn new(
        tx: mpsc::Sender<SessionEvent>,
        status_rx: watch::Receiver<SessionStatus>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            tx,
            status_rx,
            shutdown,
        }
    }

    /// Publish a payload; only succeeds while the session is connected
    pub async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        tier: DeliveryTier,
    ) -> Result<(), PublishError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(SessionEvent::Command(SessionCommand::Publish {
                topic: topic.to_string(),
                payload,
                tier,
                reply,
            }))
            .await
            .map_err(|_| PublishError::SessionClosed)?;

        response.await.map_err(|_| PublishError::SessionClosed)?
    }

    /// Ask the session to connect; returns false if the session has stopped
    ///
    /// A request while a connect attempt is already outstanding is ignored.
    pub async fn connect(&self) -> bool {
        self.tx
            .send(SessionEvent::Command(SessionCommand::Connect))
            .await
            .is_ok()
    }

    /// Request shutdown: stop telemetry, close the transport, never reconnect
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn status(&self) -> SessionStatus {
        self.status_rx.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.status_rx.borrow().state
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status_rx.clone()
    }

    /// Wait until the status satisfies `predicate`; false on timeout or when the session ends first
    pub async fn wait_for_status<F>(&self, timeout: Duration, mut predicate: F) -> bool
    where
        F: FnMut(&SessionStatus) -> bool,
    {
        let mut status_rx = self.status_rx.clone();
        let wait = async {
            loop {
                let matched = predicate(&*status_rx.borrow_and_update());
                if matched {
                    return true;
                }
                if status_rx.changed().await.is_err() {
                    return predicate(&*status_rx.borrow());
                }
            }
        };

        tokio::time::timeout(timeout, wait).await.unwrap_or(false)
    }

    pub async fn wait_for_state(&self, state: SessionState, timeout: Duration) -> bool {
        self.wait_for_status(timeout, |status| status.state == state)
            .await
    }
}

#[async_trait]
impl TelemetryPublisher for SessionHandle {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        tier: DeliveryTier,
    ) -> Result<(), PublishError> {
        SessionHandle::publish(self, topic, payload, tier).await
    }
}
