//! Session manager event loop
//!
//! The manager exclusively owns the transport connection and the current
//! credential. All inputs (transport events, publish and connect requests,
//! timer deadlines, shutdown) are handled one at a time on a single task, so
//! the state machine needs no locking.

use super::events::{
    SessionCommand, SessionEvent, TransportEvent, TransportEventSink, EVENT_CHANNEL_CAPACITY,
};
use super::handle::{PublishError, SessionHandle};
use super::state::{
    CredentialDecision, ReconnectPolicy, ReconnectionDecision, SessionMonitor, SessionState,
    SessionStatus, StateTrigger,
};
use crate::auth::{Credential, CredentialError, CredentialIssuer};
use crate::observability::metrics::metrics;
use crate::protocol::{DeliveryTier, DeviceIdentity, MessageType, TopicBuilder};
use crate::routing::{InboundHandler, MessageRouter};
use crate::session_span;
use crate::telemetry::{SensorSource, TelemetryScheduler};
use crate::transport::{Connection, ConnectionParams, Connector};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// Errors that end the session
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Cannot issue credential: {0}")]
    Credential(#[from] CredentialError),
    #[error("Giving up after {attempts} reconnection attempts")]
    ReconnectExhausted { attempts: u32 },
    #[error("Invalid session settings: {0}")]
    InvalidSettings(String),
}

/// Runtime settings for one session
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub host: String,
    pub port: u16,
    pub keep_alive: Duration,
    /// A connect attempt without acknowledgment after this long has failed
    pub connect_timeout: Duration,
    /// Credentials closer than this to expiry are reissued
    pub refresh_margin: Duration,
    pub publish_interval: Duration,
    pub message_type: MessageType,
    pub reconnect: ReconnectPolicy,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            host: "mqtt.googleapis.com".to_string(),
            port: 8883,
            keep_alive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(30),
            refresh_margin: Duration::from_secs(30),
            publish_interval: Duration::from_secs(30),
            message_type: MessageType::State,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeadlineKind {
    Reconnect,
    ConnectTimeout,
    CredentialRefresh,
}

/// The single pending timer; at most one exists at any time
#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    kind: DeadlineKind,
}

impl Deadline {
    fn after(delay: Duration, kind: DeadlineKind) -> Self {
        Self {
            at: Instant::now() + delay,
            kind,
        }
    }
}

/// Owns the device session and drives its state machine
pub struct SessionManager {
    identity: DeviceIdentity,
    issuer: CredentialIssuer,
    connector: Arc<dyn Connector>,
    settings: SessionSettings,
    router: MessageRouter,
    scheduler: TelemetryScheduler,
    state: SessionState,
    credential: Option<Credential>,
    connection: Option<Box<dyn Connection>>,
    generation: u64,
    reconnect_attempts: u32,
    /// Set by the first acknowledgment; credential failures after that are retried
    established_once: bool,
    deadline: Option<Deadline>,
    events_tx: mpsc::Sender<SessionEvent>,
    events_rx: Option<mpsc::Receiver<SessionEvent>>,
    status_tx: watch::Sender<SessionStatus>,
    shutdown: CancellationToken,
    handle: SessionHandle,
}

impl SessionManager {
    /// Build a session; fails when the settings could never keep a credential fresh
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: DeviceIdentity,
        issuer: CredentialIssuer,
        connector: Arc<dyn Connector>,
        settings: SessionSettings,
        sensor: Arc<dyn SensorSource>,
        handler: Arc<dyn InboundHandler>,
        shutdown: CancellationToken,
    ) -> Result<Self, SessionError> {
        if settings.refresh_margin >= issuer.validity() {
            return Err(SessionError::InvalidSettings(format!(
                "refresh margin ({}s) must be shorter than the credential lifetime ({}s)",
                settings.refresh_margin.as_secs_f64(),
                issuer.validity().as_secs_f64()
            )));
        }
        settings
            .reconnect
            .validate()
            .map_err(SessionError::InvalidSettings)?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (status_tx, status_rx) = watch::channel(SessionStatus::default());
        let handle = SessionHandle::new(events_tx.clone(), status_rx, shutdown.clone());

        let telemetry_topic =
            TopicBuilder::build_telemetry_topic(identity.device_id(), settings.message_type);
        let scheduler = TelemetryScheduler::new(
            Arc::new(handle.clone()),
            sensor,
            telemetry_topic,
            settings.publish_interval,
            shutdown.clone(),
        );
        let router = MessageRouter::new(identity.device_id(), handler);

        Ok(Self {
            identity,
            issuer,
            connector,
            settings,
            router,
            scheduler,
            state: SessionState::Disconnected,
            credential: None,
            connection: None,
            generation: 0,
            reconnect_attempts: 0,
            established_once: false,
            deadline: None,
            events_tx,
            events_rx: Some(events_rx),
            status_tx,
            shutdown,
            handle,
        })
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run until shutdown or a fatal error
    ///
    /// Nothing connects until a connect request arrives through a
    /// [`SessionHandle`]. On return the session is `Closing`, the scheduler is
    /// stopped and the transport is closed.
    pub async fn run(mut self) -> Result<(), SessionError> {
        let span = session_span!(
            device_id = %self.identity.device_id(),
            client_id = %self.identity.client_id()
        );

        async move {
            let Some(mut events) = self.events_rx.take() else {
                return Ok(());
            };
            let shutdown = self.shutdown.clone();
            info!("Session manager started");

            let outcome = loop {
                let deadline = self.deadline.map(|d| d.at);
                let step = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break Ok(()),
                    event = events.recv() => match event {
                        Some(event) => self.handle_event(event),
                        None => break Ok(()),
                    },
                    _ = sleep_until(deadline) => self.handle_deadline(),
                };
                self.publish_status();

                if let Err(e) = step {
                    error!(error = %e, "Session stopping");
                    break Err(e);
                }
            };

            self.close();
            info!("Session manager stopped");
            outcome
        }
        .instrument(span)
        .await
    }

    fn handle_event(&mut self, event: SessionEvent) -> Result<(), SessionError> {
        match event {
            SessionEvent::Command(SessionCommand::Connect) => self.request_connect(),
            SessionEvent::Command(SessionCommand::Publish {
                topic,
                payload,
                tier,
                reply,
            }) => {
                let _ = reply.send(self.publish(&topic, payload, tier));
                Ok(())
            }
            SessionEvent::Transport { generation, event } => {
                if generation != self.generation || self.connection.is_none() {
                    debug!(
                        generation,
                        current = self.generation,
                        "Ignoring event from a discarded connection"
                    );
                    return Ok(());
                }
                self.handle_transport_event(event)
            }
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) -> Result<(), SessionError> {
        match event {
            TransportEvent::Connected => self.on_connected(),
            TransportEvent::ConnectFailed {
                reason,
                credential_rejected,
            } => self.on_connect_failure(&reason, credential_rejected),
            TransportEvent::Closed(reason) | TransportEvent::Error(reason) => {
                self.on_connection_lost(&reason)
            }
            TransportEvent::Message(message) => {
                self.router.dispatch(message);
                Ok(())
            }
        }
    }

    fn handle_deadline(&mut self) -> Result<(), SessionError> {
        let Some(deadline) = self.deadline.take() else {
            return Ok(());
        };

        match (deadline.kind, self.state) {
            (DeadlineKind::Reconnect, SessionState::Disconnected) => self.request_connect(),
            (DeadlineKind::ConnectTimeout, SessionState::Connecting) => {
                let reason = format!(
                    "No acknowledgment within {}s",
                    self.settings.connect_timeout.as_secs_f64()
                );
                self.on_connect_failure(&reason, false)
            }
            (DeadlineKind::CredentialRefresh, SessionState::Connected) => {
                info!("Credential close to expiry, reconnecting with a fresh one");
                self.teardown(StateTrigger::ConnectionLost);
                self.credential = None;
                self.request_connect()
            }
            (kind, state) => {
                debug!(?kind, %state, "Dropping stale deadline");
                Ok(())
            }
        }
    }

    /// Disconnected → Connecting; ignored in every other state
    fn request_connect(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Disconnected {
            debug!(state = %self.state, "Connect request ignored");
            return Ok(());
        }
        if self.shutdown.is_cancelled() {
            return Ok(());
        }

        // This attempt supersedes any pending reconnect timer
        self.deadline = None;

        let token = match self.current_token() {
            Ok(token) => token,
            // Only a device that never connected treats a bad key as fatal
            Err(e) if self.established_once => {
                metrics().record_connection_failure();
                error!(error = %e, "Cannot issue credential, connection attempt abandoned");
                self.credential = None;
                return self.schedule_reconnect();
            }
            Err(e) => return Err(e),
        };
        self.generation += 1;
        let params = ConnectionParams::new(
            &self.identity,
            &self.settings.host,
            self.settings.port,
            self.settings.keep_alive,
            &token,
        );
        let sink = TransportEventSink::new(self.generation, self.events_tx.clone());

        metrics().record_connection_attempt();
        self.transition(StateTrigger::ConnectRequested);

        match self.connector.connect(params, sink) {
            Ok(connection) => {
                self.connection = Some(connection);
                self.deadline = Some(Deadline::after(
                    self.settings.connect_timeout,
                    DeadlineKind::ConnectTimeout,
                ));
                Ok(())
            }
            Err(e) => {
                let rejected = e.is_credential_rejection();
                self.on_connect_failure(&e.to_string(), rejected)
            }
        }
    }

    /// Reuse the stored credential or replace it with a freshly issued one
    fn current_token(&mut self) -> Result<String, SessionError> {
        let now = Utc::now();
        let decision = SessionMonitor::credential_decision(
            self.credential.as_ref(),
            now,
            self.settings.refresh_margin,
        );

        let credential = match (decision, self.credential.take()) {
            (CredentialDecision::Reuse, Some(existing)) => existing,
            (decision, _) => {
                let fresh = self.issuer.issue_at(&self.identity, now)?;
                metrics().record_credential_issued();
                info!(
                    ?decision,
                    algorithm = %fresh.algorithm(),
                    expires_at = %fresh.expires_at(),
                    "Issued new credential"
                );
                fresh
            }
        };

        let token = credential.token().to_string();
        self.credential = Some(credential);
        Ok(token)
    }

    /// Connecting → Connected: subscribe, then start telemetry
    fn on_connected(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Connecting {
            debug!(state = %self.state, "Ignoring unexpected acknowledgment");
            return Ok(());
        }

        self.deadline = None;
        self.reconnect_attempts = 0;
        self.established_once = true;
        self.transition(StateTrigger::Acknowledged);
        metrics().record_connection_established();

        let device_id = self.identity.device_id();
        let subscriptions = [
            (
                TopicBuilder::build_config_topic(device_id),
                DeliveryTier::AtLeastOnce,
            ),
            (
                TopicBuilder::build_commands_subscription(device_id),
                DeliveryTier::AtMostOnce,
            ),
        ];

        let failure = self.connection.as_ref().and_then(|connection| {
            subscriptions.iter().find_map(|(topic, tier)| {
                connection
                    .subscribe(topic, *tier)
                    .err()
                    .map(|e| (topic.clone(), e))
            })
        });
        if let Some((topic, e)) = failure {
            warn!(topic = %topic, error = %e, "Subscription failed, dropping connection");
            return self.on_connection_lost(&e.to_string());
        }

        self.scheduler.start();
        self.arm_credential_refresh();
        Ok(())
    }

    fn arm_credential_refresh(&mut self) {
        if let Some(credential) = &self.credential {
            let min_delay = Duration::from_millis(self.settings.reconnect.min_delay);
            let delay = SessionMonitor::time_until_refresh(
                credential,
                Utc::now(),
                self.settings.refresh_margin,
            )
            .max(min_delay);
            debug!(
                refresh_in_secs = delay.as_secs(),
                "Credential rotation scheduled"
            );
            self.deadline = Some(Deadline::after(delay, DeadlineKind::CredentialRefresh));
        }
    }

    /// Connecting → Disconnected
    fn on_connect_failure(&mut self, reason: &str, credential_rejected: bool) -> Result<(), SessionError> {
        if self.state != SessionState::Connecting {
            return Ok(());
        }

        metrics().record_connection_failure();
        warn!(reason = %reason, credential_rejected, "Connection attempt failed");

        if credential_rejected {
            info!("Discarding rejected credential");
            self.credential = None;
        }

        self.teardown(StateTrigger::ConnectFailed);
        self.schedule_reconnect()
    }

    /// Connected → Disconnected (or a failed attempt while Connecting)
    fn on_connection_lost(&mut self, reason: &str) -> Result<(), SessionError> {
        match self.state {
            SessionState::Connecting => self.on_connect_failure(reason, false),
            SessionState::Connected => {
                warn!(reason = %reason, "Connection lost");
                self.teardown(StateTrigger::ConnectionLost);
                self.schedule_reconnect()
            }
            _ => Ok(()),
        }
    }

    /// Stop telemetry, drop the connection and apply the transition
    fn teardown(&mut self, trigger: StateTrigger) {
        self.scheduler.stop();
        self.deadline = None;
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
        self.transition(trigger);
    }

    fn schedule_reconnect(&mut self) -> Result<(), SessionError> {
        if matches!(self.deadline, Some(d) if d.kind == DeadlineKind::Reconnect) {
            return Ok(());
        }

        let decision = SessionMonitor::should_attempt_reconnection(
            self.reconnect_attempts,
            &self.settings.reconnect,
            self.shutdown.is_cancelled(),
        );
        SessionMonitor::log_reconnect_decision(&decision);

        match decision {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                self.reconnect_attempts = attempt;
                self.deadline = Some(Deadline::after(
                    Duration::from_millis(delay_ms),
                    DeadlineKind::Reconnect,
                ));
                Ok(())
            }
            ReconnectionDecision::AbortShutdownRequested => Ok(()),
            ReconnectionDecision::AbortMaxAttemptsExceeded => Err(SessionError::ReconnectExhausted {
                attempts: self.reconnect_attempts,
            }),
        }
    }

    fn publish(&self, topic: &str, payload: Vec<u8>, tier: DeliveryTier) -> Result<(), PublishError> {
        if !SessionMonitor::can_publish(self.state) {
            return Err(PublishError::NotConnected { state: self.state });
        }
        let connection = self
            .connection
            .as_ref()
            .ok_or(PublishError::NotConnected { state: self.state })?;

        connection.publish(topic, payload, tier)?;
        debug!(topic = %topic, qos = ?tier, "Publish queued");
        Ok(())
    }

    /// Any state → Closing
    fn close(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.teardown(StateTrigger::ShutdownRequested);
        self.publish_status();
    }

    fn transition(&mut self, trigger: StateTrigger) {
        let next = SessionMonitor::determine_next_state(self.state, trigger);
        if next != self.state {
            SessionMonitor::log_state_transition(self.state, next);
            self.state = next;
            metrics().set_session_state(next);
        }
    }

    fn status(&self) -> SessionStatus {
        SessionStatus {
            state: self.state,
            scheduler_running: self.scheduler.is_running(),
            has_connection: self.connection.is_some(),
            generation: self.generation,
            reconnect_attempts: self.reconnect_attempts,
        }
    }

    fn publish_status(&self) {
        let status = self.status();
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
