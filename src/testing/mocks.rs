//! Mock implementations for testing
//!
//! In-memory connector, connection, publisher and inbound handler so the
//! session can be exercised without a broker.

use crate::protocol::DeliveryTier;
use crate::routing::{InboundHandler, RoutedMessage};
use crate::session::{PublishError, SessionState, TransportEvent, TransportEventSink};
use crate::telemetry::TelemetryPublisher;
use crate::transport::{Connection, ConnectionParams, Connector, TransportError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

pub type PublishedMessage = (String, Vec<u8>, DeliveryTier);

/// One request a mock connection received
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportOp {
    Subscribe {
        generation: u64,
        topic: String,
        tier: DeliveryTier,
    },
    Publish {
        generation: u64,
        topic: String,
        payload: Vec<u8>,
        tier: DeliveryTier,
    },
    Close {
        generation: u64,
    },
}

#[derive(Debug, Default)]
struct Behavior {
    auto_ack: AtomicBool,
    fail_connect: AtomicBool,
    reject_credentials: AtomicBool,
    fail_subscribe: AtomicBool,
    fail_publish: AtomicBool,
}

#[derive(Debug, Default)]
struct Recorded {
    params: Vec<ConnectionParams>,
    sinks: Vec<TransportEventSink>,
    ops: Vec<TransportOp>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Mock connector recording every connection it opens
#[derive(Debug, Default, Clone)]
pub struct MockConnector {
    behavior: Arc<Behavior>,
    recorded: Arc<Mutex<Recorded>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every connection is acknowledged as soon as it opens
    pub fn with_auto_ack() -> Self {
        let connector = Self::default();
        connector.set_auto_ack(true);
        connector
    }

    pub fn set_auto_ack(&self, enabled: bool) {
        self.behavior.auto_ack.store(enabled, Ordering::SeqCst);
    }

    pub fn set_fail_connect(&self, enabled: bool) {
        self.behavior.fail_connect.store(enabled, Ordering::SeqCst);
    }

    /// Connect attempts fail with a credential rejection
    pub fn set_reject_credentials(&self, enabled: bool) {
        self.behavior
            .reject_credentials
            .store(enabled, Ordering::SeqCst);
    }

    pub fn set_fail_subscribe(&self, enabled: bool) {
        self.behavior.fail_subscribe.store(enabled, Ordering::SeqCst);
    }

    pub fn set_fail_publish(&self, enabled: bool) {
        self.behavior.fail_publish.store(enabled, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        lock(&self.recorded).params.len()
    }

    pub fn connect_params(&self) -> Vec<ConnectionParams> {
        lock(&self.recorded).params.clone()
    }

    pub fn last_params(&self) -> Option<ConnectionParams> {
        lock(&self.recorded).params.last().cloned()
    }

    pub fn ops(&self) -> Vec<TransportOp> {
        lock(&self.recorded).ops.clone()
    }

    pub fn clear_ops(&self) {
        lock(&self.recorded).ops.clear();
    }

    pub fn subscriptions(&self) -> Vec<(String, DeliveryTier)> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                TransportOp::Subscribe { topic, tier, .. } => Some((topic, tier)),
                _ => None,
            })
            .collect()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                TransportOp::Publish {
                    topic,
                    payload,
                    tier,
                    ..
                } => Some((topic, payload, tier)),
                _ => None,
            })
            .collect()
    }

    pub fn close_count(&self) -> usize {
        self.ops()
            .iter()
            .filter(|op| matches!(op, TransportOp::Close { .. }))
            .count()
    }

    /// Sink handed to the connection opened as `generation`
    pub fn sink(&self, generation: u64) -> Option<TransportEventSink> {
        lock(&self.recorded)
            .sinks
            .iter()
            .find(|sink| sink.generation() == generation)
            .cloned()
    }

    pub fn latest_sink(&self) -> Option<TransportEventSink> {
        lock(&self.recorded).sinks.last().cloned()
    }

    /// Inject an event as if the most recent connection produced it
    pub async fn emit_latest(&self, event: TransportEvent) -> bool {
        match self.latest_sink() {
            Some(sink) => sink.emit(event).await,
            None => false,
        }
    }
}

impl Connector for MockConnector {
    fn connect(
        &self,
        params: ConnectionParams,
        sink: TransportEventSink,
    ) -> Result<Box<dyn Connection>, TransportError> {
        let generation = sink.generation();
        {
            let mut recorded = lock(&self.recorded);
            recorded.params.push(params);
            recorded.sinks.push(sink.clone());
        }

        if self.behavior.reject_credentials.load(Ordering::SeqCst) {
            return Err(TransportError::CredentialRejected(
                "Mock credential rejection".to_string(),
            ));
        }
        if self.behavior.fail_connect.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectFailed(
                "Mock connection failure".to_string(),
            ));
        }

        if self.behavior.auto_ack.load(Ordering::SeqCst) {
            tokio::spawn(async move {
                sink.emit(TransportEvent::Connected).await;
            });
        }

        Ok(Box::new(MockConnection {
            generation,
            behavior: self.behavior.clone(),
            recorded: self.recorded.clone(),
        }))
    }
}

/// Connection handed out by [`MockConnector`]
#[derive(Debug)]
pub struct MockConnection {
    generation: u64,
    behavior: Arc<Behavior>,
    recorded: Arc<Mutex<Recorded>>,
}

impl Connection for MockConnection {
    fn subscribe(&self, topic: &str, tier: DeliveryTier) -> Result<(), TransportError> {
        if self.behavior.fail_subscribe.load(Ordering::SeqCst) {
            return Err(TransportError::SubscribeFailed {
                topic: topic.to_string(),
                reason: "Mock subscribe failure".to_string(),
            });
        }

        lock(&self.recorded).ops.push(TransportOp::Subscribe {
            generation: self.generation,
            topic: topic.to_string(),
            tier,
        });
        Ok(())
    }

    fn publish(&self, topic: &str, payload: Vec<u8>, tier: DeliveryTier) -> Result<(), TransportError> {
        if self.behavior.fail_publish.load(Ordering::SeqCst) {
            return Err(TransportError::PublishFailed {
                topic: topic.to_string(),
                reason: "Mock publish failure".to_string(),
            });
        }

        lock(&self.recorded).ops.push(TransportOp::Publish {
            generation: self.generation,
            topic: topic.to_string(),
            payload,
            tier,
        });
        Ok(())
    }

    fn close(self: Box<Self>) {
        lock(&self.recorded).ops.push(TransportOp::Close {
            generation: self.generation,
        });
    }
}

/// Mock publisher for driving the telemetry scheduler directly
#[derive(Debug, Default)]
pub struct MockPublisher {
    published: Mutex<Vec<PublishedMessage>>,
    attempts: AtomicUsize,
    failing_state: Option<SessionState>,
}

impl MockPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every publish fails as if the session were in `state`
    pub fn failing(state: SessionState) -> Self {
        Self {
            failing_state: Some(state),
            ..Default::default()
        }
    }

    /// Successful publishes only
    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.published).clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TelemetryPublisher for MockPublisher {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        tier: DeliveryTier,
    ) -> Result<(), PublishError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if let Some(state) = self.failing_state {
            return Err(PublishError::NotConnected { state });
        }

        lock(&self.published).push((topic.to_string(), payload, tier));
        Ok(())
    }
}

/// Inbound handler that keeps every routed message
#[derive(Debug, Default)]
pub struct RecordingHandler {
    messages: Mutex<Vec<RoutedMessage>>,
}

impl RecordingHandler {
    pub fn messages(&self) -> Vec<RoutedMessage> {
        lock(&self.messages).clone()
    }
}

impl InboundHandler for RecordingHandler {
    fn handle(&self, message: &RoutedMessage) {
        lock(&self.messages).push(message.clone());
    }
}
