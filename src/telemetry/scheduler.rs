//! Repeating telemetry publication task
//!
//! The schedule ticks at a fixed period measured from when the previous
//! publish was initiated. A tick never waits for broker acknowledgment, and a
//! failed publish (for example while the session is reconnecting) is logged
//! and skipped without stopping the schedule.

use super::sensor::SensorSource;
use crate::observability::metrics::metrics;
use crate::protocol::DeliveryTier;
use crate::session::PublishError;
use crate::telemetry_span;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

/// Narrow publish capability handed to the scheduler
#[async_trait]
pub trait TelemetryPublisher: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        tier: DeliveryTier,
    ) -> Result<(), PublishError>;
}

struct RunningSchedule {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Publishes one telemetry sample per interval while started
pub struct TelemetryScheduler {
    publisher: Arc<dyn TelemetryPublisher>,
    sensor: Arc<dyn SensorSource>,
    topic: String,
    interval: Duration,
    shutdown: CancellationToken,
    running: Option<RunningSchedule>,
    ticks: Arc<AtomicU64>,
}

impl TelemetryScheduler {
    /// `shutdown` is the process-wide token; once it is cancelled the
    /// scheduler stops and refuses to start again.
    pub fn new(
        publisher: Arc<dyn TelemetryPublisher>,
        sensor: Arc<dyn SensorSource>,
        topic: String,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            publisher,
            sensor,
            topic,
            interval,
            shutdown,
            running: None,
            ticks: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|schedule| !schedule.handle.is_finished())
    }

    /// Ticks executed since creation, across restarts
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Start publishing. Returns false if already running or shut down.
    pub fn start(&mut self) -> bool {
        if self.is_running() {
            debug!(topic = %self.topic, "Telemetry scheduler already running");
            return false;
        }
        if self.shutdown.is_cancelled() {
            debug!("Shutdown requested, not starting telemetry scheduler");
            return false;
        }

        let cancel = self.shutdown.child_token();
        let handle = tokio::spawn(
            run_schedule(
                self.publisher.clone(),
                self.sensor.clone(),
                self.topic.clone(),
                self.interval,
                cancel.clone(),
                self.ticks.clone(),
            )
            .instrument(telemetry_span!(topic = %self.topic)),
        );

        info!(
            topic = %self.topic,
            interval_secs = self.interval.as_secs_f64(),
            "Telemetry scheduler started"
        );
        self.running = Some(RunningSchedule { cancel, handle });
        true
    }

    /// Stop publishing. Returns false if it was not running.
    pub fn stop(&mut self) -> bool {
        match self.running.take() {
            Some(schedule) => {
                schedule.cancel.cancel();
                schedule.handle.abort();
                info!(topic = %self.topic, "Telemetry scheduler stopped");
                true
            }
            None => false,
        }
    }
}

impl Drop for TelemetryScheduler {
    fn drop(&mut self) {
        if let Some(schedule) = self.running.take() {
            schedule.cancel.cancel();
            schedule.handle.abort();
        }
    }
}

async fn run_schedule(
    publisher: Arc<dyn TelemetryPublisher>,
    sensor: Arc<dyn SensorSource>,
    topic: String,
    period: Duration,
    cancel: CancellationToken,
    ticks: Arc<AtomicU64>,
) {
    // First tick fires immediately so the device reports as soon as it connects
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                ticks.fetch_add(1, Ordering::Relaxed);
                publish_sample(publisher.as_ref(), sensor.as_ref(), &topic).await;
            }
        }
    }

    debug!(topic = %topic, "Telemetry schedule exited");
}

async fn publish_sample(publisher: &dyn TelemetryPublisher, sensor: &dyn SensorSource, topic: &str) {
    let sample = sensor.read().into_sample(chrono::Utc::now().naive_utc());
    let payload = match sample.to_payload() {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "Failed to serialize telemetry sample");
            return;
        }
    };

    debug!(
        topic = %topic,
        payload = %String::from_utf8_lossy(&payload),
        "Publishing telemetry"
    );

    match publisher
        .publish(topic, payload, DeliveryTier::AtLeastOnce)
        .await
    {
        Ok(()) => {
            metrics().record_telemetry_published();
        }
        Err(PublishError::NotConnected { state }) => {
            metrics().record_telemetry_skipped();
            warn!(topic = %topic, state = ?state, "Session not connected, skipping telemetry tick");
        }
        Err(e) => {
            metrics().record_telemetry_skipped();
            warn!(topic = %topic, error = %e, "Telemetry publish failed, skipping tick");
        }
    }
}
