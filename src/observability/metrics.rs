//! Thread-safe metrics collection
//!
//! Atomic counters for connection lifecycle, credentials, telemetry and
//! inbound traffic. A serializable snapshot is logged at shutdown.

use crate::session::SessionState;
use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Thread-safe metrics collector using atomics
pub struct MetricsCollector {
    // Connection lifecycle
    connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    connection_start_time: AtomicU64,

    credentials_issued: AtomicU64,

    // Traffic
    telemetry_published: AtomicU64,
    telemetry_skipped: AtomicU64,
    messages_received: AtomicU64,
    decode_failures: AtomicU64,

    session_state: Mutex<SessionState>,
    state_transitions: AtomicU64,
    uptime_start: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            connection_start_time: AtomicU64::new(0),
            credentials_issued: AtomicU64::new(0),
            telemetry_published: AtomicU64::new(0),
            telemetry_skipped: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            session_state: Mutex::new(SessionState::Disconnected),
            state_transitions: AtomicU64::new(0),
            uptime_start: AtomicU64::new(current_timestamp()),
        }
    }

    pub fn record_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.connected.store(true, Ordering::Relaxed);
        self.connection_start_time
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn record_connection_failure(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_credential_issued(&self) {
        self.credentials_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_telemetry_published(&self) {
        self.telemetry_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_telemetry_skipped(&self) {
        self.telemetry_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Track the session state; leaving Connected ends the connection timer
    pub fn set_session_state(&self, state: SessionState) {
        if let Ok(mut current) = self.session_state.lock() {
            if *current != state {
                *current = state;
                self.state_transitions.fetch_add(1, Ordering::Relaxed);
            }
        }

        if state != SessionState::Connected {
            self.connected.store(false, Ordering::Relaxed);
            self.connection_start_time.store(0, Ordering::Relaxed);
        }
    }

    pub fn session_state(&self) -> SessionState {
        self.session_state
            .lock()
            .map(|state| *state)
            .unwrap_or(SessionState::Disconnected)
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let connection_start = self.connection_start_time.load(Ordering::Relaxed);
        let connection_duration_seconds = if connection_start == 0 {
            0
        } else {
            now.saturating_sub(connection_start)
        };

        MetricsSnapshot {
            connection: ConnectionMetrics {
                connected: self.connected.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connection_failures: self.connection_failures.load(Ordering::Relaxed),
                connection_duration_seconds,
                credentials_issued: self.credentials_issued.load(Ordering::Relaxed),
            },
            traffic: TrafficMetrics {
                telemetry_published: self.telemetry_published.load(Ordering::Relaxed),
                telemetry_skipped: self.telemetry_skipped.load(Ordering::Relaxed),
                messages_received: self.messages_received.load(Ordering::Relaxed),
                decode_failures: self.decode_failures.load(Ordering::Relaxed),
            },
            lifecycle: LifecycleMetrics {
                current_state: self.session_state(),
                state_transitions: self.state_transitions.load(Ordering::Relaxed),
                uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
            },
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub connection: ConnectionMetrics,
    pub traffic: TrafficMetrics,
    pub lifecycle: LifecycleMetrics,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct ConnectionMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub connection_duration_seconds: u64,
    pub credentials_issued: u64,
}

#[derive(Debug, Serialize)]
pub struct TrafficMetrics {
    pub telemetry_published: u64,
    pub telemetry_skipped: u64,
    pub messages_received: u64,
    pub decode_failures: u64,
}

#[derive(Debug, Serialize)]
pub struct LifecycleMetrics {
    pub current_state: SessionState,
    pub state_transitions: u64,
    pub uptime_seconds: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
