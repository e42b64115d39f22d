//! Pure session state and decision logic
//!
//! Everything here is free of I/O so the state machine rules, credential
//! refresh policy and reconnect backoff can be tested in isolation from the
//! event loop in [`super::manager`].

use crate::auth::Credential;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tracing::{error, info, warn};

/// Lifecycle state of the device session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Initial state; no transport is open
    Disconnected,
    /// Transport opened, waiting for the broker's acknowledgment
    Connecting,
    /// Acknowledged, subscribed and publishing
    Connected,
    /// Shutdown requested; terminal
    Closing,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Closing => "closing",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closing)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot published to observers on every change
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub scheduler_running: bool,
    pub has_connection: bool,
    /// Generation of the most recently opened connection
    pub generation: u64,
    pub reconnect_attempts: u32,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            state: SessionState::Disconnected,
            scheduler_running: false,
            has_connection: false,
            generation: 0,
            reconnect_attempts: 0,
        }
    }
}

/// Reconnection configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Maximum consecutive reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Delays in milliseconds for the first attempts
    pub backoff_pattern: Vec<u64>,
    /// Delay used once the pattern is exhausted
    pub sustained_delay: u64,
    /// Floor applied to every delay so failures never busy-loop
    pub min_delay: u64,
}

/// Lowest inter-attempt delay accepted from configuration
pub const MIN_RECONNECT_DELAY_MS: u64 = 1000;

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_pattern: vec![1000, 2000, 5000, 10000],
            sustained_delay: 30000,
            min_delay: MIN_RECONNECT_DELAY_MS,
        }
    }
}

impl ReconnectPolicy {
    /// Delay in milliseconds before the given (1-based) attempt
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        let delay = self
            .backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay);
        delay.max(self.min_delay)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == Some(0) {
            return Err("max_attempts must be greater than 0 or None for unlimited".to_string());
        }
        if self.min_delay == 0 {
            return Err("min_delay must be greater than 0".to_string());
        }
        if self.sustained_delay == 0 {
            return Err("sustained_delay must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectionDecision {
    /// Schedule attempt number `attempt` after `delay_ms`
    Proceed { attempt: u32, delay_ms: u64 },
    AbortShutdownRequested,
    AbortMaxAttemptsExceeded,
}

/// Why a fresh credential has to be issued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshReason {
    Missing,
    Expired,
    WithinMargin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialDecision {
    Reuse,
    Issue(RefreshReason),
}

/// Inputs that drive state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateTrigger {
    ConnectRequested,
    Acknowledged,
    ConnectFailed,
    ConnectionLost,
    ShutdownRequested,
}

/// Pure state machine rules for the session
pub struct SessionMonitor;

impl SessionMonitor {
    /// Next state for a trigger; triggers that do not apply leave the state unchanged
    pub fn determine_next_state(current: SessionState, trigger: StateTrigger) -> SessionState {
        use SessionState::*;

        match (current, trigger) {
            (Closing, _) => Closing,
            (_, StateTrigger::ShutdownRequested) => Closing,
            (Disconnected, StateTrigger::ConnectRequested) => Connecting,
            (Connecting, StateTrigger::Acknowledged) => Connected,
            (Connecting, StateTrigger::ConnectFailed) => Disconnected,
            (Connecting | Connected, StateTrigger::ConnectionLost) => Disconnected,
            (state, _) => state,
        }
    }

    pub fn can_publish(state: SessionState) -> bool {
        matches!(state, SessionState::Connected)
    }

    /// Whether the stored credential may be reused for a connection attempt
    pub fn credential_decision(
        credential: Option<&Credential>,
        now: DateTime<Utc>,
        margin: Duration,
    ) -> CredentialDecision {
        match credential {
            None => CredentialDecision::Issue(RefreshReason::Missing),
            Some(credential) if !credential.is_valid_at(now) => {
                CredentialDecision::Issue(RefreshReason::Expired)
            }
            Some(credential) if credential.expires_within(now, margin) => {
                CredentialDecision::Issue(RefreshReason::WithinMargin)
            }
            Some(_) => CredentialDecision::Reuse,
        }
    }

    /// Time from `now` until the credential should be rotated
    pub fn time_until_refresh(credential: &Credential, now: DateTime<Utc>, margin: Duration) -> Duration {
        credential.remaining(now).saturating_sub(margin)
    }

    /// Determine if reconnection should be attempted
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        policy: &ReconnectPolicy,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if let Some(max_attempts) = policy.max_attempts {
            if current_attempts >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }

        let attempt = current_attempts + 1;
        ReconnectionDecision::Proceed {
            attempt,
            delay_ms: policy.calculate_backoff_delay(attempt),
        }
    }

    pub fn log_state_transition(from: SessionState, to: SessionState) {
        match (from, to) {
            (SessionState::Connecting, SessionState::Connected) => {
                info!("Session connected");
            }
            (SessionState::Connected, SessionState::Disconnected) => {
                warn!("Session connection lost");
            }
            (SessionState::Connecting, SessionState::Disconnected) => {
                warn!("Session connect attempt failed");
            }
            (_, SessionState::Closing) => {
                info!(from = %from, "Session closing");
            }
            _ => {
                info!(from = %from, to = %to, "Session state changed");
            }
        }
    }

    pub fn log_reconnect_decision(decision: &ReconnectionDecision) {
        match decision {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                info!(attempt, delay_ms, "Scheduling reconnect attempt");
            }
            ReconnectionDecision::AbortShutdownRequested => {
                info!("Shutdown requested, not reconnecting");
            }
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                error!("Maximum reconnection attempts exceeded");
            }
        }
    }
}
