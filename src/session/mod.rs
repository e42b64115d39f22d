//! Device session lifecycle
//!
//! [`SessionManager`] drives the Disconnected → Connecting → Connected →
//! Closing state machine; [`SessionHandle`] is the only way other components
//! interact with it.

pub mod events;
pub mod handle;
pub mod manager;
pub mod state;

pub use events::{SessionCommand, SessionEvent, TransportEvent, TransportEventSink};
pub use handle::{PublishError, SessionHandle};
pub use manager::{SessionError, SessionManager, SessionSettings};
pub use state::{
    CredentialDecision, ReconnectPolicy, ReconnectionDecision, RefreshReason, SessionMonitor,
    SessionState, SessionStatus, StateTrigger, MIN_RECONNECT_DELAY_MS,
};
