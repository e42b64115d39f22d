//! Crate-level error type
//!
//! Each module reports its own error enum; [`DeviceError`] collects them for
//! callers that drive the whole device (the binary, integration code).

use crate::auth::CredentialError;
use crate::config::ConfigError;
use crate::routing::PayloadDecodeError;
use crate::session::{PublishError, SessionError};
use crate::transport::TransportError;
use thiserror::Error;

/// Main error type for device operations
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Payload decode error: {0}")]
    Decode(#[from] PayloadDecodeError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

pub type DeviceResult<T> = Result<T, DeviceError>;

impl DeviceError {
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Process exit status for this error
    ///
    /// Configuration problems exit with 2 so wrappers can tell "fix your
    /// settings" apart from runtime failures, which exit with 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            DeviceError::Config(_) => 2,
            _ => 1,
        }
    }

    /// Errors the session recovers from on its own
    pub fn is_transient(&self) -> bool {
        match self {
            DeviceError::Transport(e) => !e.is_credential_rejection(),
            DeviceError::Publish(e) => e.is_not_connected(),
            DeviceError::Decode(_) => true,
            _ => false,
        }
    }
}
