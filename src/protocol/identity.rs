//! Device identity and identifier validation

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Immutable identity of the device this client runs as
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    project_id: String,
    region: String,
    registry_id: String,
    device_id: String,
}

impl DeviceIdentity {
    pub fn new(
        project_id: impl Into<String>,
        region: impl Into<String>,
        registry_id: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let identity = Self {
            project_id: project_id.into(),
            region: region.into(),
            registry_id: registry_id.into(),
            device_id: device_id.into(),
        };

        validate_identifier("project_id", &identity.project_id)?;
        validate_identifier("region", &identity.region)?;
        validate_identifier("registry_id", &identity.registry_id)?;
        validate_identifier("device_id", &identity.device_id)?;

        Ok(identity)
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn registry_id(&self) -> &str {
        &self.registry_id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// MQTT client id:
    /// `projects/{project}/locations/{region}/registries/{registry}/devices/{device}`
    pub fn client_id(&self) -> String {
        format!(
            "projects/{}/locations/{}/registries/{}/devices/{}",
            self.project_id, self.region, self.registry_id, self.device_id
        )
    }
}

/// Identifiers end up inside topic names, so MQTT metacharacters are rejected
pub fn validate_identifier(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::Empty { field });
    }

    for ch in value.chars() {
        if ch == '/' || ch == '+' || ch == '#' || ch.is_whitespace() || ch.is_control() {
            return Err(ValidationError::InvalidChar { field, ch });
        }
    }

    Ok(())
}

/// Identifier validation errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{field} cannot be empty")]
    Empty { field: &'static str },
    #[error("{field} contains invalid character: {ch:?}")]
    InvalidChar { field: &'static str, ch: char },
}
