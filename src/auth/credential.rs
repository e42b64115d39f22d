//! Time-bound device credentials signed as JWTs
//!
//! The broker authenticates a device by the password field of the MQTT CONNECT
//! packet, which must carry a JWT whose audience is the project id. Tokens are
//! short-lived and are never renewed in place: every refresh issues a brand new
//! [`Credential`].

use crate::protocol::DeviceIdentity;
use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Default credential lifetime (20 minutes)
pub const DEFAULT_VALIDITY: Duration = Duration::from_secs(20 * 60);

/// Signature algorithms accepted by the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SigningAlgorithm {
    /// RSASSA-PKCS1-v1_5 with SHA-256
    #[serde(rename = "RS256")]
    Rs256,
    /// ECDSA on P-256 with SHA-256
    #[serde(rename = "ES256")]
    Es256,
}

impl SigningAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            SigningAlgorithm::Rs256 => "RS256",
            SigningAlgorithm::Es256 => "ES256",
        }
    }

    fn jwt_algorithm(&self) -> Algorithm {
        match self {
            SigningAlgorithm::Rs256 => Algorithm::RS256,
            SigningAlgorithm::Es256 => Algorithm::ES256,
        }
    }
}

impl fmt::Display for SigningAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SigningAlgorithm {
    type Err = CredentialError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "RS256" => Ok(SigningAlgorithm::Rs256),
            "ES256" => Ok(SigningAlgorithm::Es256),
            other => Err(CredentialError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// Credential issuance errors
///
/// Fatal to the connection attempt that requested the credential.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Failed to read signing key {path}")]
    KeyRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Signing key is not a valid {algorithm} private key (ES256 keys must be PKCS#8 PEM): {reason}")]
    InvalidKey {
        algorithm: SigningAlgorithm,
        reason: String,
    },
    #[error("Unsupported signature algorithm: {0} (expected RS256 or ES256)")]
    UnsupportedAlgorithm(String),
    #[error("Credential validity must be at least one second, got {0:?}")]
    InvalidValidity(Duration),
    #[error("Failed to sign credential: {0}")]
    Signing(#[source] jsonwebtoken::errors::Error),
}

/// Where the private signing key comes from
///
/// File sources are re-read on every issuance so a rotated key on disk is
/// picked up by the next credential.
#[derive(Clone)]
pub enum KeySource {
    File(PathBuf),
    Pem(Vec<u8>),
}

impl KeySource {
    fn load(&self) -> Result<Vec<u8>, CredentialError> {
        match self {
            KeySource::File(path) => std::fs::read(path).map_err(|source| CredentialError::KeyRead {
                path: path.clone(),
                source,
            }),
            KeySource::Pem(pem) => Ok(pem.clone()),
        }
    }
}

impl fmt::Debug for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySource::File(path) => f.debug_tuple("File").field(path).finish(),
            KeySource::Pem(_) => f.write_str("Pem(<redacted>)"),
        }
    }
}

/// JWT claims carried by every credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialClaims {
    pub iat: i64,
    pub exp: i64,
    pub aud: String,
}

/// A signed, time-bound credential
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    audience: String,
    algorithm: SigningAlgorithm,
    token: String,
}

impl Credential {
    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn audience(&self) -> &str {
        &self.audience
    }

    pub fn algorithm(&self) -> SigningAlgorithm {
        self.algorithm
    }

    /// Signed token, sent as the MQTT password
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Usable for a connection attempt only strictly before expiry
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    /// True when less than `margin` remains before expiry
    pub fn expires_within(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        match chrono::Duration::from_std(margin) {
            Ok(margin) => now + margin >= self.expires_at,
            Err(_) => true,
        }
    }

    /// Time left until `expires_at`, zero once expired
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("audience", &self.audience)
            .field("algorithm", &self.algorithm)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Issues signed credentials for one device
#[derive(Debug, Clone)]
pub struct CredentialIssuer {
    key: KeySource,
    algorithm: SigningAlgorithm,
    validity: Duration,
}

impl CredentialIssuer {
    pub fn new(key: KeySource, algorithm: SigningAlgorithm, validity: Duration) -> Self {
        Self {
            key,
            algorithm,
            validity,
        }
    }

    pub fn algorithm(&self) -> SigningAlgorithm {
        self.algorithm
    }

    pub fn validity(&self) -> Duration {
        self.validity
    }

    /// Issue a credential valid from now
    pub fn issue(&self, identity: &DeviceIdentity) -> Result<Credential, CredentialError> {
        self.issue_at(identity, Utc::now())
    }

    /// Issue a credential as if the current time were `now`
    ///
    /// Timestamps are truncated to whole seconds, so `expires_at - issued_at`
    /// always equals the configured validity exactly.
    pub fn issue_at(
        &self,
        identity: &DeviceIdentity,
        now: DateTime<Utc>,
    ) -> Result<Credential, CredentialError> {
        let validity_secs = self.validity.as_secs();
        if validity_secs == 0 {
            return Err(CredentialError::InvalidValidity(self.validity));
        }

        let iat = now.timestamp();
        let exp = iat + validity_secs as i64;
        let claims = CredentialClaims {
            iat,
            exp,
            aud: identity.project_id().to_string(),
        };

        let pem = self.key.load()?;
        let encoding_key = match self.algorithm {
            SigningAlgorithm::Rs256 => EncodingKey::from_rsa_pem(&pem),
            SigningAlgorithm::Es256 => EncodingKey::from_ec_pem(&pem),
        }
        .map_err(|e| CredentialError::InvalidKey {
            algorithm: self.algorithm,
            reason: e.to_string(),
        })?;

        let token = encode(
            &Header::new(self.algorithm.jwt_algorithm()),
            &claims,
            &encoding_key,
        )
        .map_err(CredentialError::Signing)?;

        debug!(
            audience = %claims.aud,
            algorithm = %self.algorithm,
            expires_at = exp,
            "Issued device credential"
        );

        Ok(Credential {
            issued_at: timestamp_to_utc(iat),
            expires_at: timestamp_to_utc(exp),
            audience: claims.aud,
            algorithm: self.algorithm,
            token,
        })
    }
}

fn timestamp_to_utc(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}
