//! Device authentication
//!
//! Devices authenticate to the broker with short-lived JWTs signed by a
//! per-device private key (RS256 or ES256).

pub mod credential;

pub use credential::{
    Credential, CredentialClaims, CredentialError, CredentialIssuer, KeySource, SigningAlgorithm,
    DEFAULT_VALIDITY,
};
