//! Credential issuance properties


use chrono::{TimeZone, Utc};
use iotcore_device::auth::{CredentialClaims, CredentialIssuer, KeySource, SigningAlgorithm};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use proptest::prelude::*;
use std::time::Duration;
use test_helpers::*;

fn pem(name: &str) -> Vec<u8> {
    std::fs::read(fixture_path(name)).unwrap()
}

#[test]
fn test_twenty_minute_credential_expires_1200_seconds_after_issue() {
    let t0 = Utc.with_ymd_and_hms(2024, 6, 1, 8, 30, 0).unwrap();
    let credential = rsa_issuer(Duration::from_secs(20 * 60))
        .issue_at(&test_identity(), t0)
        .unwrap();

    assert_eq!(credential.expires_at().timestamp(), t0.timestamp() + 1200);
    assert_eq!(credential.audience(), "demo-project");
}

#[test]
fn test_key_file_is_read_on_every_issue() {
    let dir = tempfile::tempdir().unwrap();
    let key_path = dir.path().join("device.pem");
    std::fs::write(&key_path, pem("rsa_private.pem")).unwrap();

    let issuer = CredentialIssuer::new(
        KeySource::File(key_path.clone()),
        SigningAlgorithm::Rs256,
        Duration::from_secs(60),
    );
    assert!(issuer.issue(&test_identity()).is_ok());

    std::fs::remove_file(&key_path).unwrap();
    assert!(issuer.issue(&test_identity()).is_err());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn test_expiry_equals_issue_plus_validity(
        validity_secs in 1u64..=24 * 60 * 60,
        issued in 1_500_000_000i64..2_000_000_000i64,
        es256 in any::<bool>(),
    ) {
        let (algorithm, key, public, jwt_algorithm) = if es256 {
            (SigningAlgorithm::Es256, pem("ec_private.pem"), pem("ec_public.pem"), Algorithm::ES256)
        } else {
            (SigningAlgorithm::Rs256, pem("rsa_private.pem"), pem("rsa_public.pem"), Algorithm::RS256)
        };
        let issuer = CredentialIssuer::new(
            KeySource::Pem(key),
            algorithm,
            Duration::from_secs(validity_secs),
        );
        let t0 = Utc.timestamp_opt(issued, 0).unwrap();

        let credential = issuer.issue_at(&test_identity(), t0).unwrap();
        prop_assert_eq!(credential.issued_at(), t0);
        prop_assert_eq!(
            (credential.expires_at() - credential.issued_at()).num_seconds(),
            validity_secs as i64
        );

        // Claims inside the token agree with the credential
        let mut validation = Validation::new(jwt_algorithm);
        validation.set_audience(&["demo-project"]);
        validation.validate_exp = false;
        let claims = decode::<CredentialClaims>(
            credential.token(),
            &DecodingKey::from_rsa_pem(&public)
                .or_else(|_| DecodingKey::from_ec_pem(&public))
                .unwrap(),
            &validation,
        )
        .unwrap()
        .claims;
        prop_assert_eq!(claims.iat, issued);
        prop_assert_eq!(claims.exp, issued + validity_secs as i64);
        prop_assert_eq!(claims.aud, "demo-project");
    }
}
