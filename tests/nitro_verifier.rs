use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use enclave_client::attestation::nitro::test_support::{
    encode_attestation_doc, generate_test_ca_valid, generate_test_leaf_valid, sign_cose_with_key,
    TestEnclave,
};
use enclave_client::attestation::types::ExpectedMeasurements;
use enclave_client::error::AttestError;
use enclave_client::{
    parse_attestation_document, AttestationVerifier, Error, NitroVerifier, RootOfTrust,
    VerificationContext,
};
use sha2::{Digest, Sha384};

const DAY: i64 = 24 * 3600;

fn unix_now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64
}

fn at(secs: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs as u64)
}

/// Enclave whose CA and leaf are both valid only within `[not_before, not_after]`.
fn windowed_enclave(not_before: i64, not_after: i64) -> TestEnclave {
    let (ca_key, ca_cert) = generate_test_ca_valid(not_before, not_after);
    let (leaf_key, leaf_cert) = generate_test_leaf_valid(&ca_key, &ca_cert, not_before, not_after);
    TestEnclave {
        ca_key,
        ca_cert,
        leaf_key,
        leaf_cert,
    }
}

fn assert_chain_error(result: Result<impl std::fmt::Debug, Error>) {
    match result {
        Err(Error::Attestation(AttestError::ChainValidation { code, message })) => {
            assert!(code > 0, "expected an X509 error code, got {code}");
            assert!(!message.is_empty());
        }
        other => panic!("expected chain validation failure, got {other:?}"),
    }
}

#[tokio::test]
async fn base64_document_verifies_end_to_end() {
    let enclave = TestEnclave::new();
    let raw = enclave.attest(Some(&[7u8; 32]), Some(b"{}"), Some(b"challenge"));
    let encoded = STANDARD.encode(&raw);

    let parsed = parse_attestation_document(encoded.as_str()).unwrap();
    assert_eq!(parsed.raw(), raw.as_slice());

    let verifier = NitroVerifier::with_root_ca(&enclave.root_pem()).unwrap();
    let verified = verifier
        .verify(
            &parsed,
            VerificationContext {
                check_time: None,
                expected_nonce: Some(b"challenge"),
            },
        )
        .await
        .unwrap();

    assert_eq!(verified.public_key().unwrap(), &[7u8; 32]);
    assert_eq!(verified.document.module_id, "i-test-module-1234");
    let expected_hash: [u8; 48] = Sha384::digest(&raw).into();
    assert_eq!(verified.document_hash, expected_hash);
}

#[tokio::test]
async fn check_time_inside_window_passes() {
    let now = unix_now();
    let enclave = windowed_enclave(now - 30 * DAY, now - 10 * DAY);
    let parsed = parse_attestation_document(&enclave.attest(None, None, None)).unwrap();
    let verifier = NitroVerifier::with_root_ca(&enclave.root_pem()).unwrap();

    // Expired relative to now.
    assert_chain_error(verifier.verify(&parsed, VerificationContext::default()).await);

    // But valid at a check time inside the window.
    let ctx = VerificationContext {
        check_time: Some(at(now - 20 * DAY)),
        expected_nonce: None,
    };
    verifier.verify(&parsed, ctx).await.unwrap();
}

#[tokio::test]
async fn check_time_before_window_fails() {
    let now = unix_now();
    let enclave = windowed_enclave(now - DAY, now + DAY);
    let parsed = parse_attestation_document(&enclave.attest(None, None, None)).unwrap();
    let verifier = NitroVerifier::with_root_ca(&enclave.root_pem()).unwrap();

    verifier
        .verify(&parsed, VerificationContext::default())
        .await
        .unwrap();

    let ctx = VerificationContext {
        check_time: Some(at(now - 2 * DAY)),
        expected_nonce: None,
    };
    assert_chain_error(verifier.verify(&parsed, ctx).await);

    let ctx = VerificationContext {
        check_time: Some(at(now + 2 * DAY)),
        expected_nonce: None,
    };
    assert_chain_error(verifier.verify(&parsed, ctx).await);
}

#[tokio::test]
async fn document_from_another_ca_is_rejected() {
    let enclave = TestEnclave::new();
    let other = TestEnclave::new();
    let parsed = parse_attestation_document(&enclave.attest(None, None, None)).unwrap();

    let verifier = NitroVerifier::new(RootOfTrust::from_pem(&other.root_pem()).unwrap());
    assert_chain_error(verifier.verify(&parsed, VerificationContext::default()).await);
}

#[tokio::test]
async fn leaf_key_mismatch_is_signature_error() {
    // Chain is valid but the document is signed by a key that is not the leaf's.
    let enclave = TestEnclave::new();
    let impostor = TestEnclave::new();
    let doc = enclave.document(None, None, None);
    let payload = encode_attestation_doc(&doc);
    let raw = sign_cose_with_key(&impostor.leaf_key, &payload);

    let parsed = parse_attestation_document(&raw).unwrap();
    let verifier = NitroVerifier::with_root_ca(&enclave.root_pem()).unwrap();
    let err = verifier
        .verify(&parsed, VerificationContext::default())
        .await
        .unwrap_err();
    assert!(
        matches!(err, Error::Attestation(AttestError::Signature(_))),
        "{err}"
    );
}

#[tokio::test]
async fn nonce_must_match_when_expected() {
    let enclave = TestEnclave::new();
    let verifier = NitroVerifier::with_root_ca(&enclave.root_pem()).unwrap();

    let with_nonce = parse_attestation_document(&enclave.attest(None, None, Some(b"abc"))).unwrap();
    let ctx = VerificationContext {
        check_time: None,
        expected_nonce: Some(b"abd"),
    };
    let err = verifier.verify(&with_nonce, ctx).await.unwrap_err();
    assert!(
        matches!(err, Error::Attestation(AttestError::NonceMismatch)),
        "{err}"
    );

    let without = parse_attestation_document(&enclave.attest(None, None, None)).unwrap();
    let ctx = VerificationContext {
        check_time: None,
        expected_nonce: Some(b"abc"),
    };
    let err = verifier.verify(&without, ctx).await.unwrap_err();
    assert!(
        matches!(err, Error::Attestation(AttestError::NonceMismatch)),
        "{err}"
    );

    // Not checked when no nonce is expected.
    verifier
        .verify(&with_nonce, VerificationContext::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn expected_measurements_are_enforced() {
    let enclave = TestEnclave::new();
    let parsed = parse_attestation_document(&enclave.attest(None, None, None)).unwrap();
    let root = RootOfTrust::from_pem(&enclave.root_pem()).unwrap();

    let matching = ExpectedMeasurements::new(BTreeMap::from([(0, vec![0xAA; 48])]));
    NitroVerifier::with_measurements(root.clone(), matching)
        .verify(&parsed, VerificationContext::default())
        .await
        .unwrap();

    let wrong = ExpectedMeasurements::new(BTreeMap::from([(2, vec![0x00; 48])]));
    let err = NitroVerifier::with_measurements(root, wrong)
        .verify(&parsed, VerificationContext::default())
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            Error::Attestation(AttestError::MeasurementMismatch { .. })
        ),
        "{err}"
    );
}
