use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ciborium::value::Value;
use coset::{CborSerializable, CoseSign1, TaggedCborSerializable};
use openssl::bn::BigNum;
use openssl::ecdsa::EcdsaSig;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::stack::Stack;
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::verify::X509VerifyParam;
use openssl::x509::{X509StoreContext, X509};
use sha2::{Digest, Sha384};

use super::root::{RootOfTrust, RootResolver};
use super::types::{AttestationDocument, AttestationInput, ExpectedMeasurements, VerifiedAttestation};
use super::{AttestationVerifier, VerificationContext};
use crate::error::{AttestError, Error, ParseError};

/// Highest PCR index a Nitro hypervisor reports.
const MAX_PCR_INDEX: i128 = 31;

/// A decoded but not yet verified attestation: the COSE_Sign1 envelope plus
/// its independently decoded payload.
#[derive(Debug, Clone)]
pub struct ParsedAttestation {
    pub envelope: CoseSign1,
    pub document: AttestationDocument,
    raw: Vec<u8>,
}

impl ParsedAttestation {
    /// The raw bytes the envelope was decoded from.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }
}

/// Decode a Nitro attestation document.
///
/// The outer structure must be a 4-element COSE_Sign1 array (tagged or not);
/// element 3 is decoded as a separate CBOR map that must carry every document
/// field. `public_key`, `user_data` and `nonce` must be present but may be null.
pub fn parse_attestation_document<'a>(
    input: impl Into<AttestationInput<'a>>,
) -> Result<ParsedAttestation, ParseError> {
    let raw = match input.into() {
        AttestationInput::Base64(text) => STANDARD.decode(text.trim())?,
        AttestationInput::Raw(bytes) => bytes.to_vec(),
    };
    if raw.is_empty() {
        return Err(ParseError::Envelope("empty document".into()));
    }

    // Real NSM output is untagged; accept tag 18 as well.
    let envelope = CoseSign1::from_tagged_slice(&raw)
        .or_else(|_| CoseSign1::from_slice(&raw))
        .map_err(|e| ParseError::Envelope(format!("expected 4-element COSE_Sign1 array: {e}")))?;

    let payload = envelope
        .payload
        .as_ref()
        .ok_or_else(|| ParseError::MissingField("payload".into()))?;
    let document = parse_payload(payload)?;

    Ok(ParsedAttestation {
        envelope,
        document,
        raw,
    })
}

/// Verifier for AWS Nitro Enclave attestation documents.
///
/// Validates a parsed document by:
/// 1. Checking the digest algorithm and module id
/// 2. Validating the X.509 chain against the pinned root at the check time
/// 3. Verifying the ECDSA P-384 signature over the COSE Sig_structure
/// 4. Checking the echoed nonce and PCR measurements, when requested
pub struct NitroVerifier {
    root: RootResolver,
    expected_pcrs: ExpectedMeasurements,
}

impl NitroVerifier {
    pub fn new(root: RootOfTrust) -> Self {
        Self::with_measurements(root, ExpectedMeasurements::default())
    }

    /// `expected_pcrs` maps PCR index to expected bytes; unlisted PCRs are ignored.
    pub fn with_measurements(root: RootOfTrust, expected_pcrs: ExpectedMeasurements) -> Self {
        Self {
            root: RootResolver::new(root),
            expected_pcrs,
        }
    }

    /// Verifier pinned to a root CA given as PEM (for synthetic test chains).
    pub fn with_root_ca(root_ca_pem: &[u8]) -> Result<Self, AttestError> {
        Ok(Self::new(RootOfTrust::from_pem(root_ca_pem)?))
    }
}

#[async_trait]
impl AttestationVerifier for NitroVerifier {
    async fn verify(
        &self,
        parsed: &ParsedAttestation,
        ctx: VerificationContext<'_>,
    ) -> Result<VerifiedAttestation, Error> {
        let doc = &parsed.document;

        if doc.digest != "SHA384" {
            return Err(AttestError::UnsupportedDigest(doc.digest.clone()).into());
        }
        if doc.module_id.is_empty() {
            return Err(AttestError::MissingField("module_id".into()).into());
        }

        let root = self.root.get().await?;
        validate_cert_chain(&doc.cabundle, &doc.certificate, root, ctx.check_time)?;
        verify_cose_signature(&parsed.envelope, &doc.certificate)?;

        if let Some(expected) = ctx.expected_nonce {
            if doc.nonce.as_deref() != Some(expected) {
                return Err(AttestError::NonceMismatch.into());
            }
        }

        self.expected_pcrs.verify(&doc.pcrs)?;
        tracing::debug!(
            module_id = %doc.module_id,
            pcr_count = doc.pcrs.len(),
            expected_count = self.expected_pcrs.values.len(),
            "attestation checks passed"
        );

        Ok(VerifiedAttestation {
            document: doc.clone(),
            document_hash: Sha384::digest(&parsed.raw).into(),
        })
    }
}

// -- CBOR Parsing Helpers --

fn parse_payload(payload: &[u8]) -> Result<AttestationDocument, ParseError> {
    let value: Value = ciborium::de::from_reader(payload)
        .map_err(|e| ParseError::Payload(format!("invalid CBOR: {e}")))?;

    let map = match value {
        Value::Map(m) => m,
        _ => return Err(ParseError::Payload("payload is not a CBOR map".into())),
    };

    let document = AttestationDocument {
        module_id: get_text_field(&map, "module_id")?,
        digest: get_text_field(&map, "digest")?,
        timestamp: get_uint_field(&map, "timestamp")?,
        pcrs: get_pcrs_field(&map)?,
        certificate: get_bytes_field(&map, "certificate")?,
        cabundle: get_bytes_array_field(&map, "cabundle")?,
        public_key: get_nullable_bytes_field(&map, "public_key")?,
        user_data: get_nullable_bytes_field(&map, "user_data")?,
        nonce: get_nullable_bytes_field(&map, "nonce")?,
    };

    for (idx, val) in &document.pcrs {
        if !matches!(val.len(), 32 | 48 | 64) {
            return Err(invalid(
                &format!("pcrs[{idx}]"),
                format!("{} bytes (expected 32, 48, or 64)", val.len()),
            ));
        }
    }

    Ok(document)
}

fn invalid(field: &str, reason: impl Into<String>) -> ParseError {
    ParseError::InvalidField {
        field: field.into(),
        reason: reason.into(),
    }
}

fn find_field<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a Value> {
    map.iter()
        .find(|(k, _)| matches!(k, Value::Text(s) if s == key))
        .map(|(_, v)| v)
}

fn require_field<'a>(map: &'a [(Value, Value)], key: &str) -> Result<&'a Value, ParseError> {
    find_field(map, key).ok_or_else(|| ParseError::MissingField(key.into()))
}

fn get_text_field(map: &[(Value, Value)], key: &str) -> Result<String, ParseError> {
    match require_field(map, key)? {
        Value::Text(s) => Ok(s.clone()),
        _ => Err(invalid(key, "not a text string")),
    }
}

fn get_uint_field(map: &[(Value, Value)], key: &str) -> Result<u64, ParseError> {
    match require_field(map, key)? {
        Value::Integer(i) => u64::try_from(i128::from(*i)).map_err(|_| invalid(key, "out of range")),
        _ => Err(invalid(key, "not an integer")),
    }
}

fn get_bytes_field(map: &[(Value, Value)], key: &str) -> Result<Vec<u8>, ParseError> {
    match require_field(map, key)? {
        Value::Bytes(b) => Ok(b.clone()),
        _ => Err(invalid(key, "not a byte string")),
    }
}

fn get_nullable_bytes_field(
    map: &[(Value, Value)],
    key: &str,
) -> Result<Option<Vec<u8>>, ParseError> {
    match require_field(map, key)? {
        Value::Bytes(b) => Ok(Some(b.clone())),
        Value::Null => Ok(None),
        _ => Err(invalid(key, "not a byte string or null")),
    }
}

fn get_bytes_array_field(map: &[(Value, Value)], key: &str) -> Result<Vec<Vec<u8>>, ParseError> {
    match require_field(map, key)? {
        Value::Array(arr) => arr
            .iter()
            .enumerate()
            .map(|(i, item)| match item {
                Value::Bytes(b) => Ok(b.clone()),
                _ => Err(invalid(&format!("{key}[{i}]"), "not a byte string")),
            })
            .collect(),
        _ => Err(invalid(key, "not an array")),
    }
}

fn get_pcrs_field(map: &[(Value, Value)]) -> Result<BTreeMap<usize, Vec<u8>>, ParseError> {
    let pcrs_map = match require_field(map, "pcrs")? {
        Value::Map(m) => m,
        _ => return Err(invalid("pcrs", "not a map")),
    };

    let mut result = BTreeMap::new();
    for (k, v) in pcrs_map {
        let idx = match k {
            Value::Integer(i) => {
                let val = i128::from(*i);
                if !(0..=MAX_PCR_INDEX).contains(&val) {
                    return Err(invalid("pcrs", format!("index {val} out of range")));
                }
                val as usize
            }
            _ => return Err(invalid("pcrs", "key is not an integer")),
        };
        let bytes = match v {
            Value::Bytes(b) => b.clone(),
            _ => return Err(invalid(&format!("pcrs[{idx}]"), "not a byte string")),
        };
        result.insert(idx, bytes);
    }

    Ok(result)
}

// -- Certificate Chain Validation --

fn chain_error(message: impl Into<String>) -> AttestError {
    AttestError::ChainValidation {
        code: -1,
        message: message.into(),
    }
}

fn validate_cert_chain(
    cabundle: &[Vec<u8>],
    leaf_der: &[u8],
    pinned_root: &X509,
    check_time: Option<SystemTime>,
) -> Result<(), AttestError> {
    let mut store_builder = X509StoreBuilder::new()
        .map_err(|e| chain_error(format!("failed to create X509 store: {e}")))?;
    store_builder
        .add_cert(pinned_root.clone())
        .map_err(|e| chain_error(format!("failed to add root cert to store: {e}")))?;

    if let Some(at) = check_time {
        let secs = at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let mut param = X509VerifyParam::new()
            .map_err(|e| chain_error(format!("failed to create verify params: {e}")))?;
        param.set_time(secs as _);
        store_builder
            .set_param(&param)
            .map_err(|e| chain_error(format!("failed to set check time: {e}")))?;
    }
    let store = store_builder.build();

    // Every bundled certificate is untrusted; only the pinned root anchors the path.
    let mut chain =
        Stack::new().map_err(|e| chain_error(format!("failed to create cert stack: {e}")))?;
    for (i, der) in cabundle.iter().enumerate() {
        let cert = X509::from_der(der)
            .map_err(|e| chain_error(format!("failed to parse cabundle[{i}]: {e}")))?;
        chain
            .push(cert)
            .map_err(|e| chain_error(format!("failed to push cabundle[{i}]: {e}")))?;
    }

    let leaf = X509::from_der(leaf_der)
        .map_err(|e| chain_error(format!("failed to parse leaf certificate: {e}")))?;

    let mut ctx = X509StoreContext::new()
        .map_err(|e| chain_error(format!("failed to create store context: {e}")))?;
    let (valid, result) = ctx
        .init(&store, &leaf, &chain, |c| {
            let ok = c.verify_cert()?;
            Ok((ok, c.error()))
        })
        .map_err(|e| chain_error(format!("certificate chain verification error: {e}")))?;

    if !valid {
        return Err(AttestError::ChainValidation {
            code: result.as_raw(),
            message: result.error_string().to_string(),
        });
    }

    Ok(())
}

// -- COSE_Sign1 Signature Verification --

fn verify_cose_signature(cose_sign1: &CoseSign1, leaf_der: &[u8]) -> Result<(), AttestError> {
    let leaf = X509::from_der(leaf_der)
        .map_err(|e| AttestError::Signature(format!("failed to parse leaf certificate: {e}")))?;
    let pubkey = leaf
        .public_key()
        .map_err(|e| AttestError::Signature(format!("failed to extract public key: {e}")))?;
    let ec_key = pubkey
        .ec_key()
        .map_err(|e| AttestError::Signature(format!("leaf cert key is not EC: {e}")))?;

    let nid = ec_key
        .group()
        .curve_name()
        .ok_or_else(|| AttestError::Signature("EC key has no named curve".into()))?;
    if nid != Nid::SECP384R1 {
        return Err(AttestError::Signature(format!(
            "expected P-384 key, got curve NID {nid:?}"
        )));
    }

    // Sig_structure = ["Signature1", protected, h'', payload]
    let tbs = cose_sign1.tbs_data(b"");
    let hash = openssl::hash::hash(MessageDigest::sha384(), &tbs)
        .map_err(|e| AttestError::Signature(format!("SHA-384 hash failed: {e}")))?;

    // r || s, equal halves.
    let raw_sig = &cose_sign1.signature;
    if raw_sig.is_empty() || raw_sig.len() % 2 != 0 {
        return Err(AttestError::Signature(format!(
            "signature has invalid length: {}",
            raw_sig.len()
        )));
    }
    let (r, s) = raw_sig.split_at(raw_sig.len() / 2);
    let r = BigNum::from_slice(r)
        .map_err(|e| AttestError::Signature(format!("failed to parse signature r: {e}")))?;
    let s = BigNum::from_slice(s)
        .map_err(|e| AttestError::Signature(format!("failed to parse signature s: {e}")))?;
    let ecdsa_sig = EcdsaSig::from_private_components(r, s)
        .map_err(|e| AttestError::Signature(format!("failed to build ECDSA sig: {e}")))?;

    let valid = ecdsa_sig
        .verify(&hash, &ec_key)
        .map_err(|e| AttestError::Signature(format!("ECDSA verification error: {e}")))?;
    if !valid {
        return Err(AttestError::Signature("signature mismatch".into()));
    }

    Ok(())
}

/// Synthetic CA, leaf and COSE_Sign1 builders shared by unit and integration tests.
#[doc(hidden)]
pub mod test_support {
    use std::collections::BTreeMap;

    use ciborium::value::Value;
    use coset::{CoseSign1Builder, HeaderBuilder, TaggedCborSerializable};
    use openssl::asn1::Asn1Time;
    use openssl::ec::{EcGroup, EcKey};
    use openssl::ecdsa::EcdsaSig;
    use openssl::hash::MessageDigest;
    use openssl::nid::Nid;
    use openssl::pkey::{PKey, Private};
    use openssl::x509::extension::{BasicConstraints, KeyUsage};
    use openssl::x509::{X509Builder, X509NameBuilder, X509};

    use crate::attestation::types::AttestationDocument;

    pub type EcPrivateKey = EcKey<Private>;

    const TEN_YEARS: i64 = 10 * 365 * 24 * 3600;

    fn now_secs() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock before UNIX epoch")
            .as_secs() as i64
    }

    fn build_cert(
        subject_cn: &str,
        key: &EcPrivateKey,
        issuer: Option<(&EcPrivateKey, &X509)>,
        not_before: i64,
        not_after: i64,
        ca: bool,
    ) -> X509 {
        let pkey = PKey::from_ec_key(key.clone()).unwrap();

        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", subject_cn).unwrap();
        let name = name.build();

        let mut builder = X509Builder::new().unwrap();
        builder.set_version(2).unwrap();
        builder.set_subject_name(&name).unwrap();
        match issuer {
            Some((_, cert)) => builder.set_issuer_name(cert.subject_name()).unwrap(),
            None => builder.set_issuer_name(&name).unwrap(),
        }
        builder.set_pubkey(&pkey).unwrap();
        builder
            .set_not_before(&Asn1Time::from_unix(not_before).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::from_unix(not_after).unwrap())
            .unwrap();

        if ca {
            let bc = BasicConstraints::new().critical().ca().build().unwrap();
            builder.append_extension(bc).unwrap();
            let ku = KeyUsage::new()
                .critical()
                .key_cert_sign()
                .crl_sign()
                .build()
                .unwrap();
            builder.append_extension(ku).unwrap();
        } else {
            let ku = KeyUsage::new()
                .critical()
                .digital_signature()
                .build()
                .unwrap();
            builder.append_extension(ku).unwrap();
        }

        let signer = match issuer {
            Some((issuer_key, _)) => PKey::from_ec_key(issuer_key.clone()).unwrap(),
            None => pkey,
        };
        builder.sign(&signer, MessageDigest::sha384()).unwrap();
        builder.build()
    }

    fn new_p384_key() -> EcPrivateKey {
        let group = EcGroup::from_curve_name(Nid::SECP384R1).unwrap();
        EcKey::generate(&group).unwrap()
    }

    /// Generate a self-signed P-384 CA certificate valid for ten years from now.
    pub fn generate_test_ca() -> (EcPrivateKey, X509) {
        let now = now_secs();
        generate_test_ca_valid(now - 60, now + TEN_YEARS)
    }

    /// Generate a self-signed P-384 CA certificate with an explicit validity window.
    pub fn generate_test_ca_valid(not_before: i64, not_after: i64) -> (EcPrivateKey, X509) {
        let key = new_p384_key();
        let cert = build_cert("Test Nitro CA", &key, None, not_before, not_after, true);
        (key, cert)
    }

    /// Generate a leaf certificate signed by the given CA.
    pub fn generate_test_leaf(ca_key: &EcPrivateKey, ca_cert: &X509) -> (EcPrivateKey, X509) {
        let now = now_secs();
        generate_test_leaf_valid(ca_key, ca_cert, now - 60, now + TEN_YEARS)
    }

    /// Generate a leaf certificate with an explicit validity window.
    pub fn generate_test_leaf_valid(
        ca_key: &EcPrivateKey,
        ca_cert: &X509,
        not_before: i64,
        not_after: i64,
    ) -> (EcPrivateKey, X509) {
        let key = new_p384_key();
        let cert = build_cert(
            "Test Nitro Leaf",
            &key,
            Some((ca_key, ca_cert)),
            not_before,
            not_after,
            false,
        );
        (key, cert)
    }

    fn nullable(bytes: &Option<Vec<u8>>) -> Value {
        match bytes {
            Some(b) => Value::Bytes(b.clone()),
            None => Value::Null,
        }
    }

    /// Encode an attestation document as the CBOR map NSM produces.
    pub fn encode_attestation_doc(doc: &AttestationDocument) -> Vec<u8> {
        let pcrs: Vec<(Value, Value)> = doc
            .pcrs
            .iter()
            .map(|(k, v)| (Value::Integer((*k as u64).into()), Value::Bytes(v.clone())))
            .collect();
        let cabundle = doc.cabundle.iter().cloned().map(Value::Bytes).collect();

        let entries = vec![
            (Value::Text("module_id".into()), Value::Text(doc.module_id.clone())),
            (Value::Text("digest".into()), Value::Text(doc.digest.clone())),
            (
                Value::Text("timestamp".into()),
                Value::Integer(doc.timestamp.into()),
            ),
            (Value::Text("pcrs".into()), Value::Map(pcrs)),
            (
                Value::Text("certificate".into()),
                Value::Bytes(doc.certificate.clone()),
            ),
            (Value::Text("cabundle".into()), Value::Array(cabundle)),
            (Value::Text("public_key".into()), nullable(&doc.public_key)),
            (Value::Text("user_data".into()), nullable(&doc.user_data)),
            (Value::Text("nonce".into()), nullable(&doc.nonce)),
        ];

        let mut buf = Vec::new();
        ciborium::ser::into_writer(&Value::Map(entries), &mut buf)
            .expect("CBOR serialization should not fail");
        buf
    }

    /// Sign a CBOR payload as COSE_Sign1 (ES384). Returns tagged CBOR bytes.
    pub fn sign_cose_with_key(ec_key: &EcPrivateKey, payload: &[u8]) -> Vec<u8> {
        let protected = HeaderBuilder::new()
            .algorithm(coset::iana::Algorithm::ES384)
            .build();

        CoseSign1Builder::new()
            .protected(protected)
            .payload(payload.to_vec())
            .create_signature(b"", |tbs| {
                let hash = openssl::hash::hash(MessageDigest::sha384(), tbs)
                    .expect("SHA-384 hash failed");
                let sig = EcdsaSig::sign(&hash, ec_key).expect("ECDSA sign failed");
                let mut raw_sig = sig.r().to_vec_padded(48).expect("r padding failed");
                raw_sig.extend(sig.s().to_vec_padded(48).expect("s padding failed"));
                raw_sig
            })
            .build()
            .to_tagged_vec()
            .expect("COSE_Sign1 serialization failed")
    }

    /// A synthetic enclave: a CA, a leaf signed by it, and a document template.
    pub struct TestEnclave {
        pub ca_key: EcPrivateKey,
        pub ca_cert: X509,
        pub leaf_key: EcPrivateKey,
        pub leaf_cert: X509,
    }

    impl Default for TestEnclave {
        fn default() -> Self {
            Self::new()
        }
    }

    impl TestEnclave {
        pub fn new() -> Self {
            let (ca_key, ca_cert) = generate_test_ca();
            let (leaf_key, leaf_cert) = generate_test_leaf(&ca_key, &ca_cert);
            Self {
                ca_key,
                ca_cert,
                leaf_key,
                leaf_cert,
            }
        }

        pub fn root_pem(&self) -> Vec<u8> {
            self.ca_cert.to_pem().unwrap()
        }

        /// Document template bound to this enclave's certificates.
        pub fn document(
            &self,
            public_key: Option<&[u8]>,
            user_data: Option<&[u8]>,
            nonce: Option<&[u8]>,
        ) -> AttestationDocument {
            let mut pcrs = BTreeMap::new();
            pcrs.insert(0, vec![0xAA; 48]);
            pcrs.insert(1, vec![0xBB; 48]);
            pcrs.insert(2, vec![0xCC; 48]);

            AttestationDocument {
                module_id: "i-test-module-1234".into(),
                digest: "SHA384".into(),
                timestamp: 1_700_000_000_000,
                pcrs,
                certificate: self.leaf_cert.to_der().unwrap(),
                cabundle: vec![self.ca_cert.to_der().unwrap()],
                public_key: public_key.map(<[u8]>::to_vec),
                user_data: user_data.map(<[u8]>::to_vec),
                nonce: nonce.map(<[u8]>::to_vec),
            }
        }

        /// Sign a document with the leaf key.
        pub fn sign(&self, doc: &AttestationDocument) -> Vec<u8> {
            sign_cose_with_key(&self.leaf_key, &encode_attestation_doc(doc))
        }

        /// Signed attestation for the given fields.
        pub fn attest(
            &self,
            public_key: Option<&[u8]>,
            user_data: Option<&[u8]>,
            nonce: Option<&[u8]>,
        ) -> Vec<u8> {
            self.sign(&self.document(public_key, user_data, nonce))
        }
    }
}
