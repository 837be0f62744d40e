use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;

use crate::error::{AttestError, ProtocolError};

/// Attestation input as delivered by the remote side: base64 text inside
/// message envelopes, raw bytes everywhere else.
#[derive(Debug, Clone, Copy)]
pub enum AttestationInput<'a> {
    Base64(&'a str),
    Raw(&'a [u8]),
}

impl<'a> From<&'a str> for AttestationInput<'a> {
    fn from(s: &'a str) -> Self {
        Self::Base64(s)
    }
}

impl<'a> From<&'a [u8]> for AttestationInput<'a> {
    fn from(b: &'a [u8]) -> Self {
        Self::Raw(b)
    }
}

impl<'a> From<&'a Vec<u8>> for AttestationInput<'a> {
    fn from(b: &'a Vec<u8>) -> Self {
        Self::Raw(b.as_slice())
    }
}

/// Decoded Nitro attestation document (the CBOR payload of the COSE_Sign1 envelope).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestationDocument {
    /// Issuing Nitro hypervisor module ID.
    pub module_id: String,
    /// Digest function used for the PCR values.
    pub digest: String,
    /// UTC creation time in milliseconds since the UNIX epoch.
    pub timestamp: u64,
    /// Locked PCRs at the time the document was created. Sparse.
    pub pcrs: BTreeMap<usize, Vec<u8>>,
    /// DER-encoded end-entity certificate that signed the document.
    pub certificate: Vec<u8>,
    /// DER-encoded issuing CA bundle, root first.
    pub cabundle: Vec<Vec<u8>>,
    /// Ephemeral enclave public key.
    pub public_key: Option<Vec<u8>>,
    /// Additional signed user data.
    pub user_data: Option<Vec<u8>>,
    /// Challenge echoed back by the enclave.
    pub nonce: Option<Vec<u8>>,
}

/// Expected measurement values to verify against an attestation document.
///
/// Only the indices present in this map are checked; other registers are ignored.
#[derive(Debug, Clone, Default)]
pub struct ExpectedMeasurements {
    pub values: BTreeMap<usize, Vec<u8>>,
}

impl ExpectedMeasurements {
    pub fn new(values: BTreeMap<usize, Vec<u8>>) -> Self {
        Self { values }
    }

    /// Verify that all expected measurements match the actual values.
    pub fn verify(&self, actual: &BTreeMap<usize, Vec<u8>>) -> Result<(), AttestError> {
        for (&index, expected) in &self.values {
            match actual.get(&index) {
                Some(value) if value == expected => {}
                Some(value) => {
                    return Err(AttestError::MeasurementMismatch {
                        index,
                        expected: hex::encode(expected),
                        actual: hex::encode(value),
                    })
                }
                None => return Err(AttestError::MissingField(format!("PCR{index}"))),
            }
        }
        Ok(())
    }
}

/// The result of a successful attestation verification.
#[derive(Debug, Clone)]
pub struct VerifiedAttestation {
    /// The verified document.
    pub document: AttestationDocument,
    /// SHA-384 of the raw COSE_Sign1 bytes.
    pub document_hash: [u8; 48],
}

impl VerifiedAttestation {
    /// The ephemeral public key bound into the attestation.
    pub fn public_key(&self) -> Result<&[u8], AttestError> {
        self.document
            .public_key
            .as_deref()
            .ok_or_else(|| AttestError::MissingField("public_key".into()))
    }

    /// Decode the user data as the JSON object enclaves place there.
    pub fn user_data(&self) -> Result<UserData, ProtocolError> {
        UserData::from_bytes(self.document.user_data.as_deref().unwrap_or_default())
    }
}

/// JSON object carried in `user_data` by enclave runtimes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct UserData {
    /// Base64 hash of the code loaded in the enclave.
    #[serde(default)]
    pub func_checksum: Option<String>,
    /// Base64 DER SubjectPublicKeyInfo of a long-lived key.
    #[serde(default)]
    pub key: Option<String>,
}

impl UserData {
    /// Parse user data. Empty user data is treated as an empty object.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, ProtocolError> {
        if raw.is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_slice(raw).map_err(|e| ProtocolError::InvalidUserData(e.to_string()))
    }

    /// Function checksum as lowercase hex (base64 → hex), empty if absent.
    pub fn func_checksum_hex(&self) -> Result<String, ProtocolError> {
        match &self.func_checksum {
            Some(b64) => STANDARD
                .decode(b64)
                .map(hex::encode)
                .map_err(|e| ProtocolError::InvalidUserData(format!("func_checksum: {e}"))),
            None => Ok(String::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_data_checksum_hex() {
        let ud = UserData::from_bytes(br#"{"func_checksum":"3q2+7w=="}"#).unwrap();
        assert_eq!(ud.func_checksum_hex().unwrap(), "deadbeef");
        assert!(ud.key.is_none());
    }

    #[test]
    fn empty_user_data_is_empty_object() {
        let ud = UserData::from_bytes(b"").unwrap();
        assert_eq!(ud, UserData::default());
        assert_eq!(ud.func_checksum_hex().unwrap(), "");
    }

    #[test]
    fn measurement_mismatch_names_index() {
        let mut actual = BTreeMap::new();
        actual.insert(0, vec![0xAA; 48]);
        let mut expected = BTreeMap::new();
        expected.insert(0, vec![0xFF; 48]);

        let err = ExpectedMeasurements::new(expected).verify(&actual).unwrap_err();
        assert!(err.to_string().contains("PCR0"), "{err}");
    }
}
