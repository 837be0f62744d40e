//! Out-of-band envelope encryption.
//!
//! A 32-byte data key is wrapped once per RSA public key with RSA-OAEP
//! (SHA-256, MGF1-SHA-256) and reused. Payloads are sealed with AES-256-GCM as
//! `iv(12) ‖ ciphertext ‖ tag(16)`, and the envelope string is
//! `"cape:" + base64(wrapped_key ‖ iv ‖ ciphertext ‖ tag)`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use openssl::encrypt::{Decrypter, Encrypter};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private, Public};
use openssl::rsa::Padding;
use openssl::symm::{decrypt_aead, encrypt_aead, Cipher};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

use super::SymmetricKey;
use crate::error::{ArgumentError, CryptoError, Error};

/// Prefix of every envelope string.
pub const ENVELOPE_PREFIX: &str = "cape:";

/// AES-GCM IV length in bytes.
pub const IV_LEN: usize = 12;

/// AES-GCM tag length in bytes.
pub const TAG_LEN: usize = 16;

/// A symmetric data key and its RSA-wrapped form.
#[derive(Clone)]
pub struct DataKey {
    plaintext: Zeroizing<SymmetricKey>,
    wrapped: Vec<u8>,
}

impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataKey")
            .field("wrapped_len", &self.wrapped.len())
            .finish_non_exhaustive()
    }
}

impl DataKey {
    /// Generate a random data key and wrap it for the RSA public key in `pem`.
    pub fn generate(pem: &str) -> Result<Self, Error> {
        let public = parse_public_pem(pem)?;
        let mut plaintext = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(&mut plaintext[..]);
        let wrapped = rsa_oaep_wrap(&public, &plaintext[..])?;
        Ok(Self { plaintext, wrapped })
    }

    /// Recover a data key from its wrapped form with the RSA private key.
    pub fn unwrap(private: &PKey<Private>, wrapped: &[u8]) -> Result<Self, CryptoError> {
        let raw = Zeroizing::new(rsa_oaep_unwrap(private, wrapped)?);
        let plaintext: SymmetricKey = raw.as_slice().try_into().map_err(|_| {
            CryptoError::InvalidEnvelope(format!("data key is {} bytes, expected 32", raw.len()))
        })?;
        Ok(Self {
            plaintext: Zeroizing::new(plaintext),
            wrapped: wrapped.to_vec(),
        })
    }

    /// The RSA-OAEP ciphertext of the key.
    pub fn wrapped(&self) -> &[u8] {
        &self.wrapped
    }

    pub(crate) fn key(&self) -> &SymmetricKey {
        &self.plaintext
    }
}

fn rsa_err(e: impl std::fmt::Display) -> CryptoError {
    CryptoError::Rsa(e.to_string())
}

fn parse_public_pem(pem: &str) -> Result<PKey<Public>, ArgumentError> {
    let key = PKey::public_key_from_pem(pem.as_bytes())
        .map_err(|e| ArgumentError::InvalidKey(format!("not a PEM public key: {e}")))?;
    if key.rsa().is_err() {
        return Err(ArgumentError::InvalidKey("public key is not RSA".into()));
    }
    Ok(key)
}

fn rsa_oaep_wrap(public: &PKey<Public>, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut encrypter = Encrypter::new(public).map_err(rsa_err)?;
    encrypter
        .set_rsa_padding(Padding::PKCS1_OAEP)
        .map_err(rsa_err)?;
    encrypter
        .set_rsa_oaep_md(MessageDigest::sha256())
        .map_err(rsa_err)?;
    encrypter
        .set_rsa_mgf1_md(MessageDigest::sha256())
        .map_err(rsa_err)?;

    let mut out = vec![0u8; encrypter.encrypt_len(plaintext).map_err(rsa_err)?];
    let len = encrypter.encrypt(plaintext, &mut out).map_err(rsa_err)?;
    out.truncate(len);
    Ok(out)
}

fn rsa_oaep_unwrap(private: &PKey<Private>, wrapped: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut decrypter = Decrypter::new(private).map_err(rsa_err)?;
    decrypter
        .set_rsa_padding(Padding::PKCS1_OAEP)
        .map_err(rsa_err)?;
    decrypter
        .set_rsa_oaep_md(MessageDigest::sha256())
        .map_err(rsa_err)?;
    decrypter
        .set_rsa_mgf1_md(MessageDigest::sha256())
        .map_err(rsa_err)?;

    let mut out = vec![0u8; decrypter.decrypt_len(wrapped).map_err(rsa_err)?];
    let len = decrypter.decrypt(wrapped, &mut out).map_err(rsa_err)?;
    out.truncate(len);
    Ok(out)
}

/// AES-256-GCM with a fresh random IV. Returns `iv ‖ ciphertext ‖ tag`.
pub fn aes_gcm_seal(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let mut tag = [0u8; TAG_LEN];
    let ciphertext = encrypt_aead(Cipher::aes_256_gcm(), key, Some(&iv), &[], plaintext, &mut tag)
        .map_err(|_| CryptoError::SealFailed)?;

    let mut out = Vec::with_capacity(IV_LEN + ciphertext.len() + TAG_LEN);
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    out.extend_from_slice(&tag);
    Ok(out)
}

/// Inverse of [`aes_gcm_seal`].
pub fn aes_gcm_open(key: &SymmetricKey, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < IV_LEN + TAG_LEN {
        return Err(CryptoError::OpenFailed);
    }
    let (iv, rest) = sealed.split_at(IV_LEN);
    let (ciphertext, tag) = rest.split_at(rest.len() - TAG_LEN);
    decrypt_aead(Cipher::aes_256_gcm(), key, Some(iv), &[], ciphertext, tag)
        .map_err(|_| CryptoError::OpenFailed)
}

/// Seal `plaintext` under `data_key` and render the envelope string.
pub fn encrypt_envelope(data_key: &DataKey, plaintext: &[u8]) -> Result<String, CryptoError> {
    let sealed = aes_gcm_seal(data_key.key(), plaintext)?;
    let mut body = Vec::with_capacity(data_key.wrapped.len() + sealed.len());
    body.extend_from_slice(&data_key.wrapped);
    body.extend_from_slice(&sealed);
    Ok(format!("{ENVELOPE_PREFIX}{}", STANDARD.encode(body)))
}

/// Decrypt an envelope string with the RSA private key it was wrapped for.
pub fn decrypt_envelope(private: &PKey<Private>, envelope: &str) -> Result<Vec<u8>, CryptoError> {
    let encoded = envelope
        .strip_prefix(ENVELOPE_PREFIX)
        .ok_or_else(|| CryptoError::InvalidEnvelope(format!("missing {ENVELOPE_PREFIX} prefix")))?;
    let body = STANDARD
        .decode(encoded)
        .map_err(|e| CryptoError::InvalidEnvelope(e.to_string()))?;

    let wrapped_len = private.size();
    if body.len() < wrapped_len + IV_LEN + TAG_LEN {
        return Err(CryptoError::InvalidEnvelope(format!(
            "envelope too short: {} bytes",
            body.len()
        )));
    }
    let (wrapped, sealed) = body.split_at(wrapped_len);
    let data_key = DataKey::unwrap(private, wrapped)?;
    aes_gcm_open(data_key.key(), sealed)
}

/// Render a DER SubjectPublicKeyInfo as PEM (`-----BEGIN PUBLIC KEY-----`).
pub fn spki_der_to_pem(der: &[u8]) -> Result<String, CryptoError> {
    let key = PKey::public_key_from_der(der).map_err(rsa_err)?;
    let pem = key.public_key_to_pem().map_err(rsa_err)?;
    String::from_utf8(pem).map_err(rsa_err)
}
