//! RFC 9180 HPKE, base mode, single-shot.
//!
//! Suite: DHKEM(X25519, HKDF-SHA256), HKDF-SHA256, ChaCha20Poly1305, with an
//! empty `info` and empty AAD. Only sequence number 0 is ever used.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use super::{CipherSuite, SymmetricKey};
use crate::error::CryptoError;

const SUITE: CipherSuite = CipherSuite::X25519ChaChaPoly;
const VERSION_LABEL: &[u8] = b"HPKE-v1";
const MODE_BASE: u8 = 0x00;

/// An X25519 key pair.
pub struct KeyPair {
    pub secret: StaticSecret,
    pub public: PublicKey,
}

impl KeyPair {
    /// Generate a new random key pair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }
}

/// Output of [`seal`]: the encapsulated key and the AEAD ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub enc: super::PublicKey,
    pub ciphertext: Vec<u8>,
}

impl Sealed {
    /// Wire frame: `enc ‖ ciphertext`.
    pub fn to_frame(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(self.enc.len() + self.ciphertext.len());
        frame.extend_from_slice(&self.enc);
        frame.extend_from_slice(&self.ciphertext);
        frame
    }
}

fn kem_suite_id() -> Vec<u8> {
    let mut id = b"KEM".to_vec();
    id.extend_from_slice(&SUITE.kem_id().to_be_bytes());
    id
}

fn hpke_suite_id() -> Vec<u8> {
    let mut id = b"HPKE".to_vec();
    id.extend_from_slice(&SUITE.kem_id().to_be_bytes());
    id.extend_from_slice(&SUITE.kdf_id().to_be_bytes());
    id.extend_from_slice(&SUITE.aead_id().to_be_bytes());
    id
}

fn labeled_extract(salt: &[u8], suite_id: &[u8], label: &[u8], ikm: &[u8]) -> Zeroizing<Vec<u8>> {
    let mut labeled_ikm = Zeroizing::new(Vec::with_capacity(
        VERSION_LABEL.len() + suite_id.len() + label.len() + ikm.len(),
    ));
    labeled_ikm.extend_from_slice(VERSION_LABEL);
    labeled_ikm.extend_from_slice(suite_id);
    labeled_ikm.extend_from_slice(label);
    labeled_ikm.extend_from_slice(ikm);

    let (prk, _) = Hkdf::<Sha256>::extract(Some(salt), &labeled_ikm);
    Zeroizing::new(prk.to_vec())
}

fn labeled_expand(
    prk: &[u8],
    suite_id: &[u8],
    label: &[u8],
    info: &[u8],
    out: &mut [u8],
) -> Result<(), CryptoError> {
    let len = u16::try_from(out.len()).map_err(|_| CryptoError::HkdfExpandFailed)?;
    let mut labeled_info =
        Vec::with_capacity(2 + VERSION_LABEL.len() + suite_id.len() + label.len() + info.len());
    labeled_info.extend_from_slice(&len.to_be_bytes());
    labeled_info.extend_from_slice(VERSION_LABEL);
    labeled_info.extend_from_slice(suite_id);
    labeled_info.extend_from_slice(label);
    labeled_info.extend_from_slice(info);

    Hkdf::<Sha256>::from_prk(prk)
        .map_err(|_| CryptoError::HkdfExpandFailed)?
        .expand(&labeled_info, out)
        .map_err(|_| CryptoError::HkdfExpandFailed)
}

/// DHKEM ExtractAndExpand over `dh` with `kem_context = enc ‖ pkR`.
fn extract_and_expand(
    dh: &[u8],
    enc: &[u8],
    pk_r: &[u8],
) -> Result<Zeroizing<SymmetricKey>, CryptoError> {
    let suite_id = kem_suite_id();
    let eae_prk = labeled_extract(b"", &suite_id, b"eae_prk", dh);

    let mut kem_context = Vec::with_capacity(enc.len() + pk_r.len());
    kem_context.extend_from_slice(enc);
    kem_context.extend_from_slice(pk_r);

    let mut shared_secret = Zeroizing::new([0u8; 32]);
    labeled_expand(
        &eae_prk,
        &suite_id,
        b"shared_secret",
        &kem_context,
        &mut shared_secret[..],
    )?;
    Ok(shared_secret)
}

/// Base-mode key schedule with empty `info`. Returns `(key, base_nonce)`.
fn key_schedule(
    shared_secret: &[u8],
) -> Result<(Zeroizing<SymmetricKey>, [u8; 12]), CryptoError> {
    let suite_id = hpke_suite_id();
    let psk_id_hash = labeled_extract(b"", &suite_id, b"psk_id_hash", b"");
    let info_hash = labeled_extract(b"", &suite_id, b"info_hash", b"");

    let mut context = Vec::with_capacity(1 + psk_id_hash.len() + info_hash.len());
    context.push(MODE_BASE);
    context.extend_from_slice(&psk_id_hash);
    context.extend_from_slice(&info_hash);

    let secret = labeled_extract(shared_secret, &suite_id, b"secret", b"");

    let mut key = Zeroizing::new([0u8; 32]);
    labeled_expand(&secret, &suite_id, b"key", &context, &mut key[..])?;
    let mut base_nonce = [0u8; 12];
    labeled_expand(&secret, &suite_id, b"base_nonce", &context, &mut base_nonce)?;
    Ok((key, base_nonce))
}

fn parse_public_key(raw: &[u8]) -> Result<PublicKey, CryptoError> {
    let bytes: super::PublicKey = raw.try_into().map_err(|_| CryptoError::InvalidPublicKey {
        expected: SUITE.public_key_len(),
        actual: raw.len(),
    })?;
    Ok(PublicKey::from(bytes))
}

fn cipher(key: &SymmetricKey) -> Result<ChaCha20Poly1305, CryptoError> {
    ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::SealFailed)
}

/// Encrypt `plaintext` to the raw recipient public key `pk_r`.
pub fn seal(pk_r: &[u8], plaintext: &[u8]) -> Result<Sealed, CryptoError> {
    seal_with_ephemeral(&StaticSecret::random_from_rng(OsRng), pk_r, plaintext)
}

fn seal_with_ephemeral(
    sk_e: &StaticSecret,
    pk_r: &[u8],
    plaintext: &[u8],
) -> Result<Sealed, CryptoError> {
    let recipient = parse_public_key(pk_r)?;
    let pk_e = PublicKey::from(sk_e);

    let dh = sk_e.diffie_hellman(&recipient);
    if !dh.was_contributory() {
        return Err(CryptoError::NonContributoryKey);
    }

    let enc = pk_e.to_bytes();
    let shared_secret = extract_and_expand(dh.as_bytes(), &enc, recipient.as_bytes())?;
    let (key, base_nonce) = key_schedule(&shared_secret[..])?;

    let ciphertext = cipher(&key)?
        .encrypt(
            Nonce::from_slice(&base_nonce),
            Payload {
                msg: plaintext,
                aad: b"",
            },
        )
        .map_err(|_| CryptoError::SealFailed)?;

    Ok(Sealed { enc, ciphertext })
}

/// Decrypt a single-shot HPKE ciphertext with the recipient secret key.
pub fn open(sk_r: &StaticSecret, enc: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let pk_e = parse_public_key(enc)?;
    let pk_r = PublicKey::from(sk_r);

    let dh = sk_r.diffie_hellman(&pk_e);
    if !dh.was_contributory() {
        return Err(CryptoError::NonContributoryKey);
    }

    let shared_secret = extract_and_expand(dh.as_bytes(), enc, pk_r.as_bytes())?;
    let (key, base_nonce) = key_schedule(&shared_secret[..])?;

    cipher(&key)?
        .decrypt(
            Nonce::from_slice(&base_nonce),
            Payload {
                msg: ciphertext,
                aad: b"",
            },
        )
        .map_err(|_| CryptoError::OpenFailed)
}

/// Decrypt a wire frame produced by [`Sealed::to_frame`].
pub fn open_frame(sk_r: &StaticSecret, frame: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let enc_len = SUITE.public_key_len();
    if frame.len() < enc_len + SUITE.tag_len() {
        return Err(CryptoError::OpenFailed);
    }
    let (enc, ciphertext) = frame.split_at(enc_len);
    open(sk_r, enc, ciphertext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn seal_open_roundtrip() {
        let recipient = KeyPair::generate();
        let sealed = seal(recipient.public.as_bytes(), b"hello enclave").unwrap();
        assert_eq!(sealed.ciphertext.len(), 13 + SUITE.tag_len());

        let opened = open(&recipient.secret, &sealed.enc, &sealed.ciphertext).unwrap();
        assert_eq!(opened, b"hello enclave");
    }

    #[test]
    fn empty_plaintext_roundtrip() {
        let recipient = KeyPair::generate();
        let frame = seal(recipient.public.as_bytes(), b"").unwrap().to_frame();
        assert_eq!(frame.len(), 32 + 16);
        assert!(open_frame(&recipient.secret, &frame).unwrap().is_empty());
    }

    #[test]
    fn fresh_ephemeral_per_seal() {
        let recipient = KeyPair::generate();
        let a = seal(recipient.public.as_bytes(), b"same").unwrap();
        let b = seal(recipient.public.as_bytes(), b"same").unwrap();
        assert_ne!(a.enc, b.enc);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn deterministic_with_fixed_ephemeral() {
        let recipient = KeyPair::generate();
        let sk_e = StaticSecret::from([7u8; 32]);
        let a = seal_with_ephemeral(&sk_e, recipient.public.as_bytes(), b"m").unwrap();
        let b = seal_with_ephemeral(&sk_e, recipient.public.as_bytes(), b"m").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn wrong_recipient_fails() {
        let recipient = KeyPair::generate();
        let other = KeyPair::generate();
        let sealed = seal(recipient.public.as_bytes(), b"secret").unwrap();
        let err = open(&other.secret, &sealed.enc, &sealed.ciphertext).unwrap_err();
        assert!(matches!(err, CryptoError::OpenFailed));
    }

    #[test]
    fn reject_bad_key_length() {
        let err = seal(&[1u8; 31], b"x").unwrap_err();
        assert!(matches!(
            err,
            CryptoError::InvalidPublicKey {
                expected: 32,
                actual: 31
            }
        ));
    }

    #[test]
    fn reject_low_order_public_key() {
        // The all-zero point has order 1.
        let err = seal(&[0u8; 32], b"x").unwrap_err();
        assert!(matches!(err, CryptoError::NonContributoryKey));
    }

    #[test]
    fn truncated_frame_fails() {
        let recipient = KeyPair::generate();
        assert!(open_frame(&recipient.secret, &[0u8; 40]).is_err());
    }

    proptest! {
        #[test]
        fn tampered_ciphertext_fails(payload in proptest::collection::vec(any::<u8>(), 0..256), flip in any::<usize>()) {
            let recipient = KeyPair::generate();
            let mut frame = seal(recipient.public.as_bytes(), &payload).unwrap().to_frame();
            let idx = flip % frame.len();
            frame[idx] ^= 0x01;
            prop_assert!(open_frame(&recipient.secret, &frame).is_err());
        }
    }
}
