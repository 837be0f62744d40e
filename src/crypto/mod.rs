pub mod envelope;
pub mod hpke;

/// Supported HPKE cipher suites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherSuite {
    /// DHKEM(X25519, HKDF-SHA256) + HKDF-SHA256 + ChaCha20Poly1305.
    X25519ChaChaPoly,
}

impl CipherSuite {
    /// RFC 9180 KEM identifier.
    pub const fn kem_id(self) -> u16 {
        match self {
            Self::X25519ChaChaPoly => 0x0020,
        }
    }

    /// RFC 9180 KDF identifier.
    pub const fn kdf_id(self) -> u16 {
        match self {
            Self::X25519ChaChaPoly => 0x0001,
        }
    }

    /// RFC 9180 AEAD identifier.
    pub const fn aead_id(self) -> u16 {
        match self {
            Self::X25519ChaChaPoly => 0x0003,
        }
    }

    /// AEAD key length in bytes.
    pub const fn key_len(self) -> usize {
        match self {
            Self::X25519ChaChaPoly => 32,
        }
    }

    /// AEAD nonce length in bytes.
    pub const fn nonce_len(self) -> usize {
        match self {
            Self::X25519ChaChaPoly => 12,
        }
    }

    /// AEAD tag length in bytes.
    pub const fn tag_len(self) -> usize {
        match self {
            Self::X25519ChaChaPoly => 16,
        }
    }

    /// Serialized KEM public key length (`Npk`, also `Nenc`).
    pub const fn public_key_len(self) -> usize {
        match self {
            Self::X25519ChaChaPoly => 32,
        }
    }
}

/// 32-byte symmetric key.
pub type SymmetricKey = [u8; 32];

/// 32-byte X25519 public key.
pub type PublicKey = [u8; 32];
