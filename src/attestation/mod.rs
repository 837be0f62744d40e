pub mod nitro;
pub mod root;
pub mod types;

use std::time::SystemTime;

use async_trait::async_trait;

use crate::error::Error;
use nitro::ParsedAttestation;
use types::VerifiedAttestation;

/// Per-call verification inputs.
#[derive(Debug, Clone, Copy, Default)]
pub struct VerificationContext<'a> {
    /// Instant at which certificate validity is evaluated. `None` means now.
    pub check_time: Option<SystemTime>,
    /// Nonce the document must echo. `None` skips the check.
    pub expected_nonce: Option<&'a [u8]>,
}

/// Verifier that validates attestation documents (runs on the client side).
#[async_trait]
pub trait AttestationVerifier: Send + Sync {
    /// Verify a parsed attestation document and return the verified claims.
    async fn verify(
        &self,
        parsed: &ParsedAttestation,
        ctx: VerificationContext<'_>,
    ) -> Result<VerifiedAttestation, Error>;
}
