pub mod attestation;
pub mod crypto;
pub mod error;
pub mod session;
pub mod transport;

// Re-export key types at crate root for convenience.
pub use error::{Error, Result};
pub use session::channel::{ChannelState, Message, SecureChannel};
pub use session::client::{EnclaveClient, EncryptOptions, Payload};
pub use session::{ClientConfig, EndpointProvider};

pub use attestation::nitro::{parse_attestation_document, NitroVerifier, ParsedAttestation};
pub use attestation::root::RootOfTrust;
pub use attestation::{AttestationVerifier, VerificationContext};
pub use crypto::envelope::DataKey;
