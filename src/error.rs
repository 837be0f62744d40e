/// Errors from caller-supplied arguments. Raised before any network I/O.
#[derive(Debug, thiserror::Error)]
pub enum ArgumentError {
    #[error("unable to connect to the server, missing function id")]
    MissingFunctionId,

    #[error("missing auth token: configure a function token or an auth token")]
    MissingCredential,

    #[error("conflicting encrypt options: {0}")]
    ConflictingOptions(&'static str),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Errors from the session lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("already connected to the server; call disconnect() first")]
    AlreadyConnected,

    #[error("not connected to the server; call connect() first")]
    NotConnected,

    #[error("missing public key; call connect() first")]
    MissingPublicKey,
}

/// Errors from decoding an attestation document.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("attestation document is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("invalid attestation document envelope: {0}")]
    Envelope(String),

    #[error("invalid attestation document payload: {0}")]
    Payload(String),

    #[error("attestation document missing required field: {0}")]
    MissingField(String),

    #[error("attestation document field '{field}' is invalid: {reason}")]
    InvalidField { field: String, reason: String },
}

/// Errors from the text/binary message protocol spoken over the channel.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("expected attestation document but received {0}")]
    UnexpectedMessageType(String),

    #[error("invalid message received from the server")]
    InvalidMessage,

    #[error("malformed message envelope: {0}")]
    MalformedEnvelope(String),

    #[error("invalid attestation user data: {0}")]
    InvalidUserData(String),
}

/// Trust failures. Any of these means the enclave must not be used.
#[derive(Debug, thiserror::Error)]
pub enum AttestError {
    #[error("attestation signature verification failed: {0}")]
    Signature(String),

    #[error("error validating certificate chain {code} {message}")]
    ChainValidation { code: i32, message: String },

    #[error("error validating function checksum, got {got}, wanted: {want}")]
    ChecksumMismatch { got: String, want: String },

    #[error("PCR{index} mismatch: expected {expected}, got {actual}")]
    MeasurementMismatch {
        index: usize,
        expected: String,
        actual: String,
    },

    #[error("attestation nonce does not match the challenge")]
    NonceMismatch,

    #[error("unsupported digest: expected SHA384, got {0}")]
    UnsupportedDigest(String),

    #[error("root certificate unavailable: {0}")]
    RootCertificate(String),

    #[error("attestation missing required field: {0}")]
    MissingField(String),
}

/// Errors from cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid public key length: expected {expected}, got {actual}")]
    InvalidPublicKey { expected: usize, actual: usize },

    #[error("non-contributory key exchange: peer sent small-subgroup or identity point")]
    NonContributoryKey,

    #[error("HKDF expand failed: invalid length")]
    HkdfExpandFailed,

    #[error("AEAD encryption failed")]
    SealFailed,

    #[error("AEAD decryption failed: ciphertext is invalid or tampered")]
    OpenFailed,

    #[error("RSA operation failed: {0}")]
    Rsa(String),

    #[error("invalid encrypted envelope: {0}")]
    InvalidEnvelope(String),
}

/// Errors from the socket and HTTP substrate.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("websocket connection not open")]
    NotOpen,

    #[error("websocket connection closed")]
    Closed,

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("http error: {0}")]
    Http(String),
}

/// Top-level error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Argument(#[from] ArgumentError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Attestation(#[from] AttestError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Error reported by the remote party, passed through verbatim.
    #[error("{0}")]
    Server(String),
}

impl Error {
    /// Whether this error must tear down the session before it propagates.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Error::Argument(_) | Error::Session(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
