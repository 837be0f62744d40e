pub mod cache;
pub mod channel;
pub mod client;
pub mod message;

use std::time::SystemTime;

use reqwest::Url;

use crate::attestation::root::RootOfTrust;
use crate::attestation::types::ExpectedMeasurements;
use crate::error::{ArgumentError, Error};

/// Default enclave WebSocket endpoint.
pub const DEFAULT_ENCLAVE_URL: &str = "wss://enclave.capeprivacy.com";

/// Default HTTP API endpoint.
pub const DEFAULT_API_URL: &str = "https://app.capeprivacy.com";

/// Endpoints and credentials the session protocol needs.
pub trait EndpointProvider: Send + Sync {
    /// Base WebSocket URL of the enclave service.
    fn enclave_url(&self) -> &str;

    /// Base HTTP URL of the API service.
    fn api_url(&self) -> &str;

    /// User auth token (`cape.runtime` scheme, bearer for HTTP).
    fn auth_token(&self) -> Option<&str>;

    /// Function-scoped token (`cape.function` scheme).
    fn function_token(&self) -> Option<&str>;

    /// Expected lowercase hex function checksum.
    fn function_checksum(&self) -> Option<&str>;

    /// Instant for certificate validity checks. `None` means now.
    fn check_time(&self) -> Option<SystemTime> {
        None
    }

    /// Whether the attestation must echo the challenge nonce.
    fn require_nonce_echo(&self) -> bool {
        false
    }
}

/// Configuration for an [`EnclaveClient`](client::EnclaveClient).
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Enclave WebSocket base URL (default: `wss://enclave.capeprivacy.com`).
    pub enclave_url: String,

    /// API base URL (default: `https://app.capeprivacy.com`).
    pub api_url: String,

    pub auth_token: Option<String>,
    pub function_token: Option<String>,

    /// Expected function checksum, lowercase hex.
    pub function_checksum: Option<String>,

    /// Verification time override for certificate validity.
    pub check_time: Option<SystemTime>,

    /// Root certificate source (default: fetched from AWS).
    pub root_of_trust: RootOfTrust,

    /// Optional expected measurements to verify against the enclave's attestation.
    pub expected_measurements: Option<ExpectedMeasurements>,

    /// Require the attestation nonce to equal the challenge (default: false).
    pub require_nonce_echo: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            enclave_url: DEFAULT_ENCLAVE_URL.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            auth_token: None,
            function_token: None,
            function_checksum: None,
            check_time: None,
            root_of_trust: RootOfTrust::default(),
            expected_measurements: None,
            require_nonce_echo: false,
        }
    }
}

impl ClientConfig {
    /// Create a builder for constructing a `ClientConfig`.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }
}

impl EndpointProvider for ClientConfig {
    fn enclave_url(&self) -> &str {
        &self.enclave_url
    }

    fn api_url(&self) -> &str {
        &self.api_url
    }

    fn auth_token(&self) -> Option<&str> {
        self.auth_token.as_deref()
    }

    fn function_token(&self) -> Option<&str> {
        self.function_token.as_deref()
    }

    fn function_checksum(&self) -> Option<&str> {
        self.function_checksum.as_deref()
    }

    fn check_time(&self) -> Option<SystemTime> {
        self.check_time
    }

    fn require_nonce_echo(&self) -> bool {
        self.require_nonce_echo
    }
}

/// Builder for [`ClientConfig`].
#[derive(Debug, Clone, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn enclave_url(mut self, url: impl Into<String>) -> Self {
        self.config.enclave_url = url.into();
        self
    }

    pub fn api_url(mut self, url: impl Into<String>) -> Self {
        self.config.api_url = url.into();
        self
    }

    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.config.auth_token = Some(token.into());
        self
    }

    pub fn function_token(mut self, token: impl Into<String>) -> Self {
        self.config.function_token = Some(token.into());
        self
    }

    pub fn function_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.config.function_checksum = Some(checksum.into());
        self
    }

    pub fn check_time(mut self, at: SystemTime) -> Self {
        self.config.check_time = Some(at);
        self
    }

    pub fn root_of_trust(mut self, root: RootOfTrust) -> Self {
        self.config.root_of_trust = root;
        self
    }

    pub fn expected_measurements(mut self, measurements: ExpectedMeasurements) -> Self {
        self.config.expected_measurements = Some(measurements);
        self
    }

    pub fn require_nonce_echo(mut self, required: bool) -> Self {
        self.config.require_nonce_echo = required;
        self
    }

    /// Build the `ClientConfig`, validating that both endpoints are usable URLs.
    pub fn build(self) -> Result<ClientConfig, Error> {
        validate_url("enclave_url", &self.config.enclave_url, &["ws", "wss"])?;
        validate_url("api_url", &self.config.api_url, &["http", "https"])?;
        Ok(self.config)
    }
}

fn validate_url(field: &str, value: &str, schemes: &[&str]) -> Result<(), ArgumentError> {
    if value.is_empty() {
        return Err(ArgumentError::InvalidConfig(format!("{field} must not be empty")));
    }
    let url = Url::parse(value)
        .map_err(|e| ArgumentError::InvalidConfig(format!("{field} is not a URL: {e}")))?;
    if !schemes.contains(&url.scheme()) {
        return Err(ArgumentError::InvalidConfig(format!(
            "{field} scheme must be one of {schemes:?}, got {}",
            url.scheme()
        )));
    }
    Ok(())
}

/// Join a base URL and an absolute path without doubling slashes.
pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}
