use std::sync::{Arc, Mutex, MutexGuard};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use reqwest::Url;
use serde::Deserialize;

use super::cache::CoalescingCache;
use super::channel::{Message, SecureChannel};
use super::message::{parse_frame, Challenge, ATTESTATION_DOC};
use super::{join_url, ClientConfig, EndpointProvider};
use crate::attestation::nitro::{parse_attestation_document, NitroVerifier};
use crate::attestation::types::{UserData, VerifiedAttestation};
use crate::attestation::{AttestationVerifier, VerificationContext};
use crate::crypto::envelope::{self, DataKey};
use crate::crypto::hpke;
use crate::error::{ArgumentError, AttestError, Error, ProtocolError, SessionError, TransportError};
use crate::transport::http;
use crate::transport::websocket::Credential;

/// Caller data normalized to bytes before encryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload(Bytes);

impl Payload {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Self(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Self(Bytes::from(s))
    }
}

impl From<&String> for Payload {
    fn from(s: &String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<&[u8]> for Payload {
    fn from(b: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(b))
    }
}

impl<const N: usize> From<&[u8; N]> for Payload {
    fn from(b: &[u8; N]) -> Self {
        Self(Bytes::copy_from_slice(b))
    }
}

impl From<Vec<u8>> for Payload {
    fn from(b: Vec<u8>) -> Self {
        Self(Bytes::from(b))
    }
}

impl From<Bytes> for Payload {
    fn from(b: Bytes) -> Self {
        Self(b)
    }
}

macro_rules! payload_from_integer {
    ($($t:ty),*) => {
        $(impl From<$t> for Payload {
            fn from(n: $t) -> Self {
                Self::from(n.to_string())
            }
        })*
    };
}

payload_from_integer!(i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize);

/// Key source for [`EnclaveClient::encrypt`]. With nothing set, the
/// client's own key is used.
#[derive(Debug, Clone, Default)]
pub struct EncryptOptions {
    /// RSA public key PEM to encrypt to.
    pub key: Option<String>,
    /// Encrypt to another user's published key.
    pub username: Option<String>,
    /// Precomputed data key; skips RSA resolution entirely.
    pub data_key: Option<DataKey>,
}

impl EncryptOptions {
    pub fn with_key(mut self, pem: impl Into<String>) -> Self {
        self.key = Some(pem.into());
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_data_key(mut self, data_key: DataKey) -> Self {
        self.data_key = Some(data_key);
        self
    }

    fn validate(&self) -> Result<(), ArgumentError> {
        if self.key.is_some() && self.data_key.is_some() {
            return Err(ArgumentError::ConflictingOptions("key and data_key"));
        }
        if self.key.is_some() && self.username.is_some() {
            return Err(ArgumentError::ConflictingOptions("key and username"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum KeyIdentity {
    Own,
    User(String),
}

#[derive(Debug, Deserialize)]
struct UserKeyResponse {
    #[serde(default)]
    attestation_document: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Default)]
struct Session {
    channel: Option<Arc<SecureChannel>>,
    public_key: Option<Vec<u8>>,
    nonce: Option<String>,
    connecting: bool,
    /// Channel of the connect attempt still in its handshake.
    pending: Option<Arc<SecureChannel>>,
    /// Bumped by every connect attempt and every disconnect. An attempt only
    /// installs its session if the generation is unchanged.
    generation: u64,
}

fn lock_session(session: &Mutex<Session>) -> MutexGuard<'_, Session> {
    session.lock().unwrap_or_else(|p| p.into_inner())
}

/// Clears the `connecting` flag when a connect attempt ends, including when
/// its future is dropped.
struct ConnectAttempt<'a> {
    session: &'a Mutex<Session>,
    generation: u64,
}

impl Drop for ConnectAttempt<'_> {
    fn drop(&mut self) {
        let mut session = lock_session(self.session);
        if session.generation == self.generation {
            session.connecting = false;
            session.pending = None;
        }
    }
}

/// Client for attested, end-to-end encrypted enclave sessions.
pub struct EnclaveClient<P: EndpointProvider = ClientConfig> {
    provider: P,
    verifier: Arc<dyn AttestationVerifier>,
    session: Mutex<Session>,
    rsa_keys: CoalescingCache<KeyIdentity, String>,
    data_keys: CoalescingCache<String, DataKey>,
}

impl EnclaveClient<ClientConfig> {
    /// Build a client that verifies with [`NitroVerifier`] against the
    /// configured root of trust.
    pub fn new(config: ClientConfig) -> Self {
        let verifier = NitroVerifier::with_measurements(
            config.root_of_trust.clone(),
            config.expected_measurements.clone().unwrap_or_default(),
        );
        Self::with_verifier(config, Arc::new(verifier))
    }
}

impl<P: EndpointProvider> EnclaveClient<P> {
    pub fn with_verifier(provider: P, verifier: Arc<dyn AttestationVerifier>) -> Self {
        Self {
            provider,
            verifier,
            session: Mutex::new(Session::default()),
            rsa_keys: CoalescingCache::new(),
            data_keys: CoalescingCache::new(),
        }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Whether a verified session is open.
    pub fn is_connected(&self) -> bool {
        self.lock().channel.is_some()
    }

    /// The verified enclave public key of the current session.
    pub fn public_key(&self) -> Option<Vec<u8>> {
        self.lock().public_key.clone()
    }

    /// Base64 nonce sent in the current session's challenge.
    pub fn session_nonce(&self) -> Option<String> {
        self.lock().nonce.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Session> {
        lock_session(&self.session)
    }

    fn credential(&self) -> Result<Credential, ArgumentError> {
        Credential::resolve(self.provider.function_token(), self.provider.auth_token())
            .ok_or(ArgumentError::MissingCredential)
    }

    /// Open an attested session to function `id`.
    pub async fn connect(&self, id: &str) -> Result<(), Error> {
        if id.is_empty() {
            return Err(ArgumentError::MissingFunctionId.into());
        }
        let (credential, attempt) = {
            let mut session = self.lock();
            if session.channel.is_some() || session.connecting {
                return Err(SessionError::AlreadyConnected.into());
            }
            let credential = self.credential()?;
            session.connecting = true;
            session.generation += 1;
            let attempt = ConnectAttempt {
                session: &self.session,
                generation: session.generation,
            };
            (credential, attempt)
        };

        self.establish(id, &credential, attempt.generation).await
    }

    async fn establish(&self, id: &str, credential: &Credential, generation: u64) -> Result<(), Error> {
        let url = join_url(self.provider.enclave_url(), &format!("/v1/run/{id}"));
        let channel = Arc::new(SecureChannel::connect(&url, credential).await?);
        let function_id = id.to_string();
        channel.on_disconnect(move || tracing::debug!(%function_id, "session channel closed"));

        if !self.track_pending(&channel, generation) {
            channel.close().await;
            return Err(TransportError::Closed.into());
        }

        let attested = async {
            let (verified, challenge) = self.attest(&channel).await?;
            self.check_function_checksum(&verified.user_data()?)?;
            let public_key = verified.public_key()?.to_vec();
            Ok::<_, Error>((verified, challenge, public_key))
        }
        .await;

        match attested {
            Ok((verified, challenge, public_key)) => {
                // A disconnect during the handshake wins over its result.
                let installed = {
                    let mut session = self.lock();
                    let current = session.generation == generation;
                    if current {
                        session.pending = None;
                        session.channel = Some(Arc::clone(&channel));
                        session.public_key = Some(public_key);
                        session.nonce = Some(challenge.nonce);
                    }
                    current
                };
                if !installed {
                    channel.close().await;
                    return Err(TransportError::Closed.into());
                }
                tracing::info!(
                    function_id = %id,
                    module_id = %verified.document.module_id,
                    "connected to attested enclave"
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!(function_id = %id, error = %e, "enclave attestation failed");
                channel.close().await;
                let mut session = self.lock();
                if session.generation == generation {
                    session.pending = None;
                }
                Err(e)
            }
        }
    }

    /// Record `channel` as the in-flight attempt. `false` if a disconnect
    /// already superseded `generation`.
    fn track_pending(&self, channel: &Arc<SecureChannel>, generation: u64) -> bool {
        let mut session = self.lock();
        if session.generation != generation {
            return false;
        }
        session.pending = Some(Arc::clone(channel));
        true
    }

    /// Nonce challenge: send a nonce, then parse and verify the returned document.
    async fn attest(&self, channel: &SecureChannel) -> Result<(VerifiedAttestation, Challenge), Error> {
        let challenge = Challenge::generate();
        let reply = channel.request(challenge.to_message()?).await?;
        let envelope = parse_frame(&reply)?;
        let document = envelope.expect(ATTESTATION_DOC)?;

        let parsed = parse_attestation_document(document)?;
        let expected_nonce = self.provider.require_nonce_echo().then(|| challenge.echoed());
        let verified = self
            .verifier
            .verify(
                &parsed,
                VerificationContext {
                    check_time: self.provider.check_time(),
                    expected_nonce,
                },
            )
            .await?;
        Ok((verified, challenge))
    }

    fn check_function_checksum(&self, user_data: &UserData) -> Result<(), Error> {
        let Some(want) = self.provider.function_checksum().filter(|c| !c.is_empty()) else {
            return Ok(());
        };
        let got = user_data.func_checksum_hex()?;
        if got != want {
            return Err(AttestError::ChecksumMismatch {
                got,
                want: want.to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Seal `data` to the session key, exchange it, and return the result as text.
    pub async fn invoke(&self, data: impl Into<Payload>) -> Result<String, Error> {
        let bytes = self.invoke_bytes(data).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// As [`invoke`](Self::invoke), returning the raw result bytes.
    pub async fn invoke_bytes(&self, data: impl Into<Payload>) -> Result<Vec<u8>, Error> {
        let (channel, public_key) = {
            let session = self.lock();
            let channel = session.channel.clone().ok_or(SessionError::NotConnected)?;
            let public_key = session
                .public_key
                .clone()
                .ok_or(SessionError::MissingPublicKey)?;
            (channel, public_key)
        };

        let payload = data.into();
        let result = async {
            let frame = hpke::seal(&public_key, payload.as_bytes())?.to_frame();
            tracing::debug!(len = frame.len(), "sending sealed payload");
            let reply = channel.request(Message::Binary(Bytes::from(frame))).await?;
            let envelope = parse_frame(&reply)?;
            envelope.function_result()
        }
        .await;

        match result {
            Err(e) if e.is_terminal() => {
                tracing::warn!(error = %e, "invoke failed; disconnecting");
                self.disconnect().await;
                Err(e)
            }
            other => other,
        }
    }

    /// Connect, invoke once, and always disconnect.
    pub async fn run(&self, id: &str, data: impl Into<Payload>) -> Result<String, Error> {
        self.connect(id).await?;
        let result = self.invoke(data).await;
        self.disconnect().await;
        result
    }

    /// Close the session channel and clear session state. Safe to call
    /// anytime; an in-flight `connect` is aborted and fails.
    pub async fn disconnect(&self) {
        let (channel, pending) = {
            let mut session = self.lock();
            session.generation += 1;
            session.connecting = false;
            session.public_key = None;
            session.nonce = None;
            (session.channel.take(), session.pending.take())
        };
        if let Some(pending) = pending {
            pending.close().await;
            tracing::debug!("aborted in-flight connect");
        }
        if let Some(channel) = channel {
            channel.close().await;
            tracing::info!("disconnected from enclave");
        }
    }

    /// RSA public key PEM for encryption: the caller's own, or `username`'s.
    pub async fn key(&self, username: Option<&str>) -> Result<String, Error> {
        match username {
            None => {
                // Fail before any I/O.
                let credential = self.credential()?;
                self.rsa_keys
                    .get_or_try_init(&KeyIdentity::Own, || self.fetch_own_key(credential))
                    .await
            }
            Some(user) => {
                let identity = KeyIdentity::User(user.to_string());
                self.rsa_keys
                    .get_or_try_init(&identity, || self.fetch_user_key(user))
                    .await
            }
        }
    }

    async fn fetch_own_key(&self, credential: Credential) -> Result<String, Error> {
        let url = join_url(self.provider.enclave_url(), "/v1/key");
        let channel = SecureChannel::connect(&url, &credential).await?;
        let result = async {
            let (verified, _) = self.attest(&channel).await?;
            key_pem_from_user_data(&verified.user_data()?)
        }
        .await;
        channel.close().await;

        if let Err(e) = &result {
            tracing::warn!(error = %e, "key attestation failed");
        } else {
            tracing::info!("fetched attested encryption key");
        }
        result
    }

    async fn fetch_user_key(&self, username: &str) -> Result<String, Error> {
        let url = user_key_url(self.provider.api_url(), username)?;
        let response: UserKeyResponse =
            http::get_json(url.as_str(), self.provider.auth_token()).await?;

        let document = match response.attestation_document {
            Some(doc) => doc,
            None => {
                let reason = response.error.or(response.message).unwrap_or_else(|| {
                    format!("no attestation document published for user {username}")
                });
                return Err(Error::Server(reason));
            }
        };

        let parsed = parse_attestation_document(document.as_str())?;
        let verified = self
            .verifier
            .verify(
                &parsed,
                VerificationContext {
                    check_time: self.provider.check_time(),
                    expected_nonce: None,
                },
            )
            .await?;
        let pem = key_pem_from_user_data(&verified.user_data()?)?;
        tracing::info!(%username, "fetched attested user key");
        Ok(pem)
    }

    /// Encrypt `input` into a `cape:` envelope.
    pub async fn encrypt(
        &self,
        input: impl Into<Payload>,
        options: EncryptOptions,
    ) -> Result<String, Error> {
        options.validate()?;
        let payload = input.into();

        let data_key = match options.data_key {
            Some(data_key) => data_key,
            None => {
                let pem = match (options.key, options.username) {
                    (Some(pem), _) => pem,
                    (None, Some(user)) => self.key(Some(&user)).await?,
                    (None, None) => self.key(None).await?,
                };
                self.data_key(&pem).await?
            }
        };

        Ok(envelope::encrypt_envelope(&data_key, payload.as_bytes())?)
    }

    /// The cached data key for an RSA public key PEM, created on first use.
    pub async fn data_key(&self, pem: &str) -> Result<DataKey, Error> {
        self.data_keys
            .get_or_try_init(&pem.to_string(), || async {
                tracing::debug!("creating data key");
                DataKey::generate(pem)
            })
            .await
    }
}

fn key_pem_from_user_data(user_data: &UserData) -> Result<String, Error> {
    let encoded = user_data
        .key
        .as_deref()
        .ok_or_else(|| ProtocolError::InvalidUserData("missing key".into()))?;
    let der = STANDARD
        .decode(encoded)
        .map_err(|e| ProtocolError::InvalidUserData(format!("key is not base64: {e}")))?;
    Ok(envelope::spki_der_to_pem(&der)?)
}

fn user_key_url(api_url: &str, username: &str) -> Result<Url, ArgumentError> {
    let mut url = Url::parse(api_url)
        .map_err(|e| ArgumentError::InvalidConfig(format!("api_url is not a URL: {e}")))?;
    url.path_segments_mut()
        .map_err(|_| ArgumentError::InvalidConfig("api_url cannot be a base".into()))?
        .pop_if_empty()
        .extend(["v1", "user", username, "key"]);
    Ok(url)
}
