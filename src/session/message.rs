//! JSON envelopes exchanged with the enclave over text frames.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use super::channel::Message;
use crate::error::{Error, ProtocolError};

/// Frame type carrying a base64 attestation document.
pub const ATTESTATION_DOC: &str = "attestation_doc";

/// Frame type carrying a base64 function result.
pub const FUNCTION_RESULT: &str = "function_result";

/// Challenge nonce length in bytes, before base64.
pub const NONCE_LEN: usize = 12;

/// `{ "message": { "type", "message" }, "error"? }`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub message: Option<Inner>,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inner {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Serialize)]
struct NonceFrame<'a> {
    message: NonceBody<'a>,
}

#[derive(Serialize)]
struct NonceBody<'a> {
    nonce: &'a str,
}

/// A fresh attestation challenge.
#[derive(Debug, Clone)]
pub struct Challenge {
    /// Base64 nonce as sent on the wire.
    pub nonce: String,
}

impl Challenge {
    pub fn generate() -> Self {
        let mut raw = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut raw);
        Self {
            nonce: STANDARD.encode(raw),
        }
    }

    /// `{"message":{"nonce":…}}`
    pub fn to_message(&self) -> Result<Message, Error> {
        let frame = serde_json::to_string(&NonceFrame {
            message: NonceBody { nonce: &self.nonce },
        })
        .map_err(|e| ProtocolError::MalformedEnvelope(e.to_string()))?;
        Ok(Message::Text(frame))
    }

    /// Bytes an enclave echoes in the attestation `nonce` field.
    pub fn echoed(&self) -> &[u8] {
        self.nonce.as_bytes()
    }
}

/// Decode a received frame. Anything but a JSON text frame is invalid.
pub fn parse_frame(msg: &Message) -> Result<Envelope, ProtocolError> {
    match msg {
        Message::Text(text) => serde_json::from_str(text).map_err(|e| {
            tracing::debug!(error = %e, "unparseable text frame");
            ProtocolError::InvalidMessage
        }),
        Message::Binary(_) => Err(ProtocolError::InvalidMessage),
    }
}

impl Envelope {
    /// Fail with the server's error, verbatim, if one is present.
    pub fn check_error(&self) -> Result<(), Error> {
        use serde_json::Value;
        match &self.error {
            // Empty or false-like values mean no error.
            None | Some(Value::Null) | Some(Value::Bool(false)) => Ok(()),
            Some(Value::String(s)) if s.is_empty() => Ok(()),
            Some(Value::Number(n)) if n.as_f64() == Some(0.0) => Ok(()),
            Some(Value::String(s)) => Err(Error::Server(s.clone())),
            Some(other) => Err(Error::Server(other.to_string())),
        }
    }

    /// Frame type, `undefined` when absent.
    pub fn kind(&self) -> &str {
        self.message
            .as_ref()
            .and_then(|m| m.kind.as_deref())
            .unwrap_or("undefined")
    }

    /// Require `kind`, then return the base64 body.
    pub fn expect(&self, kind: &str) -> Result<&str, Error> {
        self.check_error()?;
        if self.kind() != kind {
            return Err(ProtocolError::UnexpectedMessageType(self.kind().to_string()).into());
        }
        self.message
            .as_ref()
            .and_then(|m| m.message.as_deref())
            .ok_or_else(|| ProtocolError::MalformedEnvelope("missing message body".into()).into())
    }

    /// Decode a `function_result` body. The server's error wins over any body.
    pub fn function_result(&self) -> Result<Vec<u8>, Error> {
        self.check_error()?;
        let body = self
            .message
            .as_ref()
            .and_then(|m| m.message.as_deref())
            .ok_or_else(|| ProtocolError::MalformedEnvelope("missing message body".into()))?;
        STANDARD
            .decode(body)
            .map_err(|e| ProtocolError::MalformedEnvelope(format!("result is not base64: {e}")).into())
    }
}
