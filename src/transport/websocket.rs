use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::TransportError;

/// Client-side WebSocket stream, plain or TLS.
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Subprotocol scheme for function-scoped tokens.
pub const FUNCTION_SCHEME: &str = "cape.function";

/// Subprotocol scheme for user auth tokens.
pub const RUNTIME_SCHEME: &str = "cape.runtime";

/// Credential carried in the `Sec-WebSocket-Protocol` header as
/// `<scheme>, <token>`.
#[derive(Clone)]
pub struct Credential {
    pub scheme: &'static str,
    pub token: String,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("scheme", &self.scheme)
            .field("token", &"<redacted>")
            .finish()
    }
}

impl Credential {
    /// Pick the credential for a session: a non-empty function token wins
    /// over a non-empty auth token.
    pub fn resolve(function_token: Option<&str>, auth_token: Option<&str>) -> Option<Self> {
        let non_empty = |t: Option<&str>| t.filter(|t| !t.is_empty()).map(str::to_owned);
        non_empty(function_token)
            .map(|token| Self {
                scheme: FUNCTION_SCHEME,
                token,
            })
            .or_else(|| {
                non_empty(auth_token).map(|token| Self {
                    scheme: RUNTIME_SCHEME,
                    token,
                })
            })
    }

    fn header_value(&self) -> Result<HeaderValue, TransportError> {
        HeaderValue::from_str(&format!("{}, {}", self.scheme, self.token))
            .map_err(|e| TransportError::ConnectionFailed(format!("invalid credential: {e}")))
    }
}

/// Open a WebSocket to `url`, resolving once the opening handshake completes.
pub async fn connect(url: &str, credential: &Credential) -> Result<WsStream, TransportError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| TransportError::ConnectionFailed(format!("{url}: {e}")))?;
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", credential.header_value()?);

    let (stream, response) = connect_async(request)
        .await
        .map_err(|e| TransportError::ConnectionFailed(format!("{url}: {e}")))?;
    tracing::debug!(%url, status = %response.status(), scheme = credential.scheme, "websocket open");
    Ok(stream)
}
