//! Local mock enclave speaking the nonce/attestation/invoke protocol over
//! tokio-tungstenite, plus a one-shot HTTP responder for the user key API.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use enclave_client::attestation::nitro::test_support::TestEnclave;
use enclave_client::attestation::root::RootOfTrust;
use enclave_client::crypto::hpke::{self, KeyPair};
use enclave_client::ClientConfig;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing_subscriber::EnvFilter;

/// How the mock answers the nonce challenge.
#[derive(Debug, Clone)]
pub enum AttestReply {
    Document,
    WrongNonce,
    Error(String),
    WrongType,
}

/// How the mock answers a sealed invoke frame.
#[derive(Debug, Clone)]
pub enum InvokeReply {
    /// `pong-N`, where N counts every message received on the connection.
    Pong,
    /// Echo the decrypted payload back.
    Echo,
    /// A binary frame instead of a JSON envelope.
    Binary,
    Error(String),
    /// Close the socket without answering.
    Hangup,
}

#[derive(Debug, Clone, Default)]
pub struct Handshake {
    pub path: String,
    pub protocol: String,
}

pub struct MockEnclave {
    pub url: String,
    pub enclave: Arc<TestEnclave>,
    pub handshakes: Arc<Mutex<Vec<Handshake>>>,
}

pub struct MockOptions {
    pub user_data: Vec<u8>,
    pub attest: AttestReply,
    pub invoke: InvokeReply,
    /// Pause before answering the nonce challenge.
    pub attest_delay: Duration,
    /// Pause before answering each invoke.
    pub invoke_delay: Duration,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            user_data: b"{}".to_vec(),
            attest: AttestReply::Document,
            invoke: InvokeReply::Pong,
            attest_delay: Duration::ZERO,
            invoke_delay: Duration::ZERO,
        }
    }
}

/// Route crate logs to the test harness; filter with `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

impl MockEnclave {
    pub async fn spawn(options: MockOptions) -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let enclave = Arc::new(TestEnclave::new());
        let handshakes = Arc::new(Mutex::new(Vec::new()));
        let options = Arc::new(options);

        tokio::spawn({
            let enclave = Arc::clone(&enclave);
            let handshakes = Arc::clone(&handshakes);
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    tokio::spawn(serve(
                        stream,
                        Arc::clone(&enclave),
                        Arc::clone(&handshakes),
                        Arc::clone(&options),
                    ));
                }
            }
        });

        Self {
            url,
            enclave,
            handshakes,
        }
    }

    pub fn root(&self) -> RootOfTrust {
        RootOfTrust::from_pem(&self.enclave.root_pem()).unwrap()
    }

    /// Config pointed at this mock, trusting its CA, with a function token.
    pub fn config(&self) -> ClientConfig {
        ClientConfig::builder()
            .enclave_url(&self.url)
            .function_token("fn-token")
            .root_of_trust(self.root())
            .build()
            .unwrap()
    }

    pub fn handshakes(&self) -> Vec<Handshake> {
        self.handshakes.lock().unwrap().clone()
    }
}

fn envelope(kind: &str, body: &[u8]) -> Message {
    Message::Text(
        serde_json::json!({ "message": { "type": kind, "message": STANDARD.encode(body) } })
            .to_string(),
    )
}

fn error_frame(error: &str) -> Message {
    Message::Text(serde_json::json!({ "message": null, "error": error }).to_string())
}

async fn serve(
    stream: TcpStream,
    enclave: Arc<TestEnclave>,
    handshakes: Arc<Mutex<Vec<Handshake>>>,
    options: Arc<MockOptions>,
) {
    let callback = |req: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        let protocol = req
            .headers()
            .get("Sec-WebSocket-Protocol")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if let Some(scheme) = protocol.split(',').next().filter(|s| !s.is_empty()) {
            response
                .headers_mut()
                .insert("Sec-WebSocket-Protocol", scheme.trim().parse().unwrap());
        }
        handshakes.lock().unwrap().push(Handshake {
            path: req.uri().path().to_string(),
            protocol,
        });
        Ok(response)
    };
    let Ok(mut ws) = accept_hdr_async(stream, callback).await else {
        return;
    };

    let keys = KeyPair::generate();
    let mut received = 0usize;

    while let Some(Ok(msg)) = ws.next().await {
        received += 1;
        let reply = match msg {
            Message::Text(text) => {
                let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                let nonce = value["message"]["nonce"].as_str().unwrap().to_string();
                tokio::time::sleep(options.attest_delay).await;
                match &options.attest {
                    AttestReply::Document => {
                        let doc = enclave.attest(
                            Some(keys.public.as_bytes()),
                            Some(options.user_data.as_slice()),
                            Some(nonce.as_bytes()),
                        );
                        envelope("attestation_doc", &doc)
                    }
                    AttestReply::WrongNonce => {
                        let doc = enclave.attest(
                            Some(keys.public.as_bytes()),
                            Some(options.user_data.as_slice()),
                            Some(&b"not-the-challenge"[..]),
                        );
                        envelope("attestation_doc", &doc)
                    }
                    AttestReply::Error(e) => error_frame(e),
                    AttestReply::WrongType => envelope("function_result", b"surprise"),
                }
            }
            Message::Binary(frame) => {
                let plaintext = hpke::open_frame(&keys.secret, &frame).unwrap();
                tokio::time::sleep(options.invoke_delay).await;
                match &options.invoke {
                    InvokeReply::Pong => {
                        envelope("function_result", format!("pong-{received}").as_bytes())
                    }
                    InvokeReply::Echo => envelope("function_result", &plaintext),
                    InvokeReply::Binary => Message::Binary(b"raw".to_vec()),
                    InvokeReply::Error(e) => error_frame(e),
                    InvokeReply::Hangup => {
                        let _ = ws.close(None).await;
                        break;
                    }
                }
            }
            Message::Close(_) => break,
            _ => continue,
        };
        if ws.send(reply).await.is_err() {
            break;
        }
    }
}

/// Captured HTTP request head.
#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    pub request_line: String,
    pub authorization: Option<String>,
}

/// Serve `body` as JSON to every request; returns the base URL and captured heads.
pub async fn spawn_http_json(status: u16, body: String) -> (String, Arc<Mutex<Vec<HttpRequest>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let seen = Arc::new(Mutex::new(Vec::new()));

    tokio::spawn({
        let seen = Arc::clone(&seen);
        async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => head.extend_from_slice(&buf[..n]),
                    }
                }
                let head = String::from_utf8_lossy(&head).to_string();
                let mut lines = head.lines();
                let request_line = lines.next().unwrap_or_default().to_string();
                let authorization = lines
                    .find(|l| l.to_ascii_lowercase().starts_with("authorization:"))
                    .map(|l| l["authorization:".len()..].trim().to_string());
                seen.lock().unwrap().push(HttpRequest {
                    request_line,
                    authorization,
                });

                let response = format!(
                    "HTTP/1.1 {status} OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        }
    });

    (base, seen)
}
