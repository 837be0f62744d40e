use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};

use crate::error::TransportError;
use crate::transport::websocket::{self, Credential};

/// A message received from or sent to the enclave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// UTF-8 text frame (JSON envelopes).
    Text(String),
    /// Binary frame (sealed payloads).
    Binary(Bytes),
}

impl From<Message> for WsMessage {
    fn from(msg: Message) -> Self {
        match msg {
            Message::Text(text) => WsMessage::Text(text),
            Message::Binary(data) => WsMessage::Binary(data.to_vec()),
        }
    }
}

/// Lifecycle of a [`SecureChannel`]. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    Closed,
}

type Reply = Result<Message, TransportError>;
type BoxSink = Pin<Box<dyn Sink<WsMessage, Error = WsError> + Send>>;
type Observer = Box<dyn FnOnce() + Send>;

struct Mailbox {
    state: ChannelState,
    /// Messages that arrived while nobody was waiting.
    queued: VecDeque<Message>,
    /// Receivers parked in arrival order.
    waiters: VecDeque<oneshot::Sender<Reply>>,
    on_disconnect: Option<Observer>,
}

struct Shared {
    mailbox: Mutex<Mailbox>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Mailbox> {
        // A poisoned mailbox still holds consistent queues.
        self.mailbox.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Hand `msg` to the oldest waiter, or queue it if nobody is waiting.
    ///
    /// Replies pair with waiters by position. A waiter whose receiver was
    /// dropped still owns its slot, so its message is discarded rather than
    /// handed to the next caller.
    fn deliver(&self, msg: Message) {
        let mut mailbox = self.lock();
        match mailbox.waiters.pop_front() {
            Some(waiter) => {
                if waiter.send(Ok(msg)).is_err() {
                    tracing::debug!("discarding reply for cancelled receiver");
                }
            }
            None => mailbox.queued.push_back(msg),
        }
    }

    /// Move to `Closed`, reject parked receivers and fire the observer.
    /// Returns `false` if the channel was already closed.
    fn teardown(&self, reason: impl Fn() -> TransportError) -> bool {
        let (waiters, observer) = {
            let mut mailbox = self.lock();
            if mailbox.state == ChannelState::Closed {
                return false;
            }
            mailbox.state = ChannelState::Closed;
            (
                std::mem::take(&mut mailbox.waiters),
                mailbox.on_disconnect.take(),
            )
        };
        for waiter in waiters {
            let _ = waiter.send(Err(reason()));
        }
        if let Some(observer) = observer {
            observer();
        }
        true
    }
}

/// Duplex message channel over a WebSocket with an async, order-preserving
/// receive mailbox.
///
/// A single reader task dispatches inbound frames: each goes to the oldest
/// parked receiver, or is queued if nobody is waiting.
pub struct SecureChannel {
    shared: Arc<Shared>,
    sink: tokio::sync::Mutex<BoxSink>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mailbox = self.shared.lock();
        f.debug_struct("SecureChannel")
            .field("state", &mailbox.state)
            .field("queued", &mailbox.queued.len())
            .field("waiters", &mailbox.waiters.len())
            .finish()
    }
}

impl SecureChannel {
    /// Connect to `url`, resolving once the WebSocket handshake completes.
    pub async fn connect(url: &str, credential: &Credential) -> Result<Self, TransportError> {
        let stream = websocket::connect(url, credential).await?;
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already-open WebSocket stream.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<WsMessage, WsError>> + Sink<WsMessage, Error = WsError> + Send + 'static,
    {
        let (sink, source) = stream.split();
        let shared = Arc::new(Shared {
            mailbox: Mutex::new(Mailbox {
                state: ChannelState::Open,
                queued: VecDeque::new(),
                waiters: VecDeque::new(),
                on_disconnect: None,
            }),
        });

        let reader = tokio::spawn(read_loop(source, Arc::clone(&shared)));

        Self {
            shared,
            sink: tokio::sync::Mutex::new(Box::pin(sink)),
            reader: Mutex::new(Some(reader)),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        self.shared.lock().state
    }

    /// Number of received messages nobody has consumed yet.
    pub fn messages_available(&self) -> usize {
        self.shared.lock().queued.len()
    }

    /// Register a callback fired once when the channel closes for any reason.
    pub fn on_disconnect(&self, observer: impl FnOnce() + Send + 'static) {
        self.shared.lock().on_disconnect = Some(Box::new(observer));
    }

    /// Send a message. Only permitted while `Open`.
    pub async fn send(&self, msg: Message) -> Result<(), TransportError> {
        let mut sink = self.sink.lock().await;
        self.send_locked(&mut sink, msg).await
    }

    /// Send `msg` and wait for the next inbound message.
    ///
    /// The receiver is registered under the same lock as the send, so
    /// concurrent requests are answered in send order.
    pub async fn request(&self, msg: Message) -> Result<Message, TransportError> {
        let pending = {
            let mut sink = self.sink.lock().await;
            self.send_locked(&mut sink, msg).await?;
            self.register()?
        };
        pending.resolve().await
    }

    /// Receive the next message, parking until one arrives.
    pub async fn receive(&self) -> Result<Message, TransportError> {
        self.register()?.resolve().await
    }

    /// Close the channel. Idempotent; teardown runs at most once.
    pub async fn close(&self) {
        if !self.shared.teardown(|| TransportError::Closed) {
            return;
        }
        if let Some(reader) = self.take_reader() {
            reader.abort();
        }
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.close().await {
            tracing::debug!(error = %e, "websocket close handshake failed");
        }
        tracing::debug!("secure channel closed");
    }

    async fn send_locked(&self, sink: &mut BoxSink, msg: Message) -> Result<(), TransportError> {
        if self.state() != ChannelState::Open {
            return Err(TransportError::NotOpen);
        }
        sink.send(msg.into())
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }

    fn register(&self) -> Result<Pending, TransportError> {
        let mut mailbox = self.shared.lock();
        if let Some(msg) = mailbox.queued.pop_front() {
            return Ok(Pending::Ready(msg));
        }
        if mailbox.state != ChannelState::Open {
            return Err(TransportError::NotOpen);
        }
        let (tx, rx) = oneshot::channel();
        mailbox.waiters.push_back(tx);
        Ok(Pending::Parked(rx))
    }

    fn take_reader(&self) -> Option<JoinHandle<()>> {
        self.reader
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
    }
}

impl Drop for SecureChannel {
    fn drop(&mut self) {
        if let Some(reader) = self.take_reader() {
            reader.abort();
        }
        self.shared.teardown(|| TransportError::Closed);
    }
}

enum Pending {
    Ready(Message),
    Parked(oneshot::Receiver<Reply>),
}

impl Pending {
    async fn resolve(self) -> Result<Message, TransportError> {
        match self {
            Pending::Ready(msg) => Ok(msg),
            Pending::Parked(rx) => rx.await.unwrap_or(Err(TransportError::Closed)),
        }
    }
}

async fn read_loop<S>(mut source: S, shared: Arc<Shared>)
where
    S: Stream<Item = Result<WsMessage, WsError>> + Unpin,
{
    loop {
        match source.next().await {
            Some(Ok(WsMessage::Text(text))) => shared.deliver(Message::Text(text)),
            Some(Ok(WsMessage::Binary(data))) => shared.deliver(Message::Binary(Bytes::from(data))),
            Some(Ok(WsMessage::Close(frame))) => {
                tracing::debug!(?frame, "peer closed websocket");
                shared.teardown(|| TransportError::Closed);
                return;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                let reason = e.to_string();
                tracing::warn!(error = %reason, "websocket read failed");
                shared.teardown(|| TransportError::WebSocket(reason.clone()));
                return;
            }
            None => {
                shared.teardown(|| TransportError::Closed);
                return;
            }
        }
    }
}
