/// HTTP helpers (root archive download, user key lookup).
pub mod http;

/// WebSocket connect with subprotocol credentials.
pub mod websocket;
