//! Protocol handler seam between the reactor stack and the gateway.
//!
//! Handlers are carried behind a small capability set rather than a class
//! hierarchy: connect, data, disconnect, send, and a kind tag. A handler
//! reaches sessions through a [`SessionProvider`] looked up by connection
//! id, so it never owns sockets itself.

pub mod http;
pub mod ws;

use crate::session::Session;
use std::sync::Arc;

/// Protocols multiplexed by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolKind {
    Binary,
    Http,
    WebSocket,
}

/// Resolves a connection id to its live session, if any.
pub type SessionProvider = Arc<dyn Fn(u64) -> Option<Arc<Session>> + Send + Sync>;

/// Capability set implemented by each protocol handler.
pub trait ProtocolHandler: Send {
    fn kind(&self) -> ProtocolKind;

    /// A connection of this protocol was established.
    fn handle_connect(&mut self, connection_id: u64);

    /// Raw bytes arrived on the connection.
    fn handle_data(&mut self, connection_id: u64, data: &[u8]);

    /// The connection went away; drop any per-connection state.
    fn handle_disconnect(&mut self, connection_id: u64);

    /// Send protocol-framed data to the connection. Returns false when the
    /// session is gone.
    fn send_data(&mut self, connection_id: u64, data: &[u8]) -> bool;
}

const HTTP_METHODS: [&str; 7] = [
    "GET ", "POST ", "PUT ", "DELETE ", "HEAD ", "OPTIONS ", "PATCH ",
];

fn contains_ignore_ascii_case(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() || haystack.len() < needle.len() {
        return needle.is_empty();
    }
    haystack
        .windows(needle.len())
        .any(|window| window.eq_ignore_ascii_case(needle))
}

/// Classify the first bytes of a connection multiplexed on one port.
///
/// A leading HTTP method token marks the connection as HTTP; if the same
/// prefix already announces a `websocket` upgrade, the connection is
/// classified for the WebSocket handler so the handshake lands there.
/// Everything else is treated as length-prefixed binary.
pub fn detect_protocol(data: &[u8]) -> ProtocolKind {
    let is_http = HTTP_METHODS
        .iter()
        .any(|method| data.starts_with(method.as_bytes()));
    if !is_http {
        return ProtocolKind::Binary;
    }
    if contains_ignore_ascii_case(data, b"upgrade: websocket") {
        ProtocolKind::WebSocket
    } else {
        ProtocolKind::Http
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_tokens_classify_as_http() {
        for request in [
            &b"GET /health HTTP/1.1\r\n\r\n"[..],
            b"POST /data HTTP/1.1\r\n\r\n",
            b"DELETE /x HTTP/1.1\r\n\r\n",
        ] {
            assert_eq!(detect_protocol(request), ProtocolKind::Http);
        }
    }

    #[test]
    fn upgrade_requests_classify_as_websocket() {
        let request = b"GET /ws HTTP/1.1\r\nHost: x\r\nUpgrade: WebSocket\r\n\r\n";
        assert_eq!(detect_protocol(request), ProtocolKind::WebSocket);
    }

    #[test]
    fn everything_else_classifies_as_binary() {
        assert_eq!(detect_protocol(&[0, 0, 0, 9, b'A']), ProtocolKind::Binary);
        assert_eq!(detect_protocol(b"GETX"), ProtocolKind::Binary);
        assert_eq!(detect_protocol(b""), ProtocolKind::Binary);
    }
}
