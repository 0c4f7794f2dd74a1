// RFC 6455 WebSocket handler: upgrade handshake, frame parse/encode with
// masking, control frames and the close sequence.
//
// The frame subset covers TEXT, BINARY, CLOSE, PING and PONG with 7/16/64-bit
// big-endian payload lengths. Fragmented messages (FIN=0 or a continuation
// opcode) are answered with a protocol-error close; only single-frame
// messages are delivered. Client frames must be masked, server frames are
// sent unmasked.

use crate::protocol::{ProtocolHandler, ProtocolKind, SessionProvider};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::{Buf, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Fixed GUID appended to the client key when computing the accept token.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Close codes used by the gateway (RFC 6455 section 7.4.1).
pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Ceiling on a single frame payload, mirroring the binary framer's limit.
pub const MAX_PAYLOAD_SIZE: u64 = 16 * 1024 * 1024;

/// Supported opcodes. Continuation (0x0) is deliberately absent: it fails
/// the conversion and surfaces as an unsupported-opcode protocol error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum OpCode {
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WsError {
    #[error("reserved bits set in frame header")]
    ReservedBitsSet,

    #[error("unsupported opcode: {0:#x}")]
    UnsupportedOpcode(u8),

    #[error("frame payload of {0} bytes exceeds ceiling")]
    PayloadTooLarge(u64),
}

/// Connection states of the WebSocket state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// A single frame. `payload` always holds the unmasked bytes; masking is
/// applied on the wire during encode and removed during parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsFrame {
    pub opcode: OpCode,
    pub payload: Vec<u8>,
    pub fin: bool,
    pub masked: bool,
    pub mask_key: [u8; 4],
}

impl WsFrame {
    fn unmasked(opcode: OpCode, payload: Vec<u8>) -> Self {
        Self {
            opcode,
            payload,
            fin: true,
            masked: false,
            mask_key: [0; 4],
        }
    }

    pub fn text(payload: impl Into<Vec<u8>>) -> Self {
        Self::unmasked(OpCode::Text, payload.into())
    }

    pub fn binary(payload: impl Into<Vec<u8>>) -> Self {
        Self::unmasked(OpCode::Binary, payload.into())
    }

    pub fn ping(payload: impl Into<Vec<u8>>) -> Self {
        Self::unmasked(OpCode::Ping, payload.into())
    }

    pub fn pong(payload: impl Into<Vec<u8>>) -> Self {
        Self::unmasked(OpCode::Pong, payload.into())
    }

    /// A CLOSE frame carrying a big-endian close code and optional reason.
    pub fn close(code: u16, reason: &[u8]) -> Self {
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&code.to_be_bytes());
        payload.extend_from_slice(reason);
        Self::unmasked(OpCode::Close, payload)
    }

    /// Mask this frame with the given key, as a client would.
    pub fn masked_with(mut self, mask_key: [u8; 4]) -> Self {
        self.masked = true;
        self.mask_key = mask_key;
        self
    }
}

/// Compute the `Sec-WebSocket-Accept` token for a client key.
pub fn accept_token(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Attempt to parse one frame from the front of `data`.
///
/// Returns `Ok(None)` whenever any stage (header, extended length, mask,
/// payload) lacks bytes, leaving the buffer for the next read. An `Err`
/// means the frame is structurally invalid and the connection must fail
/// with a protocol-error close.
pub fn parse_frame(data: &[u8]) -> Result<Option<(WsFrame, usize)>, WsError> {
    if data.len() < 2 {
        return Ok(None);
    }

    let first = data[0];
    let second = data[1];

    if first & 0x70 != 0 {
        return Err(WsError::ReservedBitsSet);
    }
    let fin = first & 0x80 != 0;
    let opcode_raw = first & 0x0F;
    let opcode =
        OpCode::try_from(opcode_raw).map_err(|_| WsError::UnsupportedOpcode(opcode_raw))?;

    let masked = second & 0x80 != 0;
    let mut payload_len = u64::from(second & 0x7F);
    let mut offset = 2usize;

    if payload_len == 126 {
        if data.len() < offset + 2 {
            return Ok(None);
        }
        payload_len = u64::from(u16::from_be_bytes([data[offset], data[offset + 1]]));
        offset += 2;
    } else if payload_len == 127 {
        if data.len() < offset + 8 {
            return Ok(None);
        }
        payload_len = data[offset..offset + 8]
            .iter()
            .fold(0u64, |acc, &byte| (acc << 8) | u64::from(byte));
        offset += 8;
    }

    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(WsError::PayloadTooLarge(payload_len));
    }
    let payload_len = payload_len as usize;

    let mut mask_key = [0u8; 4];
    if masked {
        if data.len() < offset + 4 {
            return Ok(None);
        }
        mask_key.copy_from_slice(&data[offset..offset + 4]);
        offset += 4;
    }

    if data.len() < offset + payload_len {
        return Ok(None);
    }

    let mut payload = data[offset..offset + payload_len].to_vec();
    if masked {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= mask_key[i % 4];
        }
    }

    Ok(Some((
        WsFrame {
            opcode,
            payload,
            fin,
            masked,
            mask_key,
        },
        offset + payload_len,
    )))
}

/// Encode a frame to its wire form. Masked frames have the mask applied to
/// the payload on the way out.
pub fn encode_frame(frame: &WsFrame) -> Vec<u8> {
    let payload_len = frame.payload.len();
    let mut out = Vec::with_capacity(payload_len + 14);

    let mut first = u8::from(frame.opcode);
    if frame.fin {
        first |= 0x80;
    }
    out.push(first);

    let mask_bit: u8 = if frame.masked { 0x80 } else { 0x00 };
    if payload_len < 126 {
        out.push(mask_bit | payload_len as u8);
    } else if payload_len <= 0xFFFF {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(payload_len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&(payload_len as u64).to_be_bytes());
    }

    if frame.masked {
        out.extend_from_slice(&frame.mask_key);
        out.extend(
            frame
                .payload
                .iter()
                .enumerate()
                .map(|(i, &byte)| byte ^ frame.mask_key[i % 4]),
        );
    } else {
        out.extend_from_slice(&frame.payload);
    }
    out
}

struct HandshakeRequest {
    headers: HashMap<String, String>,
}

impl HandshakeRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

fn parse_handshake(request: &[u8]) -> Option<HandshakeRequest> {
    let text = std::str::from_utf8(request).ok()?;
    let mut lines = text.split("\r\n");

    let request_line = lines.next()?;
    if !request_line.starts_with("GET") || !request_line.contains("HTTP/1.1") {
        return None;
    }

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some(colon) = line.find(':') {
            let key = line[..colon].trim_end().to_ascii_lowercase();
            let value = line[colon + 1..].trim().to_string();
            headers.insert(key, value);
        }
    }
    Some(HandshakeRequest { headers })
}

/// Validate an upgrade request and build the `101 Switching Protocols`
/// response. `None` means the handshake is invalid and the connection must
/// be dropped without a response.
pub fn handshake_response(request: &[u8]) -> Option<Vec<u8>> {
    let parsed = parse_handshake(request)?;

    if !parsed
        .header("Upgrade")
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
    {
        return None;
    }
    if !parsed
        .header("Connection")
        .is_some_and(|v| v.to_ascii_lowercase().contains("upgrade"))
    {
        return None;
    }
    if parsed.header("Sec-WebSocket-Version") != Some("13") {
        return None;
    }
    let key = parsed.header("Sec-WebSocket-Key").filter(|k| !k.is_empty())?;

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         \r\n",
        accept_token(key)
    );
    Some(response.into_bytes())
}

struct WsConnection {
    state: WsState,
    buffer: BytesMut,
}

/// Delivered one unmasked TEXT/BINARY payload per complete frame.
pub type MessageHandler = Box<dyn FnMut(u64, Vec<u8>) + Send>;

/// The per-connection WebSocket protocol handler.
///
/// Tracks each connection through CONNECTING → OPEN → CLOSING → CLOSED,
/// accumulating bytes until the handshake terminator or a whole frame is
/// buffered. The RNG feeds mask keys for the client role; server frames go
/// out unmasked.
pub struct WebSocketProtocolHandler {
    connections: HashMap<u64, WsConnection>,
    session_provider: Option<SessionProvider>,
    message_handler: Option<MessageHandler>,
    mask_rng: StdRng,
}

impl WebSocketProtocolHandler {
    pub fn new() -> Self {
        Self {
            connections: HashMap::new(),
            session_provider: None,
            message_handler: None,
            mask_rng: StdRng::from_entropy(),
        }
    }

    pub fn set_session_provider(&mut self, provider: SessionProvider) {
        self.session_provider = Some(provider);
    }

    pub fn set_message_handler(&mut self, handler: impl FnMut(u64, Vec<u8>) + Send + 'static) {
        self.message_handler = Some(Box::new(handler));
    }

    pub fn connection_state(&self, connection_id: u64) -> Option<WsState> {
        self.connections.get(&connection_id).map(|c| c.state)
    }

    /// Fresh 4-byte mask key for frames sent in the client role.
    pub fn generate_mask_key(&mut self) -> [u8; 4] {
        self.mask_rng.r#gen()
    }

    pub fn send_text(&mut self, connection_id: u64, payload: &[u8]) -> bool {
        self.send_frame(connection_id, &WsFrame::text(payload.to_vec()))
    }

    pub fn send_binary(&mut self, connection_id: u64, payload: &[u8]) -> bool {
        self.send_frame(connection_id, &WsFrame::binary(payload.to_vec()))
    }

    pub fn send_ping(&mut self, connection_id: u64, payload: &[u8]) -> bool {
        self.send_frame(connection_id, &WsFrame::ping(payload.to_vec()))
    }

    pub fn send_pong(&mut self, connection_id: u64, payload: &[u8]) -> bool {
        self.send_frame(connection_id, &WsFrame::pong(payload.to_vec()))
    }

    /// Send a CLOSE frame and move the connection to CLOSING.
    pub fn close_connection(&mut self, connection_id: u64, code: u16, reason: &[u8]) -> bool {
        if let Some(connection) = self.connections.get_mut(&connection_id) {
            connection.state = WsState::Closing;
        }
        self.send_frame(connection_id, &WsFrame::close(code, reason))
    }

    fn send_frame(&mut self, connection_id: u64, frame: &WsFrame) -> bool {
        self.raw_send(connection_id, &encode_frame(frame))
    }

    fn raw_send(&self, connection_id: u64, data: &[u8]) -> bool {
        let Some(provider) = &self.session_provider else {
            return false;
        };
        match provider(connection_id) {
            Some(session) => {
                session.send(Bytes::copy_from_slice(data));
                true
            }
            None => false,
        }
    }

    fn drop_session(&self, connection_id: u64) {
        if let Some(provider) = &self.session_provider
            && let Some(session) = provider(connection_id)
        {
            session.close();
        }
    }

    /// Echo a protocol-error close and drop the transport.
    fn fail_connection(&mut self, connection_id: u64, code: u16) {
        self.close_connection(connection_id, code, b"");
        self.drop_session(connection_id);
    }

    fn try_handshake(&mut self, connection_id: u64) {
        let request = {
            let Some(connection) = self.connections.get_mut(&connection_id) else {
                return;
            };
            let Some(end) = connection
                .buffer
                .windows(4)
                .position(|window| window == b"\r\n\r\n")
            else {
                return;
            };
            // Bytes pipelined after the handshake stay buffered for frame
            // parsing once the connection is open.
            connection.buffer.split_to(end + 4)
        };

        match handshake_response(&request) {
            Some(response) => {
                self.raw_send(connection_id, &response);
                if let Some(connection) = self.connections.get_mut(&connection_id) {
                    connection.state = WsState::Open;
                }
                debug!(connection_id, "websocket handshake completed");
                self.process_frames(connection_id);
            }
            None => {
                error!(connection_id, "websocket handshake failed");
                self.connections.remove(&connection_id);
                self.drop_session(connection_id);
            }
        }
    }

    fn process_frames(&mut self, connection_id: u64) {
        loop {
            let parsed = {
                let Some(connection) = self.connections.get(&connection_id) else {
                    return;
                };
                if connection.buffer.is_empty() {
                    return;
                }
                parse_frame(&connection.buffer)
            };

            match parsed {
                Ok(Some((frame, consumed))) => {
                    if let Some(connection) = self.connections.get_mut(&connection_id) {
                        connection.buffer.advance(consumed);
                    }
                    if !frame.fin {
                        warn!(connection_id, "fragmented websocket message rejected");
                        self.fail_connection(connection_id, CLOSE_PROTOCOL_ERROR);
                        return;
                    }
                    if !frame.masked {
                        warn!(connection_id, "unmasked client frame rejected");
                        self.fail_connection(connection_id, CLOSE_PROTOCOL_ERROR);
                        return;
                    }
                    self.handle_frame(connection_id, frame);
                }
                Ok(None) => return,
                Err(e) => {
                    error!(connection_id, error = %e, "websocket frame parsing error");
                    self.fail_connection(connection_id, CLOSE_PROTOCOL_ERROR);
                    return;
                }
            }
        }
    }

    fn handle_frame(&mut self, connection_id: u64, frame: WsFrame) {
        match frame.opcode {
            OpCode::Text | OpCode::Binary => {
                if let Some(handler) = self.message_handler.as_mut() {
                    handler(connection_id, frame.payload);
                }
            }
            OpCode::Ping => {
                self.send_pong(connection_id, &frame.payload);
            }
            OpCode::Pong => {
                debug!(connection_id, "websocket pong received");
            }
            OpCode::Close => {
                let code = if frame.payload.len() >= 2 {
                    u16::from_be_bytes([frame.payload[0], frame.payload[1]])
                } else {
                    CLOSE_NORMAL
                };
                let reason = frame.payload.get(2..).unwrap_or_default().to_vec();
                debug!(connection_id, code, "websocket close frame received");

                match self.connection_state(connection_id) {
                    Some(WsState::Open) => {
                        // Echo the close with the peer's code, then drop the
                        // transport; disconnect moves the state to CLOSED.
                        self.close_connection(connection_id, code, &reason);
                        self.drop_session(connection_id);
                    }
                    Some(WsState::Closing) => {
                        // Peer answered our close: the sequence is complete.
                        if let Some(connection) = self.connections.get_mut(&connection_id) {
                            connection.state = WsState::Closed;
                        }
                        self.drop_session(connection_id);
                    }
                    _ => {}
                }
            }
        }
    }
}

impl Default for WebSocketProtocolHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolHandler for WebSocketProtocolHandler {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::WebSocket
    }

    fn handle_connect(&mut self, connection_id: u64) {
        debug!(connection_id, "websocket connection established");
        self.connections.insert(
            connection_id,
            WsConnection {
                state: WsState::Connecting,
                buffer: BytesMut::new(),
            },
        );
    }

    fn handle_data(&mut self, connection_id: u64, data: &[u8]) {
        let state = {
            let Some(connection) = self.connections.get_mut(&connection_id) else {
                return;
            };
            connection.buffer.extend_from_slice(data);
            connection.state
        };

        match state {
            WsState::Connecting => self.try_handshake(connection_id),
            WsState::Open | WsState::Closing => self.process_frames(connection_id),
            WsState::Closed => {
                if let Some(connection) = self.connections.get_mut(&connection_id) {
                    connection.buffer.clear();
                }
            }
        }
    }

    fn handle_disconnect(&mut self, connection_id: u64) {
        debug!(connection_id, "websocket connection closed");
        self.connections.remove(&connection_id);
    }

    fn send_data(&mut self, connection_id: u64, data: &[u8]) -> bool {
        self.send_text(connection_id, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_token_matches_rfc_example() {
        assert_eq!(
            accept_token("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn handshake_response_carries_accept_token() {
        let request = b"GET /ws HTTP/1.1\r\n\
            Host: example.com\r\n\
            Upgrade: websocket\r\n\
            Connection: Upgrade\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
            Sec-WebSocket-Version: 13\r\n\
            \r\n";
        let response = String::from_utf8(handshake_response(request).unwrap()).unwrap();
        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(response.ends_with("\r\n\r\n"));
    }

    #[test]
    fn handshake_rejects_missing_or_bad_headers() {
        let cases: [&[u8]; 4] = [
            // Wrong method.
            b"POST /ws HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: k\r\nSec-WebSocket-Version: 13\r\n\r\n",
            // No upgrade header.
            b"GET /ws HTTP/1.1\r\nConnection: Upgrade\r\nSec-WebSocket-Key: k\r\nSec-WebSocket-Version: 13\r\n\r\n",
            // Wrong version.
            b"GET /ws HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: k\r\nSec-WebSocket-Version: 8\r\n\r\n",
            // Empty key.
            b"GET /ws HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: \r\nSec-WebSocket-Version: 13\r\n\r\n",
        ];
        for case in cases {
            assert!(handshake_response(case).is_none());
        }
    }

    #[test]
    fn handshake_headers_are_case_insensitive() {
        let request = b"GET /ws HTTP/1.1\r\n\
            upgrade: WebSocket\r\n\
            connection: keep-alive, Upgrade\r\n\
            sec-websocket-key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
            sec-websocket-version: 13\r\n\
            \r\n";
        assert!(handshake_response(request).is_some());
    }

    #[test]
    fn frame_roundtrip_unmasked() {
        let frame = WsFrame::text(b"hello".to_vec());
        let encoded = encode_frame(&frame);
        assert_eq!(encoded[0], 0x81);
        assert_eq!(encoded[1], 0x05);
        let (parsed, consumed) = parse_frame(&encoded).unwrap().unwrap();
        assert_eq!(parsed, frame);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn frame_roundtrip_masked() {
        let frame = WsFrame::binary(b"payload bytes".to_vec()).masked_with([0xDE, 0xAD, 0xBE, 0xEF]);
        let encoded = encode_frame(&frame);
        assert_eq!(encoded[1] & 0x80, 0x80);
        // The wire payload is not the clear payload.
        assert_ne!(&encoded[6..], frame.payload.as_slice());
        let (parsed, _) = parse_frame(&encoded).unwrap().unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn frame_roundtrip_extended_lengths() {
        // 16-bit extended length.
        let medium = WsFrame::binary(vec![0x42; 300]);
        let encoded = encode_frame(&medium);
        assert_eq!(encoded[1] & 0x7F, 126);
        assert_eq!(u16::from_be_bytes([encoded[2], encoded[3]]), 300);
        assert_eq!(parse_frame(&encoded).unwrap().unwrap().0, medium);

        // 64-bit extended length.
        let large = WsFrame::binary(vec![0x42; 70_000]);
        let encoded = encode_frame(&large);
        assert_eq!(encoded[1] & 0x7F, 127);
        assert_eq!(parse_frame(&encoded).unwrap().unwrap().0, large);
    }

    #[test]
    fn double_mask_restores_payload() {
        let payload = b"the quick brown fox".to_vec();
        let key = [0x01, 0x02, 0x03, 0x04];
        let once: Vec<u8> = payload
            .iter()
            .enumerate()
            .map(|(i, &b)| b ^ key[i % 4])
            .collect();
        let twice: Vec<u8> = once.iter().enumerate().map(|(i, &b)| b ^ key[i % 4]).collect();
        assert_ne!(once, payload);
        assert_eq!(twice, payload);
    }

    #[test]
    fn parse_never_consumes_partial_frames() {
        let frame = WsFrame::text(vec![b'x'; 200]).masked_with([1, 2, 3, 4]);
        let encoded = encode_frame(&frame);
        for cut in 0..encoded.len() {
            assert_eq!(
                parse_frame(&encoded[..cut]).unwrap(),
                None,
                "prefix length {cut}"
            );
        }
        assert!(parse_frame(&encoded).unwrap().is_some());
    }

    #[test]
    fn parse_rejects_reserved_bits_and_unknown_opcodes() {
        assert_eq!(parse_frame(&[0xC1, 0x00]), Err(WsError::ReservedBitsSet));
        assert_eq!(parse_frame(&[0x83, 0x00]), Err(WsError::UnsupportedOpcode(0x3)));
        // Continuation frames are an unsupported opcode by design.
        assert_eq!(parse_frame(&[0x80, 0x00]), Err(WsError::UnsupportedOpcode(0x0)));
    }

    #[test]
    fn close_frame_carries_big_endian_code() {
        let frame = WsFrame::close(CLOSE_PROTOCOL_ERROR, b"protocol error");
        assert_eq!(&frame.payload[..2], &[0x03, 0xEA]);
        assert_eq!(&frame.payload[2..], b"protocol error");
    }

    #[test]
    fn mask_keys_vary() {
        let mut handler = WebSocketProtocolHandler::new();
        let keys: Vec<[u8; 4]> = (0..8).map(|_| handler.generate_mask_key()).collect();
        assert!(keys.windows(2).any(|pair| pair[0] != pair[1]));
    }
}
