// Length-prefixed binary framing for the raw TCP and UDP transports.
//
// The wire layout is a 4-byte big-endian `total_length` header followed by
// `total_length - 4` payload bytes. Payload content is opaque to the gateway;
// structure ends at the length header. Decoding is all-or-nothing: a buffer
// either yields a whole frame or is left untouched until more data arrives.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of the `total_length` header in bytes.
pub const HEADER_SIZE: usize = 4;

/// Maximum allowed frame size to prevent memory exhaustion attacks.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16 MiB

/// Framing errors. `decode` never reports incomplete input as an error;
/// an `Err` here means the stream is corrupt and the connection must go.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("frame length {0} is shorter than the {HEADER_SIZE}-byte header")]
    FrameTooShort(u32),

    #[error("frame length {length} exceeds the {max} byte ceiling")]
    FrameTooLarge { length: u32, max: usize },
}

/// Encode a payload into a framed buffer of size `4 + payload.len()`.
///
/// # Examples
///
/// ```rust
/// let frame = shield::codec::encode(b"ABCDE");
/// assert_eq!(&frame[..], &[0x00, 0x00, 0x00, 0x09, b'A', b'B', b'C', b'D', b'E']);
/// ```
pub fn encode(payload: &[u8]) -> Bytes {
    let total = HEADER_SIZE + payload.len();
    let mut buf = BytesMut::with_capacity(total);
    buf.put_u32(total as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Attempt to decode one frame from the front of `buf`.
///
/// Returns `Ok(Some((payload, bytes_consumed)))` when a whole frame is
/// buffered, `Ok(None)` when more data is needed (nothing is consumed), and
/// `Err` when the declared length is structurally invalid. The ceiling is
/// checked before the payload is copied, so an attacker-controlled header
/// never drives an allocation.
///
/// Callers drain a receive buffer by looping until `Ok(None)`.
pub fn decode_with_limit(
    buf: &[u8],
    max_frame_size: usize,
) -> Result<Option<(Bytes, usize)>, CodecError> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }

    let total = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if (total as usize) < HEADER_SIZE {
        return Err(CodecError::FrameTooShort(total));
    }
    if total as usize > max_frame_size {
        return Err(CodecError::FrameTooLarge {
            length: total,
            max: max_frame_size,
        });
    }

    let total = total as usize;
    if buf.len() < total {
        return Ok(None);
    }

    Ok(Some((Bytes::copy_from_slice(&buf[HEADER_SIZE..total]), total)))
}

/// `decode_with_limit` with the default 16 MiB ceiling.
pub fn decode(buf: &[u8]) -> Result<Option<(Bytes, usize)>, CodecError> {
    decode_with_limit(buf, DEFAULT_MAX_FRAME_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_prefixes_total_length() {
        let frame = encode(b"ABCDE");
        assert_eq!(frame.len(), 9);
        assert_eq!(&frame[..4], &[0x00, 0x00, 0x00, 0x09]);
        assert_eq!(&frame[4..], b"ABCDE");
    }

    #[test]
    fn encode_empty_payload_is_header_only() {
        let frame = encode(b"");
        assert_eq!(&frame[..], &[0x00, 0x00, 0x00, 0x04]);
    }

    #[test]
    fn decode_roundtrips_encode() {
        let message = b"hello gateway".to_vec();
        let frame = encode(&message);
        let (payload, consumed) = decode(&frame).unwrap().unwrap();
        assert_eq!(payload, message);
        assert_eq!(consumed, HEADER_SIZE + message.len());
    }

    #[test]
    fn decode_is_all_or_nothing_on_partial_input() {
        let frame = encode(b"ABCDE");
        // Every strict prefix must yield "need more data" without consuming.
        for cut in 0..frame.len() {
            assert_eq!(decode(&frame[..cut]).unwrap(), None, "prefix length {cut}");
        }
        assert!(decode(&frame).unwrap().is_some());
    }

    #[test]
    fn decode_drains_concatenated_frames_in_order() {
        let messages: [&[u8]; 3] = [b"one", b"", b"three"];
        let mut stream = Vec::new();
        for m in messages {
            stream.extend_from_slice(&encode(m));
        }

        let mut offset = 0;
        let mut out = Vec::new();
        while let Some((payload, consumed)) = decode(&stream[offset..]).unwrap() {
            out.push(payload);
            offset += consumed;
        }

        assert_eq!(offset, stream.len(), "no residue on a frame boundary");
        assert_eq!(out, messages);
    }

    #[test]
    fn decode_rejects_undersized_length() {
        let bad = [0x00, 0x00, 0x00, 0x03, 0xFF];
        assert_eq!(decode(&bad), Err(CodecError::FrameTooShort(3)));
    }

    #[test]
    fn decode_rejects_oversized_length_before_buffering_payload() {
        // Header alone declares 32 MiB; only 4 bytes are actually buffered.
        let declared = (32 * 1024 * 1024u32).to_be_bytes();
        assert_eq!(
            decode(&declared),
            Err(CodecError::FrameTooLarge {
                length: 32 * 1024 * 1024,
                max: DEFAULT_MAX_FRAME_SIZE,
            })
        );
    }

    #[test]
    fn custom_limit_is_honored() {
        let frame = encode(&vec![0u8; 128]);
        assert!(decode_with_limit(&frame, 64).is_err());
        assert!(decode_with_limit(&frame, 256).unwrap().is_some());
    }
}
