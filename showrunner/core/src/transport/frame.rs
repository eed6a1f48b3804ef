//! Frame Protocol
//!
//! Wire format for Core-peer messages using length-prefixed JSON with CRC32
//! checksum for integrity verification.
//!
//! # Frame Format
//!
//! ```text
//! +----------------+----------------+------------------------------------------+
//! | Length (4)     | Checksum (4)   | JSON Payload (variable)                  |
//! | big-endian u32 | CRC32          | CoreMessage or ComponentMessage          |
//! +----------------+----------------+------------------------------------------+
//! ```
//!
//! The Length field contains the size of the JSON payload only (not including the checksum).
//! The Checksum is the CRC32 hash of the JSON payload.
//!
//! # Limits
//!
//! - Maximum frame size is enforced before the payload buffer grows
//! - CRC32 checksum detects data corruption in transit

use serde::{de::DeserializeOwned, Serialize};

use super::TransportError;

/// Maximum frame payload size (10 MB)
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Minimum buffer capacity for decoder
const MIN_BUFFER_CAPACITY: usize = 4096;

/// Frame header size: 4 bytes length + 4 bytes checksum
pub const HEADER_SIZE: usize = 8;

#[inline]
fn compute_checksum(payload: &[u8]) -> u32 {
    crc32fast::hash(payload)
}

/// Encode a message to a length-prefixed frame with CRC32 checksum
///
/// # Errors
///
/// `TransportError::Serialization` if JSON serialization fails,
/// `TransportError::FrameTooLarge` if the payload exceeds `MAX_FRAME_SIZE`.
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, TransportError> {
    let json = serde_json::to_vec(msg).map_err(|e| TransportError::Serialization(e.to_string()))?;

    if json.len() > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge {
            size: json.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    // Bounded by MAX_FRAME_SIZE above
    let len = json.len() as u32;
    let checksum = compute_checksum(&json);

    let mut buf = Vec::with_capacity(HEADER_SIZE + json.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&checksum.to_be_bytes());
    buf.extend_from_slice(&json);
    Ok(buf)
}

/// Decoder state machine for streaming frame parsing
///
/// Buffers incoming bytes and yields complete messages.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Position where we've consumed up to
    read_pos: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Create a new decoder with default buffer capacity
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(MIN_BUFFER_CAPACITY),
            read_pos: 0,
        }
    }

    /// Append bytes to the buffer
    pub fn push(&mut self, data: &[u8]) {
        if self.read_pos > self.buffer.len() / 2 && self.read_pos > MIN_BUFFER_CAPACITY {
            self.buffer.drain(..self.read_pos);
            self.read_pos = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    /// Get the number of bytes available in the buffer
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    /// Try to decode the next frame
    ///
    /// Returns:
    /// - `Ok(Some(msg))` if a complete frame was decoded
    /// - `Ok(None)` if more data is needed
    /// - `Err(TransportError::ChecksumMismatch)` if checksum verification fails
    /// - `Err(TransportError::FrameTooLarge)` if the length prefix is over the limit
    ///
    /// A frame whose checksum matches but whose JSON does not parse as `T` is
    /// consumed before the error is returned, so the stream stays aligned.
    pub fn decode<T: DeserializeOwned>(&mut self) -> Result<Option<T>, TransportError> {
        let available = self.available();
        if available < HEADER_SIZE {
            return Ok(None);
        }

        let header = &self.buffer[self.read_pos..self.read_pos + HEADER_SIZE];
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let expected = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);

        if len > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }

        if available < HEADER_SIZE + len {
            return Ok(None);
        }

        let payload_start = self.read_pos + HEADER_SIZE;
        let payload_end = payload_start + len;
        let payload = &self.buffer[payload_start..payload_end];

        let actual = compute_checksum(payload);
        if actual != expected {
            return Err(TransportError::ChecksumMismatch { expected, actual });
        }

        let parsed = serde_json::from_slice(payload);
        self.read_pos = payload_end;
        parsed
            .map(Some)
            .map_err(|e| TransportError::Serialization(e.to_string()))
    }

    /// Whether a partially received frame is buffered
    #[must_use]
    pub fn has_partial_frame(&self) -> bool {
        self.available() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ComponentMessage, CoreMessage, NoticeLevel};

    fn heartbeat(seq: u64) -> ComponentMessage {
        ComponentMessage::Heartbeat { seq }
    }

    fn raw_frame(payload: &[u8], checksum: u32) -> Vec<u8> {
        let mut frame = u32::try_from(payload.len()).unwrap().to_be_bytes().to_vec();
        frame.extend_from_slice(&checksum.to_be_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn test_frame_layout() {
        let encoded = encode(&heartbeat(99)).unwrap();

        let payload_len =
            u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]) as usize;
        assert_eq!(payload_len, encoded.len() - HEADER_SIZE);

        let checksum = u32::from_be_bytes([encoded[4], encoded[5], encoded[6], encoded[7]]);
        assert_eq!(checksum, crc32fast::hash(&encoded[HEADER_SIZE..]));
        assert_eq!(&encoded[HEADER_SIZE..], br#"{"type":"heartbeat","seq":99}"#);
    }

    #[test]
    fn test_decode_partial_header() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&[0, 0, 0, 5]);

        assert!(matches!(decoder.decode::<ComponentMessage>(), Ok(None)));
        assert!(decoder.has_partial_frame());
    }

    #[test]
    fn test_decode_byte_by_byte() {
        let msg = CoreMessage::notice(NoticeLevel::Info, "house open");
        let encoded = encode(&msg).unwrap();

        let mut decoder = FrameDecoder::new();
        let (last, head) = encoded.split_last().unwrap();
        for byte in head {
            decoder.push(std::slice::from_ref(byte));
            assert!(decoder.decode::<CoreMessage>().unwrap().is_none());
        }
        decoder.push(std::slice::from_ref(last));
        assert_eq!(decoder.decode::<CoreMessage>().unwrap(), Some(msg));
        assert!(!decoder.has_partial_frame());
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut encoded = encode(&heartbeat(1)).unwrap();
        encoded.extend(encode(&heartbeat(2)).unwrap());

        let mut decoder = FrameDecoder::new();
        decoder.push(&encoded);

        assert_eq!(decoder.decode::<ComponentMessage>().unwrap(), Some(heartbeat(1)));
        assert_eq!(decoder.decode::<ComponentMessage>().unwrap(), Some(heartbeat(2)));
        assert_eq!(decoder.decode::<ComponentMessage>().unwrap(), None);
    }

    #[test]
    fn test_encode_too_large() {
        let msg = CoreMessage::notice(NoticeLevel::Info, "x".repeat(MAX_FRAME_SIZE + 1));
        assert!(matches!(
            encode(&msg),
            Err(TransportError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_oversize_length_prefix_rejected_before_buffering() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&u32::try_from(MAX_FRAME_SIZE + 1).unwrap().to_be_bytes());
        decoder.push(&[0u8; 4]);

        assert!(matches!(
            decoder.decode::<ComponentMessage>(),
            Err(TransportError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_checksum_mismatch() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&raw_frame(br#"{"type":"heartbeat","seq":1}"#, 0xDEAD_BEEF));

        let result = decoder.decode::<ComponentMessage>();
        assert!(matches!(
            result,
            Err(TransportError::ChecksumMismatch {
                expected: 0xDEAD_BEEF,
                ..
            })
        ));
        assert!(!result.unwrap_err().is_recoverable());
    }

    #[test]
    fn test_unknown_message_is_skipped() {
        let bad = br#"{"type":"self_destruct"}"#;
        let mut decoder = FrameDecoder::new();
        decoder.push(&raw_frame(bad, crc32fast::hash(bad)));
        decoder.push(&encode(&heartbeat(2)).unwrap());

        let result = decoder.decode::<ComponentMessage>();
        assert!(matches!(result, Err(TransportError::Serialization(_))));
        assert!(result.unwrap_err().is_recoverable());

        assert_eq!(decoder.decode::<ComponentMessage>().unwrap(), Some(heartbeat(2)));
    }
}
