//! Transport Layer for Core-peer IPC
//!
//! Frames messages over any byte stream. The daemon runs it over TCP; tests
//! run it over `tokio::io::duplex`.
//!
//! # Design Philosophy
//!
//! The transport layer separates the communication mechanism from the
//! connection lifecycle. Nothing here knows what a handshake or a cue is; it
//! moves typed messages and reports integrity failures.

pub mod config;
pub mod frame;
pub mod stream;

pub use config::TransportConfig;
pub use frame::{encode, FrameDecoder, MAX_FRAME_SIZE};
pub use stream::{FrameReader, FrameWriter};

/// Errors from the transport layer
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The underlying stream failed
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A payload could not be (de)serialized
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The payload does not match its CRC32
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum carried by the frame
        expected: u32,
        /// Checksum computed over the payload
        actual: u32,
    },

    /// A frame exceeds `MAX_FRAME_SIZE`
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge {
        /// Declared or encoded size
        size: usize,
        /// Limit
        max: usize,
    },
}

impl TransportError {
    /// Whether the stream can keep being read after this error
    ///
    /// Only an unparseable payload leaves the framing intact.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Serialization(_))
    }
}
