//! Framed async I/O
//!
//! Reads and writes frames over any `AsyncRead` / `AsyncWrite`, so the same
//! connection logic runs over TCP in the daemon and over in-memory duplex
//! pipes in tests.

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::frame::{encode, FrameDecoder};
use super::TransportError;

const READ_CHUNK: usize = 4096;

/// Reads whole frames from a byte stream
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    decoder: FrameDecoder,
    buf: Box<[u8; READ_CHUNK]>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap a reader
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::new(),
            buf: Box::new([0u8; READ_CHUNK]),
        }
    }

    /// Next message, or `None` once the peer closed the stream
    ///
    /// Cancel safe: bytes already read stay buffered in the decoder.
    ///
    /// # Errors
    ///
    /// I/O errors, checksum mismatches, oversize frames, and payloads that
    /// are not a valid `T`. An EOF in the middle of a frame is an
    /// `UnexpectedEof` I/O error.
    pub async fn next<T: DeserializeOwned>(&mut self) -> Result<Option<T>, TransportError> {
        loop {
            if let Some(msg) = self.decoder.decode()? {
                return Ok(Some(msg));
            }

            let n = self.inner.read(&mut self.buf[..]).await?;
            if n == 0 {
                if self.decoder.has_partial_frame() {
                    return Err(TransportError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "stream closed inside a frame",
                    )));
                }
                return Ok(None);
            }
            self.decoder.push(&self.buf[..n]);
        }
    }
}

/// Writes frames to a byte stream
#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Wrap a writer
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Encode and write one message, then flush
    ///
    /// # Errors
    ///
    /// Encoding errors and I/O errors.
    pub async fn send<T: Serialize>(&mut self, msg: &T) -> Result<(), TransportError> {
        let frame = encode(msg)?;
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Shut down the write side
    ///
    /// # Errors
    ///
    /// I/O errors from the underlying stream.
    pub async fn shutdown(&mut self) -> Result<(), TransportError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
