//! Framing over a reliable byte stream.

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::{decode_frame, encode, DecodeError, EncodeError};
use crate::message::NetworkMessage;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A complete frame failed to decode. The frame has been consumed and the
    /// reader can keep going.
    #[error("malformed frame: {0}")]
    Decode(#[from] DecodeError),

    #[error("unencodable message: {0}")]
    Encode(#[from] EncodeError),

    #[error("stream closed with {buffered} bytes of a partial frame")]
    UnexpectedEof { buffered: usize },
}

/// Reads whole [`NetworkMessage`]s off a byte stream.
pub struct FrameReader<R> {
    reader: R,
    buffer: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(1024),
        }
    }

    /// Returns the next message, or `Ok(None)` on a clean end of stream.
    ///
    /// Cancel safe: bytes already read stay buffered for the next call.
    pub async fn next_message(&mut self) -> Result<Option<NetworkMessage>, StreamError> {
        loop {
            if let Some(message) = decode_frame(&mut self.buffer)? {
                return Ok(Some(message));
            }

            if self.reader.read_buf(&mut self.buffer).await? == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(StreamError::UnexpectedEof {
                    buffered: self.buffer.len(),
                });
            }
        }
    }
}

/// Encodes and writes one message.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &NetworkMessage,
) -> Result<(), StreamError> {
    let bytes = encode(message)?;
    writer.write_all(&bytes).await?;
    Ok(())
}
