//! Newline-delimited JSON framing
//!
//! One envelope per line. The reader and writer halves are separate so a
//! peer can keep reading while it writes from another task.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::IpcError;
use crate::protocol::{MessageEnvelope, IPC_PROTOCOL_VERSION};

/// Reading half of a framed channel
pub struct FrameReader<R> {
    reader: BufReader<R>,
    line: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            line: Vec::new(),
        }
    }

    /// Receive the next envelope, or `None` once the peer closed the stream.
    ///
    /// A line that fails to decode yields an error but leaves the reader
    /// positioned at the following line. Cancel safe: bytes of a partially
    /// read line stay buffered and are completed by the next call.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<MessageEnvelope<T>>, IpcError> {
        loop {
            let read = self.reader.read_until(b'\n', &mut self.line).await?;
            if read == 0 && self.line.is_empty() {
                return Ok(None);
            }

            let line = std::mem::take(&mut self.line);
            let text = std::str::from_utf8(&line)
                .map_err(|e| IpcError::DeserializationError(e.to_string()))?;
            let trimmed = text.trim();
            if trimmed.is_empty() {
                continue;
            }

            let envelope: MessageEnvelope<T> = serde_json::from_str(trimmed)
                .map_err(|e| IpcError::DeserializationError(e.to_string()))?;

            if !envelope.is_compatible() {
                return Err(IpcError::ProtocolVersionMismatch {
                    expected: IPC_PROTOCOL_VERSION,
                    actual: envelope.protocol_version,
                });
            }

            return Ok(Some(envelope));
        }
    }
}

/// Writing half of a framed channel
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Send an envelope and flush
    pub async fn send<T: Serialize>(&mut self, envelope: &MessageEnvelope<T>) -> Result<(), IpcError> {
        let mut json = serde_json::to_vec(envelope)
            .map_err(|e| IpcError::SerializationError(e.to_string()))?;
        json.push(b'\n');

        self.writer.write_all(&json).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Wrap `message` in a fresh envelope and send it
    pub async fn send_message<T: Serialize>(&mut self, message: T) -> Result<(), IpcError> {
        self.send(&MessageEnvelope::new(message)).await
    }
}

/// Framed halves over this process's stdin and stdout
pub fn stdio() -> (FrameReader<tokio::io::Stdin>, FrameWriter<tokio::io::Stdout>) {
    (
        FrameReader::new(tokio::io::stdin()),
        FrameWriter::new(tokio::io::stdout()),
    )
}
