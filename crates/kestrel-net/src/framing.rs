//! Length-prefixed framing for stream transports.
//!
//! ```text
//! +-------------------+--------------------+
//! | length (4 bytes)  |   payload          |
//! | u32 little-endian |   (length bytes)   |
//! +-------------------+--------------------+
//! ```
//!
//! A peer closing the stream between two frames is a clean end of stream;
//! closing it in the middle of a frame is [`FrameError::Truncated`].

use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Limits applied by the framing layer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum allowed payload size in bytes. Default: 1 MB.
    pub max_payload_size: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 1_048_576,
        }
    }
}

/// Errors that can occur during framing operations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The payload size exceeds the configured maximum.
    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge {
        /// The actual payload size.
        size: usize,
        /// The configured maximum.
        max: u32,
    },

    /// The stream ended inside a frame.
    #[error("stream ended inside a frame ({read} of {expected} bytes)")]
    Truncated {
        /// Bytes of the frame (prefix included) read before the end.
        read: usize,
        /// Bytes the frame should have had.
        expected: usize,
    },

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Read the next frame. Returns `Ok(None)` when the stream ends cleanly
/// before a new frame starts.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    config: &FrameConfig,
) -> Result<Option<Vec<u8>>, FrameError> {
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(FrameError::Truncated {
                read: filled,
                expected: len_buf.len(),
            });
        }
        filled += n;
    }

    let payload_len = u32::from_le_bytes(len_buf);
    if payload_len > config.max_payload_size {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len as usize,
            max: config.max_payload_size,
        });
    }

    let mut payload = vec![0u8; payload_len as usize];
    let mut read = 0;
    while read < payload.len() {
        let n = reader.read(&mut payload[read..]).await?;
        if n == 0 {
            return Err(FrameError::Truncated {
                read: 4 + read,
                expected: 4 + payload.len(),
            });
        }
        read += n;
    }

    Ok(Some(payload))
}

/// Write one frame and flush.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    payload: &[u8],
    config: &FrameConfig,
) -> Result<(), FrameError> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= config.max_payload_size)
        .ok_or(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: config.max_payload_size,
        })?;

    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
