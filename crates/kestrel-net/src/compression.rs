//! Conditional LZ4 compression for packet payloads.
//!
//! World snapshots grow with the number of networked entities and are worth
//! compressing; pings and input reports are a few bytes and are sent as-is.

use lz4_flex::{compress_prepend_size, decompress};

/// Compression flag: payload is uncompressed.
pub const COMPRESSION_FLAG_NONE: u8 = 0x00;

/// Compression flag: payload is LZ4-compressed.
pub const COMPRESSION_FLAG_LZ4: u8 = 0x01;

/// Largest decompressed payload accepted from a peer. Matches the default
/// frame limit.
pub const MAX_DECOMPRESSED_SIZE: usize = 1_048_576;

/// Controls when payloads are compressed.
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Minimum payload size (bytes) before compression is applied. Default: 256.
    pub threshold: usize,
    /// Whether compression is enabled at all. Default: true.
    pub enabled: bool,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            threshold: 256,
            enabled: true,
        }
    }
}

impl CompressionConfig {
    /// Compression enabled above `threshold` bytes.
    pub fn with_threshold(threshold: usize) -> Self {
        Self {
            threshold,
            enabled: true,
        }
    }
}

/// Prefix `data` with a compression flag, compressing it when large enough.
///
/// Compression is skipped when it would not make the payload smaller.
pub fn compress_payload(data: &[u8], config: &CompressionConfig) -> Vec<u8> {
    if config.enabled && data.len() >= config.threshold {
        let compressed = compress_prepend_size(data);
        if compressed.len() < data.len() {
            let mut out = Vec::with_capacity(1 + compressed.len());
            out.push(COMPRESSION_FLAG_LZ4);
            out.extend_from_slice(&compressed);
            return out;
        }
    }

    let mut out = Vec::with_capacity(1 + data.len());
    out.push(COMPRESSION_FLAG_NONE);
    out.extend_from_slice(data);
    out
}

/// Strip the compression flag, decompressing if necessary.
///
/// The LZ4 size prefix comes from the peer, so it is checked against
/// [`MAX_DECOMPRESSED_SIZE`] before any buffer is reserved.
pub fn decompress_payload(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let Some((&flag, body)) = data.split_first() else {
        return Err(CompressionError::EmptyPayload);
    };

    match flag {
        COMPRESSION_FLAG_NONE => Ok(body.to_vec()),
        COMPRESSION_FLAG_LZ4 => {
            let Some((prefix, block)) = body.split_first_chunk::<4>() else {
                return Err(CompressionError::DecompressFailed(
                    "missing size prefix".to_string(),
                ));
            };
            let size = u32::from_le_bytes(*prefix) as usize;
            if size > MAX_DECOMPRESSED_SIZE {
                return Err(CompressionError::TooLarge {
                    size,
                    max: MAX_DECOMPRESSED_SIZE,
                });
            }
            decompress(block, size).map_err(|e| CompressionError::DecompressFailed(e.to_string()))
        }
        flag => Err(CompressionError::UnknownFlag(flag)),
    }
}

/// Errors that can occur during payload decompression.
#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    /// The payload was empty — no compression flag present.
    #[error("empty payload — no compression flag")]
    EmptyPayload,
    /// LZ4 decompression failed.
    #[error("LZ4 decompression failed: {0}")]
    DecompressFailed(String),
    /// The declared decompressed size exceeds the limit.
    #[error("decompressed size {size} exceeds limit {max}")]
    TooLarge { size: usize, max: usize },
    /// An unknown compression flag byte was encountered.
    #[error("unknown compression flag: 0x{0:02X}")]
    UnknownFlag(u8),
}
