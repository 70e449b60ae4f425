//! Conditional chunk payload compression.
//!
//! Uses zstd. A payload is only compressed when it is large enough to be
//! worth the round trip and the compressed form actually beats the configured
//! ratio margin; otherwise the original text travels as-is. Compressed
//! payloads are base64-encoded for the JSON wire body.

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::config::CompressionConfig;

/// A chunk payload ready for the wire: either the original text or
/// base64-encoded zstd bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Plain(String),
    Compressed { base64: String, original_len: usize },
}

impl Payload {
    pub fn is_compressed(&self) -> bool {
        matches!(self, Payload::Compressed { .. })
    }

    /// The string carried in the request body's `content` field.
    pub fn wire_content(&self) -> &str {
        match self {
            Payload::Plain(text) => text,
            Payload::Compressed { base64, .. } => base64,
        }
    }
}

/// Encode chunk content for delivery, compressing when beneficial.
pub fn encode(content: &str, config: &CompressionConfig) -> Result<Payload> {
    if !config.enabled || content.len() < config.min_size_bytes {
        return Ok(Payload::Plain(content.to_string()));
    }

    let compressed =
        zstd::encode_all(content.as_bytes(), config.level).context("zstd compression failed")?;

    let ratio = compressed.len() as f64 / content.len() as f64;
    if ratio > config.max_ratio {
        // Not enough savings to justify the decode on the far side.
        return Ok(Payload::Plain(content.to_string()));
    }

    Ok(Payload::Compressed {
        base64: BASE64.encode(&compressed),
        original_len: content.len(),
    })
}

/// Decode a compressed payload back to text. Used by tests and by callers
/// that need to verify round trips.
pub fn decode_compressed(base64_payload: &str) -> Result<String> {
    let bytes = BASE64
        .decode(base64_payload)
        .context("invalid base64 payload")?;
    let decompressed = zstd::decode_all(bytes.as_slice()).context("zstd decompression failed")?;
    String::from_utf8(decompressed).context("decompressed payload is not UTF-8")
}
