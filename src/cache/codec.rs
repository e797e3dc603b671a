//! Value codecs and the entry envelope wire form
//!
//! Values are encoded by a per-call or configured codec; the resulting bytes
//! ride inside a `StoredEntry` envelope that is always JSON, so every path
//! (facade, write-behind, warming, cluster sync) stores an identical shape.
//! Compression, when enabled, wraps the serialized envelope.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::types::StoredEntry;
use crate::error::{Error, Result};

/// Value codec selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CodecKind {
    /// Human-readable JSON
    Json,
    /// Compact bincode. Requires a concrete target type on decode.
    BinaryObject,
}

impl CodecKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CodecKind::Json => "json",
            CodecKind::BinaryObject => "binary-object",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "json" => Ok(CodecKind::Json),
            "binary-object" => Ok(CodecKind::BinaryObject),
            other => Err(Error::Config(format!("unsupported codec: {other}"))),
        }
    }

    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            CodecKind::Json => serde_json::to_vec(value)
                .map_err(|e| Error::Serialization(format!("json encode: {e}"))),
            CodecKind::BinaryObject => bincode::serialize(value)
                .map_err(|e| Error::Serialization(format!("binary encode: {e}"))),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            CodecKind::Json => serde_json::from_slice(bytes)
                .map_err(|e| Error::Serialization(format!("json decode: {e}"))),
            CodecKind::BinaryObject => bincode::deserialize(bytes)
                .map_err(|e| Error::Serialization(format!("binary decode: {e}"))),
        }
    }
}

/// Serialize an envelope, optionally compressing the result.
pub fn encode_envelope(entry: &StoredEntry, compression: bool) -> Result<Vec<u8>> {
    let raw = serde_json::to_vec(entry)
        .map_err(|e| Error::Serialization(format!("envelope encode: {e}")))?;
    if !compression {
        return Ok(raw);
    }
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&raw)
        .and_then(|_| encoder.finish())
        .map_err(|e| Error::Serialization(format!("compress: {e}")))
}

/// Inverse of [`encode_envelope`].
pub fn decode_envelope(bytes: &[u8], compression: bool) -> Result<StoredEntry> {
    let raw = if compression {
        let mut decoder = ZlibDecoder::new(bytes);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| Error::Serialization(format!("decompress: {e}")))?;
        out
    } else {
        bytes.to_vec()
    };
    serde_json::from_slice(&raw).map_err(|e| Error::Serialization(format!("envelope decode: {e}")))
}
