//! Stored cache entry envelope with optional compression

use crate::cache::types::CacheTier;
use crate::error::{CacheError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use tracing::warn;

/// The envelope written to the backend for every cached value.
///
/// `payload` holds the JSON-serialized value, or when `compressed` is set,
/// the base64 text of a gzip stream of that JSON. Gzip carries its own
/// header and checksum, so a corrupted blob is detected on decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub payload: String,
    pub version: Option<String>,
    pub created_at: DateTime<Utc>,
    pub tier: CacheTier,
    pub compressed: bool,
}

impl CacheEntry {
    /// Serialize a value into an entry, compressing when it is larger than
    /// `threshold` bytes or `force_compress` is set.
    ///
    /// A compression failure is logged and the entry is stored uncompressed.
    pub fn encode<T: Serialize + ?Sized>(
        value: &T,
        tier: CacheTier,
        version: Option<String>,
        force_compress: bool,
        threshold: usize,
    ) -> Result<Self> {
        let serialized = serde_json::to_string(value)?;

        let (payload, compressed) = if force_compress || serialized.len() > threshold {
            match compress(serialized.as_bytes()) {
                Ok(blob) => (blob, true),
                Err(e) => {
                    warn!("Compression failed, storing uncompressed: {}", e);
                    (serialized, false)
                }
            }
        } else {
            (serialized, false)
        };

        Ok(Self {
            payload,
            version,
            created_at: Utc::now(),
            tier,
            compressed,
        })
    }

    /// Deserialize the payload, decompressing it first if flagged
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        if self.compressed {
            let json = decompress(&self.payload)?;
            Ok(serde_json::from_slice(&json)?)
        } else {
            Ok(serde_json::from_str(&self.payload)?)
        }
    }

    /// Wire representation stored in the backend
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse the wire representation
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Size of the stored payload in bytes
    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }
}

fn compress(data: &[u8]) -> Result<String> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| CacheError::CompressionError(e.to_string()))?;
    let bytes = encoder
        .finish()
        .map_err(|e| CacheError::CompressionError(e.to_string()))?;
    Ok(BASE64.encode(bytes))
}

fn decompress(blob: &str) -> Result<Vec<u8>> {
    let bytes = BASE64
        .decode(blob)
        .map_err(|e| CacheError::CompressionError(format!("invalid base64 payload: {}", e)))?;
    let mut decoder = GzDecoder::new(bytes.as_slice());
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| CacheError::CompressionError(e.to_string()))?;
    Ok(out)
}
