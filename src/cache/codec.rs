//! Reversible encoding of cached payloads.
//!
//! With compression on, payloads are stored as `base64(gzip(utf8))`. The stored form
//! carries no header, so every reader of a store must share one configuration.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{Read, Write};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("stored value is not valid base64")]
    Base64(#[from] base64::DecodeError),
    #[error("gzip stream error")]
    Gzip(#[from] std::io::Error),
    #[error("decoded payload is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueCodec {
    compression: bool,
}

impl ValueCodec {
    pub fn new(compression: bool) -> Self {
        Self { compression }
    }

    pub fn compression_enabled(&self) -> bool {
        self.compression
    }

    /// Turn a payload into its stored form.
    pub fn encode(&self, payload: &str) -> Result<String, CodecError> {
        if !self.compression {
            return Ok(payload.to_owned());
        }
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(payload.as_bytes())?;
        let compressed = encoder.finish()?;
        Ok(STANDARD.encode(compressed))
    }

    /// Exact inverse of [`encode`](Self::encode) under the same configuration.
    pub fn decode(&self, stored: &str) -> Result<String, CodecError> {
        if !self.compression {
            return Ok(stored.to_owned());
        }
        let compressed = STANDARD.decode(stored)?;
        let mut bytes = Vec::new();
        GzDecoder::new(compressed.as_slice()).read_to_end(&mut bytes)?;
        Ok(String::from_utf8(bytes)?)
    }
}
