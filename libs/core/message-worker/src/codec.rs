//! Payload codec
//!
//! Payloads are UTF-8 JSON. Decoding follows serde's rules: unknown fields are
//! ignored, and fields marked `#[serde(default)]` fall back to their defaults.
//! An empty (or whitespace-only) payload decodes as JSON `null`, so handlers
//! that accept bodiless messages take an `Option<T>` argument.

use crate::error::CodecError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::any::type_name;

/// Maximum characters of a payload rendered into a log line
const MAX_LOG_CHARS: usize = 512;

/// Converts raw payload bytes to and from typed handler arguments.
pub struct PayloadCodec;

impl PayloadCodec {
    /// Decode a raw payload into `T`.
    pub fn decode<T: DeserializeOwned>(raw: &[u8]) -> Result<T, CodecError> {
        let text = std::str::from_utf8(raw)?;
        let text = if text.trim().is_empty() { "null" } else { text };

        serde_json::from_str(text).map_err(|source| CodecError::InvalidJson {
            target: type_name::<T>(),
            source,
        })
    }

    /// Encode a value as a UTF-8 JSON payload.
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(CodecError::Encode)
    }

    /// Render a value for diagnostics. Never fails; long output is truncated.
    pub fn encode_for_log<T: Serialize + ?Sized>(value: &T) -> String {
        match serde_json::to_string(value) {
            Ok(json) => truncate(json),
            Err(_) => format!("<unserializable {}>", type_name::<T>()),
        }
    }

    /// Render a raw payload for diagnostics, replacing invalid UTF-8.
    pub fn raw_for_log(raw: &[u8]) -> String {
        truncate(String::from_utf8_lossy(raw).into_owned())
    }
}

fn truncate(mut text: String) -> String {
    if let Some((cut, _)) = text.char_indices().nth(MAX_LOG_CHARS) {
        text.truncate(cut);
        text.push('…');
    }
    text
}
